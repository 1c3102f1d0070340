use crate::arm_config::{ArmConfig, Units};
use crate::feetech::{self, FeetechBus, FeetechError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("failed when talking to arm")]
    BusError(#[from] FeetechError),
    #[error("motor {joint:?} (id {id}) did not respond")]
    MotorNotResponding {
        joint: String,
        id: u8,
        #[source]
        source: FeetechError,
    },
    #[error("register {0:?} can not be written")]
    ReadOnlyRegister(Register),
    #[error("arm has no joint named {0:?}")]
    UnknownJoint(String),
    #[error("arm is disconnected")]
    Disconnected,
    #[error("bus worker failed")]
    WorkerFailed(#[from] tokio::task::JoinError),
}

type Result<T> = std::result::Result<T, DriverError>;

/// Joint name to position, in the unit of the session
pub type JointPositions = BTreeMap<String, f32>;

/// Named control table entries shared by every joint on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    PresentPosition,
    GoalPosition,
}

impl Register {
    fn address(self) -> u8 {
        match self {
            Register::PresentPosition => feetech::PRESENT_POSITION,
            Register::GoalPosition => feetech::GOAL_POSITION,
        }
    }
}

/// Leaders are moved by hand, followers hold torque
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmRole {
    Leader,
    Follower,
}

/// Device bus of a single arm
///
/// Every call completes before returning. Implementations are owned by one
/// controller and never shared.
#[async_trait]
pub trait ArmDriver: Send {
    async fn read(&mut self, register: Register) -> Result<JointPositions>;
    async fn write(&mut self, register: Register, positions: &JointPositions) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
}

type SerialBus = FeetechBus<Box<dyn serialport::SerialPort>>;

pub struct SerialArmDriver {
    bus: Option<SerialBus>,
    config: ArmConfig,
    units: Units,
    role: ArmRole,
}

impl SerialArmDriver {
    /// Open the port, check every motor answers and set torque for `role`
    pub async fn new(
        port: &str,
        config: ArmConfig,
        units: Units,
        role: ArmRole,
    ) -> Result<Box<Self>> {
        let path = port.to_owned();
        let bus = tokio::task::spawn_blocking(move || {
            FeetechBus::open(&path, feetech::DEFAULT_BAUD_RATE)
        })
        .await??;
        let mut arm_driver = SerialArmDriver {
            bus: Some(bus),
            config,
            units,
            role,
        };
        arm_driver.check_motors().await?;
        arm_driver.set_torque(role == ArmRole::Follower).await?;
        info!(port, ?role, %units, "Arm connected");
        Ok(Box::new(arm_driver))
    }

    /// Run blocking serial I/O off the async runtime.
    ///
    /// The bus is moved to the worker and handed back afterwards.
    async fn with_bus<T, F>(&mut self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SerialBus) -> Result<T> + Send + 'static,
    {
        let mut bus = self.bus.take().ok_or(DriverError::Disconnected)?;
        let (bus, result) = tokio::task::spawn_blocking(move || {
            let result = operation(&mut bus);
            (bus, result)
        })
        .await?;
        self.bus = Some(bus);
        result
    }

    fn motors(&self) -> Vec<(String, u8)> {
        self.config
            .joints
            .iter()
            .map(|joint| (joint.name.clone(), joint.id))
            .collect()
    }

    async fn check_motors(&mut self) -> Result<()> {
        let motors = self.motors();
        self.with_bus(move |bus| {
            for (joint, id) in motors {
                bus.ping(id)
                    .map_err(|source| DriverError::MotorNotResponding { joint, id, source })?;
            }
            Ok(())
        })
        .await
    }

    async fn set_torque(&mut self, enabled: bool) -> Result<()> {
        let ids = self.config.get_ids();
        self.with_bus(move |bus| {
            for id in ids {
                bus.set_torque(id, enabled)?;
            }
            Ok(())
        })
        .await?;
        debug!(enabled, "Torque set");
        Ok(())
    }
}

#[async_trait]
impl ArmDriver for SerialArmDriver {
    async fn read(&mut self, register: Register) -> Result<JointPositions> {
        let motors = self.motors();
        let address = register.address();
        let raw = self
            .with_bus(move |bus| {
                motors
                    .into_iter()
                    .map(|(joint, id)| -> Result<(String, u16)> {
                        Ok((joint, bus.read_u16(id, address)?))
                    })
                    .collect::<Result<Vec<(String, u16)>>>()
            })
            .await?;
        let mut positions = JointPositions::new();
        for (name, value) in raw {
            let joint = self
                .config
                .joint(&name)
                .ok_or_else(|| DriverError::UnknownJoint(name.clone()))?;
            let mode = self.config.norm_mode(joint, self.units);
            positions.insert(name, joint.calibration.normalize(value, mode));
        }
        Ok(positions)
    }

    async fn write(&mut self, register: Register, positions: &JointPositions) -> Result<()> {
        if register == Register::PresentPosition {
            return Err(DriverError::ReadOnlyRegister(register));
        }
        let values = encode_positions(&self.config, self.units, positions)?;
        let address = register.address();
        self.with_bus(move |bus| Ok(bus.sync_write_u16(address, &values)?))
            .await
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.bus.is_none() {
            return Ok(());
        }
        let torque_result = if self.role == ArmRole::Follower {
            self.set_torque(false).await
        } else {
            Ok(())
        };
        // drop the port even if torque could not be released
        self.bus = None;
        info!("Arm disconnected");
        torque_result
    }
}

fn encode_positions(
    config: &ArmConfig,
    units: Units,
    positions: &JointPositions,
) -> Result<Vec<(u8, u16)>> {
    positions
        .iter()
        .map(|(name, value)| {
            let joint = config
                .joint(name)
                .ok_or_else(|| DriverError::UnknownJoint(name.clone()))?;
            let mode = config.norm_mode(joint, units);
            Ok((joint.id, joint.calibration.denormalize(*value, mode)))
        })
        .collect()
}
