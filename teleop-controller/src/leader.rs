use crate::arm_config::Units;
use crate::arm_driver::{ArmDriver, DriverError, Register};
use crate::command::{CommandEnvelope, CommandError};
use crate::shutdown::StopSignal;
use crate::transport::{CommandPublisher, TransportError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum LeaderError {
    #[error("message channel did not connect in time")]
    StartupTimeout(#[source] TransportError),
    #[error("message channel failure")]
    Transport(#[from] TransportError),
    #[error("arm failure")]
    Driver(#[from] DriverError),
    #[error("failed to encode command")]
    Command(#[from] CommandError),
    #[error("publish rate {0} does not give a usable period")]
    InvalidRate(f32),
}

type Result<T> = std::result::Result<T, LeaderError>;

#[derive(Debug, Clone)]
pub struct LeaderSettings {
    pub units: Units,
    pub fps: f32,
    pub connect_timeout: Duration,
}

impl Default for LeaderSettings {
    fn default() -> Self {
        Self {
            units: Units::Degrees,
            fps: 60.0,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl LeaderSettings {
    /// Time between two samples. Fails for rates that are not positive or too small to time.
    pub fn period(&self) -> Result<Duration> {
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(LeaderError::InvalidRate(self.fps));
        }
        Duration::try_from_secs_f32(1.0 / self.fps).map_err(|_| LeaderError::InvalidRate(self.fps))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaderStats {
    pub iterations: u64,
    pub published: u64,
    pub skipped_disconnected: u64,
    pub read_failures: u64,
    pub publish_failures: u64,
    pub overruns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Published,
    NotConnected,
    ReadFailed,
    PublishFailed,
}

/// Publishes the leader arm position at a fixed rate.
pub struct LeaderSender {
    driver: Box<dyn ArmDriver>,
    publisher: Box<dyn CommandPublisher>,
    units: Units,
    period: Duration,
    sequence: u64,
    stats: LeaderStats,
}

impl LeaderSender {
    /// Wait for the channel and build the sender.
    ///
    /// When the channel does not connect in time both the arm and the
    /// channel are released before the error is returned.
    pub async fn start(
        mut driver: Box<dyn ArmDriver>,
        mut publisher: Box<dyn CommandPublisher>,
        settings: LeaderSettings,
    ) -> Result<Self> {
        let period = match settings.period() {
            Ok(period) => period,
            Err(err) => {
                release(driver.as_mut(), publisher.as_mut()).await;
                return Err(err);
            }
        };
        let mut monitor = publisher.monitor().clone();
        if let Err(err) = monitor.wait_for_connection(settings.connect_timeout).await {
            error!(timeout = ?settings.connect_timeout, "Message channel did not connect");
            release(driver.as_mut(), publisher.as_mut()).await;
            return Err(LeaderError::StartupTimeout(err));
        }
        info!(units = %settings.units, fps = settings.fps, "Leader connected");
        Ok(Self {
            driver,
            publisher,
            units: settings.units,
            period,
            sequence: 0,
            stats: LeaderStats::default(),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn stats(&self) -> LeaderStats {
        self.stats
    }

    /// Read the arm once and publish its position
    pub async fn step(&mut self) -> StepOutcome {
        self.stats.iterations += 1;
        let positions = match self.driver.read(Register::PresentPosition).await {
            Ok(positions) => positions,
            Err(err) => {
                self.stats.read_failures += 1;
                warn!(error = %err, "Failed to read leader arm");
                return StepOutcome::ReadFailed;
            }
        };
        if !self.publisher.monitor().is_connected() {
            self.stats.skipped_disconnected += 1;
            debug!("Message channel not connected, skipping publish");
            return StepOutcome::NotConnected;
        }
        self.sequence += 1;
        let envelope =
            CommandEnvelope::set_joint_angles(Some(self.sequence.to_string()), self.units, &positions);
        let result = match envelope.to_vec() {
            Ok(payload) => self.publisher.publish(payload).await.map_err(LeaderError::from),
            Err(err) => Err(err.into()),
        };
        match result {
            Ok(()) => {
                self.stats.published += 1;
                StepOutcome::Published
            }
            Err(err) => {
                self.stats.publish_failures += 1;
                warn!(error = %err, "Failed to publish leader position");
                StepOutcome::PublishFailed
            }
        }
    }

    /// Run the publish loop until `stop` fires, then release arm and channel
    pub async fn run(mut self, mut stop: StopSignal) -> LeaderStats {
        while !stop.is_stopped() {
            let started = Instant::now();
            self.step().await;
            let elapsed = started.elapsed();
            if elapsed > self.period {
                self.stats.overruns += 1;
                debug!(?elapsed, period = ?self.period, "Leader iteration overran");
            }
            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(self.period.saturating_sub(elapsed)) => {}
            }
        }
        release(self.driver.as_mut(), self.publisher.as_mut()).await;
        info!(
            iterations = self.stats.iterations,
            published = self.stats.published,
            skipped_disconnected = self.stats.skipped_disconnected,
            read_failures = self.stats.read_failures,
            publish_failures = self.stats.publish_failures,
            overruns = self.stats.overruns,
            "Leader stopped"
        );
        self.stats
    }
}

async fn release(driver: &mut dyn ArmDriver, publisher: &mut dyn CommandPublisher) {
    if let Err(err) = publisher.close().await {
        error!(error = %err, "Failed to close message channel");
    }
    if let Err(err) = driver.disconnect().await {
        error!(error = %err, "Failed to disconnect leader arm");
    }
}
