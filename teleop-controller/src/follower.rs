use crate::arm_config::Units;
use crate::arm_driver::{ArmDriver, DriverError, Register};
use crate::command::{CommandError, GoalCommand};
use crate::jump_protection::{ClampError, JumpProtection, SafeCommand};
use crate::shutdown::StopSignal;
use crate::transport::{ConnectionMonitor, ConnectionState, InboundMessage, Subscription, TransportError};
use std::future::Future;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum FollowerError {
    #[error("rejected command")]
    Command(#[from] CommandError),
    #[error("unsafe command")]
    Clamp(#[from] ClampError),
    #[error("arm failure")]
    Driver(#[from] DriverError),
    #[error("message channel failure")]
    Transport(#[from] TransportError),
    #[error("follower is not started")]
    NotStarted,
}

type Result<T> = std::result::Result<T, FollowerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerState {
    Disconnected,
    Connecting,
    Subscribed,
    Handling,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct FollowerSettings {
    pub topic: String,
    pub units: Units,
    pub protection: JumpProtection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FollowerStats {
    pub received: u64,
    pub written: u64,
    pub clamped: u64,
    pub rejected: u64,
    pub failed: u64,
}

/// Receives goal commands and drives the follower arm.
///
/// Messages are handled one at a time in delivery order. A failing message
/// is logged and dropped, it never stops the loop.
pub struct FollowerController {
    settings: FollowerSettings,
    driver: Option<Box<dyn ArmDriver>>,
    subscription: Option<Box<dyn Subscription>>,
    state: FollowerState,
    stats: FollowerStats,
}

impl FollowerController {
    pub fn new(settings: FollowerSettings) -> Self {
        Self {
            settings,
            driver: None,
            subscription: None,
            state: FollowerState::Disconnected,
            stats: FollowerStats::default(),
        }
    }

    pub fn state(&self) -> FollowerState {
        self.state
    }

    pub fn stats(&self) -> FollowerStats {
        self.stats
    }

    /// Connect the arm first and the channel second.
    ///
    /// Anything already opened is released again when a later step fails.
    pub async fn start<D, S>(&mut self, open_driver: D, open_subscription: S) -> Result<()>
    where
        D: Future<Output = std::result::Result<Box<dyn ArmDriver>, DriverError>>,
        S: Future<Output = std::result::Result<Box<dyn Subscription>, TransportError>>,
    {
        self.state = FollowerState::Connecting;
        match open_driver.await {
            Ok(driver) => self.driver = Some(driver),
            Err(err) => {
                self.state = FollowerState::Stopped;
                return Err(err.into());
            }
        }
        match open_subscription.await {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(err) => {
                self.shutdown().await;
                return Err(err.into());
            }
        }
        self.state = FollowerState::Subscribed;
        info!(topic = %self.settings.topic, units = %self.settings.units, "Follower subscribed");
        Ok(())
    }

    /// Read present position, clamp the goal against it and write it
    pub async fn handle_goal(&mut self, goal: &GoalCommand) -> Result<SafeCommand> {
        let driver = self.driver.as_mut().ok_or(FollowerError::NotStarted)?;
        let present = driver.read(Register::PresentPosition).await?;
        let command = self.settings.protection.apply(&goal.positions, &present)?;
        if command.positions.is_empty() {
            return Ok(command);
        }
        driver.write(Register::GoalPosition, &command.positions).await?;
        Ok(command)
    }

    pub async fn handle_message(&mut self, message: &InboundMessage) -> Result<SafeCommand> {
        let goal = GoalCommand::parse(&message.payload, self.settings.units, message.received_at)?;
        self.handle_goal(&goal).await
    }

    async fn process(&mut self, message: InboundMessage) {
        self.state = FollowerState::Handling;
        self.stats.received += 1;
        let goal = match GoalCommand::parse(&message.payload, self.settings.units, message.received_at) {
            Ok(goal) => goal,
            Err(err) => {
                self.stats.rejected += 1;
                warn!(topic = %message.topic, error = %err, "Rejected command");
                self.state = FollowerState::Subscribed;
                return;
            }
        };
        match self.handle_goal(&goal).await {
            Ok(command) => {
                for clamped in &command.clamped {
                    warn!(
                        topic = %message.topic,
                        joint = %clamped.joint,
                        requested = clamped.requested,
                        commanded = clamped.commanded,
                        "Goal position clamped"
                    );
                }
                if command.was_clamped() {
                    self.stats.clamped += 1;
                }
                if !command.skipped.is_empty() {
                    debug!(joints = ?command.skipped, "Joints without present position skipped");
                }
                if !command.positions.is_empty() {
                    self.stats.written += 1;
                }
                debug!(
                    id = goal.id.as_deref().unwrap_or("-"),
                    latency = ?goal.received_at.elapsed(),
                    "Command applied"
                );
            }
            Err(err) => {
                self.stats.failed += 1;
                let joints: Vec<&String> = goal.positions.keys().collect();
                error!(
                    topic = %message.topic,
                    ?joints,
                    error = %err,
                    source = ?std::error::Error::source(&err),
                    "Failed to apply command"
                );
            }
        }
        self.state = FollowerState::Subscribed;
    }

    /// Handle messages until `stop` fires or the subscription ends, then shut down
    pub async fn run(&mut self, mut stop: StopSignal) -> Result<FollowerStats> {
        let mut subscription = self.subscription.take().ok_or(FollowerError::NotStarted)?;
        let mut monitor = subscription.monitor();
        while !stop.is_stopped() {
            tokio::select! {
                _ = stop.stopped() => break,
                message = subscription.recv() => match message {
                    Some(message) => self.process(message).await,
                    None => {
                        warn!("Subscription ended");
                        break;
                    }
                },
                change = next_connection_change(&mut monitor) => match change {
                    Some(ConnectionState::Connected) => info!("Message channel connected"),
                    Some(ConnectionState::Disconnected) => warn!("Message channel lost, waiting for reconnect"),
                    None => monitor = None,
                },
            }
        }
        self.subscription = Some(subscription);
        self.shutdown().await;
        Ok(self.stats)
    }

    /// Release the channel and then the arm. Failures are logged only.
    pub async fn shutdown(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            if let Err(err) = subscription.close().await {
                error!(error = %err, "Failed to close subscription");
            }
        }
        if let Some(mut driver) = self.driver.take() {
            if let Err(err) = driver.disconnect().await {
                error!(error = %err, "Failed to disconnect arm");
            }
        }
        if self.state != FollowerState::Stopped {
            info!(
                received = self.stats.received,
                written = self.stats.written,
                clamped = self.stats.clamped,
                rejected = self.stats.rejected,
                failed = self.stats.failed,
                "Follower stopped"
            );
        }
        self.state = FollowerState::Stopped;
    }
}

async fn next_connection_change(monitor: &mut Option<ConnectionMonitor>) -> Option<ConnectionState> {
    match monitor {
        Some(monitor) => monitor.changed().await.ok(),
        None => std::future::pending().await,
    }
}
