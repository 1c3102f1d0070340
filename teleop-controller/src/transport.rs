use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("not connected to the message channel within {0:?}")]
    ConnectTimeout(Duration),
    #[error("message channel is closed")]
    Closed,
    #[error("message channel error")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Read only view of the connection state.
///
/// The state is written by a single task owned by the transport.
#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    receiver: watch::Receiver<ConnectionState>,
}

impl ConnectionMonitor {
    pub fn channel(initial: ConnectionState) -> (watch::Sender<ConnectionState>, Self) {
        let (sender, receiver) = watch::channel(initial);
        (sender, Self { receiver })
    }

    pub fn state(&self) -> ConnectionState {
        *self.receiver.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub async fn wait_for_connection(&mut self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(
            timeout,
            self.receiver
                .wait_for(|state| *state == ConnectionState::Connected),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::ConnectTimeout(timeout)),
        }
    }

    /// Wait for the next change and return the new state
    pub async fn changed(&mut self) -> Result<ConnectionState> {
        self.receiver
            .changed()
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(*self.receiver.borrow_and_update())
    }
}

/// A message as delivered by the channel
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Instant::now(),
        }
    }
}

/// Delivery side of a topic subscription, consumed by a single receive loop
#[async_trait]
pub trait Subscription: Send {
    /// Next message in delivery order, `None` once the subscription is gone
    async fn recv(&mut self) -> Option<InboundMessage>;

    async fn close(&mut self) -> Result<()>;

    fn monitor(&self) -> Option<ConnectionMonitor> {
        None
    }
}

#[async_trait]
impl Subscription for mpsc::Receiver<InboundMessage> {
    async fn recv(&mut self) -> Option<InboundMessage> {
        mpsc::Receiver::recv(self).await
    }

    async fn close(&mut self) -> Result<()> {
        mpsc::Receiver::close(self);
        Ok(())
    }
}

#[async_trait]
pub trait CommandPublisher: Send {
    fn monitor(&self) -> &ConnectionMonitor;

    /// Hand a payload to the channel without waiting for delivery
    async fn publish(&mut self, payload: Vec<u8>) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}
