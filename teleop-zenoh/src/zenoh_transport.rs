use crate::error::WrapperError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use teleop_controller::transport::{
    CommandPublisher, ConnectionMonitor, ConnectionState, InboundMessage, Subscription,
    TransportError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zenoh::prelude::r#async::*;
use zenoh::publication::{CongestionControl, Publisher};

/// Messages waiting for the follower loop. Newer samples are dropped when full.
pub const DEFAULT_QUEUE_SIZE: usize = 16;
const CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Zenoh session with a task tracking whether any router or peer is reachable
pub struct ZenohChannel {
    session: Arc<Session>,
    monitor: ConnectionMonitor,
    watcher: JoinHandle<()>,
}

impl ZenohChannel {
    /// Open a session connecting to `endpoints`, or scouting when empty
    pub async fn open(endpoints: &[String]) -> Result<Self, WrapperError> {
        let mut config = zenoh::config::Config::default();
        if !endpoints.is_empty() {
            config.connect.endpoints = endpoints
                .iter()
                .map(|endpoint| {
                    endpoint
                        .parse::<zenoh_config::EndPoint>()
                        .map_err(|err| WrapperError::InvalidEndpoint {
                            endpoint: endpoint.clone(),
                            reason: err.to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
        }
        let session = zenoh::open(config).res().await?.into_arc();
        info!(zid = %session.zid(), ?endpoints, "Zenoh session opened");

        let (monitor, watcher) = watch_connection(session.clone());
        Ok(Self {
            session,
            monitor,
            watcher,
        })
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub async fn subscribe(
        self,
        topic: &str,
        queue_size: usize,
    ) -> Result<ZenohSubscription, WrapperError> {
        let subscriber = self
            .session
            .declare_subscriber(topic.to_owned())
            .res()
            .await?;
        let (sender, receiver) = mpsc::channel(queue_size);
        let topic_name = topic.to_owned();
        let pump = tokio::spawn(async move {
            while let Ok(sample) = subscriber.recv_async().await {
                let message = InboundMessage {
                    topic: sample.key_expr.to_string(),
                    payload: sample.value.payload.contiguous().to_vec(),
                    received_at: Instant::now(),
                };
                match sender.try_send(message) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(topic = %topic_name, "Command queue full, dropping message")
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            debug!(topic = %topic_name, "Subscriber pump stopped");
        });
        info!(topic, "Subscribed");
        Ok(ZenohSubscription {
            receiver,
            pump: Some(pump),
            channel: Some(self),
        })
    }

    pub async fn publisher(self, topic: &str) -> Result<ZenohPublisher, WrapperError> {
        let publisher = self
            .session
            .declare_publisher(topic.to_owned())
            .congestion_control(CongestionControl::Drop)
            .res()
            .await?;
        info!(topic, "Publisher declared");
        Ok(ZenohPublisher {
            monitor: self.monitor.clone(),
            publisher: Some(publisher),
            channel: Some(self),
        })
    }

    /// Stop the watcher and close the session once nothing else holds it
    pub async fn close(self) -> Result<(), TransportError> {
        self.watcher.abort();
        let _ = self.watcher.await;
        match Arc::try_unwrap(self.session) {
            Ok(session) => {
                session
                    .close()
                    .res()
                    .await
                    .map_err(TransportError::Backend)?;
                info!("Zenoh session closed");
            }
            Err(_) => warn!("Zenoh session still in use, leaving it to be dropped"),
        }
        Ok(())
    }
}

fn watch_connection(session: Arc<Session>) -> (ConnectionMonitor, JoinHandle<()>) {
    let (sender, monitor) = ConnectionMonitor::channel(ConnectionState::Disconnected);
    let watcher = tokio::spawn(async move {
        let mut interval = tokio::time::interval(CONNECTION_POLL_INTERVAL);
        while !sender.is_closed() {
            interval.tick().await;
            let info = session.info();
            let routers = info.routers_zid().res().await.count();
            let peers = info.peers_zid().res().await.count();
            let state = if routers + peers > 0 {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
            sender.send_if_modified(|current| {
                if *current == state {
                    return false;
                }
                match state {
                    ConnectionState::Connected => info!(routers, peers, "Zenoh connected"),
                    ConnectionState::Disconnected => warn!("Zenoh lost all routers and peers"),
                }
                *current = state;
                true
            });
        }
    });
    (monitor, watcher)
}

pub struct ZenohSubscription {
    receiver: mpsc::Receiver<InboundMessage>,
    pump: Option<JoinHandle<()>>,
    channel: Option<ZenohChannel>,
}

#[async_trait]
impl Subscription for ZenohSubscription {
    async fn recv(&mut self) -> Option<InboundMessage> {
        self.receiver.recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.receiver.close();
        if let Some(pump) = self.pump.take() {
            // dropping the subscriber undeclares it
            pump.abort();
            let _ = pump.await;
        }
        match self.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    fn monitor(&self) -> Option<ConnectionMonitor> {
        self.channel.as_ref().map(|channel| channel.monitor().clone())
    }
}

pub struct ZenohPublisher {
    monitor: ConnectionMonitor,
    publisher: Option<Publisher<'static>>,
    channel: Option<ZenohChannel>,
}

#[async_trait]
impl CommandPublisher for ZenohPublisher {
    fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    async fn publish(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        let publisher = self.publisher.as_ref().ok_or(TransportError::Closed)?;
        publisher
            .put(payload)
            .res()
            .await
            .map_err(TransportError::Backend)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(publisher) = self.publisher.take() {
            if let Err(err) = publisher.undeclare().res().await {
                warn!(error = %err, "Failed to undeclare publisher");
            }
        }
        match self.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}
