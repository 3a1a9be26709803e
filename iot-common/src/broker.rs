//! # Broker
//!
//! A thin publish/subscribe abstraction with two backends: MQTT, and an
//! in-process broker used for tests and dry runs. Payloads are opaque bytes.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::lifecycle::drain;

const CHANNEL_CAPACITY: usize = 1024;

/// How long closing a connection waits for queued packets to be flushed.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("timed out after {0:?} waiting for the broker to acknowledge the connection")]
    ConnectTimeout(Duration),
    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Release the underlying connection. Publishing afterwards fails.
    async fn disconnect(&self) {}
}

/// Messages received on the topics a connection subscribed to, in arrival order.
pub struct Subscription {
    receiver: mpsc::Receiver<BrokerMessage>,
}

impl Subscription {
    /// Wait for the next message. `None` means the connection is gone.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.receiver.recv().await
    }
}

/// An open broker connection.
pub struct Connection {
    pub publisher: Arc<dyn Publisher>,
    pub subscription: Subscription,
    event_loop: Option<JoinHandle<()>>,
}

impl Connection {
    /// Disconnect, then let the event loop flush what is still queued ahead of
    /// the disconnect. The loop is aborted only if it outlives the grace period.
    pub async fn close(self) {
        self.publisher.disconnect().await;
        if let Some(event_loop) = self.event_loop {
            drain("mqtt event loop", event_loop, CLOSE_GRACE_PERIOD).await;
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(
        &self,
        client_id: &str,
        subscriptions: &[&str],
    ) -> Result<Connection, BrokerError>;
}

/// Connects to an MQTT broker.
#[derive(Clone, Debug)]
pub struct MqttBroker {
    host: String,
    port: u16,
    keep_alive: Duration,
    connect_timeout: Duration,
}

impl MqttBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            connect_timeout: config.connect_timeout.0,
        }
    }
}

/// What the MQTT event loop does with one polled event.
#[derive(Debug, PartialEq)]
enum LoopAction {
    Deliver(BrokerMessage),
    /// The broker came back without our session, so its subscriptions are gone.
    Resubscribe,
    Stop,
    Ignore,
}

fn next_action(event: Event) -> LoopAction {
    match event {
        Event::Incoming(Packet::Publish(publish)) => LoopAction::Deliver(BrokerMessage {
            topic: publish.topic,
            payload: publish.payload,
        }),
        Event::Incoming(Packet::ConnAck(connack)) if !connack.session_present => {
            LoopAction::Resubscribe
        }
        Event::Outgoing(Outgoing::Disconnect) => LoopAction::Stop,
        _ => LoopAction::Ignore,
    }
}

fn resubscribe(client: &AsyncClient, topics: &[String]) {
    for topic in topics {
        match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
            Ok(()) => info!(topic = %topic, "resubscribed after reconnect"),
            Err(e) => warn!(topic = %topic, "failed to resubscribe after reconnect: {}", e),
        }
    }
}

struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.client
            .publish_bytes(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BrokerError::Publish {
                topic: topic.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("mqtt disconnect request failed: {}", e);
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn connect(
        &self,
        client_id: &str,
        subscriptions: &[&str],
    ) -> Result<Connection, BrokerError> {
        info!("connecting to MQTT broker at {}:{}...", self.host, self.port);

        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);

        let acknowledged = tokio::time::timeout(self.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(connack))) => return Ok(connack.code),
                    Ok(_) => continue,
                    Err(e) => return Err(BrokerError::Connect(e.to_string())),
                }
            }
        })
        .await
        .map_err(|_| BrokerError::ConnectTimeout(self.connect_timeout))??;

        if acknowledged != ConnectReturnCode::Success {
            return Err(BrokerError::Connect(format!(
                "broker refused connection: {:?}",
                acknowledged
            )));
        }

        for topic in subscriptions {
            client
                .subscribe(*topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| BrokerError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;
        }
        info!(client_id, ?subscriptions, "connected to MQTT broker");

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let topics: Vec<String> = subscriptions.iter().map(|topic| topic.to_string()).collect();
        let loop_client = client.clone();
        // The first ConnAck was consumed above, so any ConnAck seen here is a reconnect.
        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(event) => match next_action(event) {
                        LoopAction::Deliver(message) => {
                            if sender.send(message).await.is_err() {
                                debug!("subscription dropped, stopping MQTT event loop");
                                break;
                            }
                        }
                        LoopAction::Resubscribe => resubscribe(&loop_client, &topics),
                        LoopAction::Stop => break,
                        LoopAction::Ignore => {}
                    },
                    Err(e) => {
                        // The next poll reconnects.
                        warn!("MQTT event loop error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Connection {
            publisher: Arc::new(MqttPublisher { client }),
            subscription: Subscription { receiver },
            event_loop: Some(event_loop),
        })
    }
}

#[derive(Default)]
struct MemoryBrokerInner {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<BrokerMessage>>>>,
    published: Mutex<Vec<BrokerMessage>>,
    failing_topics: Mutex<HashSet<String>>,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU32,
}

/// An in-process broker. Every connection subscribed to a topic receives
/// every message published to it after the subscription was made.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Reject every later publish to `topic`.
    pub fn fail_publishes(&self, topic: &str) {
        if let Ok(mut failing) = self.inner.failing_topics.lock() {
            failing.insert(topic.to_owned());
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Payloads published to `topic` so far, in publish order.
    pub fn published(&self, topic: &str) -> Vec<Bytes> {
        self.inner
            .published
            .lock()
            .map(|published| {
                published
                    .iter()
                    .filter(|message| message.topic == topic)
                    .map(|message| message.payload.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct MemoryPublisher {
    inner: Arc<MemoryBrokerInner>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        let publish_error = |reason: &str| BrokerError::Publish {
            topic: topic.to_owned(),
            reason: reason.to_owned(),
        };

        let rejected = self
            .inner
            .failing_topics
            .lock()
            .map_err(|_| publish_error("broker state is poisoned"))?
            .contains(topic);
        if rejected {
            return Err(publish_error("memory broker rejected the publish"));
        }

        let message = BrokerMessage {
            topic: topic.to_owned(),
            payload,
        };

        self.inner
            .published
            .lock()
            .map_err(|_| publish_error("broker state is poisoned"))?
            .push(message.clone());

        let subscribers = self
            .inner
            .subscribers
            .lock()
            .map_err(|_| publish_error("broker state is poisoned"))?
            .get(topic)
            .cloned()
            .unwrap_or_default();

        for subscriber in subscribers {
            // A closed subscriber is a disconnected client, not a publish failure.
            if subscriber.send(message.clone()).await.is_err() {
                debug!(topic, "subscriber gone, skipping");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        client_id: &str,
        subscriptions: &[&str],
    ) -> Result<Connection, BrokerError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BrokerError::Connect(format!(
                "memory broker refused {client_id}"
            )));
        }

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        {
            let mut topics = self
                .inner
                .subscribers
                .lock()
                .map_err(|_| BrokerError::Connect("broker state is poisoned".to_owned()))?;
            for topic in subscriptions {
                topics
                    .entry(topic.to_string())
                    .or_default()
                    .push(sender.clone());
            }
        }

        Ok(Connection {
            publisher: Arc::new(MemoryPublisher {
                inner: self.inner.clone(),
            }),
            subscription: Subscription { receiver },
            event_loop: None,
        })
    }
}
