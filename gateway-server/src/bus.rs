//! Message bus towards the CSMS
//!
//! Each session subscribes to `{prefix}/out/{protocol}/{cs_id}` for traffic
//! from the CSMS and publishes to `{prefix}/in/{protocol}/{cs_id}`. Payloads
//! are [`GatewayMessage`] JSON documents.
//!
//! [`MqttBus`](crate::mqtt::MqttBus) carries them through an MQTT broker;
//! [`LocalBus`] keeps them in process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ocpp_gateway_core::GatewayMessage;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Queue length of a single subscription
pub const SUBSCRIPTION_QUEUE_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Message bus closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid bus configuration: {0}")]
    InvalidConfig(String),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

/// Topics used by one charge station session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTopics {
    /// Gateway to CSMS
    pub inbound: String,
    /// CSMS to gateway
    pub outbound: String,
}

impl SessionTopics {
    pub fn new(prefix: &str, protocol: &str, client_id: &str) -> Self {
        Self {
            inbound: format!("{}/in/{}/{}", prefix, protocol, client_id),
            outbound: format!("{}/out/{}/{}", prefix, protocol, client_id),
        }
    }
}

pub fn encode_message(msg: &GatewayMessage) -> Result<Vec<u8>, BusError> {
    Ok(serde_json::to_vec(msg)?)
}

pub fn decode_message(payload: &[u8]) -> Result<GatewayMessage, BusError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Messages published to one topic
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    pub(crate) rx: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    pub(crate) fn new(topic: &str, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            topic: topic.to_string(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload, or `None` once the bus has closed
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Publish/subscribe transport to the CSMS
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}

#[derive(Debug, Default)]
struct LocalBusInner {
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
    closed: AtomicBool,
}

/// In-process bus with exact topic matching.
///
/// Messages published to a topic nobody subscribes to are discarded.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .get(topic)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Refuse further use and end every subscription
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.subscribers.write().clear();
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.ensure_open()?;

        let senders = self
            .inner
            .subscribers
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        if senders.is_empty() {
            debug!("No subscribers on {}, dropping message", topic);
            return Ok(());
        }

        let mut stale = false;
        for tx in senders {
            if tx.send(payload.clone()).await.is_err() {
                stale = true;
            }
        }

        if stale {
            if let Some(senders) = self.inner.subscribers.write().get_mut(topic) {
                senders.retain(|tx| !tx.is_closed());
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        self.ensure_open()?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_LEN);
        self.inner
            .subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        Ok(Subscription::new(topic, rx))
    }
}
