//! MQTT message bus
//!
//! One broker connection is shared by every session. Sessions subscribe to
//! their outbound topic; the broker subscription is dropped again once the
//! last [`Subscription`] on a topic goes away. After a reconnect every live
//! topic is subscribed again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Url;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, MessageBus, Subscription, SUBSCRIPTION_QUEUE_LEN};

/// Default broker URL
pub const DEFAULT_MQTT_URL: &str = "mqtt://127.0.0.1:1883";

/// Default client id the gateway connects with
pub const DEFAULT_MQTT_CLIENT_ID: &str = "ocpp-gateway";

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Requests buffered between the bus and the broker connection
const REQUEST_QUEUE_LEN: usize = 64;

const QOS: QoS = QoS::AtMostOnce;

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Pause before reconnecting after a connection error
    pub connect_retry_delay: Duration,
}

impl MqttConfig {
    /// Settings for a broker at `mqtt://host[:port]`
    pub fn from_url(url: &str) -> Result<Self, BusError> {
        let parsed =
            Url::parse(url).map_err(|e| BusError::InvalidConfig(format!("{}: {}", url, e)))?;

        if !matches!(parsed.scheme(), "mqtt" | "tcp") {
            return Err(BusError::InvalidConfig(format!(
                "{}: unsupported scheme {}",
                url,
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| BusError::InvalidConfig(format!("{}: no host", url)))?;

        Ok(Self {
            host: host.to_string(),
            port: parsed.port().unwrap_or(DEFAULT_MQTT_PORT),
            client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
            keep_alive: Duration::from_secs(10),
            connect_retry_delay: Duration::from_secs(1),
        })
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = client_id.to_string();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_connect_retry_delay(mut self, delay: Duration) -> Self {
        self.connect_retry_delay = delay;
        self
    }

    fn options(&self) -> Result<MqttOptions, BusError> {
        if self.client_id.is_empty() {
            return Err(BusError::InvalidConfig("empty MQTT client id".to_string()));
        }
        if self.keep_alive < Duration::from_secs(1) {
            return Err(BusError::InvalidConfig(
                "MQTT keep alive must be at least one second".to_string(),
            ));
        }

        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        Ok(options)
    }
}

/// Topic routing table shared by the bus, the connection task and the
/// subscription watchers
struct Routes {
    client: AsyncClient,
    topics: RwLock<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
}

impl Routes {
    fn new(client: AsyncClient) -> Self {
        Self {
            client,
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn add(&self, topic: &str, tx: mpsc::Sender<Vec<u8>>) -> Result<(), BusError> {
        let mut topics = self.topics.write();
        self.client.try_subscribe(topic, QOS)?;
        topics.entry(topic.to_string()).or_default().push(tx);
        Ok(())
    }

    /// Forget closed subscriptions on `topic`, unsubscribing from the broker
    /// when none are left
    fn release(&self, topic: &str) {
        let mut topics = self.topics.write();
        let Some(senders) = topics.get_mut(topic) else {
            return;
        };

        senders.retain(|tx| !tx.is_closed());
        if senders.is_empty() {
            topics.remove(topic);
            debug!("Unsubscribing from {}", topic);
            if let Err(e) = self.client.try_unsubscribe(topic) {
                warn!("Unsubscribing from {}: {}", topic, e);
            }
        }
    }

    /// Subscribe again to every live topic after the broker session was
    /// reset
    fn resubscribe(&self) {
        let topics = self.topics.read();
        for topic in topics.keys() {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QOS) {
                error!("Resubscribing to {}: {}", topic, e);
            }
        }
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let senders = self.topics.read().get(topic).cloned().unwrap_or_default();

        if senders.is_empty() {
            debug!("No subscribers on {}, dropping message", topic);
            return;
        }

        for tx in senders {
            match tx.try_send(payload.to_vec()) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Subscription on {} is full, dropping message", topic);
                }
            }
        }
    }

    fn topic_count(&self) -> usize {
        self.topics.read().len()
    }
}

struct ConnectionTask(Option<JoinHandle<()>>);

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

/// [`MessageBus`] backed by an MQTT broker
#[derive(Clone)]
pub struct MqttBus {
    routes: Arc<Routes>,
    _connection: Arc<ConnectionTask>,
}

impl MqttBus {
    /// Start the broker connection on the current tokio runtime.
    ///
    /// Connecting happens in the background and is retried until the bus
    /// is dropped.
    pub fn connect(config: &MqttConfig) -> Result<Self, BusError> {
        let (client, event_loop) = AsyncClient::new(config.options()?, REQUEST_QUEUE_LEN);
        let routes = Arc::new(Routes::new(client));

        info!(
            "Connecting to MQTT broker {}:{} as {}",
            config.host, config.port, config.client_id
        );
        let task = tokio::spawn(run_connection(
            event_loop,
            routes.clone(),
            config.connect_retry_delay,
        ));

        Ok(Self {
            routes,
            _connection: Arc::new(ConnectionTask(Some(task))),
        })
    }

    /// Topics with at least one live subscription
    pub fn topic_count(&self) -> usize {
        self.routes.topic_count()
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.routes.client.publish(topic, QOS, false, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_LEN);
        self.routes.add(topic, tx.clone())?;

        let routes = self.routes.clone();
        let watched = topic.to_string();
        tokio::spawn(async move {
            tx.closed().await;
            routes.release(&watched);
        });

        Ok(Subscription::new(topic, rx))
    }
}

async fn run_connection(mut event_loop: EventLoop, routes: Arc<Routes>, retry_delay: Duration) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                routes.resubscribe();
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                routes.dispatch(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    /// A bus whose connection is never polled; requests queue up in `_event_loop`
    fn offline_bus() -> (MqttBus, EventLoop) {
        let options = MqttConfig::from_url("mqtt://localhost")
            .unwrap()
            .options()
            .unwrap();
        let (client, event_loop) = AsyncClient::new(options, REQUEST_QUEUE_LEN);
        let bus = MqttBus {
            routes: Arc::new(Routes::new(client)),
            _connection: Arc::new(ConnectionTask(None)),
        };
        (bus, event_loop)
    }

    #[test]
    fn test_config_from_url() {
        let config = MqttConfig::from_url("mqtt://broker.example:1884").unwrap();
        assert_eq!(config.host, "broker.example");
        assert_eq!(config.port, 1884);
        assert_eq!(config.client_id, DEFAULT_MQTT_CLIENT_ID);

        let config = MqttConfig::from_url(DEFAULT_MQTT_URL).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 1883);

        let config = MqttConfig::from_url("tcp://broker").unwrap();
        assert_eq!(config.port, DEFAULT_MQTT_PORT);
    }

    #[test]
    fn test_config_rejects_bad_urls() {
        assert!(matches!(
            MqttConfig::from_url("http://broker"),
            Err(BusError::InvalidConfig(_))
        ));
        assert!(matches!(
            MqttConfig::from_url("not a url"),
            Err(BusError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_options() {
        let config = MqttConfig::from_url("mqtt://broker")
            .unwrap()
            .with_client_id("gw-1")
            .with_keep_alive(Duration::from_secs(30))
            .with_connect_retry_delay(Duration::from_millis(500));

        let options = config.options().unwrap();
        assert_eq!(options.client_id(), "gw-1");
        assert_eq!(options.broker_address(), ("broker".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.connect_retry_delay, Duration::from_millis(500));

        assert!(config
            .clone()
            .with_keep_alive(Duration::from_millis(10))
            .options()
            .is_err());
        assert!(config.with_client_id("").options().is_err());
    }

    #[tokio::test]
    async fn test_incoming_publish_reaches_subscribers() {
        let (bus, _event_loop) = offline_bus();
        let mut first = bus.subscribe("cs/out/ocpp2.0.1/cs001").await.unwrap();
        let mut second = bus.subscribe("cs/out/ocpp2.0.1/cs001").await.unwrap();
        let mut other = bus.subscribe("cs/out/ocpp1.6/cs002").await.unwrap();
        assert_eq!(bus.topic_count(), 2);

        bus.routes.dispatch("cs/out/ocpp2.0.1/cs001", b"hello");
        bus.routes.dispatch("cs/out/ocpp2.0.1/nobody", b"lost");

        assert_eq!(first.recv().await.unwrap(), b"hello");
        assert_eq!(second.recv().await.unwrap(), b"hello");
        assert!(other.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_subscription_drops_message() {
        let (bus, _event_loop) = offline_bus();
        let mut sub = bus.subscribe("a").await.unwrap();

        for _ in 0..SUBSCRIPTION_QUEUE_LEN + 1 {
            bus.routes.dispatch("a", b"x");
        }

        let mut received = 0;
        while sub.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIPTION_QUEUE_LEN);
    }

    #[tokio::test]
    async fn test_dropped_subscription_releases_topic() {
        let (bus, _event_loop) = offline_bus();
        let sub = bus.subscribe("a").await.unwrap();
        let kept = bus.subscribe("b").await.unwrap();
        assert_eq!(bus.topic_count(), 2);

        drop(sub);

        let mut released = false;
        for _ in 0..50 {
            if bus.topic_count() == 1 {
                released = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(released, "topic kept after its last subscription dropped");
        assert_eq!(kept.topic(), "b");
    }

    #[tokio::test]
    async fn test_publish_is_queued_for_the_broker() {
        let (bus, _event_loop) = offline_bus();
        tokio_test::assert_ok!(bus.publish("cs/in/ocpp2.0.1/cs001", b"{}".to_vec()).await);
    }
}
