//! ---
//! sim_section: "03-mqtt-bridge"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Broker session abstraction with rumqttc and in-process backends."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lorasim_common::{BrokerConfig, QosLevel, SimulatorError};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Failures reported by a broker session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
    /// The client request queue is full; retry after polling.
    #[error("client request queue is full")]
    Busy,
    #[error("session is not connected")]
    NotConnected,
    #[error("session closed")]
    Closed,
}

/// Something the broker told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Message { topic: String, payload: Vec<u8> },
    /// A QoS 1/2 publish completed.
    PublishAck,
    SubscribeAck { granted: bool },
    Disconnected { reason: String },
}

/// One logical connection to an MQTT broker.
///
/// `poll` must be cancel safe: the bridge races it against its channels.
#[async_trait]
pub trait BrokerSession: Send {
    async fn connect(&mut self) -> Result<(), BrokerError>;
    async fn subscribe(&mut self, filter: &str, qos: QosLevel) -> Result<(), BrokerError>;
    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QosLevel) -> Result<(), BrokerError>;
    async fn poll(&mut self) -> Result<BrokerEvent, BrokerError>;
    async fn disconnect(&mut self) -> Result<(), BrokerError>;
    fn name(&self) -> &'static str;
}

fn to_qos(level: QosLevel) -> QoS {
    match level {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Session backed by `rumqttc`. Every `connect` starts a fresh clean session.
pub struct RumqttSession {
    options: MqttOptions,
    request_capacity: usize,
    connect_timeout: Duration,
    client: Option<AsyncClient>,
    eventloop: Option<EventLoop>,
}

impl RumqttSession {
    pub fn new(config: &BrokerConfig) -> Result<Self, SimulatorError> {
        let url = config.parsed_url()?;
        let tls = matches!(url.scheme(), "ssl" | "mqtts");
        let host = url
            .host_str()
            .ok_or_else(|| SimulatorError::configuration("broker url has no host"))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        let mut options = MqttOptions::new(&config.client_id, host, port);
        options.set_keep_alive(config.keep_alive.max(MIN_KEEP_ALIVE));
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }
        if tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        Ok(Self {
            options,
            request_capacity: config.request_capacity,
            connect_timeout: config.connect_timeout,
            client: None,
            eventloop: None,
        })
    }

    fn client(&self) -> Result<&AsyncClient, BrokerError> {
        self.client.as_ref().ok_or(BrokerError::NotConnected)
    }

    fn drop_connection(&mut self) {
        self.client = None;
        self.eventloop = None;
    }
}

#[async_trait]
impl BrokerSession for RumqttSession {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        self.drop_connection();
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), self.request_capacity);
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(BrokerError::Connect(format!("broker refused: {:?}", ack.code)))
                        };
                    }
                    Ok(_) => continue,
                    Err(err) => return Err(BrokerError::Connect(err.to_string())),
                }
            }
        };
        let outcome = tokio::time::timeout(self.connect_timeout, handshake).await;
        match outcome {
            Ok(Ok(())) => {
                let (host, port) = self.options.broker_address();
                info!(%host, port, "mqtt session established");
                self.client = Some(client);
                self.eventloop = Some(eventloop);
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(BrokerError::Connect(format!(
                "no CONNACK within {:?}",
                self.connect_timeout
            ))),
        }
    }

    async fn subscribe(&mut self, filter: &str, qos: QosLevel) -> Result<(), BrokerError> {
        self.client()?
            .try_subscribe(filter, to_qos(qos))
            .map_err(|err| BrokerError::Subscribe(err.to_string()))
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QosLevel) -> Result<(), BrokerError> {
        match self.client()?.try_publish(topic, to_qos(qos), false, payload.to_vec()) {
            Ok(()) => Ok(()),
            Err(rumqttc::ClientError::TryRequest(_)) => Err(BrokerError::Busy),
            Err(err) => Err(BrokerError::Publish(err.to_string())),
        }
    }

    async fn poll(&mut self) -> Result<BrokerEvent, BrokerError> {
        let eventloop = self.eventloop.as_mut().ok_or(BrokerError::NotConnected)?;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(BrokerEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::PubAck(_))) | Ok(Event::Incoming(Packet::PubComp(_))) => {
                    return Ok(BrokerEvent::PublishAck);
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let granted = ack
                        .return_codes
                        .iter()
                        .all(|code| !matches!(code, SubscribeReasonCode::Failure));
                    return Ok(BrokerEvent::SubscribeAck { granted });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.drop_connection();
                    return Ok(BrokerEvent::Disconnected {
                        reason: "broker sent DISCONNECT".into(),
                    });
                }
                Ok(_) => continue,
                Err(err) => {
                    self.drop_connection();
                    return Ok(BrokerEvent::Disconnected {
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        let (Some(client), Some(mut eventloop)) = (self.client.take(), self.eventloop.take()) else {
            return Ok(());
        };
        client
            .try_disconnect()
            .map_err(|err| BrokerError::Publish(err.to_string()))?;
        let drain = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_TIMEOUT, drain).await.is_err() {
            debug!("disconnect not confirmed before timeout");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rumqttc"
    }
}

/// Publish observed by the in-process broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
}

#[derive(Debug, Default)]
struct MemoryState {
    connected: bool,
    connect_attempts: u32,
    connect_times: Vec<tokio::time::Instant>,
    failing_connects: u32,
    refuse_connects: bool,
    failing_publishes: u32,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<String>,
    inbound: Option<mpsc::UnboundedSender<BrokerEvent>>,
}

impl MemoryState {
    fn notify(&self, event: BrokerEvent) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(event);
        }
    }
}

/// In-process broker used for dry runs and tests. Clones share state, so a
/// test keeps one handle while the bridge drives a [`MemoryBroker::session`].
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session. Only the most recent session receives broker events.
    pub fn session(&self) -> MemorySession {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().inbound = Some(tx);
        MemorySession {
            state: Arc::clone(&self.state),
            events: rx,
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Refuse every connection attempt until switched off.
    pub fn refuse_connects(&self, refuse: bool) {
        self.state.lock().refuse_connects = refuse;
    }

    /// Fail the next `count` publishes and drop the connection each time.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().failing_publishes = count;
    }

    /// Sever the current connection as if the network went away.
    pub fn drop_connection(&self) {
        let mut state = self.state.lock();
        if state.connected {
            state.connected = false;
            state.notify(BrokerEvent::Disconnected {
                reason: "connection dropped".into(),
            });
        }
    }

    /// Deliver a message to the session if it subscribed to a matching filter.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let state = self.state.lock();
        let subscribed = state
            .subscriptions
            .iter()
            .any(|filter| topic_matches(filter, topic));
        if state.connected && subscribed {
            state.notify(BrokerEvent::Message {
                topic: topic.to_owned(),
                payload: payload.into(),
            });
            true
        } else {
            false
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Instants of every connection attempt, on the tokio clock.
    pub fn connect_times(&self) -> Vec<tokio::time::Instant> {
        self.state.lock().connect_times.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

/// Session half of a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    events: mpsc::UnboundedReceiver<BrokerEvent>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        state.connect_times.push(tokio::time::Instant::now());
        if state.refuse_connects {
            return Err(BrokerError::Connect("connection refused".into()));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::Connect("connection refused".into()));
        }
        state.connected = true;
        state.subscriptions.clear();
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str, _qos: QosLevel) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        state.subscriptions.push(filter.to_owned());
        state.notify(BrokerEvent::SubscribeAck { granted: true });
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QosLevel) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            state.connected = false;
            return Err(BrokerError::Publish("connection reset".into()));
        }
        state.published.push(PublishedMessage {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            qos,
        });
        if qos.requires_ack() {
            state.notify(BrokerEvent::PublishAck);
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<BrokerEvent, BrokerError> {
        self.events.recv().await.ok_or(BrokerError::Closed)
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.state.lock().connected = false;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// MQTT filter matching with `+` and trailing `#`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match (part, levels.next()) {
            ("#", _) => return true,
            ("+", Some(_)) => continue,
            (expected, Some(actual)) if expected == actual => continue,
            _ => return false,
        }
    }
    levels.next().is_none()
}
