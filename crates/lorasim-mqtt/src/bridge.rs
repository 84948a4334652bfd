//! ---
//! sim_section: "03-mqtt-bridge"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Reconnecting MQTT bridge task."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
//! The bridge owns the broker session for the lifetime of a simulator
//! session. It runs as a single task that
//!
//! * connects with exponential backoff and re-subscribes after every connect,
//! * publishes encoded uplinks, keeping them in a bounded buffer while the
//!   broker is unreachable,
//! * decodes downlinks and forwards them to the device engine,
//! * flushes what it can within a grace period when asked to shut down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lorasim_common::{QosLevel, ReconnectConfig, Result, SessionConfig, SimulatorError};
use lorasim_device::DownlinkCommand;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::broker::{BrokerError, BrokerEvent, BrokerSession};
use crate::buffer::OutboundBuffer;
use crate::codec::{OutboundMessage, Topics};
use crate::logging::{log_dropped, log_inbound, log_outbound, MessageDirection};

const NOTICE_CAPACITY: usize = 256;

/// Connection state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

/// Bridge parameters derived from the session configuration.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub application_id: String,
    pub qos: QosLevel,
    pub reconnect: ReconnectConfig,
    pub buffer_capacity: usize,
    pub channel_capacity: usize,
    pub flush_grace: Duration,
}

impl BridgeSettings {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            application_id: config.application_id.clone(),
            qos: config.broker.qos,
            reconnect: config.reconnect.clone(),
            buffer_capacity: config.publish.buffer_capacity,
            channel_capacity: config.publish.channel_capacity,
            flush_grace: config.publish.flush_grace,
        }
    }
}

/// Snapshot of bridge counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeMetrics {
    /// Publishes handed to the broker.
    pub published: u64,
    /// Messages received on the downlink subscription.
    pub received: u64,
    /// Downlinks forwarded to devices.
    pub routed: u64,
    /// Uplinks evicted from the full buffer.
    pub dropped: u64,
    /// Inbound messages rejected by the codec.
    pub malformed: u64,
    /// Successful reconnections after a lost connection.
    pub reconnects: u64,
    /// Messages waiting in the buffer.
    pub buffered: u64,
    /// Publishes awaiting broker acknowledgement.
    pub inflight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    received: AtomicU64,
    routed: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    reconnects: AtomicU64,
    buffered: AtomicU64,
    inflight: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn snapshot(&self) -> BridgeMetrics {
        BridgeMetrics {
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
        }
    }
}

/// Bridge activity in the order it happened. Unlike [`BridgeHandle::watch_state`],
/// every state transition is delivered, however quickly the next one follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeNotice {
    StateChanged {
        from: BridgeState,
        to: BridgeState,
    },
    MessageDropped {
        device_id: String,
        seq: u32,
        dropped_total: u64,
    },
    Malformed {
        topic: String,
        reason: String,
    },
    DownlinkDiscarded {
        device_id: String,
        correlation_id: String,
    },
}

/// Final accounting returned when the bridge task ends cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeReport {
    pub metrics: BridgeMetrics,
    /// Buffered or unacknowledged publishes left behind.
    pub undelivered: usize,
}

/// Cloneable view on a running bridge.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    outbound: mpsc::Sender<OutboundMessage>,
    state: watch::Receiver<BridgeState>,
    counters: Arc<Counters>,
    notices: broadcast::Sender<BridgeNotice>,
}

impl BridgeHandle {
    /// Sender feeding the publish path.
    pub fn outbound(&self) -> mpsc::Sender<OutboundMessage> {
        self.outbound.clone()
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    pub fn metrics(&self) -> BridgeMetrics {
        self.counters.snapshot()
    }

    pub fn notices(&self) -> broadcast::Receiver<BridgeNotice> {
        self.notices.subscribe()
    }

    /// Resolve once the bridge reaches `target` or stops.
    pub async fn wait_for(&self, target: BridgeState) -> BridgeState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current == target || current == BridgeState::Stopped {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }
}

enum Established {
    Connected,
    Shutdown,
}

enum Served {
    Shutdown,
    ConnectionLost(String),
}

/// Owner of the broker session.
pub struct MqttBridge {
    settings: BridgeSettings,
    topics: Topics,
    session: Box<dyn BrokerSession>,
    backoff: Backoff,
    buffer: OutboundBuffer,
    inflight: VecDeque<OutboundMessage>,
    outbound: mpsc::Receiver<OutboundMessage>,
    outbound_open: bool,
    downlinks: mpsc::Sender<DownlinkCommand>,
    state: watch::Sender<BridgeState>,
    counters: Arc<Counters>,
    notices: broadcast::Sender<BridgeNotice>,
}

impl MqttBridge {
    pub fn new(
        settings: BridgeSettings,
        session: Box<dyn BrokerSession>,
        downlinks: mpsc::Sender<DownlinkCommand>,
    ) -> (Self, BridgeHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.channel_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(BridgeState::Disconnected);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let counters = Arc::new(Counters::default());

        let handle = BridgeHandle {
            outbound: outbound_tx,
            state: state_rx,
            counters: Arc::clone(&counters),
            notices: notices.clone(),
        };
        let bridge = Self {
            topics: Topics::new(settings.application_id.clone()),
            backoff: Backoff::new(&settings.reconnect),
            buffer: OutboundBuffer::new(settings.buffer_capacity),
            inflight: VecDeque::new(),
            session,
            outbound: outbound_rx,
            outbound_open: true,
            downlinks,
            state: state_tx,
            counters,
            notices,
            settings,
        };
        (bridge, handle)
    }

    /// Run the bridge on its own task.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<BridgeReport>> {
        tokio::spawn(self.run(shutdown))
    }

    /// Drive the connection until shutdown or until the retry budget is spent.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<BridgeReport> {
        info!(
            session = self.session.name(),
            application_id = %self.topics.application_id(),
            "mqtt bridge starting"
        );
        let mut reconnecting = false;
        loop {
            match self.establish(&mut shutdown, reconnecting).await {
                Ok(Established::Connected) => {}
                Ok(Established::Shutdown) => return Ok(self.finish(false).await),
                Err(err) => {
                    self.set_state(BridgeState::Stopped);
                    return Err(err);
                }
            }
            match self.serve(&mut shutdown).await {
                Served::Shutdown => return Ok(self.finish(true).await),
                Served::ConnectionLost(reason) => {
                    warn!(%reason, "broker connection lost");
                    self.set_state(BridgeState::Disconnected);
                    self.requeue_inflight();
                    reconnecting = true;
                }
            }
        }
    }

    /// Announce before publishing so a watcher that sees `next` has already
    /// been preceded by its notice.
    fn set_state(&self, next: BridgeState) {
        let previous = *self.state.borrow();
        if previous == next {
            return;
        }
        info!(from = ?previous, to = ?next, "bridge state changed");
        let _ = self.notices.send(BridgeNotice::StateChanged {
            from: previous,
            to: next,
        });
        self.state.send_replace(next);
    }

    async fn establish(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
        reconnecting: bool,
    ) -> Result<Established> {
        self.set_state(if reconnecting {
            BridgeState::Reconnecting
        } else {
            BridgeState::Connecting
        });

        let mut attempts = 0u32;
        loop {
            // A lost connection waits before its first attempt; startup does not.
            let delay_index = if reconnecting { attempts + 1 } else { attempts };
            if delay_index > 0 {
                let delay = self.backoff.delay(delay_index);
                debug!(
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    "waiting before broker connect"
                );
                if self.sleep_accepting(delay, shutdown).await {
                    return Ok(Established::Shutdown);
                }
            }

            attempts += 1;
            match self.connect_and_subscribe().await {
                Ok(()) => break,
                Err(err) => {
                    warn!(
                        attempt = attempts,
                        max_retries = self.backoff.max_retries(),
                        error = %err,
                        "broker connect failed"
                    );
                    if !self.backoff.allows(attempts) {
                        return Err(SimulatorError::Connectivity {
                            attempts,
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }

        if reconnecting {
            Counters::bump(&self.counters.reconnects);
        }
        self.set_state(BridgeState::Connected);
        Ok(Established::Connected)
    }

    async fn connect_and_subscribe(&mut self) -> std::result::Result<(), BrokerError> {
        self.session.connect().await?;
        let filter = self.topics.downlink_filter();
        if let Err(err) = self.session.subscribe(&filter, self.settings.qos).await {
            let _ = self.session.disconnect().await;
            return Err(err);
        }
        info!(%filter, "subscribed to downlinks");
        Ok(())
    }

    /// Sleep for `delay` while still accepting outbound messages.
    /// Returns `true` when shutdown was requested.
    async fn sleep_accepting(
        &mut self,
        delay: Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                _ = shutdown.recv() => return true,
                message = self.outbound.recv(), if self.outbound_open => self.accept(message),
            }
        }
    }

    async fn serve(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Served {
        if let Err(reason) = self.flush().await {
            return Served::ConnectionLost(reason);
        }
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => return Served::Shutdown,
                event = self.session.poll() => {
                    let handled = match event {
                        Ok(event) => self.handle_event(event),
                        Err(err) => Err(err.to_string()),
                    };
                    if let Err(reason) = handled {
                        return Served::ConnectionLost(reason);
                    }
                    if !self.buffer.is_empty() {
                        if let Err(reason) = self.flush().await {
                            return Served::ConnectionLost(reason);
                        }
                    }
                }
                message = self.outbound.recv(), if self.outbound_open => {
                    self.accept(message);
                    if let Err(reason) = self.flush().await {
                        return Served::ConnectionLost(reason);
                    }
                }
            }
        }
    }

    fn accept(&mut self, message: Option<OutboundMessage>) {
        match message {
            Some(message) => {
                if let Some(evicted) = self.buffer.push(message) {
                    self.record_drop(&evicted);
                }
                self.sync_gauges();
            }
            None => {
                debug!("outbound channel closed");
                self.outbound_open = false;
            }
        }
    }

    fn record_drop(&self, message: &OutboundMessage) {
        let dropped_total = Counters::bump(&self.counters.dropped);
        log_dropped(message, dropped_total);
        let _ = self.notices.send(BridgeNotice::MessageDropped {
            device_id: message.device_id.clone(),
            seq: message.seq,
            dropped_total,
        });
    }

    fn requeue(&mut self, messages: Vec<OutboundMessage>) {
        for message in &messages {
            log_outbound(MessageDirection::Requeued, message);
        }
        for evicted in self.buffer.requeue(messages) {
            self.record_drop(&evicted);
        }
        self.sync_gauges();
    }

    fn requeue_inflight(&mut self) {
        let inflight: Vec<OutboundMessage> = self.inflight.drain(..).collect();
        if !inflight.is_empty() {
            debug!(count = inflight.len(), "requeueing unacknowledged publishes");
            self.requeue(inflight);
        }
    }

    /// Publish buffered messages in order. `Err` means the connection is gone.
    async fn flush(&mut self) -> std::result::Result<(), String> {
        while let Some(message) = self.buffer.pop() {
            match self
                .session
                .publish(&message.topic, &message.payload, self.settings.qos)
                .await
            {
                Ok(()) => {
                    Counters::bump(&self.counters.published);
                    log_outbound(MessageDirection::Outbound, &message);
                    if self.settings.qos.requires_ack() {
                        self.inflight.push_back(message);
                    }
                }
                Err(BrokerError::Busy) => {
                    self.requeue(vec![message]);
                    break;
                }
                Err(err) => {
                    self.requeue(vec![message]);
                    return Err(err.to_string());
                }
            }
        }
        self.sync_gauges();
        Ok(())
    }

    fn handle_event(&mut self, event: BrokerEvent) -> std::result::Result<(), String> {
        match event {
            BrokerEvent::Message { topic, payload } => {
                Counters::bump(&self.counters.received);
                log_inbound(&topic, &payload);
                self.route_downlink(&topic, &payload);
            }
            BrokerEvent::PublishAck => {
                self.inflight.pop_front();
                self.sync_gauges();
            }
            BrokerEvent::SubscribeAck { granted } => {
                if !granted {
                    warn!("broker rejected the downlink subscription");
                }
            }
            BrokerEvent::Disconnected { reason } => return Err(reason),
        }
        Ok(())
    }

    fn route_downlink(&mut self, topic: &str, payload: &[u8]) {
        let command = match self.topics.decode_downlink(topic, payload) {
            Ok(command) => command,
            Err(err) => {
                Counters::bump(&self.counters.malformed);
                warn!(%topic, error = %err, "discarding malformed downlink");
                let reason = match err {
                    SimulatorError::MalformedMessage { reason, .. } => reason,
                    other => other.to_string(),
                };
                let _ = self.notices.send(BridgeNotice::Malformed {
                    topic: topic.to_owned(),
                    reason,
                });
                return;
            }
        };

        match self.downlinks.try_send(command) {
            Ok(()) => {
                Counters::bump(&self.counters.routed);
            }
            Err(TrySendError::Full(command)) => {
                warn!(
                    device_id = %command.device_id,
                    correlation_id = %command.correlation_id,
                    "device engine busy, downlink discarded"
                );
                let _ = self.notices.send(BridgeNotice::DownlinkDiscarded {
                    device_id: command.device_id,
                    correlation_id: command.correlation_id,
                });
            }
            Err(TrySendError::Closed(command)) => {
                debug!(device_id = %command.device_id, "device engine gone, downlink discarded");
            }
        }
    }

    fn sync_gauges(&self) {
        self.counters
            .buffered
            .store(self.buffer.len() as u64, Ordering::Relaxed);
        self.counters
            .inflight
            .store(self.inflight.len() as u64, Ordering::Relaxed);
    }

    /// Publish until the buffer is empty and every publish is acknowledged.
    async fn drain_until_acked(&mut self) {
        loop {
            if self.flush().await.is_err() {
                return;
            }
            if self.buffer.is_empty() && self.inflight.is_empty() {
                return;
            }
            match self.session.poll().await {
                Ok(event) => {
                    if self.handle_event(event).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }

    async fn finish(mut self, connected: bool) -> BridgeReport {
        while let Ok(message) = self.outbound.try_recv() {
            self.accept(Some(message));
        }

        if connected {
            let grace = self.settings.flush_grace;
            if tokio::time::timeout(grace, self.drain_until_acked())
                .await
                .is_err()
            {
                warn!(grace_ms = grace.as_millis() as u64, "flush grace period elapsed");
            }
            if let Err(err) = self.session.disconnect().await {
                debug!(error = %err, "disconnect failed");
            }
        }

        self.sync_gauges();
        let undelivered = self.buffer.len() + self.inflight.len();
        if undelivered > 0 {
            warn!(undelivered, "bridge stopped with undelivered publishes");
        }
        self.set_state(BridgeState::Stopped);
        BridgeReport {
            metrics: self.counters.snapshot(),
            undelivered,
        }
    }
}
