//! ---
//! sim_section: "04-session-control"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Session lifecycle: start, runtime control and ordered teardown."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use lorasim_common::{DeviceConfig, ErrorKind, Result, SessionConfig, SimulatorError};
use lorasim_device::Device;
use lorasim_mqtt::{
    BridgeHandle, BridgeNotice, BridgeReport, BridgeSettings, BridgeState, BrokerSession,
    MemoryBroker, MqttBridge, RumqttSession,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::{Engine, EngineCommand, EngineCounters, TickSource};
use crate::status::{SessionEvent, SessionMetrics, StatusBus, StopReason};

const COMMAND_QUEUE: usize = 32;

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed { kind: ErrorKind, message: String },
}

impl SessionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SessionOutcome::Failed { .. })
    }
}

/// Optional overrides for [`SimulationController::start`].
pub struct SessionBuilder {
    config: SessionConfig,
    broker: Option<Box<dyn BrokerSession>>,
    ticks: Option<TickSource>,
    status: Option<StatusBus>,
}

impl SessionBuilder {
    /// Use this broker session instead of the one derived from the URL.
    pub fn broker(mut self, session: Box<dyn BrokerSession>) -> Self {
        self.broker = Some(session);
        self
    }

    pub fn ticks(mut self, source: TickSource) -> Self {
        self.ticks = Some(source);
        self
    }

    /// Publish session events on an existing bus, e.g. one already subscribed to.
    pub fn status(mut self, bus: StatusBus) -> Self {
        self.status = Some(bus);
        self
    }

    /// Validate, connect and start the session. Resolves once the bridge is
    /// connected.
    pub async fn start(self) -> Result<SimulationController> {
        let SessionBuilder {
            config,
            broker,
            ticks,
            status,
        } = self;
        config.validate()?;

        let devices = config
            .devices
            .iter()
            .map(|device| Device::from_config(&config.application_id, device))
            .collect::<Result<Vec<_>>>()?;
        let session = match broker {
            Some(session) => session,
            None => default_session(&config)?,
        };
        let status = status.unwrap_or_default();
        let session_id = Uuid::new_v4();
        info!(
            %session_id,
            application_id = %config.application_id,
            broker = %config.broker.url,
            devices = devices.len(),
            "starting simulation session"
        );

        let (downlink_tx, downlink_rx) = mpsc::channel(config.publish.channel_capacity.max(1));
        let (bridge, bridge_handle) =
            MqttBridge::new(BridgeSettings::from_session(&config), session, downlink_tx);
        let (bridge_shutdown, bridge_shutdown_rx) = broadcast::channel(1);
        let mut bridge_task = bridge.spawn(bridge_shutdown_rx);

        if bridge_handle.wait_for(BridgeState::Connected).await != BridgeState::Connected {
            let cause = match (&mut bridge_task).await {
                Ok(Err(err)) => err,
                Ok(Ok(_)) => SimulatorError::Connectivity {
                    attempts: 0,
                    reason: "bridge stopped before connecting".into(),
                },
                Err(join) => SimulatorError::Connectivity {
                    attempts: 0,
                    reason: format!("bridge task failed: {}", join),
                },
            };
            error!(%session_id, error = %cause, "session failed to start");
            return Err(SimulatorError::startup(cause));
        }

        let notices = bridge_handle.notices();
        let counters = Arc::new(EngineCounters::default());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (engine_shutdown, engine_shutdown_rx) = broadcast::channel(1);
        let engine = Engine::new(
            &config.application_id,
            devices,
            bridge_handle.outbound(),
            downlink_rx,
            command_rx,
            status.clone(),
            Arc::clone(&counters),
            config.scheduler.idle_wait,
        );
        let device_count = counters.devices.load(Ordering::Relaxed) as usize;
        let engine_task = tokio::spawn(engine.run(ticks.unwrap_or_else(TickSource::timer), engine_shutdown_rx));

        status.emit(SessionEvent::Started {
            session_id,
            devices: device_count,
        });
        status.emit(SessionEvent::BridgeState {
            state: BridgeState::Connected,
        });

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let supervisor = Supervisor {
            session_id,
            status: status.clone(),
            bridge: bridge_handle.clone(),
            engine_task,
            engine_shutdown,
            bridge_task,
            bridge_shutdown,
            stop_timeout: config.scheduler.stop_timeout,
            flush_grace: config.publish.flush_grace,
        };
        tokio::spawn(supervisor.run(stop_rx, notices, outcome_tx));

        info!(%session_id, "simulation session running");
        Ok(SimulationController {
            session_id,
            commands: command_tx,
            bridge: bridge_handle,
            status,
            counters,
            stop: stop_tx,
            outcome: outcome_rx,
        })
    }
}

fn default_session(config: &SessionConfig) -> Result<Box<dyn BrokerSession>> {
    if config.broker.is_in_memory() {
        info!(url = %config.broker.url, "using in-process broker");
        return Ok(Box::new(MemoryBroker::new().session()));
    }
    Ok(Box::new(RumqttSession::new(&config.broker)?))
}

/// Handle on a running simulation session.
#[derive(Debug)]
pub struct SimulationController {
    session_id: Uuid,
    commands: mpsc::Sender<EngineCommand>,
    bridge: BridgeHandle,
    status: StatusBus,
    counters: Arc<EngineCounters>,
    stop: mpsc::Sender<()>,
    outcome: watch::Receiver<Option<SessionOutcome>>,
}

impl SimulationController {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            broker: None,
            ticks: None,
            status: None,
        }
    }

    /// Start with the broker named by the config URL and wall-clock ticks.
    pub async fn start(config: SessionConfig) -> Result<Self> {
        Self::builder(config).start().await
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.status.subscribe()
    }

    pub fn bridge_state(&self) -> BridgeState {
        self.bridge.state()
    }

    pub fn is_running(&self) -> bool {
        self.outcome.borrow().is_none()
    }

    pub fn metrics(&self) -> SessionMetrics {
        SessionMetrics {
            session_id: self.session_id,
            devices: self.counters.devices.load(Ordering::Relaxed),
            uplinks: self.counters.uplinks.load(Ordering::Relaxed),
            downlinks_applied: self.counters.downlinks_applied.load(Ordering::Relaxed),
            bridge: self.bridge.metrics(),
        }
    }

    pub async fn add_device(&self, config: DeviceConfig) -> Result<()> {
        config.validate()?;
        let (reply, response) = oneshot::channel();
        self.send(EngineCommand::AddDevice { config, reply }).await?;
        response.await.map_err(|_| SimulatorError::SessionClosed)?
    }

    /// Remove a device. Returns `false` if it was not registered.
    pub async fn remove_device(&self, device_id: &str) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.send(EngineCommand::RemoveDevice {
            device_id: device_id.to_owned(),
            reply,
        })
        .await?;
        response.await.map_err(|_| SimulatorError::SessionClosed)
    }

    pub async fn device_ids(&self) -> Result<Vec<String>> {
        let (reply, response) = oneshot::channel();
        self.send(EngineCommand::DeviceIds { reply }).await?;
        response.await.map_err(|_| SimulatorError::SessionClosed)
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(EngineCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(EngineCommand::Resume).await
    }

    /// Halt the scheduler, flush the bridge and disconnect. Calling it again,
    /// or after a fatal error, returns the same outcome.
    pub async fn stop(&self) -> SessionOutcome {
        let _ = self.stop.try_send(());
        self.wait().await
    }

    /// Resolve once the session has terminated, by `stop` or a fatal error.
    pub async fn wait(&self) -> SessionOutcome {
        let mut outcome = self.outcome.clone();
        loop {
            if let Some(done) = outcome.borrow_and_update().clone() {
                return done;
            }
            if outcome.changed().await.is_err() {
                return outcome.borrow().clone().unwrap_or(SessionOutcome::Failed {
                    kind: ErrorKind::SessionClosed,
                    message: "session supervisor vanished".into(),
                });
            }
        }
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        if !self.is_running() {
            return Err(SimulatorError::SessionClosed);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| SimulatorError::SessionClosed)
    }
}

/// Relays bridge activity onto the status bus and tears the session down.
struct Supervisor {
    session_id: Uuid,
    status: StatusBus,
    bridge: BridgeHandle,
    engine_task: JoinHandle<()>,
    engine_shutdown: broadcast::Sender<()>,
    bridge_task: JoinHandle<Result<BridgeReport>>,
    bridge_shutdown: broadcast::Sender<()>,
    stop_timeout: Duration,
    flush_grace: Duration,
}

impl Supervisor {
    async fn run(
        mut self,
        mut stop: mpsc::Receiver<()>,
        mut notices: broadcast::Receiver<BridgeNotice>,
        outcome: watch::Sender<Option<SessionOutcome>>,
    ) {
        // Transitions are relayed from the notices; the watch only catches a
        // stop the notices missed.
        let mut state = self.bridge.watch_state();
        let mut notices_open = true;

        let failure = loop {
            tokio::select! {
                biased;
                _ = stop.recv() => break None,
                notice = notices.recv(), if notices_open => match notice {
                    Ok(BridgeNotice::StateChanged { to: BridgeState::Stopped, .. }) => {
                        break Some(self.bridge_failure().await);
                    }
                    Ok(notice) => self.relay(notice),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "bridge notices lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => notices_open = false,
                },
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow_and_update() == BridgeState::Stopped {
                        break Some(self.bridge_failure().await);
                    }
                }
            }
        };

        let result = match failure {
            None => {
                info!(session_id = %self.session_id, "stop requested");
                self.shutdown_engine().await;
                self.shutdown_bridge().await
            }
            Some(err) => {
                error!(session_id = %self.session_id, error = %err, "session aborted");
                self.status.emit(SessionEvent::Error {
                    kind: err.kind(),
                    message: err.to_string(),
                });
                self.shutdown_engine().await;
                Err(err)
            }
        };

        self.status.emit(SessionEvent::BridgeState {
            state: BridgeState::Stopped,
        });
        let done = match result {
            Ok(()) => {
                self.status.emit(SessionEvent::Stopped {
                    reason: StopReason::Requested,
                });
                SessionOutcome::Completed
            }
            Err(err) => {
                self.status.emit(SessionEvent::Stopped {
                    reason: StopReason::Fatal,
                });
                SessionOutcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                }
            }
        };
        info!(session_id = %self.session_id, outcome = ?done, "simulation session stopped");
        let _ = outcome.send(Some(done));
    }

    fn relay(&self, notice: BridgeNotice) {
        match notice {
            BridgeNotice::StateChanged { to, .. } => {
                self.status.emit(SessionEvent::BridgeState { state: to })
            }
            BridgeNotice::MessageDropped {
                device_id,
                seq,
                dropped_total,
            } => self.status.emit(SessionEvent::MessageDropped {
                device_id,
                seq,
                dropped_total,
            }),
            BridgeNotice::Malformed { topic, reason } => {
                let err = SimulatorError::malformed(topic, reason);
                self.status.emit(SessionEvent::Error {
                    kind: err.kind(),
                    message: err.to_string(),
                });
            }
            BridgeNotice::DownlinkDiscarded {
                device_id,
                correlation_id,
            } => warn!(%device_id, %correlation_id, "downlink discarded by bridge"),
        }
    }

    /// The bridge stopped without being asked to.
    async fn bridge_failure(&mut self) -> SimulatorError {
        match (&mut self.bridge_task).await {
            Ok(Err(err)) => err,
            Ok(Ok(_)) => SimulatorError::SessionClosed,
            Err(join) => SimulatorError::Connectivity {
                attempts: 0,
                reason: format!("bridge task failed: {}", join),
            },
        }
    }

    async fn shutdown_engine(&mut self) {
        let _ = self.engine_shutdown.send(());
        if tokio::time::timeout(self.stop_timeout, &mut self.engine_task)
            .await
            .is_err()
        {
            warn!(timeout_ms = self.stop_timeout.as_millis() as u64, "device engine did not stop in time, aborting");
            self.engine_task.abort();
        }
    }

    async fn shutdown_bridge(&mut self) -> Result<()> {
        let _ = self.bridge_shutdown.send(());
        let bound = self.flush_grace + self.stop_timeout;
        match tokio::time::timeout(bound, &mut self.bridge_task).await {
            Ok(Ok(Ok(report))) => {
                if report.undelivered > 0 {
                    warn!(
                        undelivered = report.undelivered,
                        "publishes left undelivered at shutdown"
                    );
                }
                Ok(())
            }
            Ok(Ok(Err(err))) => {
                if err.is_fatal() {
                    Err(err)
                } else {
                    warn!(error = %err, "bridge reported an error while stopping");
                    Ok(())
                }
            }
            Ok(Err(join)) => {
                warn!(error = %join, "bridge task ended abnormally");
                Ok(())
            }
            Err(_) => {
                warn!(timeout_ms = bound.as_millis() as u64, "bridge did not stop in time, aborting");
                self.bridge_task.abort();
                Ok(())
            }
        }
    }
}
