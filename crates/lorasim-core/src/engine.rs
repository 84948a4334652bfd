//! ---
//! sim_section: "04-session-control"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Device engine task: scheduler loop, uplink production and downlink application."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use lorasim_common::{DeviceConfig, Result, SimulatorError};
use lorasim_device::scheduler::due_after;
use lorasim_device::{
    Clock, Device, DownlinkCommand, DownlinkEffect, ManualClock, Scheduler, SharedClock,
    SystemClock, UplinkEvent,
};
use lorasim_mqtt::{OutboundMessage, Topics};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::status::{SessionEvent, StatusBus};

const TICK_QUEUE: usize = 16;

/// What drives simulated time.
pub enum TickSource {
    /// Wall clock; the loop sleeps until the earliest due device.
    Timer { clock: SharedClock },
    /// Time moves only when a [`ManualTicker`] asks for a tick.
    Manual {
        clock: ManualClock,
        ticks: mpsc::Receiver<TickRequest>,
    },
}

impl TickSource {
    pub fn timer() -> Self {
        TickSource::Timer {
            clock: Arc::new(SystemClock),
        }
    }

    /// Manual time starting at `start`, plus the handle that advances it.
    pub fn manual(start: DateTime<Utc>) -> (Self, ManualTicker) {
        let clock = ManualClock::new(start);
        let (tx, ticks) = mpsc::channel(TICK_QUEUE);
        (
            TickSource::Manual {
                clock: clock.clone(),
                ticks,
            },
            ManualTicker { tx, clock },
        )
    }

    fn now(&self) -> DateTime<Utc> {
        match self {
            TickSource::Timer { clock } => clock.now(),
            TickSource::Manual { clock, .. } => clock.now(),
        }
    }
}

impl std::fmt::Debug for TickSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TickSource::Timer { .. } => f.write_str("TickSource::Timer"),
            TickSource::Manual { clock, .. } => write!(f, "TickSource::Manual({})", clock.now()),
        }
    }
}

#[derive(Debug)]
pub struct TickRequest {
    advance: Duration,
    done: oneshot::Sender<TickReport>,
}

/// Uplinks produced by one manual tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub now: DateTime<Utc>,
    pub uplinks: Vec<UplinkEvent>,
}

/// Advances a manually driven engine.
#[derive(Debug, Clone)]
pub struct ManualTicker {
    tx: mpsc::Sender<TickRequest>,
    clock: ManualClock,
}

impl ManualTicker {
    /// Advance simulated time by `advance` and fire every due device.
    pub async fn tick(&self, advance: Duration) -> Result<TickReport> {
        let (done, report) = oneshot::channel();
        self.tx
            .send(TickRequest { advance, done })
            .await
            .map_err(|_| SimulatorError::SessionClosed)?;
        report.await.map_err(|_| SimulatorError::SessionClosed)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Runtime requests from the controller.
#[derive(Debug)]
pub(crate) enum EngineCommand {
    AddDevice {
        config: DeviceConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveDevice {
        device_id: String,
        reply: oneshot::Sender<bool>,
    },
    Pause,
    Resume,
    DeviceIds {
        reply: oneshot::Sender<Vec<String>>,
    },
}

#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub uplinks: AtomicU64,
    pub downlinks_applied: AtomicU64,
    pub devices: AtomicU64,
}

/// Owns the devices and their schedule. Runs as one task.
pub(crate) struct Engine {
    application_id: String,
    topics: Topics,
    devices: IndexMap<String, Device>,
    scheduler: Scheduler,
    outbound: mpsc::Sender<OutboundMessage>,
    downlinks: mpsc::Receiver<DownlinkCommand>,
    commands: mpsc::Receiver<EngineCommand>,
    status: StatusBus,
    counters: Arc<EngineCounters>,
    idle_wait: Duration,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        application_id: &str,
        devices: Vec<Device>,
        outbound: mpsc::Sender<OutboundMessage>,
        downlinks: mpsc::Receiver<DownlinkCommand>,
        commands: mpsc::Receiver<EngineCommand>,
        status: StatusBus,
        counters: Arc<EngineCounters>,
        idle_wait: Duration,
    ) -> Self {
        let devices: IndexMap<String, Device> = devices
            .into_iter()
            .map(|device| (device.id().to_owned(), device))
            .collect();
        counters
            .devices
            .store(devices.len() as u64, Ordering::Relaxed);
        Self {
            application_id: application_id.to_owned(),
            topics: Topics::new(application_id),
            devices,
            scheduler: Scheduler::new(),
            outbound,
            downlinks,
            commands,
            status,
            counters,
            idle_wait,
        }
    }

    pub(crate) async fn run(mut self, source: TickSource, mut shutdown: broadcast::Receiver<()>) {
        let start = source.now();
        for device in self.devices.values() {
            self.scheduler.add(device.id(), start, device.interval());
        }
        info!(
            application_id = %self.application_id,
            devices = self.devices.len(),
            source = ?source,
            "device engine started"
        );

        match source {
            TickSource::Timer { clock } => self.run_timer(clock, &mut shutdown).await,
            TickSource::Manual { clock, ticks } => {
                self.run_manual(clock, ticks, &mut shutdown).await
            }
        }
        info!(application_id = %self.application_id, "device engine stopped");
    }

    async fn run_timer(&mut self, clock: SharedClock, shutdown: &mut broadcast::Receiver<()>) {
        loop {
            let now = clock.now();
            self.fire_due(now).await;

            let wait = self
                .scheduler
                .next_due()
                .map(|due| (due - clock.now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(self.idle_wait)
                .min(self.idle_wait);
            let sleep = tokio::time::sleep(wait);
            tokio::pin!(sleep);

            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command, clock.now()),
                    None => break,
                },
                Some(command) = self.downlinks.recv() => self.apply_downlink(command, clock.now()),
                _ = &mut sleep => {}
            }
        }
    }

    async fn run_manual(
        &mut self,
        clock: ManualClock,
        mut ticks: mpsc::Receiver<TickRequest>,
        shutdown: &mut broadcast::Receiver<()>,
    ) {
        let mut ticks_open = true;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command, clock.now()),
                    None => break,
                },
                Some(command) = self.downlinks.recv() => self.apply_downlink(command, clock.now()),
                request = ticks.recv(), if ticks_open => match request {
                    Some(TickRequest { advance, done }) => {
                        let now = clock.advance(advance);
                        let uplinks = self.fire_due(now).await;
                        let _ = done.send(TickReport { now, uplinks });
                    }
                    None => ticks_open = false,
                },
            }
        }
    }

    /// Fire every device due at `now`, in schedule order.
    async fn fire_due(&mut self, now: DateTime<Utc>) -> Vec<UplinkEvent> {
        let mut emitted = Vec::new();
        for device_id in self.scheduler.pop_due(now) {
            let Some(device) = self.devices.get_mut(&device_id) else {
                continue;
            };
            let Some(event) = device.next_uplink(now) else {
                let due = next_due_for(device, now);
                self.scheduler.schedule(&device_id, due);
                continue;
            };
            let interval = device.interval();
            self.scheduler.reschedule(&device_id, now, interval);
            self.queue_uplink(&event).await;
            emitted.push(event);
        }
        emitted
    }

    async fn queue_uplink(&self, event: &UplinkEvent) {
        let message = match self.topics.encode_uplink(event) {
            Ok(message) => message,
            Err(err) => {
                warn!(device_id = %event.device_id, seq = event.seq, error = %err, "uplink encoding failed");
                return;
            }
        };
        let topic = message.topic.clone();
        if self.outbound.send(message).await.is_err() {
            warn!(device_id = %event.device_id, seq = event.seq, "bridge gone, uplink discarded");
            return;
        }
        self.counters.uplinks.fetch_add(1, Ordering::Relaxed);
        debug!(device_id = %event.device_id, seq = event.seq, %topic, "uplink queued");
        self.status.emit(SessionEvent::UplinkQueued {
            device_id: event.device_id.clone(),
            seq: event.seq,
            topic,
        });
    }

    fn apply_downlink(&mut self, command: DownlinkCommand, now: DateTime<Utc>) {
        let Some(device) = self.devices.get_mut(&command.device_id) else {
            warn!(
                device_id = %command.device_id,
                correlation_id = %command.correlation_id,
                "downlink for unknown device ignored"
            );
            return;
        };
        let effect = device.apply_downlink(&command);
        if let DownlinkEffect::IntervalChanged { .. } = effect {
            let due = next_due_for(device, now);
            self.scheduler.schedule(&command.device_id, due);
        }
        self.counters
            .downlinks_applied
            .fetch_add(1, Ordering::Relaxed);
        info!(
            device_id = %command.device_id,
            correlation_id = %command.correlation_id,
            confirmed = command.confirmed,
            effect = ?effect,
            "downlink applied"
        );
        self.status.emit(SessionEvent::DownlinkApplied {
            device_id: command.device_id,
            correlation_id: command.correlation_id,
            confirmed: command.confirmed,
            effect,
        });
    }

    fn handle_command(&mut self, command: EngineCommand, now: DateTime<Utc>) {
        match command {
            EngineCommand::AddDevice { config, reply } => {
                let _ = reply.send(self.add_device(&config, now));
            }
            EngineCommand::RemoveDevice { device_id, reply } => {
                let removed = self.devices.shift_remove(&device_id).is_some();
                if removed {
                    self.scheduler.remove(&device_id);
                    self.sync_device_count();
                    info!(%device_id, "device removed");
                    self.status.emit(SessionEvent::DeviceRemoved { device_id });
                }
                let _ = reply.send(removed);
            }
            EngineCommand::Pause => {
                if !self.scheduler.is_paused() {
                    self.scheduler.pause();
                    info!("scheduler paused");
                    self.status.emit(SessionEvent::Paused);
                }
            }
            EngineCommand::Resume => {
                if self.scheduler.is_paused() {
                    self.scheduler.resume();
                    info!("scheduler resumed");
                    self.status.emit(SessionEvent::Resumed);
                }
            }
            EngineCommand::DeviceIds { reply } => {
                let _ = reply.send(self.devices.keys().cloned().collect());
            }
        }
    }

    fn add_device(&mut self, config: &DeviceConfig, now: DateTime<Utc>) -> Result<()> {
        if self.devices.contains_key(&config.device_id) {
            return Err(SimulatorError::configuration(format!(
                "device '{}' is already registered",
                config.device_id
            )));
        }
        let device = Device::from_config(&self.application_id, config)?;
        self.scheduler.add(device.id(), now, device.interval());
        self.devices.insert(device.id().to_owned(), device);
        self.sync_device_count();
        info!(device_id = %config.device_id, "device added");
        self.status.emit(SessionEvent::DeviceAdded {
            device_id: config.device_id.clone(),
        });
        Ok(())
    }

    fn sync_device_count(&self) {
        self.counters
            .devices
            .store(self.devices.len() as u64, Ordering::Relaxed);
    }
}

/// One interval after the last emission, never in the past.
fn next_due_for(device: &Device, now: DateTime<Utc>) -> DateTime<Utc> {
    match device.last_emission() {
        Some(last) => due_after(last, device.interval()).max(now),
        None => due_after(now, device.interval()),
    }
}
