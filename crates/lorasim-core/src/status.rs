//! ---
//! sim_section: "04-session-control"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Session status stream and metrics snapshot."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use lorasim_common::ErrorKind;
use lorasim_device::DownlinkEffect;
use lorasim_mqtt::{BridgeMetrics, BridgeState};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1024;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    Fatal,
}

/// Lifecycle and traffic notifications of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        session_id: Uuid,
        devices: usize,
    },
    BridgeState {
        state: BridgeState,
    },
    DeviceAdded {
        device_id: String,
    },
    DeviceRemoved {
        device_id: String,
    },
    Paused,
    Resumed,
    UplinkQueued {
        device_id: String,
        seq: u32,
        topic: String,
    },
    DownlinkApplied {
        device_id: String,
        correlation_id: String,
        confirmed: bool,
        effect: DownlinkEffect,
    },
    MessageDropped {
        device_id: String,
        seq: u32,
        dropped_total: u64,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Stopped {
        reason: StopReason,
    },
}

/// Broadcast fan-out of [`SessionEvent`]s. Slow subscribers lag and lose
/// the oldest events; the session itself never blocks on them.
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl StatusBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        debug!(?event, "session event");
        let _ = self.tx.send(event);
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Point-in-time counters of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: Uuid,
    pub devices: u64,
    pub uplinks: u64,
    pub downlinks_applied: u64,
    pub bridge: BridgeMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(SessionEvent::Stopped {
            reason: StopReason::Fatal,
        })
        .unwrap();
        assert_eq!(json["event"], "stopped");
        assert_eq!(json["reason"], "fatal");

        let json = serde_json::to_value(SessionEvent::BridgeState {
            state: BridgeState::Reconnecting,
        })
        .unwrap();
        assert_eq!(json["state"], "reconnecting");
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let bus = StatusBus::new(4);
        bus.emit(SessionEvent::Paused);
        let mut rx = bus.subscribe();
        bus.emit(SessionEvent::Resumed);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Resumed);
    }
}
