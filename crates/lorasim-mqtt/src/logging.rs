//! ---
//! sim_section: "03-mqtt-bridge"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Structured log helpers for broker traffic."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use lorasim_common::SimulatorError;
use tracing::{debug, warn};

use crate::codec::OutboundMessage;

/// Direction of a message, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Handed to the broker.
    Outbound,
    /// Received from the broker.
    Inbound,
    /// Put back into the buffer after a failed or unacknowledged publish.
    Requeued,
}

pub fn log_outbound(direction: MessageDirection, message: &OutboundMessage) {
    debug!(
        topic = %message.topic,
        device_id = %message.device_id,
        seq = message.seq,
        bytes = message.payload.len(),
        direction = ?direction,
        "mqtt traffic"
    );
}

pub fn log_inbound(topic: &str, payload: &[u8]) {
    debug!(
        topic = %topic,
        bytes = payload.len(),
        direction = ?MessageDirection::Inbound,
        "mqtt traffic"
    );
}

pub fn log_dropped(message: &OutboundMessage, dropped_total: u64) {
    let error = SimulatorError::PublishBackpressure {
        dropped: dropped_total,
    };
    warn!(
        topic = %message.topic,
        device_id = %message.device_id,
        seq = message.seq,
        error = %error,
        "publish buffer full, oldest message dropped"
    );
}
