//! ---
//! sim_section: "02-device-model"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Uplink events and downlink commands exchanged with devices."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

/// Application port used when a message does not specify one.
pub const DEFAULT_F_PORT: u8 = 10;

/// One uplink frame produced by a device. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkEvent {
    pub application_id: String,
    pub device_id: String,
    pub seq: u32,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub rssi: i32,
    pub snr: f64,
    pub f_port: u8,
    /// Correlation id of the confirmed downlink this uplink acknowledges.
    pub ack: Option<String>,
    /// Decoded form of `payload`, for profiles that have one.
    pub object: Option<SensorReading>,
}

/// Battery and temperature carried by a temperature sensor payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub battery: i32,
    pub temperature: f32,
}

/// Downlink addressed to a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkCommand {
    pub device_id: String,
    pub confirmed: bool,
    pub payload: Vec<u8>,
    pub correlation_id: String,
    pub f_port: Option<u8>,
}

/// What a downlink changed on the device.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum DownlinkEffect {
    IntervalChanged {
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        interval: Duration,
    },
    BatteryReset,
    Stored,
    Ignored { reason: String },
}

impl DownlinkEffect {
    /// New uplink interval, if the downlink asked for one.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            DownlinkEffect::IntervalChanged { interval } => Some(*interval),
            _ => None,
        }
    }
}
