//! ---
//! sim_section: "03-mqtt-bridge"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "JSON bodies of uplink and downlink messages."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use lorasim_device::SensorReading;
use serde::{Deserialize, Serialize};

/// Body published on `{applicationId}/devices/{deviceId}/up`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkBody {
    pub device_id: String,
    pub application_id: String,
    pub seq: u32,
    pub timestamp: DateTime<Utc>,
    /// Base64 (standard alphabet) payload.
    pub data: String,
    pub rssi: i32,
    pub snr: f64,
    pub f_port: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<String>,
    /// `data` decoded, as a network-server payload codec would publish it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<SensorReading>,
}

/// Body expected on `{applicationId}/devices/{deviceId}/down`.
///
/// Only used for encoding; inbound bodies go through field-by-field
/// extraction in [`crate::codec`] so each defect gets its own reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownlinkBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub confirmed: bool,
    pub data: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f_port: Option<u8>,
}

pub mod fields {
    pub const DEVICE_ID: &str = "deviceId";
    pub const CONFIRMED: &str = "confirmed";
    pub const DATA: &str = "data";
    pub const CORRELATION_ID: &str = "correlationId";
    pub const F_PORT: &str = "fPort";
}
