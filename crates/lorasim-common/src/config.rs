//! ---
//! sim_section: "01-core-functionality"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Session configuration model, defaults and validation."
//! sim_version: "v0.0.0-prealpha"
//! sim_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::error::{Result, SimulatorError};
use crate::logging::LogFormat;

/// Largest application payload a LoRaWAN frame can carry (DR with 242 byte MACPayload).
pub const MAX_PAYLOAD_BYTES: usize = 242;

/// Widest UTC offset in use (UTC+14:00).
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// URL schemes accepted for the broker address.
pub const SUPPORTED_SCHEMES: &[&str] = &["tcp", "mqtt", "ssl", "mqtts", "memory"];

fn default_application_id() -> String {
    "chirpstack-simulator".to_owned()
}

fn default_broker_url() -> String {
    "tcp://localhost:1883".to_owned()
}

fn default_client_id() -> String {
    "chirpstack-simulator".to_owned()
}

fn default_qos() -> QosLevel {
    QosLevel::AtLeastOnce
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_request_capacity() -> usize {
    64
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    5
}

fn default_buffer_capacity() -> usize {
    256
}

fn default_channel_capacity() -> usize {
    256
}

fn default_flush_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_idle_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_seed() -> u64 {
    0xA11CE
}

fn default_day_temperature_delta() -> i32 {
    5
}

fn default_discharge_time() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Complete description of one simulator session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_application_id")]
    pub application_id: String,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Metadata describing where a [`SessionConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedSessionConfig {
    pub config: SessionConfig,
    pub source: PathBuf,
}

impl SessionConfig {
    pub const ENV_CONFIG_PATH: &'static str = "LORASIM_CONFIG";

    /// Load configuration from disk, respecting the `LORASIM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> anyhow::Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(
        candidates: &[P],
    ) -> anyhow::Result<LoadedSessionConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedSessionConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedSessionConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> anyhow::Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<SessionConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a device by identifier.
    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    /// Validate structural invariants before a session is started.
    pub fn validate(&self) -> Result<()> {
        validate_topic_segment("application_id", &self.application_id)?;
        self.broker.validate()?;
        self.reconnect.validate()?;
        self.publish.validate()?;

        if self.devices.is_empty() {
            return Err(SimulatorError::configuration(
                "configuration must contain at least one device",
            ));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !seen.insert(device.device_id.as_str()) {
                return Err(SimulatorError::configuration(format!(
                    "device '{}' is declared more than once",
                    device.device_id
                )));
            }
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            application_id: default_application_id(),
            broker: BrokerConfig::default(),
            reconnect: ReconnectConfig::default(),
            publish: PublishConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl std::str::FromStr for SessionConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: SessionConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// MQTT delivery guarantee requested for publishes and the downlink subscription.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum QosLevel {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    /// Whether publishes at this level wait for a broker acknowledgement.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, QosLevel::AtMostOnce)
    }
}

impl std::str::FromStr for QosLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "0" | "at_most_once" => Ok(QosLevel::AtMostOnce),
            "1" | "at_least_once" => Ok(QosLevel::AtLeastOnce),
            "2" | "exactly_once" => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("unknown qos level: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_qos")]
    pub qos: QosLevel,
    #[serde(default = "default_keep_alive", rename = "keep_alive_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
    #[serde(default = "default_connect_timeout", rename = "connect_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            client_id: default_client_id(),
            username: None,
            password: None,
            qos: default_qos(),
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            request_capacity: default_request_capacity(),
        }
    }
}

impl BrokerConfig {
    /// Parse the broker URL, checking scheme and host.
    pub fn parsed_url(&self) -> Result<Url> {
        let url = Url::parse(&self.url).map_err(|err| {
            SimulatorError::configuration(format!("broker url '{}' is invalid: {}", self.url, err))
        })?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(SimulatorError::configuration(format!(
                "broker url scheme '{}' is not supported (expected one of {})",
                url.scheme(),
                SUPPORTED_SCHEMES.join(", ")
            )));
        }
        if url.scheme() != "memory" && url.host_str().map_or(true, str::is_empty) {
            return Err(SimulatorError::configuration(format!(
                "broker url '{}' has no host",
                self.url
            )));
        }
        Ok(url)
    }

    /// True when the session should run against the in-process broker.
    pub fn is_in_memory(&self) -> bool {
        self.url.starts_with("memory:")
    }

    pub fn validate(&self) -> Result<()> {
        self.parsed_url()?;
        if self.client_id.trim().is_empty() {
            return Err(SimulatorError::configuration("broker client_id must not be empty"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(SimulatorError::configuration(
                "broker password requires a username",
            ));
        }
        if self.request_capacity == 0 {
            return Err(SimulatorError::configuration(
                "broker request_capacity must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Exponential backoff applied while (re)connecting to the broker.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay", rename = "initial_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_delay: Duration,
    #[serde(default = "default_max_delay", rename = "max_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, rename = "jitter_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            max_retries: default_max_retries(),
            jitter: Duration::ZERO,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay.is_zero() {
            return Err(SimulatorError::configuration(
                "reconnect initial_delay_ms must be greater than zero",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(SimulatorError::configuration(
                "reconnect max_delay_ms must not be smaller than initial_delay_ms",
            ));
        }
        if self.max_retries == 0 {
            return Err(SimulatorError::configuration(
                "reconnect max_retries must be at least 1",
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Messages kept while the broker is unreachable.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Capacity of the scheduler to bridge channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_flush_grace", rename = "flush_grace_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub flush_grace: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            channel_capacity: default_channel_capacity(),
            flush_grace: default_flush_grace(),
        }
    }
}

impl PublishConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(SimulatorError::configuration(
                "publish buffer_capacity must be greater than zero",
            ));
        }
        if self.channel_capacity == 0 {
            return Err(SimulatorError::configuration(
                "publish channel_capacity must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Longest sleep of the timer loop when no device is due.
    #[serde(default = "default_idle_wait", rename = "idle_wait_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_wait: Duration,
    /// Bound on how long `stop()` waits for each task before aborting it.
    #[serde(default = "default_stop_timeout", rename = "stop_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_wait: default_idle_wait(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    #[serde(default = "default_interval", rename = "interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
    #[serde(default)]
    pub payload: PayloadProfile,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Perturb payloads with session entropy instead of the seed alone.
    #[serde(default)]
    pub jitter: bool,
}

impl DeviceConfig {
    pub fn new(device_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            device_id: device_id.into(),
            interval,
            payload: PayloadProfile::default(),
            seed: default_seed(),
            jitter: false,
        }
    }

    pub fn with_payload(mut self, payload: PayloadProfile) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_topic_segment("device_id", &self.device_id)?;
        if self.interval.is_zero() {
            return Err(SimulatorError::configuration(format!(
                "device '{}' must have a positive interval",
                self.device_id
            )));
        }
        self.payload
            .validate()
            .map_err(|reason| {
                SimulatorError::configuration(format!("device '{}': {}", self.device_id, reason))
            })
    }
}

/// Payload generator selected for a device.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum PayloadProfile {
    /// Battery and temperature reading of a roof temperature sensor.
    Temperature {
        #[serde(default)]
        baseline_temperature: i32,
        #[serde(default = "default_day_temperature_delta")]
        day_temperature_delta: i32,
        #[serde(default = "default_discharge_time", rename = "discharge_time_secs")]
        #[serde_as(as = "DurationSeconds<u64>")]
        discharge_time: Duration,
        /// Offset of the sensor's local time from UTC; drives season and hour of day.
        #[serde(default)]
        utc_offset_minutes: i32,
    },
    /// Big-endian sequence counter.
    Counter,
    /// Seeded random bytes.
    Random { length: usize },
    /// Constant payload given as hex.
    Fixed { hex: String },
}

impl Default for PayloadProfile {
    fn default() -> Self {
        PayloadProfile::Temperature {
            baseline_temperature: 0,
            day_temperature_delta: default_day_temperature_delta(),
            discharge_time: default_discharge_time(),
            utc_offset_minutes: 0,
        }
    }
}

impl PayloadProfile {
    pub fn temperature(baseline_temperature: i32, day_temperature_delta: i32) -> Self {
        PayloadProfile::Temperature {
            baseline_temperature,
            day_temperature_delta,
            discharge_time: default_discharge_time(),
            utc_offset_minutes: 0,
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            PayloadProfile::Temperature {
                day_temperature_delta,
                discharge_time,
                utc_offset_minutes,
                ..
            } => {
                if *day_temperature_delta < 0 {
                    return Err("day_temperature_delta must not be negative".into());
                }
                if discharge_time.is_zero() {
                    return Err("discharge_time_secs must be greater than zero".into());
                }
                if utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
                    return Err(format!(
                        "utc_offset_minutes must be within -{0}..={0}",
                        MAX_UTC_OFFSET_MINUTES
                    ));
                }
                Ok(())
            }
            PayloadProfile::Counter => Ok(()),
            PayloadProfile::Random { length } => {
                if *length == 0 || *length > MAX_PAYLOAD_BYTES {
                    return Err(format!(
                        "random payload length must be within 1..={}",
                        MAX_PAYLOAD_BYTES
                    ));
                }
                Ok(())
            }
            PayloadProfile::Fixed { hex: encoded } => {
                let bytes =
                    hex::decode(encoded).map_err(|err| format!("fixed payload hex: {}", err))?;
                if bytes.len() > MAX_PAYLOAD_BYTES {
                    return Err(format!(
                        "fixed payload exceeds {} bytes",
                        MAX_PAYLOAD_BYTES
                    ));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Disable the rolling file layer (stdout only).
    #[serde(default)]
    pub stdout_only: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            stdout_only: false,
        }
    }
}

/// Identifiers end up as MQTT topic levels, so wildcards and separators are rejected.
fn validate_topic_segment(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SimulatorError::configuration(format!(
            "{} must not be empty",
            field
        )));
    }
    if value.contains(['/', '+', '#']) {
        return Err(SimulatorError::configuration(format!(
            "{} '{}' must not contain '/', '+' or '#'",
            field, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn minimal() -> SessionConfig {
        let mut config = SessionConfig::default();
        config
            .devices
            .push(DeviceConfig::new("airtemp000000000", Duration::from_secs(5)));
        config
    }

    #[test]
    fn parses_full_document() {
        let config = SessionConfig::from_str(
            r#"
            application_id = "roofsense"

            [broker]
            url = "tcp://broker.local:1884"
            client_id = "sim-1"
            qos = "exactly_once"
            keep_alive_secs = 10

            [reconnect]
            initial_delay_ms = 500
            max_delay_ms = 4000
            max_retries = 3

            [publish]
            buffer_capacity = 8

            [[devices]]
            device_id = "airtemp000000000"
            interval_ms = 1000
            seed = 42

            [devices.payload]
            profile = "temperature"
            baseline_temperature = 2
            day_temperature_delta = 10

            [[devices]]
            device_id = "counter-1"

            [devices.payload]
            profile = "counter"
            "#,
        )
        .expect("valid config");

        assert_eq!(config.application_id, "roofsense");
        assert_eq!(config.broker.qos, QosLevel::ExactlyOnce);
        assert_eq!(config.broker.keep_alive, Duration::from_secs(10));
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(500));
        assert_eq!(config.publish.buffer_capacity, 8);
        assert_eq!(config.devices.len(), 2);
        let first = config.device("airtemp000000000").expect("device present");
        assert_eq!(first.interval, Duration::from_secs(1));
        assert_eq!(first.seed, 42);
        assert_eq!(
            first.payload,
            PayloadProfile::Temperature {
                baseline_temperature: 2,
                day_temperature_delta: 10,
                discharge_time: Duration::from_secs(86_400),
                utc_offset_minutes: 0,
            }
        );
        let second = config.device("counter-1").expect("device present");
        assert_eq!(second.interval, Duration::from_secs(30));
        assert_eq!(second.payload, PayloadProfile::Counter);
    }

    #[test]
    fn rejects_empty_device_list() {
        let err = SessionConfig::default().validate().unwrap_err();
        assert!(matches!(err, SimulatorError::Configuration(_)));
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = minimal();
        config.devices[0].interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_device_ids() {
        let mut config = minimal();
        config
            .devices
            .push(DeviceConfig::new("airtemp000000000", Duration::from_secs(1)));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn rejects_bad_broker_urls() {
        for url in ["not a url", "http://localhost:1883", "tcp://:1883"] {
            let mut config = minimal();
            config.broker.url = url.into();
            assert!(config.validate().is_err(), "{} should be rejected", url);
        }
        let mut config = minimal();
        config.broker.url = "memory://local".into();
        assert!(config.validate().is_ok());
        assert!(config.broker.is_in_memory());
    }

    #[test]
    fn rejects_wildcards_in_identifiers() {
        let mut config = minimal();
        config.application_id = "app/#".into();
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.devices[0].device_id = "dev+1".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let mut config = minimal();
        config.reconnect.initial_delay = Duration::from_secs(10);
        config.reconnect.max_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validates_payload_profiles() {
        let mut config = minimal();
        config.devices[0].payload = PayloadProfile::Random { length: 0 };
        assert!(config.validate().is_err());

        config.devices[0].payload = PayloadProfile::Fixed { hex: "zz".into() };
        assert!(config.validate().is_err());

        config.devices[0].payload = PayloadProfile::Fixed {
            hex: "cafe".into(),
        };
        assert!(config.validate().is_ok());

        config.devices[0].payload = PayloadProfile::Temperature {
            baseline_temperature: 0,
            day_temperature_delta: 4,
            discharge_time: Duration::from_secs(60),
            utc_offset_minutes: 15 * 60,
        };
        assert!(config.validate().is_err());
        if let PayloadProfile::Temperature {
            utc_offset_minutes, ..
        } = &mut config.devices[0].payload
        {
            *utc_offset_minutes = -5 * 60;
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn device_ids_need_not_be_dev_eui_shaped() {
        let mut config = minimal();
        config
            .devices
            .push(DeviceConfig::new("counter-01", Duration::from_secs(10)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn qos_level_parses_numeric_and_named_forms() {
        assert_eq!(QosLevel::from_str("0").unwrap(), QosLevel::AtMostOnce);
        assert_eq!(
            QosLevel::from_str("at-least-once").unwrap(),
            QosLevel::AtLeastOnce
        );
        assert!(QosLevel::from_str("3").is_err());
        assert!(!QosLevel::AtMostOnce.requires_ack());
        assert!(QosLevel::ExactlyOnce.requires_ack());
    }
}
