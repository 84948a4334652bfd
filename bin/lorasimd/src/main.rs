//! ---
//! sim_section: "05-daemon"
//! sim_subsection: "binary"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Binary entrypoint for the simulator daemon."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use lorasim_common::logging::init_tracing;
use lorasim_common::{DeviceConfig, LogFormat, PayloadProfile, QosLevel, SessionConfig};
use lorasim_core::{SessionEvent, SessionOutcome, SimulationController};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const DEFAULT_CONFIG: &str = "configs/lorasim.toml";

#[derive(Debug, Parser)]
#[command(author, version, about = "LoRaWAN network-server MQTT simulator", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(short = 'm', long = "mqtt-server", value_name = "URL", help = "MQTT server URI")]
    mqtt_server: Option<String>,

    #[arg(long, help = "LoRa sensors application ID")]
    application_id: Option<String>,

    #[arg(short = 'r', long, value_name = "SECONDS", help = "Rate at which each sensor emits measurements")]
    rate: Option<u64>,

    #[arg(long, help = "Number of air temperature sensors to simulate")]
    airtemp_sensors: Option<u32>,

    #[arg(long, help = "Number of external temperature sensors to simulate")]
    extemp_sensors: Option<u32>,

    #[arg(long, help = "Number of internal temperature sensors to simulate")]
    intemp_sensors: Option<u32>,

    #[arg(long, help = "Base seed; sensor N uses seed + N")]
    seed: Option<u64>,

    #[arg(long, help = "MQTT QoS: 0, 1, 2 or at-least-once style names")]
    qos: Option<QosLevel>,

    #[arg(long, help = "Stdout log format: pretty or json")]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn sensor_flags_given(&self) -> bool {
        self.rate.is_some()
            || self.airtemp_sensors.is_some()
            || self.extemp_sensors.is_some()
            || self.intemp_sensors.is_some()
            || self.seed.is_some()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    init_tracing("lorasimd", &config.logging)?;
    info!(
        application_id = %config.application_id,
        broker = %config.broker.url,
        devices = config.devices.len(),
        "configuration resolved"
    );

    let controller = SimulationController::start(config)
        .await
        .context("failed to start simulation session")?;
    tokio::spawn(log_events(controller.subscribe()));

    info!(session_id = %controller.session_id(), "simulator running; waiting for termination signal");
    let outcome = tokio::select! {
        outcome = controller.wait() => outcome,
        interrupted = signal::ctrl_c() => {
            if let Err(err) = interrupted {
                warn!(error = %err, "unable to listen for ctrl-c; stopping");
            } else {
                info!("ctrl-c received; shutting down");
            }
            controller.stop().await
        }
    };

    let metrics = controller.metrics();
    info!(
        uplinks = metrics.uplinks,
        downlinks = metrics.downlinks_applied,
        published = metrics.bridge.published,
        dropped = metrics.bridge.dropped,
        "session summary"
    );
    match outcome {
        SessionOutcome::Completed => Ok(()),
        SessionOutcome::Failed { kind, message } => {
            error!(?kind, %message, "session ended with a fatal error");
            bail!("session failed ({:?}): {}", kind, message)
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<SessionConfig> {
    resolve_config_from(cli, Path::new(DEFAULT_CONFIG))
}

/// File configuration (if any) with command-line overrides applied. Defaults
/// are used only when no configuration file exists; a file that fails to load
/// is an error.
fn resolve_config_from(cli: &Cli, default_path: &Path) -> Result<SessionConfig> {
    let env_path_set = std::env::var(SessionConfig::ENV_CONFIG_PATH)
        .map(|path| !path.trim().is_empty())
        .unwrap_or(false);
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(&[path])?,
        None if env_path_set || default_path.exists() => SessionConfig::load(&[default_path])?,
        None => {
            debug!(path = %default_path.display(), "no configuration file; using defaults");
            SessionConfig::default()
        }
    };

    if let Some(url) = &cli.mqtt_server {
        config.broker.url = url.clone();
    }
    if let Some(application_id) = &cli.application_id {
        config.application_id = application_id.clone();
    }
    if let Some(qos) = cli.qos {
        config.broker.qos = qos;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if config.devices.is_empty() || cli.sensor_flags_given() {
        config.devices = temperature_sensors(cli)?;
    }
    config.validate()?;
    Ok(config)
}

fn temperature_sensors(cli: &Cli) -> Result<Vec<DeviceConfig>> {
    let rate = cli.rate.unwrap_or(5);
    if rate == 0 {
        bail!("--rate must be at least one second");
    }
    let interval = Duration::from_secs(rate);
    let base_seed = cli.seed.unwrap_or(0xA11CE);

    let groups = [
        (cli.airtemp_sensors.unwrap_or(1), SensorKind::Air),
        (cli.extemp_sensors.unwrap_or(1), SensorKind::External),
        (cli.intemp_sensors.unwrap_or(1), SensorKind::Internal),
    ];
    let mut devices = Vec::new();
    for (count, kind) in groups {
        for index in 0..count {
            let seed = base_seed.wrapping_add(devices.len() as u64);
            devices.push(
                DeviceConfig::new(kind.device_id(index), interval)
                    .with_payload(kind.profile())
                    .with_seed(seed),
            );
        }
    }
    debug!(count = devices.len(), "temperature sensors generated");
    Ok(devices)
}

#[derive(Debug, Clone, Copy)]
enum SensorKind {
    Air,
    External,
    Internal,
}

impl SensorKind {
    fn device_id(self, index: u32) -> String {
        match self {
            SensorKind::Air => format!("airtemp{:09X}", index),
            SensorKind::External => format!("extemp{:010X}", index),
            SensorKind::Internal => format!("intemp{:010X}", index),
        }
    }

    fn profile(self) -> PayloadProfile {
        match self {
            SensorKind::Air => PayloadProfile::temperature(2, 10),
            SensorKind::External => PayloadProfile::temperature(0, 10),
            SensorKind::Internal => PayloadProfile::temperature(0, 4),
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Error { kind, message }) => warn!(?kind, %message, "session error"),
            Ok(SessionEvent::BridgeState { state }) => info!(?state, "bridge state"),
            Ok(SessionEvent::Stopped { reason }) => {
                info!(?reason, "session stopped");
                break;
            }
            Ok(event) => debug!(?event, "session event"),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "status stream lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_ids_follow_the_fleet_naming() {
        assert_eq!(SensorKind::Air.device_id(10), "airtemp00000000A");
        assert_eq!(SensorKind::External.device_id(255), "extemp00000000FF");
        assert_eq!(SensorKind::Internal.device_id(0), "intemp0000000000");
    }

    #[test]
    fn flags_generate_sensors_with_distinct_seeds() {
        let cli = Cli::parse_from([
            "lorasimd",
            "-m",
            "memory://local",
            "-r",
            "2",
            "--airtemp-sensors",
            "2",
            "--extemp-sensors",
            "0",
            "--intemp-sensors",
            "1",
            "--seed",
            "42",
            "--qos",
            "at-most-once",
        ]);
        let dir = tempfile::tempdir().unwrap();
        let config = resolve_config_from(&cli, &dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.broker.url, "memory://local");
        assert_eq!(config.broker.qos, QosLevel::AtMostOnce);
        let ids: Vec<&str> = config.devices.iter().map(|d| d.device_id.as_str()).collect();
        assert_eq!(ids, vec!["airtemp000000000", "airtemp000000001", "intemp0000000000"]);
        let seeds: Vec<u64> = config.devices.iter().map(|d| d.seed).collect();
        assert_eq!(seeds, vec![42, 43, 44]);
        assert!(config
            .devices
            .iter()
            .all(|d| d.interval == Duration::from_secs(2)));
    }

    #[test]
    fn missing_default_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from(["lorasimd"]);
        let config = resolve_config_from(&cli, &dir.path().join("lorasim.toml")).unwrap();
        assert_eq!(config.application_id, SessionConfig::default().application_id);
        assert_eq!(config.devices.len(), 3);
    }

    #[test]
    fn broken_default_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from(["lorasimd"]);

        let unparsable = dir.path().join("unparsable.toml");
        std::fs::write(&unparsable, "application_id = [").unwrap();
        assert!(resolve_config_from(&cli, &unparsable).is_err());

        let invalid = dir.path().join("invalid.toml");
        std::fs::write(
            &invalid,
            "application_id = \"app\"\n\n[[devices]]\ndevice_id = \"dev-1\"\ninterval_ms = 0\n",
        )
        .unwrap();
        assert!(resolve_config_from(&cli, &invalid).is_err());
    }

    #[test]
    fn existing_default_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lorasim.toml");
        std::fs::write(
            &path,
            "application_id = \"farm\"\n\n[[devices]]\ndevice_id = \"counter-01\"\ninterval_ms = 1000\npayload = { profile = \"counter\" }\n",
        )
        .unwrap();
        let cli = Cli::parse_from(["lorasimd"]);
        let config = resolve_config_from(&cli, &path).unwrap();
        assert_eq!(config.application_id, "farm");
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].device_id, "counter-01");
    }

    #[test]
    fn zero_rate_is_rejected() {
        let cli = Cli::parse_from(["lorasimd", "-r", "0"]);
        assert!(temperature_sensors(&cli).is_err());
    }
}
