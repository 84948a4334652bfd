//! ---
//! sim_section: "01-core-functionality"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Shared primitives and utilities for the simulator runtime."
//! sim_version: "v0.0.0-prealpha"
//! sim_owner: "tbd"
//! ---
//! Shared primitives for the LoRaWAN network-server simulator workspace.
//! This crate exposes session configuration loading, the error taxonomy and
//! tracing initialisation consumed by every other crate.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    BrokerConfig, DeviceConfig, LoadedSessionConfig, LoggingConfig, PayloadProfile,
    PublishConfig, QosLevel, ReconnectConfig, SchedulerConfig, SessionConfig,
};
pub use error::{ErrorKind, Result, SimulatorError};
pub use logging::{init_tracing, LogFormat};
