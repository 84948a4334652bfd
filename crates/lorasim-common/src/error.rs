//! ---
//! sim_section: "01-core-functionality"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Error taxonomy shared by the simulator crates."
//! sim_version: "v0.0.0-prealpha"
//! sim_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

/// Shared result type for simulator operations.
pub type Result<T> = std::result::Result<T, SimulatorError>;

/// Errors surfaced by the simulator.
///
/// `Configuration`, `Connectivity` and `Startup` are fatal for a session.
/// `MalformedMessage` and `PublishBackpressure` are isolated to a single
/// message: they are logged, counted and never abort the session.
#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    /// The session configuration failed validation.
    #[error("invalid session configuration: {0}")]
    Configuration(String),
    /// The broker stayed unreachable after the retry budget was spent.
    #[error("broker unreachable after {attempts} attempt(s): {reason}")]
    Connectivity { attempts: u32, reason: String },
    /// An inbound message could not be mapped onto a downlink command.
    #[error("malformed message on topic '{topic}': {reason}")]
    MalformedMessage { topic: String, reason: String },
    /// The outbound buffer overflowed and discarded its oldest entries.
    #[error("publish buffer overflow, {dropped} message(s) dropped")]
    PublishBackpressure { dropped: u64 },
    /// A runtime operation was issued after the session stopped.
    #[error("session is not running")]
    SessionClosed,
    /// The session could not reach a connected state.
    #[error("session startup failed: {source}")]
    Startup {
        #[source]
        source: Box<SimulatorError>,
    },
}

impl SimulatorError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub fn malformed(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn startup(source: SimulatorError) -> Self {
        Self::Startup {
            source: Box::new(source),
        }
    }

    /// Classification used on the status stream.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SimulatorError::Configuration(_) => ErrorKind::Configuration,
            SimulatorError::Connectivity { .. } => ErrorKind::Connectivity,
            SimulatorError::MalformedMessage { .. } => ErrorKind::MalformedMessage,
            SimulatorError::PublishBackpressure { .. } => ErrorKind::PublishBackpressure,
            SimulatorError::SessionClosed => ErrorKind::SessionClosed,
            SimulatorError::Startup { .. } => ErrorKind::Startup,
        }
    }

    /// Whether the error terminates the owning session.
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}

/// Flat error classification without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Connectivity,
    MalformedMessage,
    PublishBackpressure,
    SessionClosed,
    Startup,
}

impl ErrorKind {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::Configuration | ErrorKind::Connectivity | ErrorKind::Startup
        )
    }
}
