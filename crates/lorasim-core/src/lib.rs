//! ---
//! sim_section: "04-session-control"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Simulation session runtime."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
//! Runs a simulator session: the device engine task, the MQTT bridge task and
//! a supervisor that relays their state onto the [`SessionEvent`] stream and
//! tears both down in order.

pub mod controller;
pub mod engine;
pub mod status;

pub use controller::{SessionBuilder, SessionOutcome, SimulationController};
pub use engine::{ManualTicker, TickReport, TickSource};
pub use status::{SessionEvent, SessionMetrics, StatusBus, StopReason};
