//! ---
//! sim_section: "02-device-model"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Simulated end-devices and their uplink schedule."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
//! Simulated LoRaWAN end-devices.
//!
//! A [`Device`] turns simulated time into [`UplinkEvent`]s and reacts to
//! [`DownlinkCommand`]s. The [`Scheduler`] decides which devices are due on a
//! given tick; it never sleeps itself; the caller drives it with a [`Clock`].

pub mod clock;
pub mod device;
pub mod event;
pub mod payload;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use device::Device;
pub use event::{DownlinkCommand, DownlinkEffect, SensorReading, UplinkEvent, DEFAULT_F_PORT};
pub use payload::PayloadGenerator;
pub use scheduler::Scheduler;
