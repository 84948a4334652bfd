//! ---
//! sim_section: "03-mqtt-bridge"
//! sim_subsection: "module"
//! sim_type: "source"
//! sim_scope: "code"
//! sim_description: "Topic codec and broker bridge."
//! sim_version: "v0.1.0"
//! sim_owner: "tbd"
//! ---
//! MQTT side of the simulator.
//!
//! [`codec`] maps device events onto topics and JSON bodies, [`bridge`] owns
//! the broker connection behind a [`BrokerSession`], buffering publishes while
//! the broker is away and routing downlinks back to devices.

pub mod backoff;
pub mod bridge;
pub mod broker;
pub mod buffer;
pub mod codec;
pub mod logging;
pub mod wire;

pub use backoff::Backoff;
pub use bridge::{
    BridgeHandle, BridgeMetrics, BridgeNotice, BridgeReport, BridgeSettings, BridgeState,
    MqttBridge,
};
pub use broker::{BrokerError, BrokerEvent, BrokerSession, MemoryBroker, PublishedMessage, RumqttSession};
pub use buffer::OutboundBuffer;
pub use codec::{OutboundMessage, Topics};
