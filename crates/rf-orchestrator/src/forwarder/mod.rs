//! Local forwarders relaying public listen ports to backends

mod engine;
mod probe;
mod registry;

pub use engine::{ForwarderInstance, ForwarderSpec};
pub use probe::{check_port_available, probe_liveness};
pub use registry::ForwarderRegistry;
