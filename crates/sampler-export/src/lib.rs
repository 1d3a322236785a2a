//! Encoding and delivery for the sFlow sampler

pub mod sflow;
pub mod udp;

pub use sflow::SflowEncoder;
pub use udp::{UdpExporter, UdpExporterConfig};
