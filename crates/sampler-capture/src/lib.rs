//! Frame capture sources
//!
//! Provides the capture plugins the sampler can read frames from:
//! - `AfPacketCapture`: every frame on the host (or one interface) via a Linux raw socket
//! - `FrameGenerator`: synthetic frames for demo mode and tests

use sampler_core::config::CaptureSettings;
use sampler_core::plugins::CapturePlugin;

pub mod af_packet;
pub mod frame_generator;

pub use af_packet::{AfPacketCapture, AfPacketConfig};
pub use frame_generator::{FrameGenerator, FrameGeneratorConfig};

/// Which capture source to use
#[derive(Debug, Clone)]
pub enum CaptureSource {
    /// Live capture from a raw socket
    Live(AfPacketConfig),

    /// Synthetic frames
    Synthetic(FrameGeneratorConfig),
}

impl CaptureSource {
    /// Live capture configured from the `[capture]` settings
    pub fn live(settings: &CaptureSettings) -> Self {
        CaptureSource::Live(AfPacketConfig {
            interface: settings.interface.clone(),
            snaplen: settings.snaplen,
            ..Default::default()
        })
    }
}

/// Create the capture plugin for a source
pub fn create_capture_plugin(source: CaptureSource) -> Box<dyn CapturePlugin> {
    match source {
        CaptureSource::Live(config) => Box::new(AfPacketCapture::with_config(config)),
        CaptureSource::Synthetic(config) => Box::new(FrameGenerator::with_config(config)),
    }
}
