//! Sampler Core - sampling engine, plugin traits, and pipeline orchestration
//!
//! This crate provides the foundational types and abstractions for the sFlow sampler:
//!
//! - **Sampler**: the deterministic 1-in-N sampling and truncation engine
//! - **Agent**: the fixed identity attached to every datagram
//! - **Plugins**: trait definitions for capture, encode, and export
//! - **Pipeline**: the drive loop tying them together
//! - **Config** and **Metrics**: ambient configuration and counters

pub mod agent;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod plugins;
pub mod sampler;

// Re-export commonly used types
pub use agent::AgentIdentity;
pub use config::{ConfigLoader, SamplerConfig};
pub use metrics::{MetricsCollector, SharedMetrics};
pub use pipeline::{Pipeline, PipelineConfig};
pub use plugins::{
    CapturePlugin, EncodePlugin, ExportPlugin, FrameResult, Plugin, PluginError, PluginInfo,
    PluginResult,
};
pub use sampler::{CapturedFrame, FlowSampleRecord, HeaderProtocol, Sampler};

/// sFlow protocol version produced by this agent
pub const SFLOW_VERSION: u32 = 5;

/// Sampler version
pub const SAMPLER_VERSION: &str = env!("CARGO_PKG_VERSION");
