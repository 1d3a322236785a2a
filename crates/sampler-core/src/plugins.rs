//! Plugin traits for the pipeline collaborators
//!
//! The sampler core only decides and assembles samples. Getting frames in,
//! turning samples into datagrams, and shipping datagrams out are each behind
//! a trait so platform-specific and synthetic implementations can be swapped.

use crate::agent::AgentIdentity;
use crate::sampler::{CapturedFrame, FlowSampleRecord};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Plugin error type
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Plugin operation failed: {0}")]
    OperationFailed(String),

    #[error("Plugin not supported on this platform")]
    NotSupported,

    #[error("Plugin configuration error: {0}")]
    ConfigurationError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Encoding failed: {0}")]
    EncodeFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;

/// Basic plugin information
pub trait PluginInfo {
    /// Plugin name
    fn name(&self) -> &str;

    /// Plugin version
    fn version(&self) -> &str;

    /// Plugin description
    fn description(&self) -> &str {
        ""
    }

    /// Whether plugin is available on this platform
    fn is_available(&self) -> bool {
        true
    }
}

/// Base plugin trait - all plugins implement this
pub trait Plugin: PluginInfo + Send + Sync {}

impl<T: PluginInfo + Send + Sync> Plugin for T {}

// =============================================================================
// CAPTURE PLUGINS
// =============================================================================

/// Item delivered by a capture plugin: a frame, or the error that ended capture
pub type FrameResult = PluginResult<CapturedFrame>;

/// Capture plugin - produces raw link-layer frames
///
/// Frames must be delivered in arrival order and none may be dropped after
/// capture, since every delivered frame advances the sampling counter.
#[async_trait]
pub trait CapturePlugin: Plugin {
    /// Start capturing frames into `tx`
    ///
    /// A fatal capture error is sent as the last item before the plugin stops.
    async fn start(&mut self, tx: mpsc::Sender<FrameResult>) -> PluginResult<()>;

    /// Stop capturing
    async fn stop(&mut self) -> PluginResult<()>;

    /// Check if capture is running
    fn is_running(&self) -> bool;

    /// Interface index frames are captured on, 0 if unknown or all
    fn if_index(&self) -> u32 {
        0
    }

    /// Get capture statistics
    fn stats(&self) -> CaptureStats {
        CaptureStats::default()
    }
}

/// Capture statistics
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    /// Total frames captured
    pub frames_captured: u64,
    /// Bytes captured
    pub bytes_captured: u64,
    /// Errors encountered
    pub errors: u64,
}

// =============================================================================
// ENCODE PLUGINS
// =============================================================================

/// Encode plugin - serializes a flow sample into one telemetry datagram
pub trait EncodePlugin: Plugin {
    /// Append the datagram for `record` to `out`
    ///
    /// On error `out` may hold a partial datagram and must not be sent.
    fn encode(
        &mut self,
        agent: &AgentIdentity,
        record: &FlowSampleRecord,
        out: &mut Vec<u8>,
    ) -> PluginResult<()>;
}

// =============================================================================
// EXPORT PLUGINS
// =============================================================================

/// Export plugin - delivers finished datagrams to a collector
///
/// Delivery is best-effort: `export` must not wait for the network. An `Err`
/// means the channel is unusable and the sampler should stop.
#[async_trait]
pub trait ExportPlugin: Plugin {
    /// Export one datagram
    async fn export(&self, datagram: &[u8]) -> PluginResult<()>;

    /// Flush any queued datagrams
    async fn flush(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Get export statistics
    fn stats(&self) -> ExportStats {
        ExportStats::default()
    }
}

/// Export statistics
#[derive(Debug, Clone, Default)]
pub struct ExportStats {
    /// Datagrams written to the transport
    pub datagrams_sent: u64,
    /// Datagrams discarded under backpressure
    pub datagrams_dropped: u64,
    /// Bytes written to the transport
    pub bytes_sent: u64,
}
