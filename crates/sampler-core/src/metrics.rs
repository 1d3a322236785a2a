//! Runtime metrics for the sampler
//!
//! Counters are updated by the drive loop and read from anywhere.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector shared between the pipeline and the binary
#[derive(Debug)]
pub struct MetricsCollector {
    /// When the collector was started
    start_time: Instant,
    started_at: DateTime<Utc>,
    /// Intake metrics
    pub capture: CaptureMetrics,
    /// Sampling metrics
    pub sampling: SamplingMetrics,
    /// Export metrics
    pub export: ExportMetrics,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            started_at: Utc::now(),
            capture: CaptureMetrics::default(),
            sampling: SamplingMetrics::default(),
            export: ExportMetrics::default(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Record a frame seen by the sampler
    pub fn record_frame(&self, length: u32) {
        self.capture.frames_observed.fetch_add(1, Ordering::Relaxed);
        self.capture
            .bytes_observed
            .fetch_add(u64::from(length), Ordering::Relaxed);
    }

    /// Record an emitted sample
    pub fn record_sample(&self, header_bytes: u32, stripped_bytes: u32) {
        self.sampling.samples_emitted.fetch_add(1, Ordering::Relaxed);
        self.sampling
            .header_bytes
            .fetch_add(u64::from(header_bytes), Ordering::Relaxed);
        self.sampling
            .stripped_bytes
            .fetch_add(u64::from(stripped_bytes), Ordering::Relaxed);
    }

    /// Record a datagram handed to the exporters
    pub fn record_datagram(&self, len: usize) {
        self.export.datagrams_exported.fetch_add(1, Ordering::Relaxed);
        self.export
            .datagram_bytes
            .fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn frames_observed(&self) -> u64 {
        self.capture.frames_observed.load(Ordering::Relaxed)
    }

    pub fn samples_emitted(&self) -> u64 {
        self.sampling.samples_emitted.load(Ordering::Relaxed)
    }

    pub fn datagrams_exported(&self) -> u64 {
        self.export.datagrams_exported.load(Ordering::Relaxed)
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let mut gauge = |name: &str, help: &str, kind: &str, value: u64| {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} {}\n", name, kind));
            output.push_str(&format!("{} {}\n\n", name, value));
        };

        gauge(
            "sflow_sampler_uptime_seconds",
            "Time since sampler started",
            "gauge",
            self.uptime_seconds(),
        );
        gauge(
            "sflow_sampler_frames_observed_total",
            "Frames seen by the sampler",
            "counter",
            self.frames_observed(),
        );
        gauge(
            "sflow_sampler_bytes_observed_total",
            "Bytes of frames seen by the sampler",
            "counter",
            self.capture.bytes_observed.load(Ordering::Relaxed),
        );
        gauge(
            "sflow_sampler_samples_total",
            "Flow samples emitted",
            "counter",
            self.samples_emitted(),
        );
        gauge(
            "sflow_sampler_header_bytes_total",
            "Header bytes carried in samples",
            "counter",
            self.sampling.header_bytes.load(Ordering::Relaxed),
        );
        gauge(
            "sflow_sampler_stripped_bytes_total",
            "Frame bytes stripped from samples",
            "counter",
            self.sampling.stripped_bytes.load(Ordering::Relaxed),
        );
        gauge(
            "sflow_sampler_datagrams_total",
            "Datagrams handed to exporters",
            "counter",
            self.datagrams_exported(),
        );
        gauge(
            "sflow_sampler_datagram_bytes_total",
            "Bytes of datagrams handed to exporters",
            "counter",
            self.export.datagram_bytes.load(Ordering::Relaxed),
        );

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "started_at": self.started_at.to_rfc3339(),
            "uptime_seconds": self.uptime_seconds(),
            "capture": {
                "frames_observed": self.frames_observed(),
                "bytes_observed": self.capture.bytes_observed.load(Ordering::Relaxed),
            },
            "sampling": {
                "samples_emitted": self.samples_emitted(),
                "header_bytes": self.sampling.header_bytes.load(Ordering::Relaxed),
                "stripped_bytes": self.sampling.stripped_bytes.load(Ordering::Relaxed),
            },
            "export": {
                "datagrams": self.datagrams_exported(),
                "bytes": self.export.datagram_bytes.load(Ordering::Relaxed),
            },
        })
    }
}

/// Intake metrics
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    pub frames_observed: AtomicU64,
    pub bytes_observed: AtomicU64,
}

/// Sampling metrics
#[derive(Debug, Default)]
pub struct SamplingMetrics {
    pub samples_emitted: AtomicU64,
    pub header_bytes: AtomicU64,
    pub stripped_bytes: AtomicU64,
}

/// Export metrics
#[derive(Debug, Default)]
pub struct ExportMetrics {
    pub datagrams_exported: AtomicU64,
    pub datagram_bytes: AtomicU64,
}

/// Shared metrics instance
pub type SharedMetrics = Arc<MetricsCollector>;

/// Create a new shared metrics collector
pub fn create_metrics() -> SharedMetrics {
    Arc::new(MetricsCollector::new())
}
