//! Synthetic frame generator
//!
//! Produces well-formed Ethernet/IPv4/UDP frames for exercising the pipeline
//! without a raw socket. Useful for demo mode, CI, and non-Linux hosts.

use async_trait::async_trait;
use sampler_core::plugins::{
    CapturePlugin, CaptureStats, FrameResult, PluginError, PluginInfo, PluginResult,
};
use sampler_core::CapturedFrame;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

const ETH_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const MIN_FRAME_LEN: usize = ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN;

/// Configuration for synthetic frame generation
#[derive(Debug, Clone)]
pub struct FrameGeneratorConfig {
    /// Interval between frames in milliseconds (0 = as fast as the pipeline takes them)
    pub interval_ms: u64,

    /// Number of frames to generate (0 = infinite)
    pub frame_count: u64,

    /// Frame sizes to cycle through, in bytes
    pub frame_sizes: Vec<usize>,
}

impl Default for FrameGeneratorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10,
            frame_count: 0, // infinite
            frame_sizes: vec![64, 128, 590, 1514],
        }
    }
}

/// Synthetic frame source
pub struct FrameGenerator {
    config: FrameGeneratorConfig,
    running: Arc<AtomicBool>,
    stats: Arc<GeneratorStats>,
}

#[derive(Default)]
struct GeneratorStats {
    frames_generated: AtomicU64,
    bytes_generated: AtomicU64,
}

impl FrameGenerator {
    pub fn new() -> Self {
        Self::with_config(FrameGeneratorConfig::default())
    }

    pub fn with_config(config: FrameGeneratorConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(GeneratorStats::default()),
        }
    }

    /// Build frame number `n`: 192.0.2.x -> 198.51.100.y UDP, sized from the cycle
    pub fn build_frame(&self, n: u64) -> CapturedFrame {
        let sizes = &self.config.frame_sizes;
        let size = if sizes.is_empty() {
            MIN_FRAME_LEN
        } else {
            sizes[(n % sizes.len() as u64) as usize].max(MIN_FRAME_LEN)
        };

        let host = (n % 250) as u8 + 1;
        let mut frame = Vec::with_capacity(size);

        // Ethernet II
        frame.extend_from_slice(&[0x02, 0x00, 0x5e, 0x00, 0x53, host]);
        frame.extend_from_slice(&[0x02, 0x00, 0x5e, 0x00, 0x53, 0xfe]);
        frame.extend_from_slice(&0x0800u16.to_be_bytes());

        // IPv4
        let ip_len = (size - ETH_HEADER_LEN) as u16;
        let mut ip = [0u8; IPV4_HEADER_LEN];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&ip_len.to_be_bytes());
        ip[4..6].copy_from_slice(&(n as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = 17;
        ip[12..16].copy_from_slice(&[192, 0, 2, host]);
        ip[16..20].copy_from_slice(&[198, 51, 100, 250 - host]);
        let checksum = ipv4_checksum(&ip);
        ip[10..12].copy_from_slice(&checksum.to_be_bytes());
        frame.extend_from_slice(&ip);

        // UDP
        let udp_len = ip_len - IPV4_HEADER_LEN as u16;
        frame.extend_from_slice(&(40000 + (n % 1000) as u16).to_be_bytes());
        frame.extend_from_slice(&53u16.to_be_bytes());
        frame.extend_from_slice(&udp_len.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());

        frame.resize(size, (n & 0xff) as u8);

        CapturedFrame::new(frame)
    }
}

impl Default for FrameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|w| u32::from(u16::from_be_bytes([w[0], w[1]])))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

impl PluginInfo for FrameGenerator {
    fn name(&self) -> &str {
        "frame-generator"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Generates synthetic Ethernet frames for pipeline testing"
    }
}

#[async_trait]
impl CapturePlugin for FrameGenerator {
    async fn start(&mut self, tx: mpsc::Sender<FrameResult>) -> PluginResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PluginError::OperationFailed("Already running".into()));
        }

        self.running.store(true, Ordering::SeqCst);
        info!("Starting synthetic frame generator");

        let running = self.running.clone();
        let stats = self.stats.clone();
        let generator = FrameGenerator {
            config: self.config.clone(),
            running: running.clone(),
            stats: stats.clone(),
        };

        tokio::spawn(async move {
            let mut n = 0u64;

            while running.load(Ordering::SeqCst) {
                if generator.config.frame_count > 0 && n >= generator.config.frame_count {
                    break;
                }

                let frame = generator.build_frame(n);
                let len = u64::from(frame.length);
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
                stats.frames_generated.fetch_add(1, Ordering::Relaxed);
                stats.bytes_generated.fetch_add(len, Ordering::Relaxed);
                n += 1;

                if generator.config.interval_ms > 0 {
                    tokio::time::sleep(tokio::time::Duration::from_millis(
                        generator.config.interval_ms,
                    ))
                    .await;
                }
            }

            running.store(false, Ordering::SeqCst);
            info!(
                "Frame generator stopped after {} frames",
                stats.frames_generated.load(Ordering::Relaxed)
            );
        });

        Ok(())
    }

    async fn stop(&mut self) -> PluginResult<()> {
        info!("Stopping frame generator...");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.stats.frames_generated.load(Ordering::Relaxed),
            bytes_captured: self.stats.bytes_generated.load(Ordering::Relaxed),
            errors: 0,
        }
    }
}
