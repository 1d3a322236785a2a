//! UDP delivery to an sFlow collector
//!
//! Datagrams go into a bounded queue and a background task writes them to a
//! connected UDP socket. `export` never waits on the network.

use async_trait::async_trait;
use sampler_core::config::CollectorSettings;
use sampler_core::plugins::{ExportPlugin, ExportStats, PluginError, PluginInfo, PluginResult};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

/// Default sFlow collector port
pub const DEFAULT_COLLECTOR_PORT: u16 = 6343;

/// How long `flush` waits for the queue to drain
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// UDP exporter configuration
#[derive(Debug, Clone)]
pub struct UdpExporterConfig {
    /// Collector address, `host:port`
    pub address: String,

    /// Datagrams buffered between `export` and the socket writer
    pub queue_size: usize,
}

impl Default for UdpExporterConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", DEFAULT_COLLECTOR_PORT),
            queue_size: 64,
        }
    }
}

impl From<&CollectorSettings> for UdpExporterConfig {
    fn from(settings: &CollectorSettings) -> Self {
        Self {
            address: settings.address.clone(),
            queue_size: settings.queue_size,
        }
    }
}

#[derive(Default)]
struct UdpStats {
    datagrams_sent: AtomicU64,
    datagrams_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    /// Enqueued but not yet written
    pending: AtomicU64,
}

/// Fire-and-forget UDP exporter
pub struct UdpExporter {
    config: UdpExporterConfig,
    peer: SocketAddr,
    tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<UdpStats>,
    /// Why the writer task stopped, if it has
    failure: Arc<Mutex<Option<String>>>,
}

impl UdpExporter {
    /// Resolve the collector, connect an ephemeral socket to it and start the writer
    pub async fn connect(config: UdpExporterConfig) -> PluginResult<Self> {
        if config.queue_size == 0 {
            return Err(PluginError::ConfigurationError(
                "Collector queue size must be at least 1".into(),
            ));
        }

        let peer = lookup_host(config.address.as_str())
            .await
            .map_err(|e| {
                PluginError::ConnectionFailed(format!(
                    "Cannot resolve collector {}: {}",
                    config.address, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                PluginError::ConnectionFailed(format!(
                    "Collector {} resolved to no addresses",
                    config.address
                ))
            })?;

        let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await.map_err(|e| {
            PluginError::ConnectionFailed(format!("Cannot connect to collector {}: {}", peer, e))
        })?;

        info!(
            "Sending sFlow datagrams from {} to collector at {}",
            socket.local_addr()?,
            peer
        );

        let (tx, rx) = mpsc::channel(config.queue_size);
        let stats = Arc::new(UdpStats::default());
        let failure = Arc::new(Mutex::new(None));

        tokio::spawn(write_loop(socket, rx, stats.clone(), failure.clone()));

        Ok(Self {
            config,
            peer,
            tx,
            stats,
            failure,
        })
    }

    /// Resolved collector address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn failure_reason(&self) -> String {
        self.failure
            .lock()
            .ok()
            .and_then(|f| f.clone())
            .unwrap_or_else(|| "writer stopped".to_string())
    }
}

async fn write_loop(
    socket: UdpSocket,
    mut rx: mpsc::Receiver<Vec<u8>>,
    stats: Arc<UdpStats>,
    failure: Arc<Mutex<Option<String>>>,
) {
    while let Some(datagram) = rx.recv().await {
        let result = socket.send(&datagram).await;
        stats.pending.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(n) => {
                stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            }
            // An ICMP port-unreachable from an earlier datagram; the collector may come back
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                stats.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Collector refused datagram: {}", e);
            }
            Err(e) => {
                error!("UDP send failed: {}", e);
                if let Ok(mut f) = failure.lock() {
                    *f = Some(e.to_string());
                }
                break;
            }
        }
    }
    // Dropping rx here closes the queue, which `export` reports as fatal
}

impl PluginInfo for UdpExporter {
    fn name(&self) -> &str {
        "udp-exporter"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Sends datagrams to a collector over UDP"
    }
}

#[async_trait]
impl ExportPlugin for UdpExporter {
    async fn export(&self, datagram: &[u8]) -> PluginResult<()> {
        self.stats.pending.fetch_add(1, Ordering::SeqCst);

        match self.tx.try_send(datagram.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.stats.pending.fetch_sub(1, Ordering::SeqCst);
                let dropped = self.stats.datagrams_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Collector queue full ({} slots), dropped datagram ({} dropped so far)",
                    self.config.queue_size, dropped
                );
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.pending.fetch_sub(1, Ordering::SeqCst);
                Err(PluginError::ConnectionFailed(format!(
                    "Collector {} unreachable: {}",
                    self.peer,
                    self.failure_reason()
                )))
            }
        }
    }

    async fn flush(&self) -> PluginResult<()> {
        let deadline = tokio::time::Instant::now() + FLUSH_TIMEOUT;

        while self.stats.pending.load(Ordering::SeqCst) > 0 {
            if self.tx.is_closed() {
                return Err(PluginError::ConnectionFailed(self.failure_reason()));
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Gave up flushing with {} datagrams still queued",
                    self.stats.pending.load(Ordering::SeqCst)
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        Ok(())
    }

    fn stats(&self) -> ExportStats {
        ExportStats {
            datagrams_sent: self.stats.datagrams_sent.load(Ordering::Relaxed),
            datagrams_dropped: self.stats.datagrams_dropped.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
        }
    }
}
