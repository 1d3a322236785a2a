//! Raw link-layer capture through a Linux `AF_PACKET` socket
//!
//! Reads every frame seen by the host (or by one interface) with
//! `ETH_P_ALL`. The socket read runs on a blocking thread and hands frames to
//! the pipeline with `blocking_send`, so frames are never dropped between the
//! socket and the sampler.

use async_trait::async_trait;
use sampler_core::plugins::{
    CapturePlugin, CaptureStats, FrameResult, PluginError, PluginInfo, PluginResult,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Largest frame the receive buffer holds
pub const MAX_SNAPLEN: usize = 65535;

/// AF_PACKET capture configuration
#[derive(Debug, Clone)]
pub struct AfPacketConfig {
    /// Interface to bind to (all interfaces if None)
    pub interface: Option<String>,

    /// Receive buffer size
    pub snaplen: usize,

    /// How often the read loop wakes up to check for stop, in milliseconds
    pub poll_timeout_ms: u64,
}

impl Default for AfPacketConfig {
    fn default() -> Self {
        Self {
            interface: None,
            snaplen: MAX_SNAPLEN,
            poll_timeout_ms: 250,
        }
    }
}

/// AF_PACKET capture plugin
pub struct AfPacketCapture {
    config: AfPacketConfig,
    if_index: u32,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStatsInner>,
}

#[derive(Default)]
struct CaptureStatsInner {
    frames_captured: AtomicU64,
    bytes_captured: AtomicU64,
    errors: AtomicU64,
}

impl AfPacketCapture {
    pub fn new() -> Self {
        Self::with_config(AfPacketConfig::default())
    }

    pub fn with_config(config: AfPacketConfig) -> Self {
        Self {
            config,
            if_index: 0,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(CaptureStatsInner::default()),
        }
    }
}

impl Default for AfPacketCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginInfo for AfPacketCapture {
    fn name(&self) -> &str {
        "af-packet"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Captures link-layer frames from a Linux AF_PACKET raw socket"
    }

    fn is_available(&self) -> bool {
        cfg!(target_os = "linux")
    }
}

#[async_trait]
impl CapturePlugin for AfPacketCapture {
    #[cfg(target_os = "linux")]
    async fn start(&mut self, tx: mpsc::Sender<FrameResult>) -> PluginResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PluginError::OperationFailed("Already running".into()));
        }

        let socket = linux::RawSocket::open(&self.config)?;
        self.if_index = socket.if_index();
        info!(
            "Opened a raw socket on {} (ifindex {})",
            self.config.interface.as_deref().unwrap_or("all interfaces"),
            self.if_index
        );

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let stats = self.stats.clone();
        let snaplen = self.config.snaplen.clamp(1, MAX_SNAPLEN);

        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; snaplen];

            while running.load(Ordering::SeqCst) {
                match socket.recv(&mut buf) {
                    Ok(Some(n)) => {
                        let frame = sampler_core::CapturedFrame::new(buf[..n].to_vec());
                        if tx.blocking_send(Ok(frame)).is_err() {
                            break;
                        }
                        stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                        stats.bytes_captured.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        error!("Raw socket read failed: {}", e);
                        let _ = tx.blocking_send(Err(PluginError::IoError(e)));
                        break;
                    }
                }
            }

            running.store(false, Ordering::SeqCst);
            info!(
                "AF_PACKET capture stopped after {} frames",
                stats.frames_captured.load(Ordering::Relaxed)
            );
        });

        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    async fn start(&mut self, _tx: mpsc::Sender<FrameResult>) -> PluginResult<()> {
        Err(PluginError::NotSupported)
    }

    async fn stop(&mut self) -> PluginResult<()> {
        info!("Stopping AF_PACKET capture...");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn if_index(&self) -> u32 {
        self.if_index
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.stats.frames_captured.load(Ordering::Relaxed),
            bytes_captured: self.stats.bytes_captured.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::AfPacketConfig;
    use sampler_core::plugins::{PluginError, PluginResult};
    use std::ffi::CString;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    /// An open `AF_PACKET`/`SOCK_RAW` socket receiving all protocols
    pub(super) struct RawSocket {
        fd: OwnedFd,
        if_index: u32,
    }

    impl RawSocket {
        pub(super) fn open(config: &AfPacketConfig) -> PluginResult<Self> {
            let protocol = (libc::ETH_P_ALL as u16).to_be();

            let raw = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, i32::from(protocol)) };
            if raw < 0 {
                let err = io::Error::last_os_error();
                return Err(PluginError::InitializationFailed(format!(
                    "Failed to open raw socket (root or CAP_NET_RAW required): {}",
                    err
                )));
            }
            // SAFETY: `raw` is a freshly opened descriptor owned by nobody else.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let mut socket = Self { fd, if_index: 0 };
            socket.set_recv_timeout(config.poll_timeout_ms)?;

            if let Some(name) = &config.interface {
                socket.bind(name, protocol)?;
            }

            Ok(socket)
        }

        pub(super) fn if_index(&self) -> u32 {
            self.if_index
        }

        fn set_recv_timeout(&self, timeout_ms: u64) -> PluginResult<()> {
            let tv = libc::timeval {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
            };
            let ret = unsafe {
                libc::setsockopt(
                    self.fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const libc::timeval as *const libc::c_void,
                    std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                )
            };
            if ret != 0 {
                return Err(PluginError::InitializationFailed(format!(
                    "Failed to set receive timeout: {}",
                    io::Error::last_os_error()
                )));
            }
            Ok(())
        }

        fn bind(&mut self, interface: &str, protocol: u16) -> PluginResult<()> {
            let c_name = CString::new(interface).map_err(|_| {
                PluginError::ConfigurationError(format!("Invalid interface name: {}", interface))
            })?;
            let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
            if index == 0 {
                return Err(PluginError::ConfigurationError(format!(
                    "Unknown interface {}: {}",
                    interface,
                    io::Error::last_os_error()
                )));
            }

            // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
            let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as libc::c_ushort;
            addr.sll_protocol = protocol;
            addr.sll_ifindex = index as libc::c_int;

            let ret = unsafe {
                libc::bind(
                    self.fd.as_raw_fd(),
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if ret != 0 {
                return Err(PluginError::InitializationFailed(format!(
                    "Failed to bind raw socket to {}: {}",
                    interface,
                    io::Error::last_os_error()
                )));
            }

            self.if_index = index;
            Ok(())
        }

        /// Read one frame. `Ok(None)` means the poll timeout expired.
        pub(super) fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n >= 0 {
                return Ok(Some(n as usize));
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                    Ok(None)
                }
                _ => Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AfPacketConfig::default();
        assert!(config.interface.is_none());
        assert_eq!(config.snaplen, MAX_SNAPLEN);
    }

    #[test]
    fn test_not_running_before_start() {
        let capture = AfPacketCapture::new();
        assert!(!capture.is_running());
        assert_eq!(capture.if_index(), 0);
        assert_eq!(capture.stats().frames_captured, 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_unknown_interface_is_rejected() {
        let mut capture = AfPacketCapture::with_config(AfPacketConfig {
            interface: Some("no-such-if0".to_string()),
            ..Default::default()
        });
        let (tx, _rx) = mpsc::channel(1);

        // Without CAP_NET_RAW the socket itself fails first; either way start errors.
        assert!(capture.start(tx).await.is_err());
        assert!(!capture.is_running());
    }

    #[cfg(not(target_os = "linux"))]
    #[tokio::test]
    async fn test_unsupported_platform() {
        let mut capture = AfPacketCapture::new();
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            capture.start(tx).await,
            Err(PluginError::NotSupported)
        ));
    }
}
