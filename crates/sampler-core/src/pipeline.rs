//! Drive loop - moves frames from capture through the sampler to the collector

use crate::agent::AgentIdentity;
use crate::config::PipelineSettings;
use crate::metrics::{create_metrics, SharedMetrics};
use crate::plugins::{
    CapturePlugin, CaptureStats, EncodePlugin, ExportPlugin, FrameResult, PluginError,
    PluginInfo, PluginResult,
};
use crate::sampler::{CapturedFrame, Sampler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Channel buffer size between capture and the sampler
    pub frame_buffer_size: usize,

    /// Interval between statistics log lines
    pub stats_interval: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_buffer_size: 1024,
            stats_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl From<&PipelineSettings> for PipelineConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            frame_buffer_size: settings.frame_buffer_size.max(1),
            stats_interval: (settings.stats_interval_secs > 0)
                .then(|| Duration::from_secs(settings.stats_interval_secs)),
        }
    }
}

/// The sampling pipeline
///
/// Owns the [`Sampler`] and hands it to a single task once started, so every
/// frame is observed by the same instance in arrival order.
pub struct Pipeline {
    config: PipelineConfig,

    agent: AgentIdentity,

    /// Moved into the processing task on start
    sampler: Option<Sampler>,

    capture: Option<Box<dyn CapturePlugin>>,

    /// Moved into the processing task on start
    encoder: Option<Box<dyn EncodePlugin>>,

    exporters: Vec<Arc<dyn ExportPlugin>>,

    metrics: SharedMetrics,

    shutdown_tx: Option<broadcast::Sender<()>>,

    task: Option<JoinHandle<PluginResult<()>>>,
}

impl Pipeline {
    /// Create a new pipeline around a sampler and the agent identity
    pub fn new(config: PipelineConfig, sampler: Sampler, agent: AgentIdentity) -> Self {
        Self {
            config,
            agent,
            sampler: Some(sampler),
            capture: None,
            encoder: None,
            exporters: Vec::new(),
            metrics: create_metrics(),
            shutdown_tx: None,
            task: None,
        }
    }

    /// Set the capture plugin
    pub fn set_capture(&mut self, plugin: Box<dyn CapturePlugin>) {
        if let Some(previous) = &self.capture {
            warn!("Replacing capture plugin {} with {}", previous.name(), plugin.name());
        }
        self.capture = Some(plugin);
    }

    /// Set the encode plugin
    pub fn set_encoder(&mut self, plugin: Box<dyn EncodePlugin>) {
        self.encoder = Some(plugin);
    }

    /// Add an export plugin
    pub fn add_export(&mut self, plugin: Arc<dyn ExportPlugin>) {
        self.exporters.push(plugin);
    }

    /// Shared metrics updated by the processing task
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Statistics of the capture plugin, if one is set
    pub fn capture_stats(&self) -> Option<CaptureStats> {
        self.capture.as_ref().map(|c| c.stats())
    }

    /// Whether the processing task is alive
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start capture and the processing task
    pub async fn start(&mut self) -> PluginResult<()> {
        if self.task.is_some() {
            return Err(PluginError::OperationFailed(
                "Pipeline already started".into(),
            ));
        }
        if self.exporters.is_empty() {
            return Err(PluginError::ConfigurationError(
                "No export plugin configured".into(),
            ));
        }
        let (Some(capture), Some(_), Some(_)) =
            (self.capture.as_mut(), self.encoder.as_ref(), self.sampler.as_ref())
        else {
            return Err(PluginError::ConfigurationError(
                "Pipeline needs a capture plugin, an encode plugin, and a sampler".into(),
            ));
        };

        let (frame_tx, mut frame_rx) = mpsc::channel::<FrameResult>(self.config.frame_buffer_size);

        capture.start(frame_tx).await?;
        info!("Started capture plugin: {} v{}", capture.name(), capture.version());

        let if_index = capture.if_index();
        let mut sampler = match self.sampler.take() {
            Some(sampler) => sampler.with_source_id(if_index),
            None => return Err(PluginError::OperationFailed("Sampler already consumed".into())),
        };
        let mut encoder = match self.encoder.take() {
            Some(encoder) => encoder,
            None => return Err(PluginError::OperationFailed("Encoder already consumed".into())),
        };
        info!(
            "Sampling 1 in {} frames, keeping up to {} header bytes",
            sampler.sampling_rate(),
            sampler.capture_limit()
        );

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let exporters = self.exporters.clone();
        let agent = self.agent;
        let metrics = self.metrics.clone();
        let stats_interval = self.config.stats_interval;

        self.task = Some(tokio::spawn(async move {
            let mut datagram = Vec::with_capacity(1500);
            let period = stats_interval.unwrap_or(Duration::from_secs(3600));
            let mut stats_tick =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            let result = loop {
                tokio::select! {
                    item = frame_rx.recv() => match item {
                        Some(Ok(frame)) => {
                            if let Err(e) = Self::process_frame(
                                &frame,
                                &mut sampler,
                                &mut *encoder,
                                &exporters,
                                &agent,
                                &metrics,
                                &mut datagram,
                            )
                            .await
                            {
                                error!("Aborting pipeline: {}", e);
                                break Err(e);
                            }
                        }
                        Some(Err(e)) => {
                            error!("Capture failed: {}", e);
                            break Err(e);
                        }
                        None => {
                            info!("Frame source closed");
                            break Ok(());
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Pipeline shutdown signal received");
                        break Ok(());
                    }
                    _ = stats_tick.tick(), if stats_interval.is_some() => {
                        Self::log_stats(&sampler, &exporters);
                    }
                }
            };

            for exporter in &exporters {
                if let Err(e) = exporter.flush().await {
                    warn!("Error flushing export plugin {}: {}", exporter.name(), e);
                }
            }

            Self::log_stats(&sampler, &exporters);
            info!("Pipeline stopped");

            result
        }));

        Ok(())
    }

    /// Wait for the processing task to end and return its outcome
    ///
    /// Cancel-safe: if the returned future is dropped the task keeps running.
    pub async fn wait(&mut self) -> PluginResult<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;

        joined.map_err(|e| PluginError::OperationFailed(format!("Pipeline task failed: {}", e)))?
    }

    /// Stop the pipeline and return the processing task's outcome
    pub async fn stop(&mut self) -> PluginResult<()> {
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(());
        }

        if let Some(capture) = self.capture.as_mut() {
            if capture.is_running() {
                if let Err(e) = capture.stop().await {
                    warn!("Error stopping capture plugin {}: {}", capture.name(), e);
                }
            }
        }

        self.wait().await
    }

    /// Run one frame through the sampler and, if sampled, deliver its datagram
    async fn process_frame(
        frame: &CapturedFrame,
        sampler: &mut Sampler,
        encoder: &mut dyn EncodePlugin,
        exporters: &[Arc<dyn ExportPlugin>],
        agent: &AgentIdentity,
        metrics: &SharedMetrics,
        datagram: &mut Vec<u8>,
    ) -> PluginResult<()> {
        metrics.record_frame(frame.length);

        let Some(record) = sampler.observe(frame) else {
            return Ok(());
        };
        metrics.record_sample(record.header_length(), record.stripped_bytes);

        datagram.clear();
        encoder.encode(agent, &record, datagram)?;

        for exporter in exporters {
            exporter.export(datagram).await?;
        }
        metrics.record_datagram(datagram.len());

        debug!(
            "Sent sample seq={} frame_length={} stripped={}",
            record.sequence_number, record.frame_length, record.stripped_bytes
        );

        Ok(())
    }

    fn log_stats(sampler: &Sampler, exporters: &[Arc<dyn ExportPlugin>]) {
        let (sent, dropped) = exporters.iter().fold((0, 0), |(sent, dropped), e| {
            let stats = e.stats();
            (sent + stats.datagrams_sent, dropped + stats.datagrams_dropped)
        });
        info!(
            "Frames observed: {}, samples emitted: {}, datagrams sent: {}, dropped: {}",
            sampler.frames_observed(),
            sampler.samples_emitted(),
            sent,
            dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ExportStats;
    use crate::sampler::FlowSampleRecord;
    use async_trait::async_trait;
    use std::num::NonZeroU32;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed list of items, then closes the channel
    struct ReplayCapture {
        items: Vec<FrameResult>,
        running: bool,
    }

    impl ReplayCapture {
        fn frames(lengths: &[usize]) -> Self {
            Self {
                items: lengths
                    .iter()
                    .map(|&len| Ok(CapturedFrame::new(vec![0xab; len])))
                    .collect(),
                running: false,
            }
        }
    }

    impl PluginInfo for ReplayCapture {
        fn name(&self) -> &str {
            "replay"
        }

        fn version(&self) -> &str {
            "0"
        }
    }

    #[async_trait]
    impl CapturePlugin for ReplayCapture {
        async fn start(&mut self, tx: mpsc::Sender<FrameResult>) -> PluginResult<()> {
            self.running = true;
            let items = std::mem::take(&mut self.items);
            tokio::spawn(async move {
                for item in items {
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
            });
            Ok(())
        }

        async fn stop(&mut self) -> PluginResult<()> {
            self.running = false;
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running
        }

        fn if_index(&self) -> u32 {
            2
        }
    }

    /// Produces frames until stopped
    struct EndlessCapture {
        running: Arc<AtomicBool>,
        sent: Arc<AtomicU64>,
    }

    impl EndlessCapture {
        fn new() -> Self {
            Self {
                running: Arc::new(AtomicBool::new(false)),
                sent: Arc::new(AtomicU64::new(0)),
            }
        }
    }

    impl PluginInfo for EndlessCapture {
        fn name(&self) -> &str {
            "endless"
        }

        fn version(&self) -> &str {
            "0"
        }
    }

    #[async_trait]
    impl CapturePlugin for EndlessCapture {
        async fn start(&mut self, tx: mpsc::Sender<FrameResult>) -> PluginResult<()> {
            self.running.store(true, Ordering::SeqCst);
            let running = self.running.clone();
            let sent = self.sent.clone();
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    if tx.send(Ok(CapturedFrame::new(vec![1; 64]))).await.is_err() {
                        break;
                    }
                    sent.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            });
            Ok(())
        }

        async fn stop(&mut self) -> PluginResult<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn stats(&self) -> CaptureStats {
            let frames = self.sent.load(Ordering::SeqCst);
            CaptureStats {
                frames_captured: frames,
                bytes_captured: frames * 64,
                errors: 0,
            }
        }
    }

    /// Writes sequence number, source id, and header length
    struct FieldEncoder {
        fail: bool,
    }

    impl PluginInfo for FieldEncoder {
        fn name(&self) -> &str {
            "fields"
        }

        fn version(&self) -> &str {
            "0"
        }
    }

    impl EncodePlugin for FieldEncoder {
        fn encode(
            &mut self,
            agent: &AgentIdentity,
            record: &FlowSampleRecord,
            out: &mut Vec<u8>,
        ) -> PluginResult<()> {
            if self.fail {
                return Err(PluginError::EncodeFailed("refused".into()));
            }
            out.extend_from_slice(&agent.sub_agent_id.to_be_bytes());
            out.extend_from_slice(&record.sequence_number.to_be_bytes());
            out.extend_from_slice(&record.source_id.to_be_bytes());
            out.extend_from_slice(&record.header_length().to_be_bytes());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingExporter {
        datagrams: Mutex<Vec<Vec<u8>>>,
        fail: bool,
        stats_reads: AtomicUsize,
    }

    impl RecordingExporter {
        fn fields(&self) -> Vec<[u32; 4]> {
            self.datagrams
                .lock()
                .unwrap()
                .iter()
                .map(|d| {
                    let word = |i: usize| u32::from_be_bytes(d[i * 4..i * 4 + 4].try_into().unwrap());
                    [word(0), word(1), word(2), word(3)]
                })
                .collect()
        }
    }

    impl PluginInfo for RecordingExporter {
        fn name(&self) -> &str {
            "recording"
        }

        fn version(&self) -> &str {
            "0"
        }
    }

    #[async_trait]
    impl ExportPlugin for RecordingExporter {
        async fn export(&self, datagram: &[u8]) -> PluginResult<()> {
            if self.fail {
                return Err(PluginError::ConnectionFailed("collector gone".into()));
            }
            self.datagrams.lock().unwrap().push(datagram.to_vec());
            Ok(())
        }

        fn stats(&self) -> ExportStats {
            self.stats_reads.fetch_add(1, Ordering::SeqCst);
            ExportStats {
                datagrams_sent: self.datagrams.lock().unwrap().len() as u64,
                ..Default::default()
            }
        }
    }

    fn pipeline(rate: u32, limit: u32) -> Pipeline {
        pipeline_with_stats(rate, limit, None)
    }

    fn pipeline_with_stats(rate: u32, limit: u32, stats_interval: Option<Duration>) -> Pipeline {
        let sampler = Sampler::new(NonZeroU32::new(rate).unwrap(), limit);
        let agent = AgentIdentity::default().with_sub_agent_id(9);
        let config = PipelineConfig {
            frame_buffer_size: 4,
            stats_interval,
        };
        Pipeline::new(config, sampler, agent)
    }

    #[tokio::test]
    async fn test_pipeline_samples_every_nth_frame() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut p = pipeline(4, 10);
        p.set_capture(Box::new(ReplayCapture::frames(&[20; 8])));
        p.set_encoder(Box::new(FieldEncoder { fail: false }));
        p.add_export(exporter.clone());

        tokio_test::assert_ok!(p.start().await);
        tokio_test::assert_ok!(p.wait().await);

        assert_eq!(exporter.fields(), vec![[9, 0, 2, 10], [9, 1, 2, 10]]);

        let metrics = p.metrics();
        assert_eq!(metrics.frames_observed(), 8);
        assert_eq!(metrics.samples_emitted(), 2);
        assert_eq!(metrics.datagrams_exported(), 2);
        assert!(!p.is_running());
    }

    #[tokio::test]
    async fn test_pipeline_sends_to_every_exporter() {
        let first = Arc::new(RecordingExporter::default());
        let second = Arc::new(RecordingExporter::default());
        let mut p = pipeline(1, 64);
        p.set_capture(Box::new(ReplayCapture::frames(&[30, 40, 50])));
        p.set_encoder(Box::new(FieldEncoder { fail: false }));
        p.add_export(first.clone());
        p.add_export(second.clone());

        p.start().await.unwrap();
        p.wait().await.unwrap();

        assert_eq!(first.fields().len(), 3);
        assert_eq!(first.fields(), second.fields());
    }

    #[tokio::test]
    async fn test_capture_error_is_fatal() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut p = pipeline(1, 64);
        p.set_capture(Box::new(ReplayCapture {
            items: vec![
                Ok(CapturedFrame::new(vec![0; 60])),
                Err(PluginError::OperationFailed("socket closed".into())),
                Ok(CapturedFrame::new(vec![0; 60])),
            ],
            running: false,
        }));
        p.set_encoder(Box::new(FieldEncoder { fail: false }));
        p.add_export(exporter.clone());

        p.start().await.unwrap();
        let result = p.wait().await;

        assert!(matches!(result, Err(PluginError::OperationFailed(_))));
        assert_eq!(exporter.fields().len(), 1);
    }

    #[tokio::test]
    async fn test_encode_error_is_fatal() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut p = pipeline(1, 64);
        p.set_capture(Box::new(ReplayCapture::frames(&[60, 60])));
        p.set_encoder(Box::new(FieldEncoder { fail: true }));
        p.add_export(exporter.clone());

        p.start().await.unwrap();
        let result = p.wait().await;

        assert!(matches!(result, Err(PluginError::EncodeFailed(_))));
        assert!(exporter.fields().is_empty());
    }

    #[tokio::test]
    async fn test_export_error_is_fatal() {
        let mut p = pipeline(2, 64);
        p.set_capture(Box::new(ReplayCapture::frames(&[60; 6])));
        p.set_encoder(Box::new(FieldEncoder { fail: false }));
        p.add_export(Arc::new(RecordingExporter {
            fail: true,
            ..Default::default()
        }));

        p.start().await.unwrap();
        let result = p.wait().await;

        assert!(matches!(result, Err(PluginError::ConnectionFailed(_))));
        assert_eq!(p.metrics().frames_observed(), 2);
    }

    #[tokio::test]
    async fn test_start_requires_all_plugins() {
        let mut p = pipeline(1, 64);
        p.set_capture(Box::new(ReplayCapture::frames(&[60])));
        p.add_export(Arc::new(RecordingExporter::default()));
        assert!(matches!(
            p.start().await,
            Err(PluginError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut p = pipeline(1, 64);
        p.set_capture(Box::new(EndlessCapture::new()));
        p.set_encoder(Box::new(FieldEncoder { fail: false }));
        p.add_export(Arc::new(RecordingExporter::default()));

        p.start().await.unwrap();
        assert!(p.start().await.is_err());
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_ends_endless_capture() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut p = pipeline(3, 16);
        p.set_capture(Box::new(EndlessCapture::new()));
        p.set_encoder(Box::new(FieldEncoder { fail: false }));
        p.add_export(exporter.clone());

        p.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(p.is_running());

        tokio_test::assert_ok!(p.stop().await);
        assert!(!p.is_running());

        let seqs: Vec<u32> = exporter.fields().iter().map(|f| f[1]).collect();
        assert_eq!(seqs, (0..seqs.len() as u32).collect::<Vec<_>>());
        assert_eq!(
            p.metrics().samples_emitted(),
            p.metrics().frames_observed() / 3
        );
    }

    #[tokio::test]
    async fn test_stats_are_logged_periodically() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut p = pipeline_with_stats(8, 16, Some(Duration::from_millis(20)));
        p.set_capture(Box::new(EndlessCapture::new()));
        p.set_encoder(Box::new(FieldEncoder { fail: false }));
        p.add_export(exporter.clone());

        p.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        p.stop().await.unwrap();

        // One read per tick plus the final summary
        assert!(exporter.stats_reads.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_capture_stats_cover_observed_frames() {
        let mut p = pipeline(2, 16);
        assert!(p.capture_stats().is_none());

        p.set_capture(Box::new(EndlessCapture::new()));
        p.set_encoder(Box::new(FieldEncoder { fail: false }));
        p.add_export(Arc::new(RecordingExporter::default()));

        p.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        p.stop().await.unwrap();

        let stats = p.capture_stats().unwrap();
        assert!(stats.frames_captured > 0);
        assert!(stats.frames_captured >= p.metrics().frames_observed());
        assert_eq!(stats.bytes_captured, stats.frames_captured * 64);
    }

    #[test]
    fn test_config_from_settings() {
        let config = PipelineConfig::from(&PipelineSettings {
            frame_buffer_size: 8,
            stats_interval_secs: 0,
        });
        assert_eq!(config.frame_buffer_size, 8);
        assert!(config.stats_interval.is_none());
    }
}
