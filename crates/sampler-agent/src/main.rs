//! sflow-sampler - sFlow v5 traffic sampling agent
//!
//! Samples one in every N frames seen by the host and ships the truncated
//! headers to an sFlow collector over UDP.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use sampler_capture::{create_capture_plugin, CaptureSource, FrameGeneratorConfig};
use sampler_core::config::{ConfigLoader, SamplerConfig};
use sampler_core::pipeline::{Pipeline, PipelineConfig};
use sampler_core::plugins::{CaptureStats, ExportPlugin};
use sampler_core::SharedMetrics;
use sampler_export::{SflowEncoder, UdpExporter, UdpExporterConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sflow-sampler")]
#[command(version)]
#[command(about = "Samples network traffic and exports it as sFlow v5", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format for logs and reports
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "SFLOW_SAMPLER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Flags shared by every command that runs the pipeline
#[derive(Args, Debug, Default)]
struct SamplingArgs {
    /// Sample one in every N frames
    #[arg(long, value_name = "N")]
    sample_every: Option<u32>,

    /// Bytes of each sampled frame to keep
    #[arg(long, value_name = "BYTES")]
    sample_size: Option<u32>,

    /// Collector address, host:port
    #[arg(long, value_name = "ADDR")]
    collector_address: Option<String>,

    /// Agent IP address reported in every datagram
    #[arg(long, value_name = "IP")]
    source_ip: Option<String>,

    /// Write Prometheus text metrics to this file on exit
    #[arg(long, value_name = "PATH")]
    metrics_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample live traffic (requires root or CAP_NET_RAW)
    Run {
        #[command(flatten)]
        sampling: SamplingArgs,

        /// Capture on this interface only
        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Sample synthetic frames (no raw socket required)
    Demo {
        #[command(flatten)]
        sampling: SamplingArgs,

        /// Number of frames to generate (0 = infinite)
        #[arg(long, default_value = "0")]
        count: u64,

        /// Frame generation interval in milliseconds
        #[arg(long, default_value = "1")]
        interval: u64,
    },

    /// Show agent status and host capabilities
    Status,

    /// Write the effective configuration to a TOML file
    InitConfig {
        /// Destination path
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loader = ConfigLoader::new().with_cli_path(cli.config.clone());
    let config = loader.load().context("Failed to load configuration")?;

    init_logging(cli.verbose, &config.agent.log_level, cli.format)?;

    match cli.command {
        Commands::Run {
            mut sampling,
            interface,
        } => {
            let metrics_file = sampling.metrics_file.take();
            let mut config = merge_sampling_args(&loader, config, sampling)?;
            if interface.is_some() {
                config.capture.interface = interface;
            }
            let source = CaptureSource::live(&config.capture);
            run_command(config, source, cli.format, metrics_file.as_deref()).await
        }
        Commands::Demo {
            mut sampling,
            count,
            interval,
        } => {
            let metrics_file = sampling.metrics_file.take();
            let config = merge_sampling_args(&loader, config, sampling)?;
            let source = CaptureSource::Synthetic(FrameGeneratorConfig {
                interval_ms: interval,
                frame_count: count,
                ..Default::default()
            });
            println!();
            println!("  sflow-sampler v{} - DEMO MODE", env!("CARGO_PKG_VERSION"));
            println!();
            println!("  Generating a synthetic frame every {}ms", interval);
            if count > 0 {
                println!("  Will generate {} frames total", count);
            }
            println!("  Sending to {}", config.collector.address);
            println!();
            run_command(config, source, cli.format, metrics_file.as_deref()).await
        }
        Commands::Status => status_command(cli.format),
        Commands::InitConfig { path, force } => init_config_command(&loader, &config, &path, force),
    }
}

/// Install the global subscriber; `-v` wins over the configured level
fn init_logging(verbose: u8, configured: &str, format: OutputFormat) -> anyhow::Result<()> {
    let log_level = if verbose > 0 {
        match verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match configured.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    match format {
        OutputFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        OutputFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }

    Ok(())
}

/// Merge CLI flags over the loaded configuration and re-validate
fn merge_sampling_args(
    loader: &ConfigLoader,
    mut config: SamplerConfig,
    args: SamplingArgs,
) -> anyhow::Result<SamplerConfig> {
    if let Some(rate) = args.sample_every {
        config.sampling.rate = rate;
    }
    if let Some(size) = args.sample_size {
        config.sampling.header_bytes = size;
    }
    if let Some(address) = args.collector_address {
        config.collector.address = address;
    }
    if let Some(ip) = args.source_ip {
        config.agent.address = ip;
    }

    loader
        .validate(&config)
        .context("Invalid command line options")?;
    Ok(config)
}

async fn run_command(
    config: SamplerConfig,
    source: CaptureSource,
    format: OutputFormat,
    metrics_file: Option<&Path>,
) -> anyhow::Result<()> {
    info!("Starting sflow-sampler v{}...", env!("CARGO_PKG_VERSION"));

    let sampler = config.sampler()?;
    let agent = config.agent_identity()?;

    let mut pipeline = Pipeline::new(PipelineConfig::from(&config.pipeline), sampler, agent);
    pipeline.set_capture(create_capture_plugin(source));
    pipeline.set_encoder(Box::new(SflowEncoder::new()));

    let exporter = Arc::new(UdpExporter::connect(UdpExporterConfig::from(&config.collector)).await?);
    pipeline.add_export(exporter.clone());

    pipeline.start().await?;
    info!(
        "Agent {} sampling toward {} (Ctrl+C to stop)",
        agent.address,
        exporter.peer()
    );

    let finished = tokio::select! {
        result = pipeline.wait() => Some(result),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
    };

    let result = match finished {
        Some(result) => result,
        None => {
            info!("Interrupted, shutting down");
            pipeline.stop().await
        }
    };

    let metrics = pipeline.metrics();
    print_summary(
        &metrics,
        pipeline.capture_stats().unwrap_or_default(),
        exporter.as_ref(),
        format,
    )?;
    if let Some(path) = metrics_file {
        std::fs::write(path, metrics.to_prometheus())
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        info!("Metrics written to {}", path.display());
    }

    result?;
    info!("Sampler stopped");
    Ok(())
}

fn print_summary(
    metrics: &SharedMetrics,
    capture: CaptureStats,
    exporter: &dyn ExportPlugin,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let stats = exporter.stats();

    match format {
        OutputFormat::Json => {
            let summary = serde_json::json!({
                "metrics": metrics.to_json(),
                "capture": {
                    "frames_captured": capture.frames_captured,
                    "bytes_captured": capture.bytes_captured,
                    "errors": capture.errors,
                },
                "collector": {
                    "datagrams_sent": stats.datagrams_sent,
                    "datagrams_dropped": stats.datagrams_dropped,
                    "bytes_sent": stats.bytes_sent,
                },
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            println!();
            println!("  Frames captured:    {}", capture.frames_captured);
            println!("  Capture errors:     {}", capture.errors);
            println!("  Frames observed:    {}", metrics.frames_observed());
            println!("  Samples emitted:    {}", metrics.samples_emitted());
            println!("  Datagrams sent:     {}", stats.datagrams_sent);
            println!("  Datagrams dropped:  {}", stats.datagrams_dropped);
            println!("  Uptime:             {}s", metrics.uptime_seconds());
            println!();
        }
    }

    Ok(())
}

fn status_command(format: OutputFormat) -> anyhow::Result<()> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let interfaces = list_interfaces();
    let config_path = ConfigLoader::default_config_path();

    #[cfg(target_os = "linux")]
    let is_root = Some(unsafe { libc::getuid() } == 0);
    #[cfg(not(target_os = "linux"))]
    let is_root: Option<bool> = None;

    let raw_capture = cfg!(target_os = "linux");

    if format == OutputFormat::Json {
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "sflow_version": sampler_core::SFLOW_VERSION,
            "platform": {
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
            },
            "hostname": hostname,
            "running_as_root": is_root,
            "raw_capture_supported": raw_capture,
            "interfaces": interfaces,
            "default_config_path": config_path.map(|p| p.display().to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("sflow-sampler v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    println!("Hostname: {}", hostname);
    println!("sFlow version: {}", sampler_core::SFLOW_VERSION);
    println!();
    println!("Capture:");
    println!("  AF_PACKET supported: {}", raw_capture);
    if let Some(root) = is_root {
        println!("  Running as root: {}", root);
    }
    if interfaces.is_empty() {
        println!("  Interfaces: none found");
    } else {
        println!("  Interfaces: {}", interfaces.join(", "));
    }
    if let Some(path) = config_path {
        println!();
        println!("Default config: {}", path.display());
    }
    println!();

    Ok(())
}

/// Network interface names, sorted
fn list_interfaces() -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir("/sys/class/net")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn init_config_command(
    loader: &ConfigLoader,
    config: &SamplerConfig,
    path: &Path,
    force: bool,
) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    loader.save(config, path)?;
    println!("Wrote configuration to {}", path.display());
    Ok(())
}
