//! Configuration system for the sFlow sampler
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation of sampling and collector settings

use crate::agent::AgentIdentity;
use crate::sampler::{Sampler, DEFAULT_CAPTURE_LIMIT, DEFAULT_SAMPLING_RATE};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SFLOW_SAMPLER_CONFIG";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete sampler configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplerConfig {
    /// Agent identity and logging
    pub agent: AgentSettings,

    /// Sampling parameters
    pub sampling: SamplingSettings,

    /// Frame capture settings
    pub capture: CaptureSettings,

    /// Collector delivery settings
    pub collector: CollectorSettings,

    /// Drive loop settings
    pub pipeline: PipelineSettings,
}

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// IP address of this host as reported to the collector
    pub address: String,

    /// sFlow sub-agent id
    pub sub_agent_id: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            address: "127.0.0.1".to_string(),
            sub_agent_id: crate::agent::DEFAULT_SUB_AGENT_ID,
        }
    }
}

/// Sampling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplingSettings {
    /// Sample one frame in every `rate`
    pub rate: u32,

    /// Maximum bytes of each sampled frame to keep
    pub header_bytes: u32,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            rate: DEFAULT_SAMPLING_RATE,
            header_bytes: DEFAULT_CAPTURE_LIMIT,
        }
    }
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureSettings {
    /// Interface to capture on (all interfaces if unset)
    pub interface: Option<String>,

    /// Receive buffer size in bytes
    pub snaplen: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: None,
            snaplen: 65535,
        }
    }
}

/// Collector settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectorSettings {
    /// Collector address, `host:port`
    pub address: String,

    /// Datagrams queued for the socket before new ones are dropped
    pub queue_size: usize,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6343".to_string(),
            queue_size: 64,
        }
    }
}

/// Drive loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    /// Frames buffered between capture and the sampler
    pub frame_buffer_size: usize,

    /// Seconds between statistics log lines (0 = off)
    pub stats_interval_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            frame_buffer_size: 1024,
            stats_interval_secs: 60,
        }
    }
}

impl SamplerConfig {
    /// Build the sampling engine described by this configuration
    pub fn sampler(&self) -> ConfigResult<Sampler> {
        let rate = NonZeroU32::new(self.sampling.rate).ok_or_else(|| {
            ConfigError::ValidationError("Sampling rate must be at least 1".to_string())
        })?;
        Ok(Sampler::new(rate, self.sampling.header_bytes))
    }

    /// Agent identity described by this configuration
    pub fn agent_identity(&self) -> ConfigResult<AgentIdentity> {
        let address: IpAddr = self.agent.address.parse().map_err(|_| {
            ConfigError::ValidationError(format!(
                "Invalid agent address: {}",
                self.agent.address
            ))
        })?;
        Ok(AgentIdentity::new(address).with_sub_agent_id(self.agent.sub_agent_id))
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. SFLOW_SAMPLER_CONFIG environment variable
    /// 3. ~/.config/sflow-sampler/config.toml
    /// 4. /etc/sflow-sampler/config.toml
    /// 5. Default values
    ///
    /// A config path given explicitly (flag or env var) must exist.
    pub fn load(&self) -> ConfigResult<SamplerConfig> {
        let config_path = self.find_config_file()?;

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            SamplerConfig::default()
        };

        self.apply_env_overrides(&mut config)?;

        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> ConfigResult<Option<PathBuf>> {
        if let Some(path) = &self.cli_path {
            return explicit_path(path.clone(), "--config");
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            return explicit_path(PathBuf::from(env_path), CONFIG_ENV_VAR);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Ok(Some(path));
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/sflow-sampler/config.toml");
            if path.exists() {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<SamplerConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: SamplerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut SamplerConfig) -> ConfigResult<()> {
        apply_overrides(config, |key| std::env::var(key).ok())
    }

    /// Validate configuration
    pub fn validate(&self, config: &SamplerConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.agent.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.agent.log_level, valid_levels
            )));
        }

        config.sampler()?;
        let agent = config.agent_identity()?;

        if config.sampling.header_bytes > agent.max_header_bytes() {
            return Err(ConfigError::ValidationError(format!(
                "Header bytes {} too large: at most {} fit one datagram from a {} agent",
                config.sampling.header_bytes,
                agent.max_header_bytes(),
                if agent.address.is_ipv4() { "IPv4" } else { "IPv6" }
            )));
        }

        if config.collector.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Collector address cannot be empty".to_string(),
            ));
        }

        if config.collector.queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "Collector queue size cannot be 0".to_string(),
            ));
        }

        if config.pipeline.frame_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "Frame buffer size cannot be 0".to_string(),
            ));
        }

        if config.capture.snaplen == 0 {
            return Err(ConfigError::ValidationError(
                "Capture snaplen cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &SamplerConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sflow-sampler").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn explicit_path(path: PathBuf, source: &str) -> ConfigResult<Option<PathBuf>> {
    if path.exists() {
        Ok(Some(path))
    } else {
        Err(ConfigError::ReadError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} points to missing file {}", source, path.display()),
        )))
    }
}

/// Apply `SFLOW_SAMPLER_*` overrides read through `lookup`
fn apply_overrides(
    config: &mut SamplerConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> ConfigResult<()> {
    if let Some(val) = lookup("SFLOW_SAMPLER_LOG_LEVEL") {
        config.agent.log_level = val;
    }
    if let Some(val) = lookup("SFLOW_SAMPLER_AGENT_ADDRESS") {
        config.agent.address = val;
    }

    if let Some(val) = lookup("SFLOW_SAMPLER_SAMPLING_RATE") {
        config.sampling.rate = parse_number("SFLOW_SAMPLER_SAMPLING_RATE", &val)?;
    }
    if let Some(val) = lookup("SFLOW_SAMPLER_HEADER_BYTES") {
        config.sampling.header_bytes = parse_number("SFLOW_SAMPLER_HEADER_BYTES", &val)?;
    }

    if let Some(val) = lookup("SFLOW_SAMPLER_INTERFACE") {
        config.capture.interface = Some(val);
    }

    if let Some(val) = lookup("SFLOW_SAMPLER_COLLECTOR") {
        config.collector.address = val;
    }

    Ok(())
}

fn parse_number(key: &str, val: &str) -> ConfigResult<u32> {
    val.trim().parse().map_err(|_| {
        ConfigError::ValidationError(format!("{} is not a number: {:?}", key, val))
    })
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }

        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_default_config() {
        let config = SamplerConfig::default();
        assert_eq!(config.agent.log_level, "info");
        assert_eq!(config.sampling.rate, 256);
        assert_eq!(config.sampling.header_bytes, 256);
        assert_eq!(config.collector.address, "127.0.0.1:6343");
        assert!(config.capture.interface.is_none());
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [sampling]
            rate = 1000
        "#;
        let config: SamplerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sampling.rate, 1000);
        assert_eq!(config.sampling.header_bytes, 256);
        assert_eq!(config.agent.sub_agent_id, 1);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [agent]
            log_level = "debug"
            address = "10.0.0.5"
            sub_agent_id = 7

            [sampling]
            rate = 512
            header_bytes = 128

            [capture]
            interface = "eth0"

            [collector]
            address = "collector.example:6343"
            queue_size = 16

            [pipeline]
            stats_interval_secs = 0
        "#;

        let config: SamplerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agent.log_level, "debug");
        assert_eq!(config.sampling.rate, 512);
        assert_eq!(config.sampling.header_bytes, 128);
        assert_eq!(config.capture.interface.as_deref(), Some("eth0"));
        assert_eq!(config.collector.address, "collector.example:6343");
        assert_eq!(config.collector.queue_size, 16);
        assert_eq!(config.pipeline.stats_interval_secs, 0);

        let agent = config.agent_identity().unwrap();
        assert_eq!(agent.address, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(agent.sub_agent_id, 7);

        let sampler = config.sampler().unwrap();
        assert_eq!(sampler.sampling_rate(), 512);
        assert_eq!(sampler.capture_limit(), 128);
    }

    #[test]
    fn test_validation_zero_rate() {
        let config = SamplerConfig {
            sampling: SamplingSettings {
                rate: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = ConfigLoader::new().validate(&config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_zero_header_bytes_is_allowed() {
        let config = SamplerConfig {
            sampling: SamplingSettings {
                header_bytes: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_validation_invalid_agent_address() {
        let config = SamplerConfig {
            agent: AgentSettings {
                address: "not-an-ip".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let config = SamplerConfig {
            agent: AgentSettings {
                log_level: "loud".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = SamplerConfig::default();
        config.sampling.rate = 32;
        config.capture.interface = Some("lo".to_string());

        let loader = ConfigLoader::new();
        loader.save(&config, &path).unwrap();

        let loaded = loader.load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validation_header_bytes_must_fit_datagram() {
        let mut config = SamplerConfig::default();
        let loader = ConfigLoader::new();

        config.sampling.header_bytes = 65412;
        assert!(loader.validate(&config).is_ok());
        config.sampling.header_bytes = 65413;
        assert!(matches!(
            loader.validate(&config),
            Err(ConfigError::ValidationError(_))
        ));
        config.sampling.header_bytes = 65535;
        assert!(loader.validate(&config).is_err());

        // IPv6 agent addresses leave 12 fewer bytes for the header
        config.agent.address = "2001:db8::1".to_string();
        config.sampling.header_bytes = 65400;
        assert!(loader.validate(&config).is_ok());
        config.sampling.header_bytes = 65401;
        assert!(loader.validate(&config).is_err());
    }

    #[test]
    fn test_missing_cli_config_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::new().with_cli_path(Some(dir.path().join("typo.toml")));

        assert!(matches!(loader.load(), Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_cli_config_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sampling]\nrate = 2048\n").unwrap();

        let config = ConfigLoader::new().with_cli_path(Some(path)).load().unwrap();
        assert_eq!(config.sampling.rate, 2048);
    }

    #[test]
    fn test_overrides_apply() {
        let env = [
            ("SFLOW_SAMPLER_SAMPLING_RATE", " 1024"),
            ("SFLOW_SAMPLER_HEADER_BYTES", "96"),
            ("SFLOW_SAMPLER_COLLECTOR", "198.51.100.7:6343"),
            ("SFLOW_SAMPLER_INTERFACE", "eth2"),
        ];
        let mut config = SamplerConfig::default();

        apply_overrides(&mut config, |key| {
            env.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
        .unwrap();

        assert_eq!(config.sampling.rate, 1024);
        assert_eq!(config.sampling.header_bytes, 96);
        assert_eq!(config.collector.address, "198.51.100.7:6343");
        assert_eq!(config.capture.interface.as_deref(), Some("eth2"));
    }

    #[test]
    fn test_unparsable_numeric_override_is_an_error() {
        for key in ["SFLOW_SAMPLER_SAMPLING_RATE", "SFLOW_SAMPLER_HEADER_BYTES"] {
            let mut config = SamplerConfig::default();
            let result = apply_overrides(&mut config, |k| (k == key).then(|| "1O24".to_string()));

            assert!(matches!(result, Err(ConfigError::ValidationError(_))));
            assert_eq!(config, SamplerConfig::default());
        }
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sampling\nrate = ").unwrap();

        let result = ConfigLoader::new().load_from_file(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
