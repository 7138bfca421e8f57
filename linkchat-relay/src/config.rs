//! Configuration system for the `LinkChat` relay.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/linkchat-relay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

use crate::assets::{AssetSettings, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MIN_CHUNK_SIZE};
use crate::bus::{BusSettings, DEFAULT_RECEIVED_DIR};
use crate::store::DEFAULT_MAX_QUEUE_SIZE;

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value is outside its allowed range.
    #[error("invalid setting {name}: {reason}")]
    Invalid {
        /// Setting name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    assets: AssetsFileConfig,
}

/// `[server]` section: the message bus.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    echo_to_sender: Option<bool>,
    max_queue_size: Option<usize>,
}

/// `[assets]` section: the asset receiving service.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AssetsFileConfig {
    bind_addr: Option<String>,
    received_dir: Option<PathBuf>,
    loss_rate: Option<f64>,
    min_chunk_size: Option<usize>,
    max_chunk_size: Option<usize>,
}

/// CLI arguments for the relay.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "LinkChat message bus and asset service")]
pub struct RelayCliArgs {
    /// Address to bind the message bus to.
    #[arg(short, long, env = "LINKCHAT_RELAY_ADDR")]
    pub bind: Option<String>,

    /// Address to bind the asset service to.
    #[arg(long, env = "LINKCHAT_ASSET_BIND")]
    pub asset_bind: Option<String>,

    /// Path to config file (default: `~/.config/linkchat-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory uploaded assets are stored in and served from.
    #[arg(long)]
    pub received_dir: Option<PathBuf>,

    /// Simulated chunk loss probability (0.0 to 1.0).
    #[arg(long)]
    pub loss_rate: Option<f64>,

    /// Echo every routed message back to its sender.
    #[arg(long)]
    pub echo_to_sender: bool,

    /// Maximum queue size per offline recipient.
    #[arg(long)]
    pub max_queue_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "LINKCHAT_RELAY_LOG")]
    pub log_level: String,
}

/// Fully resolved relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Message bus bind address.
    pub bind_addr: String,
    /// Asset service bind address.
    pub asset_bind_addr: String,
    /// Echo routed messages to their sender.
    pub echo_to_sender: bool,
    /// Maximum number of queued messages per offline recipient.
    pub max_queue_size: usize,
    /// Storage directory for uploads.
    pub received_dir: PathBuf,
    /// Simulated chunk loss probability.
    pub loss_rate: f64,
    /// Smallest accepted chunk size.
    pub min_chunk_size: usize,
    /// Largest accepted chunk size.
    pub max_chunk_size: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            asset_bind_addr: "0.0.0.0:9001".to_string(),
            echo_to_sender: false,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            received_dir: PathBuf::from(DEFAULT_RECEIVED_DIR),
            loss_rate: 0.0,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or a resolved value is out of range.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            asset_bind_addr: cli
                .asset_bind
                .clone()
                .or_else(|| file.assets.bind_addr.clone())
                .unwrap_or(defaults.asset_bind_addr),
            echo_to_sender: cli.echo_to_sender
                || file.server.echo_to_sender.unwrap_or(defaults.echo_to_sender),
            max_queue_size: cli
                .max_queue_size
                .or(file.server.max_queue_size)
                .unwrap_or(defaults.max_queue_size),
            received_dir: cli
                .received_dir
                .clone()
                .or_else(|| file.assets.received_dir.clone())
                .unwrap_or(defaults.received_dir),
            loss_rate: cli
                .loss_rate
                .or(file.assets.loss_rate)
                .unwrap_or(defaults.loss_rate),
            min_chunk_size: file.assets.min_chunk_size.unwrap_or(defaults.min_chunk_size),
            max_chunk_size: file.assets.max_chunk_size.unwrap_or(defaults.max_chunk_size),
            log_level: cli.log_level.clone(),
        };
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.loss_rate) {
            return Err(ConfigError::Invalid {
                name: "loss_rate",
                reason: format!("{} is not within 0.0..=1.0", self.loss_rate),
            });
        }
        if self.min_chunk_size == 0 || self.min_chunk_size > self.max_chunk_size {
            return Err(ConfigError::Invalid {
                name: "min_chunk_size",
                reason: format!(
                    "{} must be positive and at most max_chunk_size {}",
                    self.min_chunk_size, self.max_chunk_size
                ),
            });
        }
        Ok(())
    }

    /// Settings for the message bus.
    #[must_use]
    pub fn bus_settings(&self) -> BusSettings {
        BusSettings {
            echo_to_sender: self.echo_to_sender,
            max_queue_size: self.max_queue_size,
            received_dir: self.received_dir.clone(),
        }
    }

    /// Settings for the asset service.
    #[must_use]
    pub fn asset_settings(&self) -> AssetSettings {
        AssetSettings {
            received_dir: self.received_dir.clone(),
            loss_rate: self.loss_rate,
            min_chunk_size: self.min_chunk_size,
            max_chunk_size: self.max_chunk_size,
        }
    }
}

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(RelayConfigFile::default());
    };
    let path = config_dir.join("linkchat-relay").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
