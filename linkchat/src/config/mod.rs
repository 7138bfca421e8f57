//! Configuration for the `LinkChat` client.
//!
//! Layered, highest priority first:
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/linkchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use linkchat_proto::transfer::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, TransferMode, UnknownMode,
};

use crate::bus::ws::WsConnector;
use crate::client::ClientSettings;
use crate::delivery::link::TcpLinkConnector;
use crate::delivery::transfer::{DEFAULT_ACK_TIMEOUT, TransferOptions};
use crate::session::{ConnectionManager, DEFAULT_REFRESH_INTERVAL, DEFAULT_REGISTER_TIMEOUT};

/// Errors that can occur when loading configuration.
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

    /// The configured transfer mode is not recognised.
    #[error("invalid [transfer] mode: {0}")]
    InvalidMode(#[from] UnknownMode),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    transfer: TransferFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    bus_url: Option<String>,
    asset_addr: Option<String>,
    identity: Option<String>,
    connect_timeout_secs: Option<u64>,
    register_timeout_secs: Option<u64>,
    refresh_interval_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[transfer]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransferFileConfig {
    mode: Option<String>,
    chunk_size: Option<usize>,
    max_retries: Option<u32>,
    ack_timeout_ms: Option<u64>,
    result_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Message bus WebSocket URL.
    pub bus_url: String,
    /// Asset service address (`host:port`).
    pub asset_addr: String,
    /// Identity to connect with at startup.
    pub identity: Option<String>,
    /// Timeout for opening bus and asset connections.
    pub connect_timeout: Duration,
    /// Timeout for the registration acknowledgment.
    pub register_timeout: Duration,
    /// Interval between directory refresh requests.
    pub refresh_interval: Duration,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,

    // -- Transfer --
    /// Default asset transfer parameters.
    pub transfer: TransferOptions,
    /// Wait for the asset service's final result.
    pub result_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bus_url: "ws://127.0.0.1:8000/ws".to_string(),
            asset_addr: "127.0.0.1:9001".to_string(),
            identity: None,
            connect_timeout: Duration::from_secs(10),
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            channel_capacity: 256,
            transfer: TransferOptions {
                mode: TransferMode::Reliable,
                chunk_size: DEFAULT_CHUNK_SIZE,
                max_retries: DEFAULT_MAX_RETRIES,
                ack_timeout: DEFAULT_ACK_TIMEOUT,
            },
            result_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit config file cannot be read,
    /// if any config file cannot be parsed, or if the configured transfer
    /// mode is unknown.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let net = &file.network;
        let xfer = &file.transfer;

        let file_mode = xfer
            .mode
            .as_deref()
            .map(str::parse::<TransferMode>)
            .transpose()?;

        Ok(Self {
            bus_url: cli
                .bus_url
                .clone()
                .or_else(|| net.bus_url.clone())
                .unwrap_or(defaults.bus_url),
            asset_addr: cli
                .asset_addr
                .clone()
                .or_else(|| net.asset_addr.clone())
                .unwrap_or(defaults.asset_addr),
            identity: cli.identity.clone().or_else(|| net.identity.clone()),
            connect_timeout: net
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            register_timeout: net
                .register_timeout_secs
                .map_or(defaults.register_timeout, Duration::from_secs),
            refresh_interval: net
                .refresh_interval_secs
                .map_or(defaults.refresh_interval, Duration::from_secs),
            channel_capacity: net.channel_capacity.unwrap_or(defaults.channel_capacity),
            transfer: TransferOptions {
                mode: cli.mode.or(file_mode).unwrap_or(defaults.transfer.mode),
                chunk_size: cli
                    .chunk_size
                    .or(xfer.chunk_size)
                    .unwrap_or(defaults.transfer.chunk_size),
                max_retries: xfer.max_retries.unwrap_or(defaults.transfer.max_retries),
                ack_timeout: xfer
                    .ack_timeout_ms
                    .map_or(defaults.transfer.ack_timeout, Duration::from_millis),
            },
            result_timeout: xfer
                .result_timeout_secs
                .map_or(defaults.result_timeout, Duration::from_secs),
        })
    }

    /// Connection manager for the configured bus.
    #[must_use]
    pub fn connection_manager(&self) -> ConnectionManager<WsConnector> {
        let connector = WsConnector::new(self.bus_url.clone())
            .with_connect_timeout(self.connect_timeout)
            .with_buffer(self.channel_capacity);
        ConnectionManager::new(connector)
            .with_register_timeout(self.register_timeout)
            .with_refresh_interval(self.refresh_interval)
    }

    /// Connector for the configured asset service.
    #[must_use]
    pub fn link_connector(&self) -> TcpLinkConnector {
        TcpLinkConnector::new(self.asset_addr.clone())
            .with_connect_timeout(self.connect_timeout)
            .with_result_timeout(self.result_timeout)
    }

    /// Client settings derived from this configuration.
    #[must_use]
    pub const fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            transfer: self.transfer,
            event_capacity: self.channel_capacity,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Messaging client with reliable and best-effort image transfer")]
pub struct CliArgs {
    /// WebSocket URL of the message bus.
    #[arg(long, env = "LINKCHAT_BUS_URL")]
    pub bus_url: Option<String>,

    /// Address of the asset service (`host:port`).
    #[arg(long, env = "LINKCHAT_ASSET_ADDR")]
    pub asset_addr: Option<String>,

    /// Identity to connect with at startup.
    #[arg(long, env = "LINKCHAT_IDENTITY")]
    pub identity: Option<String>,

    /// Default transfer mode (FIABLE or SEMI-FIABLE).
    #[arg(long)]
    pub mode: Option<TransferMode>,

    /// Default chunk size in bytes.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Path to config file (default: `~/.config/linkchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "LINKCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/linkchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Load and parse a TOML config file.
///
/// An explicit path must exist. Without one, the default path is tried and
/// a missing file counts as empty.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("linkchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.bus_url, "ws://127.0.0.1:8000/ws");
        assert_eq!(config.asset_addr, "127.0.0.1:9001");
        assert!(config.identity.is_none());
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.register_timeout, Duration::from_secs(5));
        assert_eq!(config.refresh_interval, Duration::from_secs(3));
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.transfer.mode, TransferMode::Reliable);
        assert_eq!(config.transfer.chunk_size, 4096);
        assert_eq!(config.transfer.max_retries, 3);
        assert_eq!(config.transfer.ack_timeout, Duration::from_millis(500));
        assert_eq!(config.result_timeout, Duration::from_secs(5));
    }

    #[test]
    fn toml_parsing_full() {
        let toml_str = r#"
[network]
bus_url = "ws://bus.example:8000/ws"
asset_addr = "assets.example:9001"
identity = "alice"
connect_timeout_secs = 30
register_timeout_secs = 8
refresh_interval_secs = 10
channel_capacity = 512

[transfer]
mode = "SEMI-FIABLE"
chunk_size = 1024
max_retries = 5
ack_timeout_ms = 250
result_timeout_secs = 9
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file).unwrap();

        assert_eq!(config.bus_url, "ws://bus.example:8000/ws");
        assert_eq!(config.asset_addr, "assets.example:9001");
        assert_eq!(config.identity.as_deref(), Some("alice"));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.register_timeout, Duration::from_secs(8));
        assert_eq!(config.refresh_interval, Duration::from_secs(10));
        assert_eq!(config.channel_capacity, 512);
        assert_eq!(config.transfer.mode, TransferMode::BestEffort);
        assert_eq!(config.transfer.chunk_size, 1024);
        assert_eq!(config.transfer.max_retries, 5);
        assert_eq!(config.transfer.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.result_timeout, Duration::from_secs(9));
    }

    #[test]
    fn toml_parsing_partial() {
        let toml_str = r#"
[transfer]
chunk_size = 512
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file).unwrap();

        assert_eq!(config.transfer.chunk_size, 512);
        assert_eq!(config.transfer.max_retries, 3);
        assert_eq!(config.bus_url, "ws://127.0.0.1:8000/ws");
    }

    #[test]
    fn toml_parsing_empty() {
        let file: ConfigFile = toml::from_str("").unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file).unwrap();
        assert!(config.identity.is_none());
        assert_eq!(config.transfer.mode, TransferMode::Reliable);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let file: ConfigFile = toml::from_str("[transfer]\nmode = \"turbo\"\n").unwrap();
        let err = ClientConfig::resolve(&CliArgs::default(), &file).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMode(_)));
    }

    #[test]
    fn cli_overrides_file() {
        let toml_str = r#"
[network]
bus_url = "ws://file:8000/ws"
identity = "file-user"

[transfer]
mode = "FIABLE"
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cli = CliArgs {
            bus_url: Some("ws://cli:8000/ws".to_string()),
            mode: Some(TransferMode::BestEffort),
            ..Default::default()
        };
        let config = ClientConfig::resolve(&cli, &file).unwrap();

        assert_eq!(config.bus_url, "ws://cli:8000/ws");
        assert_eq!(config.identity.as_deref(), Some("file-user"));
        assert_eq!(config.transfer.mode, TransferMode::BestEffort);
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = load_config_file(None);
        assert!(result.is_ok());
    }

    #[test]
    fn explicit_missing_config_file_returns_error() {
        let result = load_config_file(Some(std::path::Path::new("/nonexistent/config.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    fn client_settings_carry_transfer_defaults() {
        let config = ClientConfig {
            channel_capacity: 32,
            ..Default::default()
        };
        let settings = config.client_settings();
        assert_eq!(settings.event_capacity, 32);
        assert_eq!(settings.transfer, config.transfer);
    }
}
