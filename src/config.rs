//! Runtime configuration loaded from TOML.

use crate::acm::{AcmClose, AcmConfig, AcmHeartbeat};
use crate::error::Error;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default maximum frame size (1MB)
pub const DEFAULT_MESSAGE_SIZE_MAX: usize = 1024 * 1024;

/// Default batch auto-flush threshold (1MB)
pub const DEFAULT_BATCH_AUTO_FLUSH_SIZE: usize = 1024 * 1024;

/// Default endpoint timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: i64 = 60_000;

/// ACM settings as written in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmSection {
    /// Idle timeout in seconds. Zero disables monitoring.
    pub timeout_secs: u64,
    pub close: AcmClose,
    pub heartbeat: AcmHeartbeat,
}

impl Default for AcmSection {
    fn default() -> Self {
        Self::from(AcmConfig::default())
    }
}

impl From<AcmConfig> for AcmSection {
    fn from(config: AcmConfig) -> Self {
        Self {
            timeout_secs: config.timeout.as_secs(),
            close: config.close,
            heartbeat: config.heartbeat,
        }
    }
}

impl AcmSection {
    pub fn to_acm_config(&self) -> AcmConfig {
        AcmConfig::new(
            Duration::from_secs(self.timeout_secs),
            self.close,
            self.heartbeat,
        )
    }
}

/// Client and server ACM policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AcmSettings {
    #[serde(default)]
    pub client: AcmSection,
    #[serde(default)]
    pub server: AcmSection,
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default bind address for `floe serve`
    pub default_bind_addr: String,
    /// Largest frame accepted from a peer, in bytes. 0 means unlimited.
    pub message_size_max: usize,
    /// DEFLATE level, clamped to 1..=9 when used.
    pub compression_level: i32,
    /// Batches reaching this many bytes are sent automatically. 0 disables.
    pub batch_auto_flush_size: usize,
    /// Overrides the endpoint timeout while connecting, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<i64>,
    /// Overrides the endpoint timeout while closing, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_timeout: Option<i64>,
    /// Endpoint timeout in milliseconds. Negative disables timeouts.
    pub default_timeout: i64,
    /// Delays between invocation retries, in milliseconds.
    pub retry_intervals: Vec<u64>,
    pub warn_connections: bool,
    pub warn_datagrams: bool,
    pub acm: AcmSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_bind_addr: "127.0.0.1:10000".to_string(),
            message_size_max: DEFAULT_MESSAGE_SIZE_MAX,
            compression_level: 1,
            batch_auto_flush_size: DEFAULT_BATCH_AUTO_FLUSH_SIZE,
            connect_timeout: None,
            close_timeout: None,
            default_timeout: DEFAULT_TIMEOUT_MS,
            retry_intervals: vec![0],
            warn_connections: false,
            warn_datagrams: false,
            acm: AcmSettings::default(),
        }
    }
}

impl Config {
    /// Configuration suited to processes that mostly make outgoing calls.
    /// Client connections heartbeat when idle so the server keeps them.
    pub fn for_client() -> Self {
        let mut config = Self::default();
        config.acm.client = AcmSection {
            timeout_secs: 60,
            close: AcmClose::OnInvocationAndIdle,
            heartbeat: AcmHeartbeat::OnIdle,
        };
        config.connect_timeout = Some(10_000);
        config
    }

    /// Configuration for servers: idle clients are closed gracefully and
    /// connection failures are reported.
    pub fn for_server() -> Self {
        let mut config = Self::default();
        config.acm.server = AcmSection {
            timeout_secs: 60,
            close: AcmClose::OnIdle,
            heartbeat: AcmHeartbeat::OnDispatch,
        };
        config.warn_connections = true;
        config
    }

    /// Small limits and short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            default_bind_addr: "127.0.0.1:0".to_string(),
            message_size_max: 64 * 1024,
            batch_auto_flush_size: 4 * 1024,
            connect_timeout: Some(1_000),
            close_timeout: Some(1_000),
            default_timeout: 5_000,
            retry_intervals: vec![0, 10],
            acm: AcmSettings {
                client: AcmSection::from(AcmConfig::disabled()),
                server: AcmSection::from(AcmConfig::disabled()),
            },
            ..Self::default()
        }
    }

    /// Get the default config directory
    pub fn default_config_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "floe", "floe")
            .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
    }

    /// Get the default config file path
    pub fn default_config_file() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub fn load_or_create_default() -> Result<Self> {
        let config_file = Self::default_config_file()?;

        if config_file.exists() {
            Self::load_from(&config_file)
        } else {
            let config = Config::default();
            config.save_to(&config_file)?;
            Ok(config)
        }
    }

    /// Load and validate a configuration file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).context("Failed to parse configuration file")?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_config_file()?)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure config directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content).context("Failed to write configuration file")?;

        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.message_size_max != 0 && self.message_size_max < crate::protocol::HEADER_SIZE {
            return Err(Error::Configuration(format!(
                "message_size_max must be 0 or at least {} bytes, got {}",
                crate::protocol::HEADER_SIZE,
                self.message_size_max
            )));
        }
        if self.retry_intervals.is_empty() {
            return Err(Error::Configuration(
                "retry_intervals needs at least one entry".to_string(),
            ));
        }
        if self.default_bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::Configuration(format!(
                "default_bind_addr `{}` is not a socket address",
                self.default_bind_addr
            )));
        }
        Ok(())
    }

    pub fn client_acm(&self) -> AcmConfig {
        self.acm.client.to_acm_config()
    }

    pub fn server_acm(&self) -> AcmConfig {
        self.acm.server.to_acm_config()
    }

    /// Endpoint timeout, `None` when disabled.
    pub fn endpoint_timeout(&self) -> Option<Duration> {
        millis(self.default_timeout)
    }

    pub fn connect_timeout_override(&self) -> Option<Option<Duration>> {
        self.connect_timeout.map(millis)
    }

    pub fn close_timeout_override(&self) -> Option<Option<Duration>> {
        self.close_timeout.map(millis)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_intervals
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

/// Negative values disable a timeout.
fn millis(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}
