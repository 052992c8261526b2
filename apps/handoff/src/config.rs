//! Configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/handoff/handoff.toml`
//! - Windows: `%APPDATA%/handoff/handoff.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use handoff_cache::CacheConfig;
use handoff_protocol::Credentials;
use handoff_transfer::{ReceiverConfig, RetryPolicy, SenderConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub receiver: ReceiverSection,
    #[serde(default)]
    pub sender: SenderSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub cache: CacheSection,
}

/// `[receiver]`: the `serve` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverSection {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Directory for partial transfers.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Directory completed transfers are moved into.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Only accept uploads to this request path (any path when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Idle timeout for socket reads, in seconds.
    #[serde(default = "default_io_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Largest accepted chunk, in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

/// `[sender]`: the `send` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderSection {
    /// Receiver address as `host:port`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_content_type")]
    pub content_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_charset: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Chunk size in bytes; 0 sends a raw body with `Content-Length`.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default)]
    pub compress: bool,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
}

/// `[retry]`: sender retry budget and backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// First backoff delay, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Backoff multiplier; values <= 0 keep the delay constant.
    #[serde(default = "default_factor")]
    pub factor: f64,
}

/// `[cache]`: parked sender cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_threshold")]
    pub threshold: f64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}

fn default_cache_dir() -> PathBuf {
    ReceiverConfig::default().cache_dir
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("received")
}

fn default_io_timeout_secs() -> u64 {
    handoff_transfer::DEFAULT_IO_TIMEOUT.as_secs()
}

fn default_connect_timeout_secs() -> u64 {
    handoff_transfer::DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_max_chunk_size() -> usize {
    handoff_protocol::MAX_CHUNK_SIZE
}

fn default_endpoint() -> String {
    "127.0.0.1:8080".into()
}

fn default_path() -> String {
    "/".into()
}

fn default_content_type() -> String {
    "application/octet-stream".into()
}

fn default_chunk_size() -> usize {
    handoff_transfer::DEFAULT_CHUNK_SIZE
}

fn default_retries() -> u32 {
    RetryPolicy::default().retries
}

fn default_interval_ms() -> u64 {
    RetryPolicy::default().interval.as_millis() as u64
}

fn default_factor() -> f64 {
    RetryPolicy::default().factor
}

fn default_capacity() -> usize {
    CacheConfig::default().capacity
}

fn default_threshold() -> f64 {
    CacheConfig::default().threshold
}

fn default_sweep_interval_secs() -> u64 {
    CacheConfig::default().sweep_interval.as_secs()
}

impl Default for ReceiverSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cache_dir: default_cache_dir(),
            output_dir: default_output_dir(),
            path: None,
            username: None,
            password: None,
            read_timeout_secs: default_io_timeout_secs(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

impl Default for SenderSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            path: default_path(),
            content_type: default_content_type(),
            accept_charset: None,
            username: None,
            password: None,
            chunk_size: default_chunk_size(),
            compress: false,
            connect_timeout_secs: default_connect_timeout_secs(),
            io_timeout_secs: default_io_timeout_secs(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            interval_ms: default_interval_ms(),
            factor: default_factor(),
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            threshold: default_threshold(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl ReceiverSection {
    pub fn to_receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            cache_dir: self.cache_dir.clone(),
            path: self.path.clone().filter(|p| !p.is_empty()),
            credentials: credentials(&self.username, &self.password),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_chunk_size: self.max_chunk_size,
            ..ReceiverConfig::default()
        }
    }
}

impl SenderSection {
    pub fn to_sender_config(&self, unique_id: impl Into<String>) -> SenderConfig {
        SenderConfig {
            path: self.path.clone(),
            content_type: self.content_type.clone(),
            accept_charset: self.accept_charset.clone(),
            credentials: credentials(&self.username, &self.password),
            chunk_size: (self.chunk_size > 0).then_some(self.chunk_size),
            compress: self.compress,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            ..SenderConfig::new(self.endpoint.clone(), unique_id)
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            interval: Duration::from_millis(self.interval_ms),
            factor: self.factor,
        }
    }
}

impl CacheSection {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.capacity,
            threshold: self.threshold,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}

fn credentials(username: &Option<String>, password: &Option<String>) -> Option<Credentials> {
    let username = username.as_deref()?;
    Some(Credentials::new(
        username,
        password.as_deref().unwrap_or_default(),
    ))
}

impl Config {
    /// Loads configuration from `path` (or the platform default), writing
    /// defaults there if the file does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // May hold basic-auth passwords.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("handoff")
            .join("handoff.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("handoff").join("handoff.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/handoff/handoff.toml"))
    }
}
