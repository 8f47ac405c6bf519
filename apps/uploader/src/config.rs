//! Uploader configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/bucketlift/uploader.toml`
//! - Windows: `%APPDATA%/bucketlift/uploader.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use bucketlift_transfer::{DEFAULT_PART_SIZE, RetryPolicy, TransferConfig};
use serde::{Deserialize, Serialize};

/// Which object store transfers go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    S3,
    Local,
}

/// Uploader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Destination bucket (S3 store only).
    #[serde(default)]
    pub bucket: String,

    /// AWS region; falls back to the environment and the default chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default)]
    pub store: StoreKind,

    /// Root directory of the local store.
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,

    /// Part size in bytes.
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    #[serde(default = "default_max_concurrent_parts")]
    pub max_concurrent_parts: usize,

    /// Timeout for one part-upload attempt, in seconds.
    #[serde(default = "default_part_timeout_secs")]
    pub part_timeout_secs: u64,

    /// Attempts per part, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Write session checkpoints, enabling resume.
    #[serde(default = "default_checkpoints")]
    pub checkpoints: bool,

    /// Where session checkpoints go.
    #[serde(default = "default_checkpoint_dir", skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,

    /// How long the store keeps abandoned uploads, in hours.
    #[serde(default = "default_session_retention_hours")]
    pub session_retention_hours: u64,
}

fn default_local_root() -> PathBuf {
    data_dir().join("objects")
}

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

fn default_max_concurrent_parts() -> usize {
    4
}

fn default_part_timeout_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_checkpoints() -> bool {
    true
}

fn default_checkpoint_dir() -> Option<PathBuf> {
    Some(data_dir().join("sessions"))
}

fn default_session_retention_hours() -> u64 {
    7 * 24
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: None,
            store: StoreKind::default(),
            local_root: default_local_root(),
            part_size: default_part_size(),
            max_concurrent_parts: default_max_concurrent_parts(),
            part_timeout_secs: default_part_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            checkpoints: default_checkpoints(),
            checkpoint_dir: default_checkpoint_dir(),
            session_retention_hours: default_session_retention_hours(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or from the default location.
    ///
    /// A missing file at the default location is created with defaults;
    /// an explicitly given path must exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::load_from(path);
        }

        let path = config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Controller settings derived from this configuration.
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            part_size: self.part_size,
            max_concurrent_parts: self.max_concurrent_parts,
            part_timeout: Duration::from_secs(self.part_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                ..RetryPolicy::default()
            },
            checkpoint_dir: self.checkpoint_dir.clone().filter(|_| self.checkpoints),
            session_retention: Duration::from_secs(
                self.session_retention_hours.saturating_mul(3600),
            ),
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("bucketlift")
            .join("uploader.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("bucketlift").join("uploader.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/bucketlift/uploader.toml"))
    }
}

/// Returns the platform-specific data directory.
fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("LOCALAPPDATA")
            .unwrap_or_else(|_| "C:\\Users\\Default\\AppData\\Local".into());
        PathBuf::from(appdata).join("bucketlift")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("bucketlift")
    }
}
