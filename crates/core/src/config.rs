//! Repository configuration file parsing (.hubsync.toml)

use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Config file name, looked up in the repository root
pub const CONFIG_FILE: &str = ".hubsync.toml";

/// Sync tuning shared by the hub and the client
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bytes per upload/download chunk
    pub chunk_size: u64,
    /// How long to wait for a response before giving up
    pub request_timeout_secs: u64,
    /// Watch debounce delay in milliseconds
    pub debounce_ms: u64,
    /// Extra glob patterns excluded from scans
    pub ignore: Vec<String>,
    /// Dial/reconcile retry policy
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            request_timeout_secs: 30,
            debounce_ms: 100,
            ignore: Vec::new(),
            retry: RetryConfig::default(),
        }
    }
}

/// Exponential backoff settings
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            max_attempts: 8,
        }
    }
}

impl SyncConfig {
    /// Load config from the repository root
    ///
    /// Returns the default config if .hubsync.toml doesn't exist.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            Self::from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from an explicit file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| SyncError::Protocol(format!("{}: {e}", path.display())))?;
        if config.chunk_size == 0 {
            config.chunk_size = Self::default().chunk_size;
        }
        Ok(config)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
