use super::ConfigError;
use crate::shared::fs_atomic::atomic_write_file;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_QUEUE_CAPACITY: usize = 32;
pub const DEFAULT_API_CONCURRENCY: usize = 10;
pub const DEFAULT_MAX_FRAME_BYTES: usize = u32::MAX as usize >> 1;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// Service-wide settings, read from `config.yaml` in the state root.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default = "default_listen_host")]
    pub listen_host: IpAddr,
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_api_concurrency")]
    pub api_concurrency: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_listen_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_api_concurrency() -> usize {
    DEFAULT_API_CONCURRENCY
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            port: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            api_concurrency: DEFAULT_API_CONCURRENCY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            log_level: default_log_level(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let encoded = serde_yaml::to_string(self).map_err(|source| ConfigError::Encode {
            path: path.display().to_string(),
            source,
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }
        atomic_write_file(path, encoded.as_bytes()).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Settings(
                "`queue_capacity` must be greater than zero".to_string(),
            ));
        }
        if self.api_concurrency == 0 {
            return Err(ConfigError::Settings(
                "`api_concurrency` must be greater than zero".to_string(),
            ));
        }
        if self.max_frame_bytes == 0 || self.max_frame_bytes > u32::MAX as usize {
            return Err(ConfigError::Settings(format!(
                "`max_frame_bytes` must be between 1 and {}",
                u32::MAX
            )));
        }
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`log_level` must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms.max(1))
    }
}
