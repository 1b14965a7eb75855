//! TOML configuration for a Kurome peer.
//!
//! Every field has a default, so a missing file or a file from an older
//! release still yields a usable configuration:
//!
//! ```toml
//! device_name = "workstation"
//! service_port = 33587
//! discovery_port = 33586
//! shared_root = "/home/me/Shared"
//! ```

use crate::device::Platform;
use crate::error::{KuromeError, Result};
use crate::message;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CONFIG_FILE: &str = "config.toml";

/// Upper bound for `max_read_length`; keeps every frame well under the
/// 4 GiB the length prefix can express.
pub const MAX_READ_LENGTH_LIMIT: u64 = 512 * 1024 * 1024;
const APP_DIR: &str = "kurome";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KuromeConfig {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "Platform::current")]
    pub platform: Platform,
    /// TCP port of the TLS service.
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    /// UDP port for announcements.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_announce_interval_secs")]
    pub announce_interval_secs: u64,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Tag sent in announcements, e.g. `"desktop"` or `"phone"`.
    #[serde(default = "default_role")]
    pub role: String,
    /// Directory served to paired peers.
    #[serde(default = "default_shared_root")]
    pub shared_root: PathBuf,
    /// Identity and saved devices live here.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    #[serde(default = "default_pair_timeout_secs")]
    pub pair_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_read_length")]
    pub max_read_length: u64,
    /// `tracing` filter directive, e.g. `"info"` or `"kurome_core=trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_device_name() -> String {
    whoami::devicename()
}
fn default_service_port() -> u16 {
    33587
}
fn default_discovery_port() -> u16 {
    33586
}
fn default_announce_interval_secs() -> u64 {
    5
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_role() -> String {
    "desktop".to_string()
}
fn default_shared_root() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}
fn default_storage_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".kurome"))
}
fn default_pair_timeout_secs() -> u64 {
    30
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_max_read_length() -> u64 {
    crate::dispatcher::DEFAULT_MAX_READ_LENGTH
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for KuromeConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            platform: Platform::current(),
            service_port: default_service_port(),
            discovery_port: default_discovery_port(),
            announce_interval_secs: default_announce_interval_secs(),
            bind_address: default_bind_address(),
            role: default_role(),
            shared_root: default_shared_root(),
            storage_dir: default_storage_dir(),
            pair_timeout_secs: default_pair_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_read_length: default_max_read_length(),
            log_level: default_log_level(),
        }
    }
}

impl KuromeConfig {
    /// Reads `path`, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(KuromeError::Io)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| KuromeError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        default_storage_dir().join(CONFIG_FILE)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(KuromeError::Io)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| KuromeError::Config(e.to_string()))?;
        std::fs::write(path, text).map_err(KuromeError::Io)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_port == self.discovery_port {
            return Err(KuromeError::Config(format!(
                "service_port and discovery_port must differ (both {})",
                self.service_port
            )));
        }
        if self.announce_interval_secs == 0 {
            return Err(KuromeError::Config(
                "announce_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.max_read_length == 0 || self.max_read_length > MAX_READ_LENGTH_LIMIT {
            return Err(KuromeError::Config(format!(
                "max_read_length must be between 1 and {}",
                MAX_READ_LENGTH_LIMIT
            )));
        }
        if self.role.is_empty() || self.role.contains(':') {
            return Err(KuromeError::Config(format!("Invalid role {:?}", self.role)));
        }
        Ok(())
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn pair_timeout(&self) -> Duration {
        Duration::from_secs(self.pair_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Largest inbound frame a link accepts: one full read response.
    pub fn max_frame_len(&self) -> usize {
        let data = self.max_read_length.min(MAX_READ_LENGTH_LIMIT) as usize;
        message::max_encoded_len(data)
    }
}
