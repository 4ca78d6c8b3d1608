//! Configuration loading.
//!
//! Plain JSON with serde defaults for every section, so an empty or missing
//! file yields a fully working local-dev configuration.
//!
//! # Path resolution
//!
//! `WATCHDESK_CONFIG_PATH` > `WATCHDESK_STATE_DIR/watchdesk.json` >
//! `~/.watchdesk/watchdesk.json`.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::stream::StreamConfig;
use crate::transport::backoff::ReconnectPolicy;
use crate::transport::TransportConfig;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: String, message: String },
}

/// Get the config file path (see module docs for priority).
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("WATCHDESK_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    state_dir().join("watchdesk.json")
}

/// State directory: `WATCHDESK_STATE_DIR` > `~/.watchdesk`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = env::var("WATCHDESK_STATE_DIR") {
        return PathBuf::from(dir);
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".watchdesk")
}

/// Backend endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket base, e.g. `ws://host:8000/ws`.
    pub ws_base_url: String,
    /// REST base, e.g. `http://host:8000/api/v1`.
    pub api_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://127.0.0.1:8000/ws".to_string(),
            api_base_url: "http://127.0.0.1:8000/api/v1".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn alert_feed_url(&self) -> String {
        format!("{}/alerts", self.ws_base_url.trim_end_matches('/'))
    }

    pub fn detection_base_url(&self) -> String {
        format!("{}/detection", self.ws_base_url.trim_end_matches('/'))
    }
}

/// Alert feed transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub heartbeat_secs: u64,
    pub reconnect_delays_secs: Vec<u64>,
    pub max_reconnect_attempts: u32,
    pub outbound_queue_cap: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: 25,
            reconnect_delays_secs: vec![1, 2, 4, 8, 16, 30],
            max_reconnect_attempts: 10,
            outbound_queue_cap: 50,
        }
    }
}

impl TransportSettings {
    pub fn to_transport_config(&self, url: String) -> TransportConfig {
        TransportConfig {
            url,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            reconnect: ReconnectPolicy::new(
                self.reconnect_delays_secs
                    .iter()
                    .map(|s| Duration::from_secs(*s))
                    .collect(),
                self.max_reconnect_attempts,
            ),
            outbound_queue_cap: self.outbound_queue_cap,
        }
    }
}

/// Detection stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub simulated_prefixes: Vec<String>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            simulated_prefixes: vec!["demo-".to_string(), "sim-".to_string()],
        }
    }
}

impl StreamSettings {
    pub fn to_stream_config(&self, base_url: String) -> StreamConfig {
        StreamConfig {
            base_url,
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            simulated_prefixes: self.simulated_prefixes.clone(),
        }
    }
}

/// Alert queue / presenter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub max_queue_size: usize,
    pub dedup_cache_cap: usize,
    pub dedup_sweep_secs: u64,
    /// Zero disables auto-close.
    pub auto_close_secs: u64,
    pub settle_ms: u64,
    pub flash_secs: u64,
    pub flash_enabled: bool,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 10,
            dedup_cache_cap: 100,
            dedup_sweep_secs: 300,
            auto_close_secs: 0,
            settle_ms: 300,
            flash_secs: 3,
            flash_enabled: true,
        }
    }
}

impl AlertSettings {
    pub fn to_presenter_config(&self) -> crate::alerts::PresenterConfig {
        crate::alerts::PresenterConfig {
            auto_close: Duration::from_secs(self.auto_close_secs),
            settle_delay: Duration::from_millis(self.settle_ms),
            flash_duration: Duration::from_secs(self.flash_secs),
            flash_enabled: self.flash_enabled,
            max_queue_size: self.max_queue_size,
            dedup_cap: self.dedup_cache_cap,
            dedup_sweep_interval: Duration::from_secs(self.dedup_sweep_secs),
        }
    }
}

/// Sound settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundSettings {
    /// Directory of alarm audio assets; none means synthesized tones only.
    pub asset_dir: Option<PathBuf>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdeskConfig {
    pub server: ServerConfig,
    pub transport: TransportSettings,
    pub stream: StreamSettings,
    pub alerts: AlertSettings,
    pub sound: SoundSettings,
}

/// Load configuration from the resolved path; a missing file yields
/// defaults.
pub fn load_config() -> Result<WatchdeskConfig, ConfigError> {
    load_config_from(get_config_path())
}

/// Load configuration from an explicit path.
pub fn load_config_from(path: PathBuf) -> Result<WatchdeskConfig, ConfigError> {
    if !path.exists() {
        info!(target: "config", path = %path.display(), "no config file, using defaults");
        return Ok(WatchdeskConfig::default());
    }
    let raw = fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
