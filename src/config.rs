use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::hls::TranscodeSettings;
use crate::state::is_valid_uid;

pub const CONFIG_PATH_ENV: &str = "CAMERA_BRIDGE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Rejection text the device sends when too many app connections are open
pub const DEFAULT_CONNECTION_LIMIT_MESSAGE: &str =
    "Forbidden: Number of Mobile App connections above limit, declining connection";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Key used by every registry, the RTMP path and the HLS directory
    pub uid: String,
    /// Identifier substituted into the WebSocket URL
    pub camera_uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// `{camera_uid}` is replaced per device
    pub url_template: String,
    pub auth_token: String,
    pub keepalive_interval_secs: u64,
    pub reconnect_min_secs: u64,
    pub reconnect_max_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url_template: "wss://api.nanit.com/focus/cameras/{camera_uid}/user_connect".to_string(),
            auth_token: String::new(),
            keepalive_interval_secs: 20,
            reconnect_min_secs: 5,
            reconnect_max_secs: 300,
        }
    }
}

impl WebSocketConfig {
    pub fn url_for(&self, camera_uid: &str) -> String {
        self.url_template.replace("{camera_uid}", camera_uid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmpConfig {
    pub enabled: bool,
    pub listen_addr: String,
    /// Address the device is told to publish to, `host:port`
    pub public_addr: String,
    /// Request streaming and start HLS as soon as a device connects
    pub auto_start: bool,
    pub subscriber_queue: usize,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:1935".to_string(),
            public_addr: "127.0.0.1:1935".to_string(),
            auto_start: true,
            subscriber_queue: crate::broadcast::DEFAULT_SUBSCRIBER_QUEUE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub request_timeout_secs: u64,
    pub retry_interval_secs: u64,
    /// Delay between asking for the stream and starting HLS on it
    pub hls_start_delay_secs: u64,
    pub connection_limit_message: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            retry_interval_secs: 60,
            hls_start_delay_secs: 3,
            connection_limit_message: DEFAULT_CONNECTION_LIMIT_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub enabled: bool,
    /// Relative paths resolve against `data_dir`
    pub base_dir: String,
    pub ffmpeg_path: String,
    pub segment_seconds: u32,
    pub playlist_size: u32,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub max_retry_delay_secs: u64,
    pub fresh_window_secs: u64,
    pub poll_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub orphan_max_age_secs: u64,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: "hls".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            segment_seconds: 2,
            playlist_size: 5,
            max_retries: 5,
            retry_delay_secs: 10,
            max_retry_delay_secs: 60,
            fresh_window_secs: 10,
            poll_interval_secs: 5,
            cleanup_interval_secs: 30 * 60,
            orphan_max_age_secs: 60 * 60,
        }
    }
}

impl HlsConfig {
    pub fn transcode_settings(&self) -> TranscodeSettings {
        TranscodeSettings {
            program: self.ffmpeg_path.clone(),
            segment_seconds: self.segment_seconds,
            playlist_size: self.playlist_size,
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            max_retry_delay: Duration::from_secs(self.max_retry_delay_secs),
            fresh_window: Duration::from_secs(self.fresh_window_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { enabled: true, port: 8080 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub data_dir: String,
    pub devices: Vec<DeviceConfig>,
    pub websocket: WebSocketConfig,
    pub rtmp: RtmpConfig,
    pub streaming: StreamingConfig,
    pub hls: HlsConfig,
    pub http: HttpConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: "data".to_string(),
            devices: Vec::new(),
            websocket: WebSocketConfig::default(),
            rtmp: RtmpConfig::default(),
            streaming: StreamingConfig::default(),
            hls: HlsConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `CAMERA_BRIDGE_CONFIG` (default `config.json`), apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Missing file falls back to defaults; a malformed one is an error.
    pub fn from_file(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(config_str) => serde_json::from_str(&config_str)
                .with_context(|| format!("invalid config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Runs before telemetry is up
                eprintln!("⚠️ {} not found, using default configuration", path.display());
                Ok(AppConfig::default())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(level) = lookup("CAMERA_BRIDGE_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(dir) = lookup("CAMERA_BRIDGE_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Some(token) = lookup("CAMERA_BRIDGE_AUTH_TOKEN") {
            self.websocket.auth_token = token;
        }
        if let Some(addr) = lookup("CAMERA_BRIDGE_RTMP_ADDR") {
            // Public address; the listener keeps its host but follows the port
            let port = addr
                .rsplit_once(':')
                .map(|(_, port)| port.to_string())
                .context("CAMERA_BRIDGE_RTMP_ADDR must be host:port")?;
            let host = self
                .rtmp
                .listen_addr
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.rtmp.listen_addr = format!("{}:{}", host, port);
            self.rtmp.public_addr = addr;
        }
        if let Some(port) = lookup("CAMERA_BRIDGE_HTTP_PORT") {
            self.http.port = port
                .parse()
                .with_context(|| format!("invalid CAMERA_BRIDGE_HTTP_PORT '{}'", port))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for device in &self.devices {
            if !is_valid_uid(&device.uid) {
                bail!(
                    "invalid device uid '{}': only lowercase letters, numbers, underscore and hyphen allowed",
                    device.uid
                );
            }
        }
        if self.rtmp.enabled {
            self.rtmp_listen_addr()?;
        }
        Ok(())
    }

    pub fn rtmp_listen_addr(&self) -> Result<SocketAddr> {
        self.rtmp
            .listen_addr
            .parse()
            .with_context(|| format!("invalid rtmp listen address '{}'", self.rtmp.listen_addr))
    }

    pub fn hls_dir(&self) -> PathBuf {
        let base = PathBuf::from(&self.hls.base_dir);
        if base.is_absolute() {
            base
        } else {
            PathBuf::from(&self.data_dir).join(base)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.streaming.request_timeout_secs)
    }
}
