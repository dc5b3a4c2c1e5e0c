use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(&'static str),
}

fn default_service_port() -> u16 {
    8000
}

fn default_capacity() -> u32 {
    40
}

fn default_max_image_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_model_path() -> String {
    "yolov5xu.onnx".to_string()
}

fn default_confidence_threshold() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_report_url() -> String {
    "https://bus-api-ihcu.onrender.com/api/occupancy".to_string()
}

fn default_warning_url() -> String {
    "https://warning-api.onrender.com/api/alert".to_string()
}

fn default_alert_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_port")]
    pub port: u16,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_report_url")]
    pub report_url: String,
    #[serde(default = "default_warning_url")]
    pub warning_url: String,
    #[serde(default = "default_alert_timeout")]
    pub alert_timeout_secs: u64,
}

impl ServiceConfig {
    pub fn alert_timeout(&self) -> Duration {
        Duration::from_secs(self.alert_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: default_service_port(),
            capacity: default_capacity(),
            max_image_bytes: default_max_image_bytes(),
            model_path: default_model_path(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
            report_url: default_report_url(),
            warning_url: default_warning_url(),
            alert_timeout_secs: default_alert_timeout(),
        }
    }
}

fn default_camera_id() -> String {
    "bus-1".to_string()
}

fn default_device() -> String {
    "/dev/video0".to_string()
}

fn default_frame_width() -> u32 {
    640
}

fn default_frame_height() -> u32 {
    480
}

fn default_detect_url() -> String {
    "http://192.168.137.1:8000".to_string()
}

fn default_capture_interval() -> u64 {
    5
}

fn default_upload_timeout() -> u64 {
    10
}

fn default_init_attempts() -> u32 {
    5
}

fn default_init_backoff() -> u64 {
    2
}

fn default_warmup() -> u64 {
    2
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_location_interval() -> u64 {
    60
}

fn default_location_url() -> String {
    "https://ipinfo.io/json".to_string()
}

fn default_stream_port() -> u16 {
    8001
}

fn default_stream_fps() -> u32 {
    10
}

fn default_display_columns() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_camera_id")]
    pub camera_id: String,
    /// Capacity shown until the first detection reply arrives.
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    #[serde(default = "default_frame_height")]
    pub frame_height: u32,
    /// Base address of the detection service, without the `/detect` path.
    #[serde(default = "default_detect_url")]
    pub detect_url: String,
    #[serde(default = "default_capture_interval")]
    pub capture_interval_secs: u64,
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
    #[serde(default = "default_init_attempts")]
    pub init_attempts: u32,
    #[serde(default = "default_init_backoff")]
    pub init_backoff_secs: u64,
    #[serde(default = "default_warmup")]
    pub warmup_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_location_interval")]
    pub location_interval_secs: u64,
    #[serde(default = "default_location_url")]
    pub location_url: String,
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    #[serde(default = "default_stream_fps")]
    pub stream_fps: u32,
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    #[serde(default = "default_display_columns")]
    pub display_columns: usize,
}

impl AgentConfig {
    pub fn capture_interval(&self) -> Duration {
        Duration::from_secs(self.capture_interval_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn init_backoff(&self) -> Duration {
        Duration::from_secs(self.init_backoff_secs)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn location_interval(&self) -> Duration {
        Duration::from_secs(self.location_interval_secs)
    }

    /// Snapshots older than two capture periods are shown as stale.
    pub fn stale_after(&self) -> Duration {
        self.capture_interval() * 2
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            camera_id: default_camera_id(),
            capacity: default_capacity(),
            device: default_device(),
            frame_width: default_frame_width(),
            frame_height: default_frame_height(),
            detect_url: default_detect_url(),
            capture_interval_secs: default_capture_interval(),
            upload_timeout_secs: default_upload_timeout(),
            init_attempts: default_init_attempts(),
            init_backoff_secs: default_init_backoff(),
            warmup_secs: default_warmup(),
            health_interval_secs: default_health_interval(),
            health_timeout_secs: default_health_timeout(),
            location_interval_secs: default_location_interval(),
            location_url: default_location_url(),
            stream_port: default_stream_port(),
            stream_fps: default_stream_fps(),
            archive_dir: None,
            display_columns: default_display_columns(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.service.capacity == 0 || self.agent.capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be greater than zero"));
        }
        if self.service.max_image_bytes == 0 {
            return Err(ConfigError::Invalid("service.max_image_bytes must be greater than zero"));
        }
        if self.agent.init_attempts == 0 {
            return Err(ConfigError::Invalid("agent.init_attempts must be at least 1"));
        }
        if self.agent.capture_interval_secs == 0
            || self.agent.health_interval_secs == 0
            || self.agent.location_interval_secs == 0
        {
            return Err(ConfigError::Invalid("agent loop periods must be non-zero"));
        }
        if self.agent.stream_fps == 0 {
            return Err(ConfigError::Invalid("agent.stream_fps must be non-zero"));
        }
        Ok(())
    }
}
