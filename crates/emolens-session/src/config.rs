use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Client configuration.
///
/// Loaded from an optional TOML file named by `EMOLENS_CONFIG`, then
/// overridden by `EMOLENS_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base URL of the detection/analytics backend.
    pub api_url: String,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Still image served in place of a camera, when set.
    pub camera_image: Option<PathBuf>,
    /// Real-time capture cadence in milliseconds.
    pub capture_interval_ms: u64,
    /// Analytics polling cadence in milliseconds.
    pub analytics_interval_ms: u64,
    /// Timeout in seconds for each backend request.
    pub request_timeout_secs: u64,
    /// JPEG quality (1–100) for live captures.
    pub jpeg_quality: u8,
    /// Ideal camera capture width.
    pub capture_width: u32,
    /// Ideal camera capture height.
    pub capture_height: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000".to_string(),
            camera_device: "/dev/video0".to_string(),
            camera_image: None,
            capture_interval_ms: 5000,
            analytics_interval_ms: 5000,
            request_timeout_secs: 10,
            jpeg_quality: 80,
            capture_width: 640,
            capture_height: 480,
        }
    }
}

impl Config {
    /// Load the config file named by `EMOLENS_CONFIG` (if any), then apply
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("EMOLENS_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        Ok(base.with_overrides(|key| std::env::var(key).ok()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from `lookup`, ignoring values that fail to parse.
    pub fn with_overrides(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            api_url: lookup("EMOLENS_API_URL").unwrap_or(self.api_url),
            camera_device: lookup("EMOLENS_CAMERA_DEVICE").unwrap_or(self.camera_device),
            camera_image: lookup("EMOLENS_CAMERA_IMAGE")
                .map(PathBuf::from)
                .or(self.camera_image),
            capture_interval_ms: parse_or(lookup("EMOLENS_CAPTURE_INTERVAL_MS"), self.capture_interval_ms),
            analytics_interval_ms: parse_or(
                lookup("EMOLENS_ANALYTICS_INTERVAL_MS"),
                self.analytics_interval_ms,
            ),
            request_timeout_secs: parse_or(lookup("EMOLENS_REQUEST_TIMEOUT_SECS"), self.request_timeout_secs),
            jpeg_quality: parse_or(lookup("EMOLENS_JPEG_QUALITY"), self.jpeg_quality),
            capture_width: parse_or(lookup("EMOLENS_CAPTURE_WIDTH"), self.capture_width),
            capture_height: parse_or(lookup("EMOLENS_CAPTURE_HEIGHT"), self.capture_height),
        }
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    pub fn analytics_interval(&self) -> Duration {
        Duration::from_millis(self.analytics_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
