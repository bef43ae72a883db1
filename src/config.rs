//! Configuration System using Figment
//!
//! Strongly-typed configuration for the retriever. Values are layered:
//! 1. Built-in defaults (115200 baud, 640x480 rasters, 1 MB payload ceiling, ...)
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `ESP_CAM_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use esp_cam_retriever::config::RetrieverConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // ESP_CAM_SERIAL__PORT=/dev/ttyUSB0 overrides serial.port
//! let config = RetrieverConfig::load(Some("retriever.toml".as_ref()))?;
//! config.validate()?;
//! println!("Port: {}", config.serial.port);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, RetrievalError};
use crate::protocol::ProtocolConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ESP_CAM_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrieverConfig {
    /// Logging settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial link settings
    #[serde(default)]
    pub serial: SerialConfig,
    /// Wire protocol constants, limits and timeouts
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Raster geometry and file format
    #[serde(default)]
    pub image: ImageConfig,
    /// Where sessions are written
    #[serde(default)]
    pub output: OutputConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored (development)
    #[default]
    Pretty,
    /// Single-line, no colors
    Compact,
    /// One JSON object per event
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Serial port configuration (always 8N1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port path (e.g. "/dev/ttyUSB0", "COM3")
    #[serde(default = "default_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Transport-level read/write timeout in milliseconds
    #[serde(default = "default_serial_timeout")]
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_serial_timeout(),
        }
    }
}

impl SerialConfig {
    /// Transport timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Raster configuration for image-typed responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Raster width in pixels
    #[serde(default = "default_width")]
    pub width: u32,
    /// Raster height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
    /// File extension, which also selects the encoder ("jpg", "png")
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Reject image payloads whose length is not `width * height`
    #[serde(default = "default_enforce_dimensions")]
    pub enforce_dimensions: bool,
    /// Number of image indices retrieved per run
    #[serde(default = "default_count")]
    pub count: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            extension: default_extension(),
            enforce_dimensions: default_enforce_dimensions(),
            count: default_count(),
        }
    }
}

impl ImageConfig {
    /// Bytes in one 8-bit raster.
    pub fn raster_len(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Output location configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Parent directory for session directories
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Session directory prefix; a `_YYYYmmdd_HHMMSS` timestamp is appended
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            session_prefix: default_session_prefix(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_serial_timeout() -> u64 {
    1000
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_extension() -> String {
    "jpg".to_string()
}

fn default_enforce_dimensions() -> bool {
    true
}

fn default_count() -> usize {
    20
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_session_prefix() -> String {
    "captured_images".to_string()
}

impl RetrieverConfig {
    /// Load defaults, then `path` (if given), then `ESP_CAM_*` environment variables.
    ///
    /// Example: `ESP_CAM_PROTOCOL__TRANSFER_TIMEOUT_MS=8000`
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        Self::figment(path).extract().map_err(RetrievalError::from)
    }

    /// The layered provider stack used by [`load`](Self::load).
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(RetrieverConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(RetrievalError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.serial.port.is_empty() {
            return Err(RetrievalError::Configuration(
                "serial.port must not be empty".into(),
            ));
        }

        if self.image.width == 0 || self.image.height == 0 {
            return Err(RetrievalError::Configuration(format!(
                "Invalid raster {}x{}: dimensions must be nonzero",
                self.image.width, self.image.height
            )));
        }

        if self.image.enforce_dimensions
            && self.image.raster_len() > self.protocol.max_payload as usize
        {
            return Err(RetrievalError::Configuration(format!(
                "Raster of {} bytes exceeds protocol.max_payload {}",
                self.image.raster_len(),
                self.protocol.max_payload
            )));
        }

        let valid_extensions = ["jpg", "jpeg", "png"];
        if !valid_extensions.contains(&self.image.extension.to_lowercase().as_str()) {
            return Err(RetrievalError::Configuration(format!(
                "Invalid image extension '{}'. Must be one of: {}",
                self.image.extension,
                valid_extensions.join(", ")
            )));
        }

        if self.image.count > 256 {
            return Err(RetrievalError::Configuration(format!(
                "image.count {} exceeds the 8-bit index range",
                self.image.count
            )));
        }

        if self.protocol.chunk_size == 0 {
            return Err(RetrievalError::Configuration(
                "protocol.chunk_size must be positive".into(),
            ));
        }

        if self.protocol.header == self.protocol.footer {
            return Err(RetrievalError::Configuration(format!(
                "protocol.header and protocol.footer are both 0x{:04X}",
                self.protocol.header
            )));
        }

        if !self.protocol.opcodes.are_distinct() {
            return Err(RetrievalError::Configuration(
                "protocol.opcodes must be distinct".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_match_wire_protocol() {
        let config = RetrieverConfig::default();
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.serial.timeout_ms, 1000);
        assert_eq!(config.protocol.header, 0xAA55);
        assert_eq!(config.protocol.footer, 0x55AA);
        assert_eq!(config.protocol.max_payload, 1_000_000);
        assert_eq!(config.protocol.transfer_timeout_ms, 5000);
        assert_eq!(config.image.raster_len(), 307_200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "retriever.toml",
                r#"
                [serial]
                port = "/dev/tty.usbserial-110"

                [image]
                width = 160
                height = 120
                count = 5

                [protocol]
                transfer_timeout_ms = 8000
                "#,
            )?;
            jail.set_env("ESP_CAM_SERIAL__BAUD_RATE", "57600");

            let config =
                RetrieverConfig::load(Some(Path::new("retriever.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.serial.port, "/dev/tty.usbserial-110");
            assert_eq!(config.serial.baud_rate, 57_600);
            assert_eq!(config.image.raster_len(), 160 * 120);
            assert_eq!(config.image.count, 5);
            assert_eq!(config.protocol.transfer_timeout_ms, 8000);
            // Untouched fields keep their defaults
            assert_eq!(config.protocol.max_payload, 1_000_000);
            assert_eq!(config.output.session_prefix, "captured_images");
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_jail| {
            let config = RetrieverConfig::load(Some(Path::new("absent.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config, RetrieverConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_config_validation() {
        let mut config = RetrieverConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = RetrieverConfig::default();
        config.image.width = 0;
        assert!(config.validate().is_err());

        let mut config = RetrieverConfig::default();
        config.image.width = 2000;
        config.image.height = 2000;
        assert!(config.validate().is_err());

        let mut config = RetrieverConfig::default();
        config.image.extension = "bmp".into();
        assert!(config.validate().is_err());

        let mut config = RetrieverConfig::default();
        config.protocol.footer = config.protocol.header;
        assert!(config.validate().is_err());

        let mut config = RetrieverConfig::default();
        config.protocol.opcodes.get_performance = 0x01;
        assert!(config.validate().is_err());

        let mut config = RetrieverConfig::default();
        config.image.count = 300;
        assert!(config.validate().is_err());
    }
}
