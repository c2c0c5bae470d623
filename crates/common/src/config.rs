//! Transport configuration management
//!
//! Every section and field is defaulted individually, so a configuration
//! file only needs to mention the values it overrides:
//!
//! ```toml
//! [bulk]
//! send_zero_packet = true
//!
//! [hid]
//! read_timeout_ms = 500
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest bulk chunk submitted in one transfer (1 MiB)
pub const DEFAULT_MAX_TRANSFER_SIZE: usize = 0x10_0000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub hid: HidSettings,
    #[serde(default)]
    pub bulk: BulkSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "GeneralSettings::default_log_level")]
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl GeneralSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Settings shared by every USB transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Synchronous transfer timeout in milliseconds
    #[serde(default = "UsbSettings::default_timeout")]
    pub timeout_ms: u64,
    /// How long close/free_multi wait for a cancelled transfer to resolve
    #[serde(default = "UsbSettings::default_cancel_timeout")]
    pub cancel_timeout_ms: u64,
    /// Interface number claimed on open
    #[serde(default)]
    pub interface: u8,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout(),
            cancel_timeout_ms: Self::default_cancel_timeout(),
            interface: 0,
        }
    }
}

impl UsbSettings {
    fn default_timeout() -> u64 {
        2000
    }

    fn default_cancel_timeout() -> u64 {
        1000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}

/// HID report framing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HidSettings {
    #[serde(default = "HidSettings::default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Interrupt OUT endpoint used instead of SET_REPORT on the default pipe
    #[serde(default)]
    pub out_endpoint: Option<u8>,
    /// Fixed report size; learned from the interrupt IN endpoint when unset
    #[serde(default)]
    pub report_size: Option<usize>,
    /// Zero-pad short reports up to the report size
    #[serde(default = "HidSettings::default_pad_reports")]
    pub pad_reports: bool,
}

impl Default for HidSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: Self::default_read_timeout(),
            out_endpoint: None,
            report_size: None,
            pad_reports: Self::default_pad_reports(),
        }
    }
}

impl HidSettings {
    fn default_read_timeout() -> u64 {
        1000
    }

    fn default_pad_reports() -> bool {
        true
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSettings {
    /// Largest chunk handed to a single bulk OUT transfer
    #[serde(default = "BulkSettings::default_max_transfer_size")]
    pub max_transfer_size: usize,
    /// Terminate transfers that end on a packet boundary with a zero-length packet
    #[serde(default)]
    pub send_zero_packet: bool,
    #[serde(default = "BulkSettings::default_timeout")]
    pub timeout_ms: u64,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            max_transfer_size: Self::default_max_transfer_size(),
            send_zero_packet: false,
            timeout_ms: Self::default_timeout(),
        }
    }
}

impl BulkSettings {
    fn default_max_transfer_size() -> usize {
        DEFAULT_MAX_TRANSFER_SIZE
    }

    fn default_timeout() -> u64 {
        2000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Multi-request pipeline depth and request size
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "PipelineSettings::default_request_size")]
    pub request_size: usize,
    #[serde(default = "PipelineSettings::default_request_count")]
    pub request_count: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            request_size: Self::default_request_size(),
            request_count: Self::default_request_count(),
        }
    }
}

impl PipelineSettings {
    fn default_request_size() -> usize {
        0x1_0000
    }

    fn default_request_count() -> usize {
        4
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Upper bound on one event-processing wait
    #[serde(default = "DispatcherSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval(),
        }
    }
}

impl DispatcherSettings {
    fn default_poll_interval() -> u64 {
        100
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl TransportConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path, the first existing standard location is used.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => {
                let candidates = vec![
                    Self::default_path(),
                    PathBuf::from("/etc/usb-trans/transport.toml"),
                ];

                candidates
                    .into_iter()
                    .find(|p| p.exists())
                    .ok_or_else(|| Error::Config("No configuration file found".to_string()))?
            }
        };

        let content = fs::read_to_string(&config_path)?;
        let config: TransportConfig = toml::from_str(&content)?;
        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(path: Option<PathBuf>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-trans").join("transport.toml")
        } else {
            PathBuf::from(".config/usb-trans/transport.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(Error::Config(format!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.bulk.max_transfer_size == 0 {
            return Err(Error::Config(
                "bulk.max_transfer_size must be greater than 0".to_string(),
            ));
        }

        if self.hid.report_size == Some(0) {
            return Err(Error::Config(
                "hid.report_size must be greater than 0".to_string(),
            ));
        }

        if let Some(ep) = self.hid.out_endpoint
            && (ep & 0x80 != 0 || ep & 0x0f == 0)
        {
            return Err(Error::Config(format!(
                "hid.out_endpoint {:#04x} is not an OUT endpoint address",
                ep
            )));
        }

        if self.pipeline.request_size == 0 || self.pipeline.request_count == 0 {
            return Err(Error::Config(
                "pipeline.request_size and pipeline.request_count must be greater than 0"
                    .to_string(),
            ));
        }

        if self.dispatcher.poll_interval_ms == 0 {
            return Err(Error::Config(
                "dispatcher.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Load a configuration file from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<TransportConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    TransportConfig::load(Some(path_buf))
}
