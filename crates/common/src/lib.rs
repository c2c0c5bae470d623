//! Common utilities for usb-trans
//!
//! This crate provides the functionality shared by the transport library and
//! the probe tool: error handling, logging setup and configuration loading.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    BulkSettings, DispatcherSettings, GeneralSettings, HidSettings, PipelineSettings,
    TransportConfig, UsbSettings, load_config,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
