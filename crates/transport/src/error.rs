//! Transport error types

use thiserror::Error;

/// Backend-reported failure of a device or transfer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceFault {
    #[error("endpoint stalled")]
    Stall,

    #[error("device disconnected")]
    NoDevice,

    #[error("I/O error")]
    Io,

    #[error("device sent more data than requested")]
    Overflow,

    #[error("device or interface busy")]
    Busy,

    #[error("access denied")]
    Access,

    #[error("entity not found")]
    NotFound,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("no {0} endpoint on interface")]
    MissingEndpoint(&'static str),

    #[error("{0}")]
    Other(String),
}

/// Errors returned by every transport operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Operation on a closed or never opened transport
    #[error("transport is not open")]
    NotOpen,

    #[error("transfer timed out")]
    Timeout,

    /// Fewer bytes moved than requested; the caller decides whether that is fatal
    #[error("short transfer: expected {expected} bytes, moved {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("device error: {0}")]
    Device(#[from] DeviceFault),

    #[error("multi-request pool exhausted: {0}")]
    ResourceExhausted(String),
}

impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::NoMem => TransportError::ResourceExhausted(err.to_string()),
            rusb::Error::Pipe => DeviceFault::Stall.into(),
            rusb::Error::NoDevice => DeviceFault::NoDevice.into(),
            rusb::Error::NotFound => DeviceFault::NotFound.into(),
            rusb::Error::Busy => DeviceFault::Busy.into(),
            rusb::Error::Overflow => DeviceFault::Overflow.into(),
            rusb::Error::Io => DeviceFault::Io.into(),
            rusb::Error::InvalidParam => DeviceFault::InvalidParam.into(),
            rusb::Error::Access => DeviceFault::Access.into(),
            rusb::Error::Interrupted => DeviceFault::Cancelled.into(),
            _ => DeviceFault::Other(err.to_string()).into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
