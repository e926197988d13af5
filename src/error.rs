//! Error handling for the tank gateway service
//!
//! A single service-wide error enum with string payloads; locally recoverable
//! failures (transport retries, log stream errors, notification failures) are
//! logged and swallowed at their call sites, so only configuration and
//! persistence failures normally travel far up the stack.

use thiserror::Error;

/// Tank gateway error type
#[derive(Error, Debug, Clone)]
pub enum TankSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Register map structure or decode errors
    #[error("Register map error: {0}")]
    RegisterMapError(String),

    /// Write plan rejections (unknown point, read-only, NaN, out of bounds)
    #[error("Write plan error: {0}")]
    WritePlanError(String),

    /// Modbus transport failures (connect, request timeout, framing)
    #[error("Transport failure: {0}")]
    TransportError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Data serialization and deserialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Broker publish errors
    #[error("Publish error: {0}")]
    PublishError(String),

    /// Telemetry log writer errors
    #[error("Log writer error: {0}")]
    LogWriterError(String),

    /// Alarm engine and notification errors
    #[error("Alarm error: {0}")]
    AlarmError(String),

    /// Invalid parameter errors
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// API errors
    #[error("API error: {0}")]
    ApiError(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the tank gateway
pub type Result<T> = std::result::Result<T, TankSrvError>;

impl From<std::io::Error> for TankSrvError {
    fn from(err: std::io::Error) -> Self {
        TankSrvError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for TankSrvError {
    fn from(err: serde_json::Error) -> Self {
        TankSrvError::SerializationError(format!("JSON error: {err}"))
    }
}

impl TankSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        TankSrvError::ConfigError(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        TankSrvError::TransportError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        TankSrvError::TimeoutError(msg.into())
    }

    pub fn register_map(msg: impl Into<String>) -> Self {
        TankSrvError::RegisterMapError(msg.into())
    }

    pub fn write_plan(msg: impl Into<String>) -> Self {
        TankSrvError::WritePlanError(msg.into())
    }

    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        TankSrvError::InvalidParameter(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        TankSrvError::InternalError(msg.into())
    }
}
