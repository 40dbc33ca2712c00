//! Error Module
//!
//! Defines the error and result types used throughout the layered cache.

use thiserror::Error;

/// Main error type for the layered cache.
///
/// The type is `Clone` so a single result can be fanned out to every waiter
/// collapsed onto the same in-flight load.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Interface type: {0}")]
    InterfaceType(String),

    #[error("Serialize failed: {0}")]
    SerializeFailed(String),

    #[error("Deserialize failed: {0}")]
    DeserializeFailed(String),

    #[error("Corrupt file: {0}")]
    CorruptFile(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Breaker open")]
    BreakerOpen,

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

/// Result type alias for the layered cache
pub type Result<T> = std::result::Result<T, CacheError>;
