//! Error types for mnemonic-core.

use thiserror::Error;

/// Result type alias using mnemonic-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory engine operations.
///
/// Only [`Error::StorageUnavailable`] and [`Error::Configuration`] are hard
/// failures for callers; the cache, embedding and snapshot variants are
/// logged and absorbed by the engine, which degrades to the next tier.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Cold store could not be reached or failed a statement
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Hot cache connect/timeout failure
    #[error("Hot cache degraded: {0}")]
    CacheDegraded(String),

    /// Embedding provider missing or failed
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Warm index snapshot unreadable or corrupt
    #[error("Corrupt warm snapshot: {0}")]
    CorruptSnapshot(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine is shutting down and accepts no new operations
    #[error("Memory engine is shutting down")]
    ShuttingDown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageUnavailable(message.into())
    }

    /// Create a cache degradation error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::CacheDegraded(message.into())
    }

    /// Create an embedding error.
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::EmbeddingUnavailable(message.into())
    }

    /// Create a corrupt snapshot error.
    pub fn corrupt_snapshot(message: impl Into<String>) -> Self {
        Self::CorruptSnapshot(message.into())
    }

    /// Whether this error belongs to a tier that degrades silently.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Self::CacheDegraded(_) | Self::EmbeddingUnavailable(_) | Self::CorruptSnapshot(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}
