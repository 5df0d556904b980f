//! Error types for the extension bridge.

use std::path::PathBuf;

use thiserror::Error;

/// Common error type for the extension bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Plugin descriptor is missing or cannot be parsed.
    ///
    /// Aborts the load of that plugin only.
    #[error("invalid manifest at {}: {reason}", path.display())]
    InvalidManifest { path: PathBuf, reason: String },

    /// A single script failed to compile or register.
    #[error("failed to load script '{name}': {reason}")]
    ScriptLoad { name: String, reason: String },

    /// Script raised an error or returned something unusable.
    #[error("{0}")]
    Interpreter(String),

    /// A cached literal blob could not be parsed.
    #[error("corrupted cache entry '{key}': {reason}")]
    CacheCorruption { key: String, reason: String },

    /// Template formulas reference each other in a cycle.
    #[error("circular formula between fields: {}", .0.join(", "))]
    CircularFormula(Vec<String>),

    /// A template formula is not plain arithmetic.
    #[error("invalid formula for '{field}': {reason}")]
    Formula { field: String, reason: String },

    /// Character template markup is malformed.
    #[error("template error: {0}")]
    Template(String),

    /// Rulebook document is malformed.
    #[error("invalid rulebook {}: {reason}", path.display())]
    Rulebook { path: PathBuf, reason: String },

    /// Command definition file is malformed.
    #[error("invalid command config {}: {reason}", path.display())]
    CommandConfig { path: PathBuf, reason: String },

    /// Persistent store error.
    #[error("store error: {0}")]
    Store(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Request rejected by a precondition check.
    #[error("validation error: {0}")]
    Validation(String),
}

impl From<sqlx::Error> for BridgeError {
    fn from(e: sqlx::Error) -> Self {
        BridgeError::Store(e.to_string())
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
