//! Error types for qsync operations

use thiserror::Error;

/// Malformed mutation payloads.
///
/// These are the only walker failures that surface to a caller. Unknown
/// fields, unknown models and unknown relation operators are not errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Payload for {model}.{operation} must be an object")]
    NotAnObject { model: String, operation: String },

    #[error("Payload for {model}.{operation} is missing required field `{field}`")]
    MissingField {
        model: String,
        operation: String,
        field: &'static str,
    },

    #[error("Field `{field}` of {model}.{operation} must be {expected}")]
    InvalidField {
        model: String,
        operation: String,
        field: &'static str,
        expected: &'static str,
    },

    #[error("Unsupported mutation operation: {0}")]
    UnsupportedOperation(String),
}

/// Cache host errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Cache entry for {key} is not a valid infinite entry: {reason}")]
    InvalidInfiniteEntry { key: String, reason: String },
}

/// Transport failures. A failed transport call rolls back every optimistic
/// patch the mutation applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request to {url} failed with status {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Network error for {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("Could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl TransportError {
    /// HTTP status of the failure, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (set QSYNC_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {0}")]
    Io(String),

    #[error("Failed to parse config TOML: {0}")]
    Parse(String),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Mutation state machine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Illegal mutation transition from {from} on {event}")]
    IllegalTransition { from: String, event: String },
}

/// Master error type for all qsync errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Result type alias for qsync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// TESTS
// =============================================================================
