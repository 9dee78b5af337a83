//! Client-side error type.

use qsync_core::{ConfigError, SyncError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Failed to init tracing subscriber: {0}")]
    Telemetry(String),
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        Self::Sync(err.into())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
