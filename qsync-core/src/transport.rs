//! Transport abstraction.
//!
//! The engine never performs I/O itself; it issues requests through a
//! [`Transport`] and consumes `{ data }` envelopes.

use crate::error::TransportError;
use crate::key::QueryKey;
use crate::operation::HttpMethod;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response envelope returned by the data API.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(data: Value) -> Self {
        Self { data: Some(data) }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Decode a response body. Bodies that are not an object or carry no
    /// `data` field decode to an empty envelope.
    pub fn from_body(body: &Value) -> Self {
        match body {
            Value::Object(map) => Self {
                data: map.get("data").cloned(),
            },
            _ => Self::empty(),
        }
    }
}

/// One outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub url: String,
    pub method: HttpMethod,
    pub payload: Option<Value>,
}

impl TransportRequest {
    pub fn new(url: impl Into<String>, method: HttpMethod, payload: Option<Value>) -> Self {
        Self {
            url: url.into(),
            method,
            payload,
        }
    }
}

/// Sends requests to the remote data API.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request. Non-2xx responses surface as
    /// [`TransportError::Status`].
    async fn send(&self, request: TransportRequest) -> Result<Envelope, TransportError>;
}

/// Builds request URLs following the `{endpoint}/{model}/{operation}`
/// convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base_url: String,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL for an operation on a model.
    pub fn url(&self, model: &str, operation: &str) -> String {
        format!("{}/{}/{}", self.base_url, model, operation)
    }

    /// Read request for a cached query, optionally overriding its arguments
    /// (used for infinite query pages).
    pub fn query_request(&self, key: &QueryKey, args: Option<&Value>) -> TransportRequest {
        TransportRequest::new(
            self.url(key.model(), key.operation().as_str()),
            HttpMethod::Get,
            args.or(key.args()).cloned(),
        )
    }
}
