//! HTTP transport over `reqwest`.
//!
//! `GET` and `DELETE` requests carry their payload as JSON in the `q` query
//! parameter; every other method sends it as the JSON body. Responses are
//! decoded as `{ data }` envelopes.

use crate::config::{AuthConfig, ClientConfig};
use crate::error::ClientResult;
use async_trait::async_trait;
use qsync_core::{Envelope, HttpMethod, Transport, TransportError, TransportRequest};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let headers = build_auth_headers(&config.auth)?;
        Ok(Self { client, headers })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<Envelope, TransportError> {
        let url = request.url;
        let mut builder = self
            .client
            .request(method(request.method), &url)
            .headers(self.headers.clone());
        if let Some(payload) = &request.payload {
            builder = if request.method.payload_in_query() {
                builder.query(&[("q", payload.to_string())])
            } else {
                builder.json(payload)
            };
        }

        let response = builder.send().await.map_err(|e| network(&url, e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| network(&url, e))?;
        if !status.is_success() {
            return Err(TransportError::Status {
                url,
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Envelope::empty());
        }
        let body: Value = serde_json::from_str(&text).map_err(|e| TransportError::Decode {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        Ok(Envelope::from_body(&body))
    }
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn network(url: &str, err: reqwest::Error) -> TransportError {
    TransportError::Network {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

fn build_auth_headers(auth: &AuthConfig) -> ClientResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        headers.insert(HeaderName::from_static("x-api-key"), HeaderValue::from_str(api_key)?);
    }
    if let Some(jwt) = &auth.jwt {
        let value = format!("Bearer {}", jwt);
        headers.insert(HeaderName::from_static("authorization"), HeaderValue::from_str(&value)?);
    }
    Ok(headers)
}
