//! Read-through query fetching.
//!
//! [`QueryFetcher`] turns a [`QueryKey`] into a transport request and decodes
//! the response into the value cached under that key. Infinite queries are
//! fetched page by page; a refetch re-requests every page the entry holds.

use crate::host::CacheHost;
use crate::infinite::InfiniteData;
use qsync_core::{Endpoint, QueryKey, SyncResult, Transport};
use serde_json::Value;
use std::sync::Arc;

/// Fetches query results through a [`Transport`].
#[derive(Clone)]
pub struct QueryFetcher {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
}

impl QueryFetcher {
    pub fn new(transport: Arc<dyn Transport>, endpoint: Endpoint) -> Self {
        Self {
            transport,
            endpoint,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Fetch a key's value from scratch. Infinite keys load their first page
    /// with the key's own arguments.
    pub async fn fetch(&self, key: &QueryKey) -> SyncResult<Value> {
        let page = self.fetch_page(key, key.args()).await?;
        if key.is_infinite() {
            let param = key.args().cloned().unwrap_or(Value::Null);
            return Ok(InfiniteData::first(page, param).into_value());
        }
        Ok(page)
    }

    /// Fetch a single result set with explicit arguments.
    pub async fn fetch_page(&self, key: &QueryKey, args: Option<&Value>) -> SyncResult<Value> {
        let request = self.endpoint.query_request(key, args);
        tracing::debug!(key = %key, url = %request.url, "fetching query");
        let envelope = self.transport.send(request).await?;
        Ok(envelope.data.unwrap_or(Value::Null))
    }

    /// Refetch a key given its current value. Infinite entries re-request
    /// every stored page param in order.
    pub async fn refetch(&self, key: &QueryKey, current: Option<&Value>) -> SyncResult<Value> {
        let Some(current) = current.filter(|_| key.is_infinite()) else {
            return self.fetch(key).await;
        };
        let stored = InfiniteData::from_entry(key, current)?;
        if stored.page_params.is_empty() {
            return self.fetch(key).await;
        }
        let mut fresh = InfiniteData::default();
        for param in stored.page_params {
            let args = (!param.is_null()).then_some(&param);
            let page = self.fetch_page(key, args).await?;
            fresh.push_page(page, param);
        }
        Ok(fresh.into_value())
    }

    /// Fetch a key and store the result (or the failure) in `host`.
    pub async fn fetch_into(&self, host: &dyn CacheHost, key: &QueryKey) -> SyncResult<Value> {
        let current = host.get(key)?;
        match self.refetch(key, current.as_ref()).await {
            Ok(value) => {
                host.set(key, value.clone())?;
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "query fetch failed");
                host.set_error(key, err.clone())?;
                Err(err)
            }
        }
    }
}
