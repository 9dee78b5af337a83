//! Query client facade.
//!
//! Owns the cache host, the fetcher and the mutation coordinator of one
//! client instance and exposes them the way generated query and mutation
//! hooks use them.

use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::http::HttpTransport;
use qsync_cache::{CacheHost, InMemoryCacheHost, InfiniteData, QueryFetcher};
use qsync_core::{
    Endpoint, HttpMethod, KeyFlags, ModelMeta, MutationOperation, QueryKey, QueryOperation,
    SyncError, SyncResult, Transport,
};
use qsync_mutation::{MutationCoordinator, MutationOptions, MutationRequest};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Per-query options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Let mutations patch this query before the server responds.
    pub optimistic_update: bool,
}

impl QueryOptions {
    pub fn optimistic() -> Self {
        Self {
            optimistic_update: true,
        }
    }
}

/// What a query hook exposes for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub key: QueryKey,
    pub data: Option<Value>,
    pub is_success: bool,
    pub is_error: bool,
    pub is_stale: bool,
    pub error: Option<SyncError>,
}

#[derive(Clone)]
pub struct QueryClient {
    host: Arc<InMemoryCacheHost>,
    fetcher: QueryFetcher,
    coordinator: MutationCoordinator,
    mutation_defaults: MutationOptions,
}

impl QueryClient {
    pub fn new(meta: Arc<ModelMeta>, transport: Arc<dyn Transport>, endpoint: Endpoint) -> Self {
        let host = Arc::new(InMemoryCacheHost::new());
        let fetcher = QueryFetcher::new(transport, endpoint);
        let coordinator = MutationCoordinator::new(meta, host.clone(), fetcher.clone());
        Self {
            host,
            fetcher,
            coordinator,
            mutation_defaults: MutationOptions::default(),
        }
    }

    /// Client talking HTTP to the configured endpoint.
    pub fn from_config(meta: Arc<ModelMeta>, config: &ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(config)?);
        let client = Self::new(meta, transport, config.endpoint())
            .with_mutation_defaults(config.mutations.options());
        client.coordinator.set_logging(config.logging);
        tracing::info!(endpoint = %config.endpoint, "query client created");
        Ok(client)
    }

    /// Options every new mutation handle starts from.
    pub fn with_mutation_defaults(mut self, options: MutationOptions) -> Self {
        self.mutation_defaults = options;
        self
    }

    pub fn host(&self) -> &Arc<InMemoryCacheHost> {
        &self.host
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    /// Key a query hook caches under.
    pub fn query_key(
        &self,
        model: &str,
        operation: &str,
        args: Option<&Value>,
        options: QueryOptions,
        infinite: bool,
    ) -> QueryKey {
        QueryKey::encode(
            model,
            QueryOperation::from(operation),
            args,
            KeyFlags::new(infinite, options.optimistic_update),
        )
    }

    /// Read a query, fetching it unless a fresh value is cached. Fetch
    /// failures are reported through the returned state.
    pub async fn query(
        &self,
        model: &str,
        operation: &str,
        args: Option<Value>,
        options: QueryOptions,
    ) -> SyncResult<QueryState> {
        let key = self.query_key(model, operation, args.as_ref(), options, false);
        self.load(key).await
    }

    /// Read an infinite query; the first page is loaded with `args`.
    pub async fn infinite_query(
        &self,
        model: &str,
        operation: &str,
        args: Option<Value>,
        options: QueryOptions,
    ) -> SyncResult<QueryState> {
        let key = self.query_key(model, operation, args.as_ref(), options, true);
        self.load(key).await
    }

    /// Append the page fetched with `page_args` to an infinite entry. The
    /// page goes under any pending optimistic patches, which are re-applied.
    pub async fn fetch_next_page(&self, key: &QueryKey, page_args: Value) -> SyncResult<QueryState> {
        let page = self.fetcher.fetch_page(key, Some(&page_args)).await?;
        self.coordinator.update_base(key, |base| {
            let mut data = InfiniteData::from_entry(key, &base)?;
            data.push_page(page, page_args);
            Ok(data.into_value())
        })?;
        self.query_state(key)
    }

    /// Current state of a cached key.
    pub fn query_state(&self, key: &QueryKey) -> SyncResult<QueryState> {
        let snapshot = self.host.snapshot(key)?;
        Ok(match snapshot {
            Some(entry) => QueryState {
                key: key.clone(),
                is_success: entry.data.is_some() && entry.error.is_none(),
                is_error: entry.error.is_some(),
                is_stale: entry.stale,
                data: entry.data,
                error: entry.error,
            },
            None => QueryState {
                key: key.clone(),
                data: None,
                is_success: false,
                is_error: false,
                is_stale: false,
                error: None,
            },
        })
    }

    /// Cached data of a query, without fetching.
    pub fn get_query_data(
        &self,
        model: &str,
        operation: &str,
        args: Option<&Value>,
        options: QueryOptions,
    ) -> SyncResult<Option<Value>> {
        self.host
            .get(&self.query_key(model, operation, args, options, false))
    }

    /// Refetch every stale key, keeping pending optimistic patches on top of
    /// the fresh data. Returns the keys refetched successfully.
    pub async fn refetch_stale(&self) -> SyncResult<Vec<QueryKey>> {
        let mut refreshed = Vec::new();
        for key in self.host.stale_keys()? {
            let current = self.host.get(&key)?;
            match self.fetcher.refetch(&key, current.as_ref()).await {
                Ok(fresh) => {
                    self.coordinator.update_base(&key, |_| Ok(fresh))?;
                    refreshed.push(key);
                }
                Err(error) => {
                    tracing::warn!(key = %key, error = %error, "stale refetch failed");
                    self.host.set_error(&key, error)?;
                }
            }
        }
        Ok(refreshed)
    }

    /// Mutation hook for `model.operation`, starting from the client's
    /// mutation defaults.
    pub fn mutation(&self, model: &str, operation: MutationOperation) -> MutationHandle {
        MutationHandle {
            client: self.clone(),
            model: model.to_string(),
            operation,
            method: operation.http_method(),
            options: self.mutation_defaults.clone(),
        }
    }

    async fn load(&self, key: QueryKey) -> SyncResult<QueryState> {
        let fresh = self
            .host
            .snapshot(&key)?
            .is_some_and(|entry| entry.data.is_some() && entry.error.is_none() && !entry.stale);
        if !fresh {
            // the failure is recorded on the entry
            let _ = self.fetcher.fetch_into(&*self.host, &key).await;
        }
        self.query_state(&key)
    }
}

/// A mutation hook bound to one model operation.
#[derive(Clone)]
pub struct MutationHandle {
    client: QueryClient,
    model: String,
    operation: MutationOperation,
    method: HttpMethod,
    options: MutationOptions,
}

impl MutationHandle {
    pub fn with_options(mut self, options: MutationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn options(&self) -> &MutationOptions {
        &self.options
    }

    fn request(&self, payload: Value) -> MutationRequest {
        MutationRequest::new(self.model.clone(), self.operation, payload)
            .with_method(self.method)
            .with_options(self.options.clone())
    }

    /// Fire-and-forget mutation. Optimistic patches are in the cache when
    /// this returns; the request runs on a spawned task. Must be called from
    /// within a tokio runtime.
    pub fn mutate(&self, payload: Value) -> SyncResult<JoinHandle<SyncResult<Option<Value>>>> {
        let pending = self.client.coordinator.begin(self.request(payload))?;
        Ok(tokio::spawn(pending.run()))
    }

    /// Run the mutation and return the server's `data`.
    pub async fn mutate_async(&self, payload: Value) -> SyncResult<Option<Value>> {
        self.client.coordinator.execute(self.request(payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsync_test_utils::fixtures::{shared_meta, user};
    use qsync_test_utils::MockServer;
    use serde_json::json;

    fn client() -> (Arc<MockServer>, QueryClient) {
        let server = MockServer::new();
        let client = QueryClient::new(shared_meta(), server.clone(), server.endpoint());
        (server, client)
    }

    #[tokio::test]
    async fn test_query_served_from_cache_when_fresh() {
        let (server, client) = client();
        server.reply("User", "findMany", json!([user("1", "a")]));

        let first = client
            .query("User", "findMany", None, QueryOptions::default())
            .await
            .expect("query");
        assert!(first.is_success);
        assert_eq!(first.data, Some(json!([user("1", "a")])));

        client
            .query("User", "findMany", None, QueryOptions::default())
            .await
            .expect("query");
        assert_eq!(server.calls("User", "findMany"), 1);
    }

    #[tokio::test]
    async fn test_query_failure_sets_error_state() {
        let (server, client) = client();
        server.fail("User", "findMany", 500);

        let state = client
            .query("User", "findMany", None, QueryOptions::default())
            .await
            .expect("query");
        assert!(state.is_error);
        assert!(!state.is_success);
        assert_eq!(state.error.and_then(|e| match e {
            SyncError::Transport(t) => t.status(),
            _ => None,
        }), Some(500));
    }

    #[tokio::test]
    async fn test_query_args_reach_server() {
        let (server, client) = client();
        server.reply("User", "findUnique", user("1", "a"));
        let args = json!({ "where": { "id": "1" } });

        client
            .query("User", "findUnique", Some(args.clone()), QueryOptions::default())
            .await
            .expect("query");
        assert_eq!(server.last_payload("User", "findUnique"), Some(args));
    }

    #[tokio::test]
    async fn test_infinite_query_pages() {
        let (server, client) = client();
        server.reply_with("User", "findMany", |payload| {
            let skip = payload
                .and_then(|p| p.get("skip"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            json!([user(&(skip + 1).to_string(), "u")])
        });

        let state = client
            .infinite_query("User", "findMany", Some(json!({ "take": 1 })), QueryOptions::default())
            .await
            .expect("query");
        assert_eq!(
            state.data,
            Some(json!({ "pages": [[user("1", "u")]], "pageParams": [{ "take": 1 }] }))
        );

        let state = client
            .fetch_next_page(&state.key, json!({ "take": 1, "skip": 1 }))
            .await
            .expect("next page");
        let data = state.data.expect("data");
        assert_eq!(data["pages"][1], json!([user("2", "u")]));
        assert_eq!(data["pageParams"][1], json!({ "take": 1, "skip": 1 }));
    }

    #[tokio::test]
    async fn test_refetch_stale() {
        let (server, client) = client();
        server.reply("User", "findMany", json!([]));
        let state = client
            .query("User", "findMany", None, QueryOptions::default())
            .await
            .expect("query");

        server.reply("User", "findMany", json!([user("1", "a")]));
        client.host().invalidate(&state.key).expect("invalidate");
        assert!(client.query_state(&state.key).expect("state").is_stale);

        let refreshed = client.refetch_stale().await.expect("refetch");
        assert_eq!(refreshed, vec![state.key.clone()]);
        let state = client.query_state(&state.key).expect("state");
        assert!(!state.is_stale);
        assert_eq!(state.data, Some(json!([user("1", "a")])));
    }

    #[tokio::test]
    async fn test_mutation_defaults_and_method() {
        let (server, client) = client();
        let client = client.with_mutation_defaults(MutationOptions::new().optimistic(true));
        server.reply("User", "update", user("1", "b"));

        let handle = client
            .mutation("User", MutationOperation::Update)
            .with_method(HttpMethod::Patch);
        assert!(handle.options().optimistic_update);

        let data = handle
            .mutate_async(json!({ "where": { "id": "1" }, "data": { "name": "b" } }))
            .await
            .expect("mutation");
        assert_eq!(data, Some(user("1", "b")));
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid() {
        let config = ClientConfig::new("");
        assert!(QueryClient::from_config(shared_meta(), &config).is_err());
    }
}
