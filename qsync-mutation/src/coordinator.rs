//! Mutation coordinator.
//!
//! Drives one mutation through the state machine in [`crate::state`]:
//! walks the payload, writes optimistic patches synchronously, sends the
//! request, then either reconciles affected entries with server data or
//! rolls the patches back.
//!
//! Several mutations may be pending at once. Each patch is computed from the
//! entry's current value, so patches of concurrent mutations compose in the
//! order the mutations began. The [`PatchLedger`] keeps enough history to
//! remove one mutation's patches without losing the others'.

use crate::hook::{MutationOptions, ProviderContext, ProviderResult};
use crate::ledger::{LedgerEntry, PatchLedger, Replay};
use crate::patcher::OptimisticPatcher;
use crate::resolver::AffectedEntryResolver;
use crate::state::{transition, MutationEvent, MutationState};
use crate::walker::PayloadWalker;
use qsync_cache::{CacheHost, QueryFetcher};
use qsync_core::{
    CacheError, EffectDescription, Envelope, HttpMethod, ModelMeta, MutationOperation, QueryKey,
    SyncResult, TransportError, TransportRequest,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// One mutation call as issued by a mutation hook.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub model: String,
    pub operation: MutationOperation,
    pub method: HttpMethod,
    pub payload: Value,
    pub options: MutationOptions,
}

impl MutationRequest {
    pub fn new(model: impl Into<String>, operation: MutationOperation, payload: Value) -> Self {
        Self {
            model: model.into(),
            operation,
            method: operation.http_method(),
            payload,
            options: MutationOptions::default(),
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_options(mut self, options: MutationOptions) -> Self {
        self.options = options;
        self
    }
}

struct Inner {
    meta: Arc<ModelMeta>,
    host: Arc<dyn CacheHost>,
    fetcher: QueryFetcher,
    ledger: Mutex<PatchLedger>,
    /// Held across every read-modify-write of a patched entry. Optimistic
    /// data providers run under it, so they must not begin, settle or drop
    /// mutations; the ledger itself is only locked around bookkeeping.
    writes: Mutex<()>,
    next_id: AtomicU64,
    logging: AtomicBool,
}

/// Shared entry point for every mutation of one client.
#[derive(Clone)]
pub struct MutationCoordinator {
    inner: Arc<Inner>,
}

impl MutationCoordinator {
    pub fn new(meta: Arc<ModelMeta>, host: Arc<dyn CacheHost>, fetcher: QueryFetcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                meta,
                host,
                fetcher,
                ledger: Mutex::new(PatchLedger::new()),
                writes: Mutex::new(()),
                next_id: AtomicU64::new(1),
                logging: AtomicBool::new(false),
            }),
        }
    }

    /// Log every key a mutation patches, rolls back or refetches.
    pub fn set_logging(&self, enabled: bool) {
        self.inner.logging.store(enabled, Ordering::Relaxed);
    }

    pub fn meta(&self) -> &Arc<ModelMeta> {
        &self.inner.meta
    }

    pub fn host(&self) -> &Arc<dyn CacheHost> {
        &self.inner.host
    }

    pub fn fetcher(&self) -> &QueryFetcher {
        &self.inner.fetcher
    }

    /// Validate the payload and apply optimistic patches. Returns once every
    /// patch is written; the request itself is sent by [`PendingMutation::run`].
    pub fn begin(&self, request: MutationRequest) -> SyncResult<PendingMutation> {
        let effect = PayloadWalker::new(&self.inner.meta).walk(
            &request.model,
            request.operation,
            &request.payload,
        )?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            mutation_id = id,
            model = %request.model,
            operation = %request.operation,
            optimistic = request.options.optimistic_update,
            "mutation started"
        );

        let mut pending = PendingMutation {
            coordinator: self.clone(),
            id,
            request,
            effect: Arc::new(effect),
            state: MutationState::Idle,
            patched: Vec::new(),
        };
        pending.advance(MutationEvent::Begin)?;

        if pending.request.options.optimistic_update {
            match self.apply(id, &pending.request, &pending.effect) {
                Ok(keys) => pending.patched = keys,
                Err(error) => {
                    pending.advance(MutationEvent::Failed)?;
                    pending.roll_back()?;
                    pending.advance(MutationEvent::Settled)?;
                    return Err(error);
                }
            }
        }
        pending.advance(MutationEvent::Applied)?;
        Ok(pending)
    }

    /// Run a mutation to completion and return the server's `data`.
    pub async fn execute(&self, request: MutationRequest) -> SyncResult<Option<Value>> {
        self.begin(request)?.run().await
    }

    /// Value to store for `key` after fetching `fresh` server data: the data
    /// with every still-pending optimistic patch re-applied.
    pub fn rebase_pending(&self, key: &QueryKey, fresh: Value) -> SyncResult<Value> {
        let patcher = OptimisticPatcher::new(&self.inner.meta);
        Ok(self.lock_ledger()?.rebase(key, fresh, &patcher))
    }

    /// Rewrite the server data underneath the pending patches of `key` and
    /// store the result with those patches re-applied. `update` receives the
    /// entry as last fetched, or the cached value when nothing is pending.
    pub fn update_base<F>(&self, key: &QueryKey, update: F) -> SyncResult<Value>
    where
        F: FnOnce(Value) -> SyncResult<Value>,
    {
        let _writes = self.lock_writes()?;
        let host = &*self.inner.host;
        let base = match self.lock_ledger()?.base(key) {
            Some(base) => base.clone(),
            None => host.get(key)?.unwrap_or(Value::Null),
        };
        let fresh = update(base)?;
        let value = self.rebase_pending(key, fresh)?;
        host.set(key, value.clone())?;
        Ok(value)
    }

    fn logging(&self) -> bool {
        self.inner.logging.load(Ordering::Relaxed)
    }

    fn lock_ledger(&self) -> SyncResult<MutexGuard<'_, PatchLedger>> {
        self.inner
            .ledger
            .lock()
            .map_err(|_| CacheError::LockPoisoned.into())
    }

    fn lock_writes(&self) -> SyncResult<MutexGuard<'_, ()>> {
        self.inner
            .writes
            .lock()
            .map_err(|_| CacheError::LockPoisoned.into())
    }

    /// Patch every optimistic, non-errored entry the mutation affects. The
    /// write lock is held for the whole step so concurrent mutations apply
    /// one after the other.
    fn apply(
        &self,
        id: u64,
        request: &MutationRequest,
        effect: &Arc<EffectDescription>,
    ) -> SyncResult<Vec<QueryKey>> {
        let meta = &*self.inner.meta;
        let host = &*self.inner.host;
        let resolver = AffectedEntryResolver::new(meta);
        let patcher = OptimisticPatcher::new(meta);
        let mutated = effect.mutated_models(meta);

        let _writes = self.lock_writes()?;
        let mut patched = Vec::new();
        for key in host.list_keys(&|key| key.is_optimistic())? {
            if host.is_errored(&key)? {
                continue;
            }
            let Some(current) = host.get(&key)? else {
                continue;
            };
            if !resolver.is_affected(&mutated, &key, Some(&current)) {
                continue;
            }

            let ctx = ProviderContext {
                query_model: key.model(),
                query_operation: key.operation(),
                query_args: key.args(),
                current_data: &current,
                mutation_args: &request.payload,
            };
            let (next, replay) = match request.options.consult(&ctx) {
                ProviderResult::Skip => {
                    if self.logging() {
                        tracing::debug!(mutation_id = id, key = %key, "provider skipped entry");
                    }
                    continue;
                }
                ProviderResult::Update(value) => (value.clone(), Replay::Provided(value)),
                ProviderResult::ProceedDefault => match patcher.patch(&key, &current, effect) {
                    Some(value) => (value, Replay::Effect(Arc::clone(effect))),
                    None => continue,
                },
            };

            if self.logging() {
                tracing::debug!(mutation_id = id, key = %key, "optimistically patched entry");
            }
            host.set(&key, next.clone())?;
            self.lock_ledger()?.record(
                key.clone(),
                LedgerEntry {
                    mutation_id: id,
                    pre_image: current,
                    post_image: next,
                    replay,
                },
            );
            patched.push(key);
        }
        Ok(patched)
    }
}

/// A mutation whose optimistic patches are applied and whose request has not
/// settled yet. Dropping it while pending rolls the patches back.
pub struct PendingMutation {
    coordinator: MutationCoordinator,
    id: u64,
    request: MutationRequest,
    effect: Arc<EffectDescription>,
    state: MutationState,
    patched: Vec<QueryKey>,
}

impl PendingMutation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> MutationState {
        self.state
    }

    pub fn effect(&self) -> &EffectDescription {
        &self.effect
    }

    /// Keys that received an optimistic patch.
    pub fn patched_keys(&self) -> &[QueryKey] {
        &self.patched
    }

    /// Send the mutation request.
    pub async fn send(&self) -> Result<Envelope, TransportError> {
        let fetcher = &self.coordinator.inner.fetcher;
        let url = fetcher
            .endpoint()
            .url(&self.request.model, self.request.operation.as_str());
        let request = TransportRequest::new(url, self.request.method, Some(self.request.payload.clone()));
        fetcher.transport().send(request).await
    }

    /// Reconcile or roll back according to the transport outcome.
    pub async fn settle(mut self, outcome: Result<Envelope, TransportError>) -> SyncResult<Option<Value>> {
        match outcome {
            Ok(envelope) => {
                self.advance(MutationEvent::Succeeded)?;
                self.reconcile().await?;
                self.advance(MutationEvent::Settled)?;
                Ok(envelope.data)
            }
            Err(error) => {
                tracing::warn!(mutation_id = self.id, model = %self.request.model, error = %error, "mutation failed");
                self.advance(MutationEvent::Failed)?;
                self.roll_back()?;
                self.advance(MutationEvent::Settled)?;
                Err(error.into())
            }
        }
    }

    pub async fn run(self) -> SyncResult<Option<Value>> {
        let outcome = self.send().await;
        self.settle(outcome).await
    }

    fn advance(&mut self, event: MutationEvent) -> SyncResult<()> {
        self.state = transition(self.state, event)?;
        tracing::trace!(mutation_id = self.id, state = %self.state, "mutation state");
        Ok(())
    }

    fn roll_back(&mut self) -> SyncResult<Vec<QueryKey>> {
        let coordinator = &self.coordinator;
        let patcher = OptimisticPatcher::new(&coordinator.inner.meta);
        let _writes = coordinator.lock_writes()?;
        let restored =
            coordinator
                .lock_ledger()?
                .rollback(self.id, &*coordinator.inner.host, &patcher)?;
        if coordinator.logging() {
            for key in &restored {
                tracing::debug!(mutation_id = self.id, key = %key, "rolled back entry");
            }
        }
        Ok(restored)
    }

    /// Drop the ledger entries and, when invalidation is on, refetch every
    /// affected key. Refetch failures mark the entry errored without failing
    /// the mutation.
    async fn reconcile(&mut self) -> SyncResult<()> {
        let coordinator = self.coordinator.clone();
        let inner = &coordinator.inner;
        coordinator.lock_ledger()?.release(self.id);
        if !self.request.options.invalidate_queries {
            return Ok(());
        }

        let mut keys = AffectedEntryResolver::new(&inner.meta)
            .resolve(&self.effect, &inner.host.list_keys(&|_| true)?);
        for key in &self.patched {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        for key in &keys {
            inner.host.invalidate(key)?;
        }

        for key in keys {
            let current = inner.host.get(&key)?;
            match inner.fetcher.refetch(&key, current.as_ref()).await {
                Ok(fresh) => {
                    coordinator.update_base(&key, |_| Ok(fresh))?;
                    if coordinator.logging() {
                        tracing::debug!(mutation_id = self.id, key = %key, "refetched entry");
                    }
                }
                Err(error) => {
                    tracing::warn!(mutation_id = self.id, key = %key, error = %error, "refetch failed");
                    inner.host.set_error(&key, error)?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for PendingMutation {
    fn drop(&mut self) {
        if self.state != MutationState::Pending {
            return;
        }
        tracing::debug!(mutation_id = self.id, "pending mutation dropped, rolling back");
        let result = self
            .advance(MutationEvent::Aborted)
            .and_then(|_| self.roll_back())
            .and_then(|_| self.advance(MutationEvent::Settled));
        if let Err(error) = result {
            tracing::warn!(mutation_id = self.id, error = %error, "rollback of aborted mutation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsync_core::{KeyFlags, SyncError};
    use qsync_test_utils::assertions::{assert_len, assert_no_markers, assert_optimistic};
    use qsync_test_utils::fixtures::{shared_meta, user};
    use qsync_test_utils::{InMemoryCacheHost, MockServer};
    use serde_json::json;

    fn setup() -> (Arc<MockServer>, Arc<InMemoryCacheHost>, MutationCoordinator) {
        let server = MockServer::new();
        let host = Arc::new(InMemoryCacheHost::new());
        let fetcher = QueryFetcher::new(server.clone(), server.endpoint());
        let coordinator = MutationCoordinator::new(shared_meta(), host.clone(), fetcher);
        (server, host, coordinator)
    }

    fn users(optimistic: bool) -> QueryKey {
        QueryKey::encode("User", "findMany", None, KeyFlags::new(false, optimistic))
    }

    fn create(name: &str, options: MutationOptions) -> MutationRequest {
        MutationRequest::new("User", MutationOperation::Create, json!({ "data": { "name": name } }))
            .with_options(options)
    }

    #[tokio::test]
    async fn test_optimistic_patch_visible_before_settle() {
        let (server, host, coordinator) = setup();
        host.set(&users(true), json!([])).expect("host");
        server.reply("User", "create", user("1", "foo"));

        let pending = coordinator
            .begin(create("foo", MutationOptions::new().optimistic(true).invalidate(false)))
            .expect("begin");
        assert_eq!(pending.state(), MutationState::Pending);
        assert_eq!(pending.patched_keys(), &[users(true)]);

        let cached = host.get(&users(true)).expect("host").expect("entry");
        assert_len(&cached, 1);
        assert_optimistic(&cached[0]);

        let data = pending.run().await.expect("mutation");
        assert_eq!(data, Some(user("1", "foo")));
        let cached = host.get(&users(true)).expect("host").expect("entry");
        assert_optimistic(&cached[0]);
    }

    #[test]
    fn test_provider_may_call_back_into_coordinator() {
        let (_server, host, coordinator) = setup();
        host.set(&users(true), json!([user("0", "zero")])).expect("host");

        let reentrant = coordinator.clone();
        let options = MutationOptions::new()
            .optimistic(true)
            .invalidate(false)
            .with_provider(move |ctx| {
                match reentrant.rebase_pending(&users(true), ctx.current_data.clone()) {
                    Ok(_) => ProviderResult::Update(json!([])),
                    Err(_) => ProviderResult::Skip,
                }
            });
        let pending = coordinator.begin(create("foo", options)).expect("begin");
        assert_eq!(pending.patched_keys(), &[users(true)]);
        assert_eq!(host.get(&users(true)).expect("host"), Some(json!([])));

        drop(pending);
        assert_eq!(host.get(&users(true)).expect("host"), Some(json!([user("0", "zero")])));
    }

    #[tokio::test]
    async fn test_non_optimistic_keys_untouched() {
        let (server, host, coordinator) = setup();
        host.set(&users(false), json!([])).expect("host");
        server.reply("User", "create", user("1", "foo"));

        let pending = coordinator
            .begin(create("foo", MutationOptions::new().optimistic(true).invalidate(false)))
            .expect("begin");
        assert!(pending.patched_keys().is_empty());
        assert_eq!(host.get(&users(false)).expect("host"), Some(json!([])));
    }

    #[tokio::test]
    async fn test_failure_restores_pre_image() {
        let (server, host, coordinator) = setup();
        let original = json!([user("0", "zero")]);
        host.set(&users(true), original.clone()).expect("host");
        server.fail("User", "create", 403);

        let result = coordinator
            .execute(create("foo", MutationOptions::new().optimistic(true)))
            .await;
        assert!(matches!(
            result,
            Err(SyncError::Transport(TransportError::Status { status: 403, .. }))
        ));
        assert_eq!(host.get(&users(true)).expect("host"), Some(original));
    }

    #[tokio::test]
    async fn test_drop_while_pending_rolls_back() {
        let (_server, host, coordinator) = setup();
        host.set(&users(true), json!([])).expect("host");

        let pending = coordinator
            .begin(create("foo", MutationOptions::new().optimistic(true)))
            .expect("begin");
        assert_len(&host.get(&users(true)).expect("host").expect("entry"), 1);
        drop(pending);
        assert_eq!(host.get(&users(true)).expect("host"), Some(json!([])));
    }

    #[tokio::test]
    async fn test_success_refetches_and_clears_markers() {
        let (server, host, coordinator) = setup();
        host.set(&users(true), json!([])).expect("host");
        server.reply("User", "create", user("1", "foo"));
        server.reply("User", "findMany", json!([user("1", "foo")]));

        coordinator
            .execute(create("foo", MutationOptions::new().optimistic(true)))
            .await
            .expect("mutation");

        let cached = host.get(&users(true)).expect("host").expect("entry");
        assert_eq!(cached, json!([user("1", "foo")]));
        assert_no_markers(&cached);
        assert_eq!(server.calls("User", "findMany"), 1);
    }

    #[tokio::test]
    async fn test_refetch_failure_marks_entry_errored() {
        let (server, host, coordinator) = setup();
        host.set(&users(false), json!([])).expect("host");
        server.reply("User", "create", user("1", "foo"));
        server.fail("User", "findMany", 500);

        let data = coordinator
            .execute(create("foo", MutationOptions::new()))
            .await
            .expect("mutation succeeds");
        assert_eq!(data, Some(user("1", "foo")));
        assert!(host.is_errored(&users(false)).expect("host"));
    }

    #[tokio::test]
    async fn test_errored_entries_not_patched() {
        let (_server, host, coordinator) = setup();
        host.set(&users(true), json!([])).expect("host");
        host.set_error(
            &users(true),
            SyncError::Transport(TransportError::Network {
                url: "http://localhost/api/model/User/findMany".to_string(),
                reason: "down".to_string(),
            }),
        )
        .expect("host");

        let pending = coordinator
            .begin(create("foo", MutationOptions::new().optimistic(true)))
            .expect("begin");
        assert!(pending.patched_keys().is_empty());
    }

    #[test]
    fn test_malformed_payload_fails_begin() {
        let (_server, _host, coordinator) = setup();
        let request = MutationRequest::new("User", MutationOperation::Update, json!({ "data": {} }));
        assert!(matches!(coordinator.begin(request), Err(SyncError::Payload(_))));
    }

    #[tokio::test]
    async fn test_sends_configured_method_and_payload() {
        let (server, _host, coordinator) = setup();
        server.reply("User", "delete", json!(null));
        let payload = json!({ "where": { "id": "1" } });
        coordinator
            .execute(MutationRequest::new("User", MutationOperation::Delete, payload.clone()))
            .await
            .expect("mutation");
        assert_eq!(server.last_payload("User", "delete"), Some(payload));
    }
}
