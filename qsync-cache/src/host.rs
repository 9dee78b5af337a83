//! Cache host trait.
//!
//! The cache host owns every cached query result. The engine only reads and
//! writes through this key/value interface; it never holds entries itself.
//!
//! # Synchronous Access
//!
//! All methods are synchronous and run to completion. An optimistic apply
//! step reads, patches and writes every affected entry without suspending,
//! so no reader can observe a partially patched entry.

use qsync_core::{QueryKey, SyncError, SyncResult};
use serde_json::Value;

/// Key/value interface of the reactive query cache.
pub trait CacheHost: Send + Sync {
    /// Current value of an entry, `None` if the key is unknown or has no
    /// data yet.
    fn get(&self, key: &QueryKey) -> SyncResult<Option<Value>>;

    /// Replace an entry's value and notify subscribers. Clears any stale or
    /// error state of the entry.
    fn set(&self, key: &QueryKey, value: Value) -> SyncResult<()>;

    /// Mark an entry stale so it is refetched.
    fn invalidate(&self, key: &QueryKey) -> SyncResult<()>;

    /// Every cached key accepted by `predicate`.
    fn list_keys(&self, predicate: &dyn Fn(&QueryKey) -> bool) -> SyncResult<Vec<QueryKey>>;

    /// Record a failed fetch for an entry. Existing data is kept.
    fn set_error(&self, key: &QueryKey, error: SyncError) -> SyncResult<()>;

    /// Whether the entry's last fetch failed. Errored entries are never
    /// patched optimistically.
    fn is_errored(&self, _key: &QueryKey) -> SyncResult<bool> {
        Ok(false)
    }
}

/// Keys of all cached queries on `model`.
pub fn keys_for_model(host: &dyn CacheHost, model: &str) -> SyncResult<Vec<QueryKey>> {
    host.list_keys(&|key| key.model() == model)
}
