//! Patch ledger.
//!
//! Records, per cache key, the chain of optimistic patches still waiting
//! for their mutation to settle. Each entry holds the value before and after
//! its patch plus what is needed to replay it, so one mutation can be rolled
//! back while later patches to the same key are re-applied on top of the
//! restored value.

use crate::patcher::OptimisticPatcher;
use qsync_cache::CacheHost;
use qsync_core::{EffectDescription, QueryKey, SyncResult, OPTIMISTIC_MARKER};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// How a recorded patch is re-applied after an earlier one is removed.
#[derive(Debug, Clone)]
pub enum Replay {
    /// Default patch, recomputed from the effect.
    Effect(Arc<EffectDescription>),
    /// Value returned by an optimistic data provider. Providers are not
    /// re-consulted, so the value is reused as is.
    Provided(Value),
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub mutation_id: u64,
    pub pre_image: Value,
    pub post_image: Value,
    pub replay: Replay,
}

impl LedgerEntry {
    fn replay_onto(&self, key: &QueryKey, base: &Value, patcher: &OptimisticPatcher<'_>) -> Value {
        match &self.replay {
            Replay::Effect(effect) => patcher
                .patch(key, base, effect)
                .unwrap_or_else(|| base.clone()),
            Replay::Provided(value) => value.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PatchLedger {
    entries: HashMap<QueryKey, Vec<LedgerEntry>>,
}

impl PatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: QueryKey, entry: LedgerEntry) {
        self.entries.entry(key).or_default().push(entry);
    }

    /// Keys holding a patch of `mutation_id`.
    pub fn keys_for(&self, mutation_id: u64) -> Vec<QueryKey> {
        self.entries
            .iter()
            .filter(|(_, chain)| chain.iter().any(|e| e.mutation_id == mutation_id))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Whether any patch is recorded for `key`.
    pub fn is_pending(&self, key: &QueryKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value of `key` before its oldest pending patch.
    pub fn base(&self, key: &QueryKey) -> Option<&Value> {
        self.entries
            .get(key)
            .and_then(|chain| chain.first())
            .map(|e| &e.pre_image)
    }

    /// Forget the patches of a settled mutation, leaving the cache as is.
    pub fn release(&mut self, mutation_id: u64) -> Vec<QueryKey> {
        let keys = self.keys_for(mutation_id);
        for key in &keys {
            if let Some(chain) = self.entries.get_mut(key) {
                chain.retain(|e| e.mutation_id != mutation_id);
                if chain.is_empty() {
                    self.entries.remove(key);
                }
            }
        }
        keys
    }

    /// Revert the patches of `mutation_id`.
    ///
    /// A key whose cached value is still the last recorded post-image is
    /// restored to the pre-image of the reverted patch, with later patches
    /// replayed on top. A key replaced since by unmarked data is left alone.
    /// A key replaced by data that still carries optimistic markers is
    /// restored the same way and invalidated, since the write that replaced
    /// it is lost. Returns the keys whose cached value changed.
    pub fn rollback(
        &mut self,
        mutation_id: u64,
        host: &dyn CacheHost,
        patcher: &OptimisticPatcher<'_>,
    ) -> SyncResult<Vec<QueryKey>> {
        let mut restored = Vec::new();
        for key in self.keys_for(mutation_id) {
            let Some(chain) = self.entries.get_mut(&key) else {
                continue;
            };
            let Some(index) = chain.iter().position(|e| e.mutation_id == mutation_id) else {
                continue;
            };
            let current = host.get(&key)?;
            let untouched = match (&current, chain.last()) {
                (Some(current), Some(last)) => *current == last.post_image,
                _ => false,
            };
            let marked = !untouched && current.as_ref().is_some_and(carries_marker);

            let removed = chain.remove(index);
            if untouched || marked {
                let mut value = removed.pre_image;
                for entry in chain.iter_mut().skip(index) {
                    entry.pre_image = value.clone();
                    entry.post_image = entry.replay_onto(&key, &value, patcher);
                    value = entry.post_image.clone();
                }
                host.set(&key, value)?;
                if marked {
                    tracing::debug!(key = %key, mutation_id, "marked entry replaced since patch, restored and invalidated");
                    host.invalidate(&key)?;
                }
                restored.push(key.clone());
            } else {
                tracing::debug!(key = %key, mutation_id, "cache entry replaced since patch, not restored");
            }
            if chain.is_empty() {
                self.entries.remove(&key);
            }
        }
        Ok(restored)
    }

    /// Re-apply every pending patch of `key` on top of freshly fetched data
    /// and return the value to store.
    pub fn rebase(&mut self, key: &QueryKey, fresh: Value, patcher: &OptimisticPatcher<'_>) -> Value {
        let Some(chain) = self.entries.get_mut(key) else {
            return fresh;
        };
        let mut value = fresh;
        for entry in chain.iter_mut() {
            entry.pre_image = value.clone();
            entry.post_image = entry.replay_onto(key, &value, patcher);
            value = entry.post_image.clone();
        }
        value
    }
}

fn carries_marker(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.contains_key(OPTIMISTIC_MARKER) || map.values().any(carries_marker)
        }
        Value::Array(items) => items.iter().any(carries_marker),
        _ => false,
    }
}
