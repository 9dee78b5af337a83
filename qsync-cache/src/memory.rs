//! In-memory cache host.
//!
//! Entries live in a `RwLock<HashMap>` keyed by [`QueryKey`]. Every write,
//! invalidation and removal is broadcast to subscribers as a [`CacheEvent`].

use crate::host::CacheHost;
use chrono::{DateTime, Utc};
use qsync_core::{CacheError, QueryKey, SyncError, SyncResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notification sent to cache subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Updated(QueryKey),
    Invalidated(QueryKey),
    Removed(QueryKey),
}

impl CacheEvent {
    pub fn key(&self) -> &QueryKey {
        match self {
            Self::Updated(key) | Self::Invalidated(key) | Self::Removed(key) => key,
        }
    }
}

/// Snapshot of one cache entry's state.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub data: Option<Value>,
    pub error: Option<SyncError>,
    pub stale: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CacheSlot {
    data: Option<Value>,
    error: Option<SyncError>,
    stale: bool,
    updated_at: DateTime<Utc>,
}

impl CacheSlot {
    fn empty() -> Self {
        Self {
            data: None,
            error: None,
            stale: false,
            updated_at: Utc::now(),
        }
    }
}

/// Thread-safe in-memory cache host.
pub struct InMemoryCacheHost {
    slots: RwLock<HashMap<QueryKey, CacheSlot>>,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for InMemoryCacheHost {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCacheHost {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            slots: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to cache notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Full state of an entry.
    pub fn snapshot(&self, key: &QueryKey) -> SyncResult<Option<EntrySnapshot>> {
        let slots = self.slots.read().map_err(|_| CacheError::LockPoisoned)?;
        Ok(slots.get(key).map(|slot| EntrySnapshot {
            data: slot.data.clone(),
            error: slot.error.clone(),
            stale: slot.stale,
            updated_at: slot.updated_at,
        }))
    }

    /// Drop an entry entirely.
    pub fn remove(&self, key: &QueryKey) -> SyncResult<bool> {
        let removed = {
            let mut slots = self.slots.write().map_err(|_| CacheError::LockPoisoned)?;
            slots.remove(key).is_some()
        };
        if removed {
            self.notify(CacheEvent::Removed(key.clone()));
        }
        Ok(removed)
    }

    /// Keys currently marked stale.
    pub fn stale_keys(&self) -> SyncResult<Vec<QueryKey>> {
        let slots = self.slots.read().map_err(|_| CacheError::LockPoisoned)?;
        Ok(slots
            .iter()
            .filter(|(_, slot)| slot.stale)
            .map(|(key, _)| key.clone())
            .collect())
    }

    pub fn len(&self) -> usize {
        self.slots.read().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, event: CacheEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }
}

impl CacheHost for InMemoryCacheHost {
    fn get(&self, key: &QueryKey) -> SyncResult<Option<Value>> {
        let slots = self.slots.read().map_err(|_| CacheError::LockPoisoned)?;
        Ok(slots.get(key).and_then(|slot| slot.data.clone()))
    }

    fn set(&self, key: &QueryKey, value: Value) -> SyncResult<()> {
        {
            let mut slots = self.slots.write().map_err(|_| CacheError::LockPoisoned)?;
            let slot = slots.entry(key.clone()).or_insert_with(CacheSlot::empty);
            slot.data = Some(value);
            slot.error = None;
            slot.stale = false;
            slot.updated_at = Utc::now();
        }
        tracing::trace!(key = %key, "cache entry updated");
        self.notify(CacheEvent::Updated(key.clone()));
        Ok(())
    }

    fn invalidate(&self, key: &QueryKey) -> SyncResult<()> {
        let found = {
            let mut slots = self.slots.write().map_err(|_| CacheError::LockPoisoned)?;
            match slots.get_mut(key) {
                Some(slot) => {
                    slot.stale = true;
                    true
                }
                None => false,
            }
        };
        if found {
            tracing::trace!(key = %key, "cache entry invalidated");
            self.notify(CacheEvent::Invalidated(key.clone()));
        }
        Ok(())
    }

    fn list_keys(&self, predicate: &dyn Fn(&QueryKey) -> bool) -> SyncResult<Vec<QueryKey>> {
        let slots = self.slots.read().map_err(|_| CacheError::LockPoisoned)?;
        Ok(slots.keys().filter(|key| predicate(key)).cloned().collect())
    }

    fn set_error(&self, key: &QueryKey, error: SyncError) -> SyncResult<()> {
        {
            let mut slots = self.slots.write().map_err(|_| CacheError::LockPoisoned)?;
            let slot = slots.entry(key.clone()).or_insert_with(CacheSlot::empty);
            slot.error = Some(error);
            slot.updated_at = Utc::now();
        }
        self.notify(CacheEvent::Updated(key.clone()));
        Ok(())
    }

    fn is_errored(&self, key: &QueryKey) -> SyncResult<bool> {
        let slots = self.slots.read().map_err(|_| CacheError::LockPoisoned)?;
        Ok(slots.get(key).is_some_and(|slot| slot.error.is_some()))
    }
}
