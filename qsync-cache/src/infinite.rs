//! Infinite query entries.
//!
//! An infinite query caches every page it has loaded together with the
//! arguments each page was fetched with: `{ pages: [..], pageParams: [..] }`.

use qsync_core::{CacheError, QueryKey, SyncResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decoded infinite query entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfiniteData {
    pub pages: Vec<Value>,
    #[serde(default)]
    pub page_params: Vec<Value>,
}

impl InfiniteData {
    /// First page loaded with `param`.
    pub fn first(page: Value, param: Value) -> Self {
        Self {
            pages: vec![page],
            page_params: vec![param],
        }
    }

    /// Decode an entry cached under `key`.
    pub fn from_entry(key: &QueryKey, entry: &Value) -> SyncResult<Self> {
        serde_json::from_value(entry.clone()).map_err(|e| {
            CacheError::InvalidInfiniteEntry {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn push_page(&mut self, page: Value, param: Value) {
        self.pages.push(page);
        self.page_params.push(param);
    }

    pub fn into_value(self) -> Value {
        serde_json::json!({
            "pages": self.pages,
            "pageParams": self.page_params,
        })
    }
}
