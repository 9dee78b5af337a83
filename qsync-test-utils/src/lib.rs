//! qsync Test Utilities
//!
//! Centralized test infrastructure for the qsync workspace:
//! - A scripted in-memory server implementing the transport
//! - Proptest generators for query arguments and cached rows
//! - Model metadata fixtures for a small blog schema
//! - Custom assertions for optimistic markers

pub use qsync_cache::{CacheHost, InMemoryCacheHost};
pub use qsync_core::{
    Endpoint, Envelope, KeyFlags, ModelInfo, ModelMeta, QueryKey, SyncError, SyncResult,
    Transport, TransportError, TransportRequest, OPTIMISTIC_MARKER,
};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Base URL the scripted server answers on.
pub const TEST_ENDPOINT: &str = "http://localhost/api/model";

// ============================================================================
// SCRIPTED SERVER
// ============================================================================

type Handler = Arc<dyn Fn(Option<&Value>) -> Result<Value, TransportError> + Send + Sync>;

/// In-memory server answering `{endpoint}/{model}/{operation}` requests from
/// scripted handlers and counting every call it receives.
///
/// Requests to unscripted routes fail with status 404.
#[derive(Default)]
pub struct MockServer {
    routes: Mutex<HashMap<String, Handler>>,
    calls: Mutex<HashMap<String, usize>>,
    payloads: Mutex<HashMap<String, Vec<Option<Value>>>>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(TEST_ENDPOINT)
    }

    /// Always reply with `data`.
    pub fn reply(&self, model: &str, operation: &str, data: Value) {
        self.route(model, operation, Arc::new(move |_| Ok(data.clone())));
    }

    /// Reply with whatever `handler` computes from the request payload.
    pub fn reply_with<F>(&self, model: &str, operation: &str, handler: F)
    where
        F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
    {
        self.route(model, operation, Arc::new(move |payload| Ok(handler(payload))));
    }

    /// Always fail with `status`.
    pub fn fail(&self, model: &str, operation: &str, status: u16) {
        let url = format!("{}/{}/{}", TEST_ENDPOINT, model, operation);
        self.route(
            model,
            operation,
            Arc::new(move |_| {
                Err(TransportError::Status {
                    url: url.clone(),
                    status,
                    body: "scripted failure".to_string(),
                })
            }),
        );
    }

    /// Number of requests received for a route.
    pub fn calls(&self, model: &str, operation: &str) -> usize {
        let calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.get(&route_key(model, operation)).copied().unwrap_or(0)
    }

    /// Payload of the most recent request for a route.
    pub fn last_payload(&self, model: &str, operation: &str) -> Option<Value> {
        let payloads = self.payloads.lock().unwrap_or_else(PoisonError::into_inner);
        payloads
            .get(&route_key(model, operation))
            .and_then(|all| all.last().cloned())
            .flatten()
    }

    fn route(&self, model: &str, operation: &str, handler: Handler) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.insert(route_key(model, operation), handler);
    }
}

fn route_key(model: &str, operation: &str) -> String {
    format!("{}/{}", model, operation)
}

#[async_trait]
impl Transport for MockServer {
    async fn send(&self, request: TransportRequest) -> Result<Envelope, TransportError> {
        let route = request
            .url
            .strip_prefix(TEST_ENDPOINT)
            .unwrap_or(&request.url)
            .trim_start_matches('/')
            .to_string();

        {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            *calls.entry(route.clone()).or_insert(0) += 1;
            let mut payloads = self.payloads.lock().unwrap_or_else(PoisonError::into_inner);
            payloads
                .entry(route.clone())
                .or_default()
                .push(request.payload.clone());
        }

        let handler = {
            let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            routes.get(&route).cloned()
        };
        match handler {
            Some(handler) => handler(request.payload.as_ref()).map(Envelope::new),
            None => Err(TransportError::Status {
                url: request.url,
                status: 404,
                body: format!("no route for {}", route),
            }),
        }
    }
}

/// Server-side rows shared between a test and its handlers.
pub type SharedRows = Arc<Mutex<Value>>;

pub fn shared_rows(rows: Value) -> SharedRows {
    Arc::new(Mutex::new(rows))
}

/// Current contents of shared rows.
pub fn read_rows(rows: &SharedRows) -> Value {
    rows.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest generators for qsync values.

    use proptest::prelude::*;
    use serde_json::{json, Map, Value};

    /// Generate a JSON scalar.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            (-1000i64..1000).prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::String),
        ]
    }

    /// Generate an arbitrary JSON tree.
    pub fn arb_json() -> impl Strategy<Value = Value> {
        arb_scalar().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,5}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    /// Generate `findMany` style query arguments.
    pub fn arb_query_args() -> impl Strategy<Value = Value> {
        (
            prop::option::of("[a-z]{1,6}"),
            any::<bool>(),
            prop::option::of(1u32..50),
        )
            .prop_map(|(name, include_posts, take)| {
                let mut args = Map::new();
                if let Some(name) = name {
                    args.insert("where".to_string(), json!({ "name": name }));
                }
                if include_posts {
                    args.insert("include".to_string(), json!({ "posts": true }));
                }
                if let Some(take) = take {
                    args.insert("take".to_string(), json!(take));
                }
                Value::Object(args)
            })
    }

    /// Generate a cached `User` row set with unique string ids.
    pub fn arb_user_rows() -> impl Strategy<Value = Value> {
        prop::collection::vec("[a-z]{1,8}", 0..6).prop_map(|names| {
            Value::Array(
                names
                    .into_iter()
                    .enumerate()
                    .map(|(i, name)| json!({ "id": (i + 1).to_string(), "name": name, "posts": [] }))
                    .collect(),
            )
        })
    }

    /// Generate a `User.update` payload targeting one of the first ids.
    pub fn arb_user_update() -> impl Strategy<Value = Value> {
        (1usize..8, "[a-z]{1,8}").prop_map(|(id, name)| {
            json!({ "where": { "id": id.to_string() }, "data": { "name": name } })
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built metadata and rows for a small blog schema.
    //!
    //! `User 1-n Post` (Post owns `ownerId`), `User 1-1 Profile` (Profile owns
    //! `userId`, integer ids), `Video` extends `Asset`.

    use super::*;
    use serde_json::json;

    /// Metadata of the blog schema.
    pub fn blog_meta() -> ModelMeta {
        ModelMeta::new()
            .with_model(
                ModelInfo::new("User")
                    .id("id", "String")
                    .scalar("name", "String")
                    .optional("email", "String")
                    .to_many("posts", "Post", "owner")
                    .to_one("profile", "Profile", "user"),
            )
            .with_model(
                ModelInfo::new("Post")
                    .id("id", "String")
                    .scalar("title", "String")
                    .with_default("published", "Boolean", json!(false))
                    .with_default("views", "Int", json!(0))
                    .optional("ownerId", "String")
                    .owns_one("owner", "User", "posts", &[("id", "ownerId")]),
            )
            .with_model(
                ModelInfo::new("Profile")
                    .id("id", "Int")
                    .optional("bio", "String")
                    .optional("userId", "String")
                    .owns_one("user", "User", "profile", &[("id", "userId")]),
            )
            .with_model(
                ModelInfo::new("Asset")
                    .id("id", "String")
                    .timestamp("createdAt")
                    .updated_at("updatedAt"),
            )
            .with_model(
                ModelInfo::new("Video")
                    .id("id", "String")
                    .scalar("url", "String")
                    .extends("Asset"),
            )
    }

    pub fn user(id: &str, name: &str) -> Value {
        json!({ "id": id, "name": name })
    }

    pub fn user_with_posts(id: &str, name: &str, posts: Vec<Value>) -> Value {
        json!({ "id": id, "name": name, "posts": posts })
    }

    pub fn post(id: &str, title: &str, owner_id: Option<&str>) -> Value {
        json!({ "id": id, "title": title, "ownerId": owner_id })
    }

    /// Shared metadata handle.
    pub fn shared_meta() -> Arc<ModelMeta> {
        Arc::new(blog_meta())
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for optimistic markers and cached entry shapes.

    use super::*;

    /// Assert that an entity carries the optimistic marker.
    #[track_caller]
    pub fn assert_optimistic(entity: &Value) {
        assert_eq!(
            entity.get(OPTIMISTIC_MARKER),
            Some(&Value::Bool(true)),
            "Expected optimistic marker on {}",
            entity
        );
    }

    /// Assert that no object anywhere in `value` carries the marker.
    #[track_caller]
    pub fn assert_no_markers(value: &Value) {
        assert!(
            !has_marker(value),
            "Expected no optimistic markers in {}",
            value
        );
    }

    /// Whether any object in `value` carries the marker.
    pub fn has_marker(value: &Value) -> bool {
        match value {
            Value::Object(map) => {
                map.contains_key(OPTIMISTIC_MARKER) || map.values().any(has_marker)
            }
            Value::Array(items) => items.iter().any(has_marker),
            _ => false,
        }
    }

    /// Assert that a cached entry is an array of `len` items.
    #[track_caller]
    pub fn assert_len(value: &Value, len: usize) {
        match value.as_array() {
            Some(items) => assert_eq!(items.len(), len, "Unexpected length of {}", value),
            None => panic!("Expected an array, got {}", value),
        }
    }

    /// Assert that `actual` contains every field of `expected` with equal
    /// values. Nested objects are compared the same way.
    #[track_caller]
    pub fn assert_matches(actual: &Value, expected: &Value) {
        assert!(
            matches_object(actual, expected),
            "Expected {} to match {}",
            actual,
            expected
        );
    }

    fn matches_object(actual: &Value, expected: &Value) -> bool {
        match (actual, expected) {
            (Value::Object(actual), Value::Object(expected)) => expected.iter().all(|(k, v)| {
                actual.get(k).is_some_and(|a| matches_object(a, v))
            }),
            (a, e) => a == e,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
