//! End-to-end scenarios: query client, mutation hooks and cache against the
//! scripted server.

use qsync_client::{
    MutationOperation, MutationOptions, ProviderResult, QueryClient, QueryKey, QueryOptions,
};
use qsync_test_utils::assertions::{assert_len, assert_matches, assert_no_markers, assert_optimistic};
use qsync_test_utils::fixtures::{post, shared_meta, user, user_with_posts};
use qsync_test_utils::{read_rows, shared_rows, CacheHost, MockServer, SharedRows, OPTIMISTIC_MARKER};
use serde_json::{json, Value};
use std::sync::Arc;

fn setup() -> (Arc<MockServer>, QueryClient) {
    let server = MockServer::new();
    let client = QueryClient::new(shared_meta(), server.clone(), server.endpoint());
    (server, client)
}

fn optimistic(invalidate: bool) -> MutationOptions {
    MutationOptions::new().optimistic(true).invalidate(invalidate)
}

/// Serve `User.findMany` from `rows` and append created users to it.
fn serve_users(server: &MockServer, rows: &SharedRows) {
    let read = rows.clone();
    server.reply_with("User", "findMany", move |_| read_rows(&read));

    let write = rows.clone();
    server.reply_with("User", "create", move |payload| {
        let mut rows = write.lock().unwrap();
        let list = rows.as_array_mut().unwrap();
        let mut created = payload.map(|p| p["data"].clone()).unwrap_or(json!({}));
        created["id"] = json!((list.len() + 1).to_string());
        list.push(created.clone());
        created
    });
}

async fn cache(client: &QueryClient, model: &str, operation: &str, args: Option<Value>, options: QueryOptions) -> QueryKey {
    let state = client
        .query(model, operation, args, options)
        .await
        .expect("query");
    assert!(state.is_success, "query {}.{} failed: {:?}", model, operation, state.error);
    state.key
}

fn cached(client: &QueryClient, key: &QueryKey) -> Value {
    client.host().get(key).expect("host").expect("entry")
}

// ============================================================================
// QUERIES
// ============================================================================

#[tokio::test]
async fn test_simple_query() {
    let (server, client) = setup();
    server.reply("User", "findUnique", user("1", "foo"));

    let state = client
        .query("User", "findUnique", Some(json!({ "where": { "id": "1" } })), QueryOptions::default())
        .await
        .expect("query");
    assert!(state.is_success);
    assert_eq!(state.data, Some(user("1", "foo")));
}

#[tokio::test]
async fn test_infinite_query() {
    let (server, client) = setup();
    server.reply("User", "findMany", json!([user("1", "foo")]));

    let state = client
        .infinite_query("User", "findMany", None, QueryOptions::default())
        .await
        .expect("query");
    let data = state.data.expect("data");
    assert_eq!(data["pages"], json!([[user("1", "foo")]]));
}

// ============================================================================
// INVALIDATION
// ============================================================================

#[tokio::test]
async fn test_independent_mutation_does_not_refetch() {
    let (server, client) = setup();
    server.reply("User", "findMany", json!([user("1", "foo")]));
    server.reply("Post", "create", post("p1", "t", None));
    cache(&client, "User", "findMany", None, QueryOptions::default()).await;

    client
        .mutation("Post", MutationOperation::Create)
        .mutate_async(json!({ "data": { "title": "t" } }))
        .await
        .expect("mutation");
    assert_eq!(server.calls("User", "findMany"), 1);
}

#[tokio::test]
async fn test_create_with_invalidation() {
    let (server, client) = setup();
    let rows = shared_rows(json!([]));
    serve_users(&server, &rows);
    let key = cache(&client, "User", "findMany", None, QueryOptions::default()).await;

    client
        .mutation("User", MutationOperation::Create)
        .mutate_async(json!({ "data": { "name": "foo" } }))
        .await
        .expect("mutation");

    assert_eq!(cached(&client, &key), read_rows(&rows));
    assert_len(&cached(&client, &key), 1);
    assert_eq!(server.calls("User", "findMany"), 2);
}

#[tokio::test]
async fn test_create_without_invalidation() {
    let (server, client) = setup();
    let rows = shared_rows(json!([]));
    serve_users(&server, &rows);
    let key = cache(&client, "User", "findMany", None, QueryOptions::default()).await;

    client
        .mutation("User", MutationOperation::Create)
        .with_options(MutationOptions::new().invalidate(false))
        .mutate_async(json!({ "data": { "name": "foo" } }))
        .await
        .expect("mutation");

    assert_eq!(cached(&client, &key), json!([]));
    assert_eq!(server.calls("User", "findMany"), 1);
}

#[tokio::test]
async fn test_update_and_delete_with_invalidation() {
    let (server, client) = setup();
    let rows = shared_rows(json!([user("1", "foo"), user("2", "bar")]));
    serve_users(&server, &rows);
    let key = cache(&client, "User", "findMany", None, QueryOptions::default()).await;

    let write = rows.clone();
    server.reply_with("User", "update", move |_| {
        let mut rows = write.lock().unwrap();
        rows[0]["name"] = json!("baz");
        rows[0].clone()
    });
    client
        .mutation("User", MutationOperation::Update)
        .mutate_async(json!({ "where": { "id": "1" }, "data": { "name": "baz" } }))
        .await
        .expect("update");
    assert_eq!(cached(&client, &key)[0]["name"], json!("baz"));

    let write = rows.clone();
    server.reply_with("User", "delete", move |_| {
        let mut rows = write.lock().unwrap();
        rows.as_array_mut().unwrap().remove(0)
    });
    client
        .mutation("User", MutationOperation::Delete)
        .mutate_async(json!({ "where": { "id": "1" } }))
        .await
        .expect("delete");
    assert_eq!(cached(&client, &key), json!([user("2", "bar")]));
    assert_eq!(server.calls("User", "findMany"), 3);
}

#[tokio::test]
async fn test_nested_read_invalidated_by_related_mutation() {
    let (server, client) = setup();
    server.reply("Post", "findMany", json!([]));
    server.reply("User", "update", user("1", "bar"));
    let key = cache(
        &client,
        "Post",
        "findMany",
        Some(json!({ "include": { "owner": true } })),
        QueryOptions::default(),
    )
    .await;
    server.reply("Post", "count", json!(0));
    let plain = cache(&client, "Post", "count", None, QueryOptions::default()).await;

    client
        .mutation("User", MutationOperation::Update)
        .mutate_async(json!({ "where": { "id": "1" }, "data": { "name": "bar" } }))
        .await
        .expect("mutation");

    assert_eq!(server.calls("Post", "findMany"), 2);
    assert!(client.query_state(&key).expect("state").is_success);
    assert_eq!(server.calls("Post", "count"), 1);
    assert!(!client.query_state(&plain).expect("state").is_stale);
}

#[tokio::test]
async fn test_nested_write_invalidates_top_level_query() {
    let (server, client) = setup();
    server.reply("Post", "findMany", json!([]));
    server.reply("User", "update", user("1", "foo"));
    cache(&client, "Post", "findMany", None, QueryOptions::default()).await;

    client
        .mutation("User", MutationOperation::Update)
        .mutate_async(json!({ "where": { "id": "1" }, "data": { "posts": { "create": { "title": "t" } } } }))
        .await
        .expect("mutation");
    assert_eq!(server.calls("Post", "findMany"), 2);
}

// ============================================================================
// OPTIMISTIC CREATE
// ============================================================================

#[tokio::test]
async fn test_optimistic_create_visible_before_response() {
    let (server, client) = setup();
    server.reply("User", "findMany", json!([]));
    server.reply("User", "create", user("1", "foo"));
    let key = cache(&client, "User", "findMany", None, QueryOptions::optimistic()).await;

    let task = client
        .mutation("User", MutationOperation::Create)
        .with_options(optimistic(false))
        .mutate(json!({ "data": { "name": "foo" } }))
        .expect("mutate");

    let data = cached(&client, &key);
    assert_len(&data, 1);
    assert_matches(&data[0], &json!({ "name": "foo" }));
    assert_optimistic(&data[0]);

    let result = task.await.expect("task").expect("mutation");
    assert_eq!(result, Some(user("1", "foo")));
    assert_optimistic(&cached(&client, &key)[0]);
}

#[tokio::test]
async fn test_optimistic_create_into_nested_collection() {
    let (server, client) = setup();
    server.reply(
        "User",
        "findMany",
        json!([user_with_posts("1", "foo", vec![]), user_with_posts("2", "bar", vec![])]),
    );
    server.reply("Post", "create", post("p1", "t", Some("1")));
    let key = cache(
        &client,
        "User",
        "findMany",
        Some(json!({ "include": { "posts": true } })),
        QueryOptions::optimistic(),
    )
    .await;

    client
        .mutation("Post", MutationOperation::Create)
        .with_options(optimistic(false))
        .mutate_async(json!({ "data": { "title": "t", "owner": { "connect": { "id": "1" } } } }))
        .await
        .expect("mutation");

    let data = cached(&client, &key);
    assert_len(&data[0]["posts"], 1);
    assert_matches(&data[0]["posts"][0], &json!({ "title": "t", "ownerId": "1" }));
    assert_optimistic(&data[0]["posts"][0]);
    assert_len(&data[1]["posts"], 0);
}

#[tokio::test]
async fn test_optimistic_nested_create_under_update() {
    let (server, client) = setup();
    server.reply("User", "findUnique", user_with_posts("1", "foo", vec![]));
    server.reply("User", "update", user("1", "foo"));
    let key = cache(
        &client,
        "User",
        "findUnique",
        Some(json!({ "where": { "id": "1" }, "include": { "posts": true } })),
        QueryOptions::optimistic(),
    )
    .await;

    client
        .mutation("User", MutationOperation::Update)
        .with_options(optimistic(false))
        .mutate_async(json!({ "where": { "id": "1" }, "data": { "posts": { "create": { "title": "t" } } } }))
        .await
        .expect("mutation");

    let data = cached(&client, &key);
    assert_len(&data["posts"], 1);
    assert_matches(&data["posts"][0], &json!({ "title": "t", "ownerId": "1" }));
}

#[tokio::test]
async fn test_optimistic_create_many() {
    let (server, client) = setup();
    server.reply("Post", "findMany", json!([post("p0", "old", None)]));
    server.reply("Post", "createMany", json!({ "count": 2 }));
    let key = cache(&client, "Post", "findMany", None, QueryOptions::optimistic()).await;

    client
        .mutation("Post", MutationOperation::CreateMany)
        .with_options(optimistic(false))
        .mutate_async(json!({ "data": [{ "title": "a" }, { "title": "b" }] }))
        .await
        .expect("mutation");

    let data = cached(&client, &key);
    assert_len(&data, 3);
    assert_eq!(data[2], post("p0", "old", None));
    assert!(data[0].get(OPTIMISTIC_MARKER).is_some());
    assert!(data[1].get(OPTIMISTIC_MARKER).is_some());
}

// ============================================================================
// OPTIMISTIC UPDATE / UPSERT / DELETE
// ============================================================================

#[tokio::test]
async fn test_optimistic_update_simple() {
    let (server, client) = setup();
    server.reply("User", "findUnique", user("1", "foo"));
    server.reply("User", "update", user("1", "bar"));
    let key = cache(
        &client,
        "User",
        "findUnique",
        Some(json!({ "where": { "id": "1" } })),
        QueryOptions::optimistic(),
    )
    .await;

    client
        .mutation("User", MutationOperation::Update)
        .with_options(optimistic(false))
        .mutate_async(json!({ "where": { "id": "1" }, "data": { "name": "bar" } }))
        .await
        .expect("mutation");

    let data = cached(&client, &key);
    assert_eq!(data["name"], json!("bar"));
    assert_optimistic(&data);
}

#[tokio::test]
async fn test_optimistic_update_nested_read() {
    let (server, client) = setup();
    server.reply(
        "Post",
        "findMany",
        json!([{ "id": "p1", "title": "t", "ownerId": "1", "owner": user("1", "foo") }]),
    );
    server.reply("User", "update", user("1", "bar"));
    let key = cache(
        &client,
        "Post",
        "findMany",
        Some(json!({ "include": { "owner": true } })),
        QueryOptions::optimistic(),
    )
    .await;

    client
        .mutation("User", MutationOperation::Update)
        .with_options(optimistic(false))
        .mutate_async(json!({ "where": { "id": "1" }, "data": { "name": "bar" } }))
        .await
        .expect("mutation");

    let data = cached(&client, &key);
    assert_eq!(data[0]["owner"]["name"], json!("bar"));
    assert_optimistic(&data[0]["owner"]);
    assert!(data[0].get(OPTIMISTIC_MARKER).is_none());
}

#[tokio::test]
async fn test_optimistic_upsert_create_and_update() {
    let (server, client) = setup();
    server.reply("User", "findMany", json!([]));
    server.reply("User", "upsert", user("1", "foo"));
    let key = cache(&client, "User", "findMany", None, QueryOptions::optimistic()).await;
    let upsert = client
        .mutation("User", MutationOperation::Upsert)
        .with_options(optimistic(false));
    let payload = |name: &str| {
        json!({
            "where": { "id": "1" },
            "create": { "id": "1", "name": name },
            "update": { "name": name }
        })
    };

    upsert.mutate_async(payload("foo")).await.expect("create branch");
    let data = cached(&client, &key);
    assert_len(&data, 1);
    assert_matches(&data[0], &json!({ "id": "1", "name": "foo" }));

    upsert.mutate_async(payload("bar")).await.expect("update branch");
    let data = cached(&client, &key);
    assert_len(&data, 1);
    assert_matches(&data[0], &json!({ "id": "1", "name": "bar" }));
    assert_optimistic(&data[0]);
}

#[tokio::test]
async fn test_optimistic_upsert_nested() {
    let (server, client) = setup();
    server.reply(
        "User",
        "findUnique",
        user_with_posts("1", "foo", vec![post("p1", "old", Some("1"))]),
    );
    server.reply("User", "update", user("1", "foo"));
    let key = cache(
        &client,
        "User",
        "findUnique",
        Some(json!({ "where": { "id": "1" }, "include": { "posts": true } })),
        QueryOptions::optimistic(),
    )
    .await;
    let update = client
        .mutation("User", MutationOperation::Update)
        .with_options(optimistic(false));

    update
        .mutate_async(json!({
            "where": { "id": "1" },
            "data": { "posts": { "upsert": {
                "where": { "id": "p1" },
                "create": { "id": "p1", "title": "created" },
                "update": { "title": "updated" }
            } } }
        }))
        .await
        .expect("update branch");
    assert_eq!(cached(&client, &key)["posts"][0]["title"], json!("updated"));

    update
        .mutate_async(json!({
            "where": { "id": "1" },
            "data": { "posts": { "upsert": {
                "where": { "id": "p2" },
                "create": { "id": "p2", "title": "created" },
                "update": { "title": "updated" }
            } } }
        }))
        .await
        .expect("create branch");
    let data = cached(&client, &key);
    assert_len(&data["posts"], 2);
    assert_matches(&data["posts"][0], &json!({ "id": "p2", "title": "created", "ownerId": "1" }));
}

#[tokio::test]
async fn test_optimistic_delete_simple() {
    let (server, client) = setup();
    server.reply("User", "findMany", json!([user("1", "foo"), user("2", "bar")]));
    server.reply("User", "delete", user("1", "foo"));
    let key = cache(&client, "User", "findMany", None, QueryOptions::optimistic()).await;

    client
        .mutation("User", MutationOperation::Delete)
        .with_options(optimistic(false))
        .mutate_async(json!({ "where": { "id": "1" } }))
        .await
        .expect("mutation");
    assert_eq!(cached(&client, &key), json!([user("2", "bar")]));
}

#[tokio::test]
async fn test_optimistic_delete_nested() {
    let (server, client) = setup();
    server.reply(
        "User",
        "findUnique",
        user_with_posts("1", "foo", vec![post("p1", "a", Some("1")), post("p2", "b", Some("1"))]),
    );
    server.reply("Post", "delete", post("p1", "a", Some("1")));
    server.reply("User", "update", user("1", "foo"));
    let key = cache(
        &client,
        "User",
        "findUnique",
        Some(json!({ "where": { "id": "1" }, "include": { "posts": true } })),
        QueryOptions::optimistic(),
    )
    .await;

    client
        .mutation("Post", MutationOperation::Delete)
        .with_options(optimistic(false))
        .mutate_async(json!({ "where": { "id": "p1" } }))
        .await
        .expect("direct delete");
    assert_eq!(cached(&client, &key)["posts"], json!([post("p2", "b", Some("1"))]));

    client
        .mutation("User", MutationOperation::Update)
        .with_options(optimistic(false))
        .mutate_async(json!({ "where": { "id": "1" }, "data": { "posts": { "delete": { "id": "p2" } } } }))
        .await
        .expect("nested delete");
    assert_eq!(cached(&client, &key)["posts"], json!([]));
}

// ============================================================================
// PROVIDER HOOK
// ============================================================================

#[tokio::test]
async fn test_provider_skip_and_update() {
    let (server, client) = setup();
    server.reply("User", "findMany", json!([user("1", "foo")]));
    server.reply("Post", "findMany", json!([]));
    server.reply("User", "create", user("2", "bar"));
    let users = cache(&client, "User", "findMany", None, QueryOptions::optimistic()).await;
    let posts = cache(
        &client,
        "Post",
        "findMany",
        Some(json!({ "include": { "owner": true } })),
        QueryOptions::optimistic(),
    )
    .await;

    let options = optimistic(false).with_provider(|ctx| {
        if ctx.query_model == "User" {
            ProviderResult::Update(json!([{ "id": "custom", "$optimistic": true }]))
        } else {
            ProviderResult::Skip
        }
    });
    client
        .mutation("User", MutationOperation::Create)
        .with_options(options)
        .mutate_async(json!({ "data": { "name": "bar" } }))
        .await
        .expect("mutation");

    assert_eq!(cached(&client, &users), json!([{ "id": "custom", "$optimistic": true }]));
    assert_eq!(cached(&client, &posts), json!([]));
}

// ============================================================================
// FAILURE, CONCURRENCY, ABORT
// ============================================================================

#[tokio::test]
async fn test_failure_restores_exact_value() {
    let (server, client) = setup();
    let original = json!([user_with_posts("1", "foo", vec![post("p1", "a", Some("1"))])]);
    server.reply("User", "findMany", original.clone());
    server.fail("User", "update", 500);
    let key = cache(
        &client,
        "User",
        "findMany",
        Some(json!({ "include": { "posts": true } })),
        QueryOptions::optimistic(),
    )
    .await;

    let result = client
        .mutation("User", MutationOperation::Update)
        .with_options(optimistic(true))
        .mutate_async(json!({
            "where": { "id": "1" },
            "data": { "name": "bar", "posts": { "create": { "title": "b" } } }
        }))
        .await;

    assert!(result.is_err());
    assert_eq!(cached(&client, &key), original);
    assert_eq!(server.calls("User", "findMany"), 1);
}

#[tokio::test]
async fn test_concurrent_patches_compose() {
    let (server, client) = setup();
    server.reply("User", "findMany", json!([]));
    server.reply("User", "create", user("1", "x"));
    let key = cache(&client, "User", "findMany", None, QueryOptions::optimistic()).await;
    let create = client
        .mutation("User", MutationOperation::Create)
        .with_options(optimistic(false));

    let first = create.mutate(json!({ "data": { "name": "a" } })).expect("first");
    let second = create.mutate(json!({ "data": { "name": "b" } })).expect("second");

    let names: Vec<Value> = cached(&client, &key)
        .as_array()
        .expect("array")
        .iter()
        .map(|u| u["name"].clone())
        .collect();
    assert_eq!(names, vec![json!("b"), json!("a")]);

    first.await.expect("task").expect("first mutation");
    second.await.expect("task").expect("second mutation");
    assert_len(&cached(&client, &key), 2);
}

#[tokio::test]
async fn test_failed_mutation_keeps_other_pending_patch() {
    let (server, client) = setup();
    server.reply("User", "findMany", json!([]));
    server.fail("User", "create", 500);
    let key = cache(&client, "User", "findMany", None, QueryOptions::optimistic()).await;

    let pending_create = client
        .coordinator()
        .begin(
            qsync_mutation::MutationRequest::new(
                "User",
                MutationOperation::Create,
                json!({ "data": { "name": "kept" } }),
            )
            .with_options(optimistic(false)),
        )
        .expect("begin");
    let failing = client
        .mutation("User", MutationOperation::Create)
        .with_options(optimistic(false))
        .mutate(json!({ "data": { "name": "dropped" } }))
        .expect("mutate");
    assert_len(&cached(&client, &key), 2);

    assert!(failing.await.expect("task").is_err());
    let data = cached(&client, &key);
    assert_len(&data, 1);
    assert_eq!(data[0]["name"], json!("kept"));
    drop(pending_create);
    assert_eq!(cached(&client, &key), json!([]));
}

#[tokio::test]
async fn test_settled_optimistic_mutation_clears_markers() {
    let (server, client) = setup();
    let rows = shared_rows(json!([]));
    serve_users(&server, &rows);
    let key = cache(&client, "User", "findMany", None, QueryOptions::optimistic()).await;

    client
        .mutation("User", MutationOperation::Create)
        .with_options(optimistic(true))
        .mutate_async(json!({ "data": { "name": "foo" } }))
        .await
        .expect("mutation");

    let data = cached(&client, &key);
    assert_no_markers(&data);
    assert_eq!(data, read_rows(&rows));
}

#[tokio::test]
async fn test_next_page_under_pending_patch_then_failure_restores() {
    let (server, client) = setup();
    server.reply_with("User", "findMany", |args| match args.and_then(|a| a.get("skip")) {
        Some(_) => json!([user("2", "b")]),
        None => json!([user("1", "a")]),
    });
    server.fail("User", "create", 500);
    let key = client
        .infinite_query("User", "findMany", None, QueryOptions::optimistic())
        .await
        .expect("query")
        .key;

    let pending = client
        .coordinator()
        .begin(
            qsync_mutation::MutationRequest::new(
                "User",
                MutationOperation::Create,
                json!({ "data": { "name": "opt" } }),
            )
            .with_options(optimistic(false)),
        )
        .expect("begin");
    client
        .fetch_next_page(&key, json!({ "skip": 1 }))
        .await
        .expect("next page");

    let data = cached(&client, &key);
    assert_eq!(data["pages"][0][0]["name"], json!("opt"));
    assert_optimistic(&data["pages"][0][0]);
    assert_eq!(data["pages"][1], json!([user("2", "b")]));

    assert!(pending.run().await.is_err());
    let data = cached(&client, &key);
    assert_no_markers(&data);
    assert_eq!(data["pages"], json!([[user("1", "a")], [user("2", "b")]]));
}
