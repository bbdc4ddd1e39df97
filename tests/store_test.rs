use colloquy::store;
use colloquy::types::*;
use sqlx::sqlite::SqlitePoolOptions;
use std::time::Duration;
use tempfile::tempdir;

// A single connection keeps every query on the same in-memory database.
async fn memory_pool() -> store::DbPool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    store::run_migrations(&pool).await.unwrap();
    pool
}

fn new_conversation(id: &str, title: &str) -> NewConversation {
    NewConversation {
        id: Some(id.to_string()),
        title: title.to_string(),
        model: "claude-sonnet-4-20250514".to_string(),
        system: String::new(),
    }
}

// Millisecond timestamps need a beat between writes to order deterministically.
async fn tick() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test]
async fn test_create_and_fetch_roundtrip() {
    let pool = memory_pool().await;
    let created = store::create_conversation(&pool, "alice", &new_conversation("c-1", "hi"))
        .await
        .unwrap();
    assert_eq!(created.id, "c-1");
    assert_eq!(created.created_at, created.updated_at);

    let fetched = store::fetch_conversation(&pool, "alice", "c-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.id, "c-1");
    assert_eq!(fetched.title, "hi");
    assert_eq!(fetched.model, "claude-sonnet-4-20250514");
    assert!(fetched.turns.is_empty());
}

#[tokio::test]
async fn test_missing_conversation_fetches_none() {
    let pool = memory_pool().await;
    assert!(store::fetch_conversation(&pool, "alice", "nope")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_server_assigns_id_when_absent() {
    let pool = memory_pool().await;
    let request = NewConversation {
        id: None,
        title: "untitled".to_string(),
        model: "claude-sonnet-4-20250514".to_string(),
        system: String::new(),
    };
    let created = store::create_conversation(&pool, "alice", &request)
        .await
        .unwrap();
    assert!(!created.id.is_empty());
}

#[tokio::test]
async fn test_turns_come_back_in_append_order_with_usage() {
    let pool = memory_pool().await;
    store::create_conversation(&pool, "alice", &new_conversation("c-1", "hi"))
        .await
        .unwrap();

    assert!(store::append_turn(&pool, "alice", "c-1", &Turn::user("hi"))
        .await
        .unwrap());
    let mut reply = Turn::assistant("Hello");
    reply.usage = Some(Usage {
        input_tokens: Some(10),
        output_tokens: Some(5),
        ..Default::default()
    });
    assert!(store::append_turn(&pool, "alice", "c-1", &reply)
        .await
        .unwrap());

    let fetched = store::fetch_conversation(&pool, "alice", "c-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.turns.len(), 2);
    assert_eq!(fetched.turns[0].role, Role::User);
    assert_eq!(fetched.turns[0].flattened_text(), "hi");
    assert!(!fetched.turns[0].streaming);
    assert_eq!(fetched.turns[1].role, Role::Assistant);
    assert_eq!(fetched.turns[1].flattened_text(), "Hello");
    assert_eq!(fetched.turns[1].usage, reply.usage);
}

#[tokio::test]
async fn test_append_bumps_parent_recency() {
    let pool = memory_pool().await;
    store::create_conversation(&pool, "alice", &new_conversation("c-a", "a"))
        .await
        .unwrap();
    tick().await;
    store::create_conversation(&pool, "alice", &new_conversation("c-b", "b"))
        .await
        .unwrap();

    let listed = store::list_conversations(&pool, "alice").await.unwrap();
    assert_eq!(listed[0].id, "c-b");
    assert_eq!(listed[1].id, "c-a");

    tick().await;
    store::append_turn(&pool, "alice", "c-a", &Turn::user("bump"))
        .await
        .unwrap();

    let listed = store::list_conversations(&pool, "alice").await.unwrap();
    assert_eq!(listed[0].id, "c-a");
    assert_eq!(listed[1].id, "c-b");
}

#[tokio::test]
async fn test_append_to_missing_conversation_returns_false() {
    let pool = memory_pool().await;
    assert!(!store::append_turn(&pool, "alice", "ghost", &Turn::user("hi"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_patch_updates_named_fields_only() {
    let pool = memory_pool().await;
    let created = store::create_conversation(&pool, "alice", &new_conversation("c-1", "old"))
        .await
        .unwrap();
    tick().await;

    let patch = ConversationPatch {
        title: Some("renamed".to_string()),
        model: None,
        system: None,
    };
    let summary = store::patch_conversation(&pool, "alice", "c-1", &patch)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.title, "renamed");
    assert_eq!(summary.model, "claude-sonnet-4-20250514");
    assert!(summary.updated_at > created.updated_at);

    let missing = store::patch_conversation(&pool, "alice", "ghost", &patch)
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_delete_takes_turns_with_it() {
    let pool = memory_pool().await;
    store::create_conversation(&pool, "alice", &new_conversation("c-1", "hi"))
        .await
        .unwrap();
    store::append_turn(&pool, "alice", "c-1", &Turn::user("hi"))
        .await
        .unwrap();
    store::append_turn(&pool, "alice", "c-1", &Turn::assistant("yo"))
        .await
        .unwrap();

    assert!(store::delete_conversation(&pool, "alice", "c-1")
        .await
        .unwrap());
    assert!(store::fetch_conversation(&pool, "alice", "c-1")
        .await
        .unwrap()
        .is_none());

    let orphans: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM messages WHERE conversation_id = 'c-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(orphans.0, 0);

    assert!(!store::delete_conversation(&pool, "alice", "c-1")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_rows_are_scoped_to_their_owner() {
    let pool = memory_pool().await;
    store::create_conversation(&pool, "alice", &new_conversation("c-1", "mine"))
        .await
        .unwrap();

    assert!(store::list_conversations(&pool, "bob").await.unwrap().is_empty());
    assert!(store::fetch_conversation(&pool, "bob", "c-1")
        .await
        .unwrap()
        .is_none());
    assert!(!store::append_turn(&pool, "bob", "c-1", &Turn::user("hi"))
        .await
        .unwrap());
    assert!(!store::delete_conversation(&pool, "bob", "c-1")
        .await
        .unwrap());
    assert!(store::patch_conversation(
        &pool,
        "bob",
        "c-1",
        &ConversationPatch {
            title: Some("stolen".to_string()),
            model: None,
            system: None,
        }
    )
    .await
    .unwrap()
    .is_none());

    // Alice is unaffected
    let fetched = store::fetch_conversation(&pool, "alice", "c-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.title, "mine");
}

#[tokio::test]
async fn test_init_db_builds_schema_on_disk() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_colloquy.db");

    let pool = store::init_db(&db_path).await.unwrap();

    let journal_mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(journal_mode.0.to_uppercase(), "WAL");

    let tables: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table'")
            .fetch_all(&pool)
            .await
            .unwrap();
    let table_names: Vec<String> = tables.into_iter().map(|t| t.0).collect();
    assert!(table_names.contains(&"conversations".to_string()));
    assert!(table_names.contains(&"messages".to_string()));
    assert!(table_names.contains(&"schema_metadata".to_string()));

    let version: (String,) =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(version.0, "1");
}
