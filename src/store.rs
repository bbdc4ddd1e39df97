use crate::constants::DB_PRAGMAS;
use crate::types::{
    ColloquyError, Conversation, ConversationPatch, ConversationSummary, NewConversation, Result,
    Role, Turn, TurnContent, Usage,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(ColloquyError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(ColloquyError::Database(e).into()),
    };

    configure_db(&pool).await?;
    run_migrations(&pool).await?;
    verify_schema_version(&pool).await;

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(ColloquyError::Database(e).into());
        }
    }
    Ok(())
}

/// Applies the schema in `migrations/`. Public so tests can run it against
/// in-memory pools.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    if let Err(e) = sqlx::migrate!("./migrations").run(pool).await {
        return Err(ColloquyError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub async fn list_conversations(pool: &DbPool, username: &str) -> Result<Vec<ConversationSummary>> {
    let rows = sqlx::query(
        "SELECT id, title, model, created_at, updated_at FROM conversations \
         WHERE username = ? ORDER BY updated_at DESC",
    )
    .bind(username)
    .fetch_all(pool)
    .await?;

    let mut summaries = Vec::with_capacity(rows.len());
    for row in &rows {
        summaries.push(ConversationSummary {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            model: row.try_get("model")?,
            created_at: from_millis(row.try_get("created_at")?),
            updated_at: from_millis(row.try_get("updated_at")?),
        });
    }
    Ok(summaries)
}

pub async fn fetch_conversation(
    pool: &DbPool,
    username: &str,
    id: &str,
) -> Result<Option<Conversation>> {
    let row = sqlx::query(
        "SELECT id, title, model, system, created_at, updated_at FROM conversations \
         WHERE id = ? AND username = ?",
    )
    .bind(id)
    .bind(username)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(r) => {
            let conversation = Conversation {
                id: r.try_get("id")?,
                title: r.try_get("title")?,
                model: r.try_get("model")?,
                system: r.try_get("system")?,
                created_at: from_millis(r.try_get("created_at")?),
                updated_at: from_millis(r.try_get("updated_at")?),
                turns: fetch_turns(pool, id).await?,
            };
            Ok(Some(conversation))
        }
        None => Ok(None),
    }
}

async fn fetch_turns(pool: &DbPool, conversation_id: &str) -> Result<Vec<Turn>> {
    let rows = sqlx::query(
        "SELECT role, content, usage FROM messages WHERE conversation_id = ? ORDER BY id",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    let mut turns = Vec::with_capacity(rows.len());
    for row in &rows {
        let role: String = row.try_get("role")?;
        let usage = match row.try_get::<Option<String>, _>("usage")? {
            Some(raw) => match serde_json::from_str::<Usage>(&raw) {
                Ok(u) => Some(u),
                Err(e) => {
                    tracing::debug!("Dropping unreadable usage record: {}", e);
                    None
                }
            },
            None => None,
        };
        turns.push(Turn {
            role: role.parse::<Role>()?,
            content: TurnContent::Text(row.try_get("content")?),
            usage,
            streaming: false,
        });
    }
    Ok(turns)
}

pub async fn create_conversation(
    pool: &DbPool,
    username: &str,
    req: &NewConversation,
) -> Result<Conversation> {
    let id = req
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let now_ms = now_millis();

    sqlx::query(
        "INSERT INTO conversations (id, username, title, model, system, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(username)
    .bind(&req.title)
    .bind(&req.model)
    .bind(&req.system)
    .bind(now_ms)
    .bind(now_ms)
    .execute(pool)
    .await?;

    Ok(Conversation {
        id,
        title: req.title.clone(),
        model: req.model.clone(),
        system: req.system.clone(),
        created_at: from_millis(now_ms),
        updated_at: from_millis(now_ms),
        turns: Vec::new(),
    })
}

pub async fn patch_conversation(
    pool: &DbPool,
    username: &str,
    id: &str,
    patch: &ConversationPatch,
) -> Result<Option<ConversationSummary>> {
    let row = sqlx::query(
        "SELECT title, model, system, created_at FROM conversations WHERE id = ? AND username = ?",
    )
    .bind(id)
    .bind(username)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    let title = match &patch.title {
        Some(t) => t.clone(),
        None => row.try_get("title")?,
    };
    let model = match &patch.model {
        Some(m) => m.clone(),
        None => row.try_get("model")?,
    };
    let system: String = match &patch.system {
        Some(s) => s.clone(),
        None => row.try_get("system")?,
    };
    let created_at: i64 = row.try_get("created_at")?;
    let now_ms = now_millis();

    sqlx::query(
        "UPDATE conversations SET title = ?, model = ?, system = ?, updated_at = ? \
         WHERE id = ? AND username = ?",
    )
    .bind(&title)
    .bind(&model)
    .bind(&system)
    .bind(now_ms)
    .bind(id)
    .bind(username)
    .execute(pool)
    .await?;

    Ok(Some(ConversationSummary {
        id: id.to_string(),
        title,
        model,
        created_at: from_millis(created_at),
        updated_at: from_millis(now_ms),
    }))
}

pub async fn delete_conversation(pool: &DbPool, username: &str, id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query("DELETE FROM conversations WHERE id = ? AND username = ?")
        .bind(id)
        .bind(username)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }

    // Turns go too even when the connection-level foreign_keys pragma is off.
    sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

/// Appends one finalized turn and bumps the parent's `updated_at`. Returns
/// false when the conversation does not exist for this user.
pub async fn append_turn(pool: &DbPool, username: &str, id: &str, turn: &Turn) -> Result<bool> {
    let content = turn.flattened_text().into_owned();
    let usage_json = match &turn.usage {
        Some(u) => Some(serde_json::to_string(u)?),
        None => None,
    };
    let now_ms = now_millis();

    let mut tx = pool.begin().await?;

    let bumped = sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ? AND username = ?")
        .bind(now_ms)
        .bind(id)
        .bind(username)
        .execute(&mut *tx)
        .await?;
    if bumped.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO messages (conversation_id, role, content, usage, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(turn.role.as_str())
    .bind(&content)
    .bind(&usage_json)
    .bind(now_ms)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}
