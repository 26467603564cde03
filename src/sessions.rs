//! Session persistence.
//!
//! [`SessionStore`] keeps sessions and their full message history in
//! SQLite and implements [`TurnLog`], the durable side of the memory
//! window. The first exchange of a session that was created without an
//! explicit name renames it after the user's message.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use docent_core::memory::{Exchange, TurnLog};
use docent_core::models::{Role, Turn};
use docent_core::rerank::RerankAuditEntry;

/// Longest automatic session title, in characters.
const MAX_TITLE_CHARS: usize = 48;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub message_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub sources: Vec<String>,
    pub rerank: Vec<RerankAuditEntry>,
    pub created_at: i64,
}

pub struct SessionStore {
    pool: SqlitePool,
}

/// Session title derived from a first message: its first non-empty line,
/// cut to [`MAX_TITLE_CHARS`] with an ellipsis.
pub fn title_from_message(message: &str) -> String {
    let line = message
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if line.chars().count() <= MAX_TITLE_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(MAX_TITLE_CHARS - 1).collect();
    format!("{}…", cut.trim_end())
}

fn default_name(now: i64) -> String {
    let stamp = chrono::DateTime::from_timestamp(now, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| now.to_string());
    format!("Chat Session {}", stamp)
}

fn row_to_session(row: &SqliteRow) -> SessionInfo {
    SessionInfo {
        id: row.get("id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        message_count: row.get("message_count"),
    }
}

fn row_to_message(row: &SqliteRow) -> Result<StoredMessage> {
    let role: String = row.get("role");
    let role = match Role::parse(&role) {
        Some(r) => r,
        None => bail!("unknown message role in session log: {}", role),
    };
    let sources_json: String = row.get("sources_json");
    let rerank_json: Option<String> = row.get("rerank_json");
    Ok(StoredMessage {
        role,
        content: row.get("content"),
        sources: serde_json::from_str(&sources_json)?,
        rerank: match rerank_json {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        },
        created_at: row.get("created_at"),
    })
}

const SESSION_COLUMNS: &str = r#"
    SELECT s.id, s.name, s.created_at, s.updated_at,
           (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id) AS message_count
    FROM sessions s
"#;

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a session. Without a name it gets a timestamped default and
    /// is renamed by its first message.
    pub async fn create(&self, name: Option<&str>) -> Result<SessionInfo> {
        let now = chrono::Utc::now().timestamp();
        let id = uuid::Uuid::new_v4().to_string();
        let (name, auto_name) = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(n) => (n.to_string(), false),
            None => (default_name(now), true),
        };
        sqlx::query(
            "INSERT INTO sessions (id, name, auto_name, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&name)
        .bind(auto_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        tracing::debug!(session = %id, "session created");
        Ok(SessionInfo {
            id,
            name,
            created_at: now,
            updated_at: now,
            message_count: 0,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<SessionInfo>> {
        let row = sqlx::query(&format!("{} WHERE s.id = ?", SESSION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_session))
    }

    /// All sessions, most recently updated first.
    pub async fn list(&self) -> Result<Vec<SessionInfo>> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY s.updated_at DESC, s.created_at DESC, s.id",
            SESSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_session).collect())
    }

    /// Full history, oldest first.
    pub async fn messages(&self, id: &str) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT role, content, sources_json, rerank_json, created_at FROM messages \
             WHERE session_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<bool> {
        let updated = sqlx::query("UPDATE sessions SET name = ?, auto_name = 0 WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    /// Delete a session and its messages. Returns false if it did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    /// Delete every session. Returns how many were removed.
    pub async fn delete_all(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages").execute(&mut *tx).await?;
        let deleted = sqlx::query("DELETE FROM sessions")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted as usize)
    }
}

#[async_trait]
impl TurnLog for SessionStore {
    async fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT role, content, sources_json, rerank_json, created_at FROM messages \
             WHERE session_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut turns = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let m = row_to_message(row)?;
            turns.push(Turn {
                role: m.role,
                content: m.content,
                timestamp: m.created_at,
                sources: m.sources,
            });
        }
        Ok(turns)
    }

    async fn append_exchange(&self, session_id: &str, exchange: &Exchange) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // The first statement takes the write lock, so the reads below
        // cannot be invalidated by another session's append.
        let touched = sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(exchange.assistant.timestamp)
            .bind(session_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if touched == 0 {
            bail!("Session not found: {}", session_id);
        }

        let session = sqlx::query(
            "SELECT auto_name, (SELECT COUNT(*) FROM messages WHERE session_id = ?) AS message_count \
             FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;
        let auto_name: bool = session.get("auto_name");
        let message_count: i64 = session.get("message_count");

        let rerank_json = if exchange.rerank.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&exchange.rerank)?)
        };
        for (turn, rerank) in [(&exchange.user, None), (&exchange.assistant, rerank_json)] {
            sqlx::query(
                "INSERT INTO messages (session_id, role, content, sources_json, rerank_json, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(session_id)
            .bind(turn.role.as_str())
            .bind(&turn.content)
            .bind(serde_json::to_string(&turn.sources)?)
            .bind(rerank)
            .bind(turn.timestamp)
            .execute(&mut *tx)
            .await?;
        }

        let title = title_from_message(&exchange.user.content);
        if auto_name && message_count == 0 && !title.is_empty() {
            sqlx::query("UPDATE sessions SET name = ?, auto_name = 0 WHERE id = ?")
                .bind(&title)
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.get(session_id).await?.is_some())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.delete(session_id).await
    }

    async fn delete_all_sessions(&self) -> Result<usize> {
        self.delete_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SessionStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        SessionStore::new(pool)
    }

    fn exchange(q: &str, a: &str, sources: &[&str]) -> Exchange {
        Exchange {
            user: Turn::user(q),
            assistant: Turn::assistant(a, sources.iter().map(|s| s.to_string()).collect()),
            rerank: Vec::new(),
        }
    }

    #[test]
    fn test_title_from_message() {
        assert_eq!(title_from_message("\n  What is RAG?\nmore"), "What is RAG?");
        let long = "x".repeat(60);
        let title = title_from_message(&long);
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS);
        assert!(title.ends_with('…'));
        assert_eq!(title_from_message("   "), "");
    }

    #[tokio::test]
    async fn test_first_exchange_names_session() {
        let store = store().await;
        let s = store.create(None).await.unwrap();
        assert!(s.name.starts_with("Chat Session "));

        store
            .append_exchange(&s.id, &exchange("How do refunds work?", "See policy.", &["policy.md"]))
            .await
            .unwrap();
        store
            .append_exchange(&s.id, &exchange("And exchanges?", "Also policy.", &[]))
            .await
            .unwrap();

        let info = store.get(&s.id).await.unwrap().unwrap();
        assert_eq!(info.name, "How do refunds work?");
        assert_eq!(info.message_count, 4);

        let messages = store.messages(&s.id).await.unwrap();
        assert_eq!(messages[1].sources, vec!["policy.md".to_string()]);
        assert_eq!(messages[2].role, Role::User);
    }

    #[tokio::test]
    async fn test_explicit_name_is_kept() {
        let store = store().await;
        let s = store.create(Some("Billing")).await.unwrap();
        store
            .append_exchange(&s.id, &exchange("q", "a", &[]))
            .await
            .unwrap();
        assert_eq!(store.get(&s.id).await.unwrap().unwrap().name, "Billing");
    }

    #[tokio::test]
    async fn test_recent_turns_oldest_first() {
        let store = store().await;
        let s = store.create(None).await.unwrap();
        for i in 0..3 {
            store
                .append_exchange(&s.id, &exchange(&format!("q{}", i), &format!("a{}", i), &[]))
                .await
                .unwrap();
        }
        let turns = store.recent_turns(&s.id, 3).await.unwrap();
        let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["a1", "q2", "a2"]);
    }

    #[tokio::test]
    async fn test_rerank_audit_round_trip_and_delete() {
        let store = store().await;
        let s = store.create(None).await.unwrap();
        let mut ex = exchange("q", "a", &["a.md"]);
        ex.rerank = vec![RerankAuditEntry {
            chunk_id: "c2".into(),
            source_path: "a.md".into(),
            initial_rank: 2,
            final_rank: 1,
            similarity: 0.85,
            score: 0.95,
        }];
        store.append_exchange(&s.id, &ex).await.unwrap();
        let messages = store.messages(&s.id).await.unwrap();
        assert!(messages[0].rerank.is_empty());
        assert_eq!(messages[1].rerank, ex.rerank);

        assert!(store.delete(&s.id).await.unwrap());
        assert!(!store.delete(&s.id).await.unwrap());
        assert!(store.messages(&s.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_to_missing_session_fails() {
        let store = store().await;
        assert!(store
            .append_exchange("nope", &exchange("q", "a", &[]))
            .await
            .is_err());
        store.create(None).await.unwrap();
        store.create(None).await.unwrap();
        assert_eq!(store.delete_all().await.unwrap(), 2);
        assert!(store.list().await.unwrap().is_empty());
    }
}
