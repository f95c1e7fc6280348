use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use chainflow_core::error::{ChainflowError, Result};
use chainflow_core::traits::HistoryStore;
use chainflow_core::types::{ChatMessage, Role, SessionId};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_session
        ON messages(session_id, id);";

fn db_err(e: impl std::fmt::Display) -> ChainflowError {
    ChainflowError::Database(e.to_string())
}

/// SQLite-backed chat history, one row per message.
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    /// Open or create a database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "History store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Sessions with stored history, most recently active first.
    pub fn sessions(&self) -> Result<Vec<SessionId>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT session_id FROM messages
                 GROUP BY session_id
                 ORDER BY MAX(id) DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(SessionId(row.map_err(db_err)?));
        }
        Ok(sessions)
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn append_messages(&self, sid: &SessionId, msgs: &[ChatMessage]) -> BoxFuture<'_, Result<()>> {
        let sid = sid.0.clone();
        let rows: Vec<(String, String, String)> = msgs
            .iter()
            .map(|m| {
                (
                    m.role.as_str().to_string(),
                    m.content.clone(),
                    m.timestamp.unwrap_or_else(Utc::now).to_rfc3339(),
                )
            })
            .collect();

        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            for (role, content, timestamp) in &rows {
                tx.execute(
                    "INSERT INTO messages (session_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
                    params![sid, role, content, timestamp],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            debug!(session_id = %sid, count = rows.len(), "Appended history");
            Ok(())
        })
    }

    fn load_history(&self, sid: &SessionId, limit: usize) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        let sid = sid.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT role, content, timestamp FROM (
                         SELECT id, role, content, timestamp FROM messages
                         WHERE session_id = ?1
                         ORDER BY id DESC
                         LIMIT ?2
                     ) ORDER BY id ASC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![sid, limit as i64], |row| {
                    let role: String = row.get(0)?;
                    let content: String = row.get(1)?;
                    let ts_str: String = row.get(2)?;
                    Ok((role, content, ts_str))
                })
                .map_err(db_err)?;

            let mut messages = Vec::new();
            for row in rows {
                let (role, content, ts_str) = row.map_err(db_err)?;
                let timestamp = DateTime::parse_from_rfc3339(&ts_str)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc));
                messages.push(ChatMessage {
                    role: Role::parse(&role).unwrap_or(Role::User),
                    content,
                    timestamp,
                });
            }

            Ok(messages)
        })
    }

    fn clear(&self, sid: &SessionId) -> BoxFuture<'_, Result<()>> {
        let sid = sid.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let removed = conn
                .execute("DELETE FROM messages WHERE session_id = ?1", params![sid])
                .map_err(db_err)?;
            debug!(session_id = %sid, removed, "Cleared history");
            Ok(())
        })
    }
}
