use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

/// Row of the active-session table.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalSessionRow {
    pub id: u64,
    pub server_run_id: u64,
    pub created_at: i64,
    pub is_deleted: bool,
    pub deleted_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmProvider {
    pub id: u64,
    pub name: String,
    pub provider_type: String,
    pub url: String,
    pub model: String,
    pub api_key: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: u64,
    pub session_id: u64,
    pub role: String,
    pub content: String,
    pub created_at: i64,
}

/// Server-wide database (`server_state.sqlite`): run records for crash
/// detection, the session table, LLM providers and chat history.
pub struct ServerStorage {
    conn: Connection,
}

impl ServerStorage {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS server_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_timestamp INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS server_stops (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                stop_timestamp INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS terminal_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_run_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS llm_providers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                url TEXT NOT NULL,
                model TEXT NOT NULL,
                api_key TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn record_start(&self) -> rusqlite::Result<u64> {
        self.conn.execute(
            "INSERT INTO server_runs (start_timestamp) VALUES (?1)",
            params![Self::now_millis()],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    pub fn record_stop(&self, run_id: u64) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO server_stops (run_id, stop_timestamp) VALUES (?1, ?2)",
            params![run_id, Self::now_millis()],
        )?;
        Ok(())
    }

    /// True iff the most recent run has no matching stop record.
    pub fn was_last_run_crashed(&self) -> rusqlite::Result<bool> {
        let last_run: Option<u64> = self
            .conn
            .query_row(
                "SELECT id FROM server_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(run_id) = last_run else {
            return Ok(false);
        };
        let stops: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM server_stops WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(stops == 0)
    }

    pub fn create_terminal_session(&self, server_run_id: u64) -> rusqlite::Result<u64> {
        self.conn.execute(
            "INSERT INTO terminal_sessions (server_run_id, created_at) VALUES (?1, ?2)",
            params![server_run_id, Self::now_millis()],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    pub fn mark_terminal_session_as_deleted(&self, session_id: u64) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE terminal_sessions SET is_deleted = 1, deleted_at = ?2 WHERE id = ?1",
            params![session_id, Self::now_millis()],
        )?;
        Ok(())
    }

    pub fn is_active_terminal_session(&self, session_id: u64) -> rusqlite::Result<bool> {
        let count: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM terminal_sessions WHERE id = ?1 AND is_deleted = 0",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_terminal_session(
        &self,
        session_id: u64,
    ) -> rusqlite::Result<Option<TerminalSessionRow>> {
        self.conn
            .query_row(
                "SELECT id, server_run_id, created_at, is_deleted, deleted_at
                 FROM terminal_sessions WHERE id = ?1",
                params![session_id],
                row_to_session,
            )
            .optional()
    }

    pub fn get_active_terminal_sessions(&self) -> rusqlite::Result<Vec<TerminalSessionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, server_run_id, created_at, is_deleted, deleted_at
             FROM terminal_sessions WHERE is_deleted = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_session)?;
        rows.collect()
    }

    pub fn add_llm_provider(
        &self,
        name: &str,
        provider_type: &str,
        url: &str,
        model: &str,
        api_key: &str,
    ) -> rusqlite::Result<u64> {
        self.conn.execute(
            "INSERT INTO llm_providers (name, type, url, model, api_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![name, provider_type, url, model, api_key, Self::now_millis()],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    pub fn update_llm_provider(
        &self,
        id: u64,
        name: &str,
        url: &str,
        model: &str,
        api_key: &str,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE llm_providers SET name = ?2, url = ?3, model = ?4, api_key = ?5
             WHERE id = ?1",
            params![id, name, url, model, api_key],
        )?;
        Ok(())
    }

    pub fn delete_llm_provider(&self, id: u64) -> rusqlite::Result<()> {
        self.conn
            .execute("DELETE FROM llm_providers WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get_llm_provider(&self, id: u64) -> rusqlite::Result<Option<LlmProvider>> {
        self.conn
            .query_row(
                "SELECT id, name, type, url, model, api_key, created_at
                 FROM llm_providers WHERE id = ?1",
                params![id],
                row_to_provider,
            )
            .optional()
    }

    pub fn get_all_llm_providers(&self) -> rusqlite::Result<Vec<LlmProvider>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, type, url, model, api_key, created_at
             FROM llm_providers ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_provider)?;
        rows.collect()
    }

    pub fn save_chat_message(
        &self,
        session_id: u64,
        role: &str,
        content: &str,
    ) -> rusqlite::Result<u64> {
        self.conn.execute(
            "INSERT INTO chat_messages (session_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role, content, Self::now_millis()],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    pub fn get_chat_history(&self, session_id: u64) -> rusqlite::Result<Vec<ChatMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, role, content, created_at
             FROM chat_messages WHERE session_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(ChatMessage {
                id: row.get(0)?,
                session_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        rows.collect()
    }

    pub fn clear_chat_history(&self, session_id: u64) -> rusqlite::Result<()> {
        self.conn.execute(
            "DELETE FROM chat_messages WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<TerminalSessionRow> {
    Ok(TerminalSessionRow {
        id: row.get(0)?,
        server_run_id: row.get(1)?,
        created_at: row.get(2)?,
        is_deleted: row.get(3)?,
        deleted_at: row.get(4)?,
    })
}

fn row_to_provider(row: &rusqlite::Row<'_>) -> rusqlite::Result<LlmProvider> {
    Ok(LlmProvider {
        id: row.get(0)?,
        name: row.get(1)?,
        provider_type: row.get(2)?,
        url: row.get(3)?,
        model: row.get(4)?,
        api_key: row.get(5)?,
        created_at: row.get(6)?,
    })
}
