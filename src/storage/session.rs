use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

/// Durable record of one user command and its output boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub id: u64,
    /// Reserved for multi-server deployments; never populated here.
    pub server_command_id: Option<u64>,
    pub server_run_id: u64,
    pub command: String,
    pub output: Vec<u8>,
    pub exit_code: Option<i32>,
    pub cwd_start: String,
    pub cwd_end: String,
    pub is_finished: bool,
    pub timestamp: i64,
}

/// Per-session command history database (`session_<id>.sqlite`).
pub struct SessionStorage {
    conn: Connection,
}

impl SessionStorage {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS session_commands (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_command_id INTEGER,
                server_run_id INTEGER NOT NULL,
                command TEXT NOT NULL,
                output BLOB NOT NULL DEFAULT x'',
                exit_code INTEGER,
                cwd_start TEXT NOT NULL DEFAULT '',
                cwd_end TEXT NOT NULL DEFAULT '',
                is_finished INTEGER NOT NULL DEFAULT 0,
                timestamp INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS command_output_lines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                command_id INTEGER NOT NULL,
                line_order INTEGER NOT NULL,
                segments_json TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    /// Insert a new, unfinished command record; returns its local id.
    pub fn add_command(
        &self,
        server_run_id: u64,
        command: &str,
        cwd_start: &str,
    ) -> rusqlite::Result<u64> {
        let timestamp = chrono::Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO session_commands (server_run_id, command, cwd_start, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![server_run_id, command, cwd_start, timestamp],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    pub fn append_output(&self, command_id: u64, output: &[u8]) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE session_commands SET output = output || ?2 WHERE id = ?1",
            params![command_id, output],
        )?;
        Ok(())
    }

    pub fn finish_command(
        &self,
        command_id: u64,
        exit_code: i32,
        cwd_end: &str,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE session_commands
             SET exit_code = ?2, cwd_end = ?3, is_finished = 1
             WHERE id = ?1",
            params![command_id, exit_code, cwd_end],
        )?;
        Ok(())
    }

    pub fn get_command(&self, command_id: u64) -> rusqlite::Result<Option<CommandRecord>> {
        self.conn
            .query_row(
                "SELECT id, server_command_id, server_run_id, command, output, exit_code,
                        cwd_start, cwd_end, is_finished, timestamp
                 FROM session_commands WHERE id = ?1",
                params![command_id],
                row_to_record,
            )
            .optional()
    }

    pub fn get_all_commands(&self) -> rusqlite::Result<Vec<CommandRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, server_command_id, server_run_id, command, output, exit_code,
                    cwd_start, cwd_end, is_finished, timestamp
             FROM session_commands ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        rows.collect()
    }

    /// Most recent cwd of a finished command, if any.
    pub fn get_last_cwd(&self) -> rusqlite::Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT cwd_end FROM session_commands
                 WHERE is_finished = 1 AND length(cwd_end) > 0
                 ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
    }

    /// Append a pre-parsed output line (segment JSON) for replay.
    pub fn add_output_line(&self, command_id: u64, segments_json: &str) -> rusqlite::Result<()> {
        let next_order: u64 = self.conn.query_row(
            "SELECT COALESCE(MAX(line_order) + 1, 0) FROM command_output_lines
             WHERE command_id = ?1",
            params![command_id],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO command_output_lines (command_id, line_order, segments_json)
             VALUES (?1, ?2, ?3)",
            params![command_id, next_order, segments_json],
        )?;
        Ok(())
    }

    pub fn get_output_lines(&self, command_id: u64) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT segments_json FROM command_output_lines
             WHERE command_id = ?1 ORDER BY line_order",
        )?;
        let rows = stmt.query_map(params![command_id], |row| row.get(0))?;
        rows.collect()
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommandRecord> {
    Ok(CommandRecord {
        id: row.get(0)?,
        server_command_id: row.get(1)?,
        server_run_id: row.get(2)?,
        command: row.get(3)?,
        output: row.get(4)?,
        exit_code: row.get(5)?,
        cwd_start: row.get(6)?,
        cwd_end: row.get(7)?,
        is_finished: row.get(8)?,
        timestamp: row.get(9)?,
    })
}
