//! SQLite persistence: room metadata, compressed snapshots, and the
//! optional durable command log.
//!
//! One connection behind a mutex is plenty for this write pattern (a
//! snapshot every 30 s per room plus occasional command batches). Schema
//! creation is idempotent; all operations wrap driver errors with an
//! internal kind and `{operation, room_id}` context.

use graphpad_proto::{Command, CompressedBlob, CompressionMethod};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{ErrorKind, RelayError, Result};

pub struct Database {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRow {
    pub room_id: String,
    pub created_at: i64,
    pub last_updated: i64,
}

/// Counts removed by one maintenance sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupStats {
    pub commands_removed: usize,
    pub snapshots_removed: usize,
}

fn db_err(operation: &'static str, err: rusqlite::Error) -> RelayError {
    RelayError::internal(format!("database operation {operation} failed"), err)
        .with_context("operation", operation)
}

impl Database {
    /// Open (or create) the database at `path`. `:memory:` is allowed.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| db_err("open", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| db_err("open", e))?;
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rooms (
                room_id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                last_updated INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS room_states (
                room_id TEXT NOT NULL,
                state_data BLOB NOT NULL,
                compression_method TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                client_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (room_id, timestamp)
            );

            CREATE TABLE IF NOT EXISTS commands (
                command_id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                command_type TEXT NOT NULL,
                payload BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rooms_last_updated
                ON rooms(last_updated);
            CREATE INDEX IF NOT EXISTS idx_room_states_room_ts
                ON room_states(room_id, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_commands_room_ts
                ON commands(room_id, timestamp);",
        )
        .map_err(|e| db_err("migrate", e))
    }

    /// Insert the room or bump its `last_updated`.
    pub fn upsert_room(&self, room_id: &str, now_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rooms (room_id, created_at, last_updated) VALUES (?1, ?2, ?2)
             ON CONFLICT(room_id) DO UPDATE SET last_updated = excluded.last_updated",
            params![room_id, now_ms],
        )
        .map_err(|e| db_err("upsert_room", e).with_context("room_id", room_id))?;
        Ok(())
    }

    pub fn get_room(&self, room_id: &str) -> Result<Option<RoomRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT room_id, created_at, last_updated FROM rooms WHERE room_id = ?1",
            params![room_id],
            |row| {
                Ok(RoomRow {
                    room_id: row.get(0)?,
                    created_at: row.get(1)?,
                    last_updated: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| db_err("get_room", e).with_context("room_id", room_id))
    }

    /// All known rooms, most recently updated first.
    pub fn list_rooms(&self) -> Result<Vec<RoomRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT room_id, created_at, last_updated FROM rooms
                 ORDER BY last_updated DESC",
            )
            .map_err(|e| db_err("list_rooms", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RoomRow {
                    room_id: row.get(0)?,
                    created_at: row.get(1)?,
                    last_updated: row.get(2)?,
                })
            })
            .map_err(|e| db_err("list_rooms", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("list_rooms", e))?;
        Ok(rows)
    }

    pub fn save_snapshot(
        &self,
        room_id: &str,
        blob: &CompressedBlob,
        timestamp: i64,
        client_count: usize,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO room_states
                 (room_id, state_data, compression_method, timestamp, client_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                room_id,
                blob.data,
                blob.method.as_str(),
                timestamp,
                client_count as i64
            ],
        )
        .map_err(|e| db_err("save_snapshot", e).with_context("room_id", room_id))?;
        Ok(())
    }

    /// Newest snapshot for the room, if any.
    pub fn load_snapshot(&self, room_id: &str) -> Result<Option<CompressedBlob>> {
        let conn = self.conn.lock();
        let row: Option<(Vec<u8>, String)> = conn
            .query_row(
                "SELECT state_data, compression_method FROM room_states
                 WHERE room_id = ?1 ORDER BY timestamp DESC LIMIT 1",
                params![room_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| db_err("load_snapshot", e).with_context("room_id", room_id))?;

        row.map(|(data, method)| {
            let method = CompressionMethod::parse(&method).ok_or_else(|| {
                RelayError::new(
                    ErrorKind::Internal,
                    format!("unknown compression method {method:?} in stored snapshot"),
                )
                .with_context("operation", "load_snapshot")
                .with_context("room_id", room_id)
            })?;
            Ok(CompressedBlob { method, data })
        })
        .transpose()
    }

    /// Append a flushed batch to the durable command log.
    pub fn save_commands(&self, room_id: &str, commands: &[Command]) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| db_err("save_commands", e).with_context("room_id", room_id))?;
        for cmd in commands {
            let payload = serde_json::to_vec(cmd).map_err(|e| {
                RelayError::internal("command serialization failed", e)
                    .with_context("operation", "save_commands")
                    .with_context("room_id", room_id)
            })?;
            let command_type = command_type_name(cmd);
            tx.execute(
                "INSERT OR REPLACE INTO commands
                     (command_id, room_id, client_id, timestamp, command_type, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    cmd.command_id,
                    room_id,
                    cmd.client_id,
                    cmd.timestamp,
                    command_type,
                    payload
                ],
            )
            .map_err(|e| db_err("save_commands", e).with_context("room_id", room_id))?;
        }
        tx.commit()
            .map_err(|e| db_err("save_commands", e).with_context("room_id", room_id))
    }

    /// Drop command rows older than `max_age_ms` and keep only the newest
    /// three snapshots per room.
    pub fn cleanup(&self, max_age_ms: i64, now_ms: i64) -> Result<CleanupStats> {
        let cutoff = now_ms - max_age_ms;
        let conn = self.conn.lock();

        let commands_removed = conn
            .execute("DELETE FROM commands WHERE timestamp < ?1", params![cutoff])
            .map_err(|e| db_err("cleanup", e))?;

        let snapshots_removed = conn
            .execute(
                "DELETE FROM room_states WHERE rowid IN (
                     SELECT rowid FROM (
                         SELECT rowid,
                                ROW_NUMBER() OVER (
                                    PARTITION BY room_id ORDER BY timestamp DESC
                                ) AS rn
                         FROM room_states
                     ) WHERE rn > 3
                 )",
                [],
            )
            .map_err(|e| db_err("cleanup", e))?;

        Ok(CleanupStats {
            commands_removed,
            snapshots_removed,
        })
    }
}

fn command_type_name(cmd: &Command) -> &'static str {
    use graphpad_proto::CommandKind::*;
    match cmd.kind {
        PageAdd { .. } => "page.add",
        PageDelete { .. } => "page.delete",
        PageModify { .. } => "page.modify",
        PageReorder { .. } => "page.reorder",
        ObjectAdd { .. } => "object.add",
        ObjectDelete { .. } => "object.delete",
        ObjectModify { .. } => "object.modify",
    }
}
