//! SQLite storage layer for drift.
//!
//! Holds the durable half of the system: bans, appeals, the append-only
//! session and message logs, rate-limit windows, and daily/hourly stats.
//! Live session state never lives here; the connection registry is
//! authoritative for that.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Banned source address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRow {
    pub id: i64,
    pub ip_address: String,
    pub reason: String,
    pub banned_at: u64,
    pub banned_by: String,
}

/// One finished (or still active) pairing, appended from the live room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLogRow {
    pub id: i64,
    pub room_id: String,
    pub ip_a: String,
    pub ip_b: String,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub message_count: u64,
    pub is_active: bool,
}

/// One attempted message send.  Flagged rows were never relayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLogRow {
    pub id: i64,
    pub room_id: String,
    pub sender_ip: String,
    pub content: String,
    pub sent_at: u64,
    pub flagged: bool,
    pub flag_reason: Option<String>,
}

/// Ban appeal submitted by an end user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppealRow {
    pub id: i64,
    pub ip_address: String,
    pub contact_email: String,
    pub reason: String,
    /// "pending", "approved", or "rejected".
    pub status: String,
    pub submitted_at: u64,
    pub reviewed_at: Option<u64>,
    pub reviewer: Option<String>,
    pub notes: Option<String>,
}

/// Fixed rate-limit window for one (source, action) pair.
#[derive(Debug, Clone)]
pub struct RateWindowRow {
    pub ip_address: String,
    pub action: String,
    pub count: u32,
    pub window_start: u64,
}

/// Daily counter snapshot persisted at day rollover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStatsRow {
    pub day: String,
    pub message_count: u64,
    pub unique_ips: u64,
    pub peak_rooms: u64,
}

/// Per-hour message delta persisted by the rollup task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyStatsRow {
    pub day: String,
    pub hour: u32,
    pub message_count: u64,
    pub active_rooms: u64,
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Main storage handle wrapping a SQLite connection.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database, for tests and ephemeral deployments.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS banned_ips (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                ip_address  TEXT NOT NULL UNIQUE,
                reason      TEXT NOT NULL,
                banned_at   INTEGER NOT NULL,
                banned_by   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_sessions (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id       TEXT NOT NULL UNIQUE,
                ip_a          TEXT NOT NULL,
                ip_b          TEXT NOT NULL,
                started_at    INTEGER NOT NULL,
                ended_at      INTEGER,
                message_count INTEGER NOT NULL DEFAULT 0,
                is_active     INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_chat_sessions_active
                ON chat_sessions(is_active, started_at);

            CREATE TABLE IF NOT EXISTS chat_messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id     TEXT NOT NULL,
                sender_ip   TEXT NOT NULL,
                content     TEXT NOT NULL,
                sent_at     INTEGER NOT NULL,
                flagged     INTEGER NOT NULL DEFAULT 0,
                flag_reason TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_chat_messages_room
                ON chat_messages(room_id, sent_at);
            CREATE INDEX IF NOT EXISTS idx_chat_messages_flagged
                ON chat_messages(flagged, sent_at);

            CREATE TABLE IF NOT EXISTS ban_appeals (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                ip_address    TEXT NOT NULL,
                contact_email TEXT NOT NULL,
                reason        TEXT NOT NULL,
                status        TEXT NOT NULL DEFAULT 'pending',
                submitted_at  INTEGER NOT NULL,
                reviewed_at   INTEGER,
                reviewer      TEXT,
                notes         TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_ban_appeals_status
                ON ban_appeals(status, submitted_at);
            CREATE INDEX IF NOT EXISTS idx_ban_appeals_ip
                ON ban_appeals(ip_address, status);

            CREATE TABLE IF NOT EXISTS rate_limits (
                ip_address   TEXT NOT NULL,
                action       TEXT NOT NULL,
                count        INTEGER NOT NULL,
                window_start INTEGER NOT NULL,
                PRIMARY KEY (ip_address, action)
            );

            CREATE TABLE IF NOT EXISTS daily_stats (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                day           TEXT NOT NULL UNIQUE,
                message_count INTEGER NOT NULL,
                unique_ips    INTEGER NOT NULL,
                peak_rooms    INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hourly_stats (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                day           TEXT NOT NULL,
                hour          INTEGER NOT NULL,
                message_count INTEGER NOT NULL,
                active_rooms  INTEGER NOT NULL,
                UNIQUE (day, hour)
            );
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bans
    // -----------------------------------------------------------------------

    pub fn insert_ban(
        &self,
        ip: &str,
        reason: &str,
        banned_by: &str,
        now: u64,
    ) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO banned_ips (ip_address, reason, banned_at, banned_by)
             VALUES (?1, ?2, ?3, ?4)",
            params![ip, reason, now as i64, banned_by],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn is_banned(&self, ip: &str) -> Result<bool, StorageError> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM banned_ips WHERE ip_address = ?1)",
            params![ip],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    pub fn get_ban_by_ip(&self, ip: &str) -> Result<Option<BanRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, ip_address, reason, banned_at, banned_by
             FROM banned_ips WHERE ip_address = ?1",
        )?;
        let row = stmt
            .query_row(params![ip], |row| {
                Ok(BanRow {
                    id: row.get(0)?,
                    ip_address: row.get(1)?,
                    reason: row.get(2)?,
                    banned_at: row.get::<_, i64>(3)? as u64,
                    banned_by: row.get(4)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn list_bans(&self) -> Result<Vec<BanRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, ip_address, reason, banned_at, banned_by
             FROM banned_ips ORDER BY banned_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BanRow {
                id: row.get(0)?,
                ip_address: row.get(1)?,
                reason: row.get(2)?,
                banned_at: row.get::<_, i64>(3)? as u64,
                banned_by: row.get(4)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn count_bans(&self) -> Result<u64, StorageError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM banned_ips", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn delete_ban(&self, id: i64) -> Result<bool, StorageError> {
        let affected = self
            .conn
            .execute("DELETE FROM banned_ips WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn delete_ban_by_ip(&self, ip: &str) -> Result<bool, StorageError> {
        let affected = self
            .conn
            .execute("DELETE FROM banned_ips WHERE ip_address = ?1", params![ip])?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Session log
    // -----------------------------------------------------------------------

    pub fn insert_session_log(
        &self,
        room_id: &str,
        ip_a: &str,
        ip_b: &str,
        started_at: u64,
    ) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO chat_sessions (room_id, ip_a, ip_b, started_at, message_count, is_active)
             VALUES (?1, ?2, ?3, ?4, 0, 1)",
            params![room_id, ip_a, ip_b, started_at as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn close_session_log(
        &self,
        room_id: &str,
        ended_at: u64,
        message_count: u64,
    ) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE chat_sessions SET ended_at = ?1, message_count = ?2, is_active = 0
             WHERE room_id = ?3 AND is_active = 1",
            params![ended_at as i64, message_count as i64, room_id],
        )?;
        Ok(affected > 0)
    }

    pub fn get_session_log(&self, room_id: &str) -> Result<Option<SessionLogRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, room_id, ip_a, ip_b, started_at, ended_at, message_count, is_active
             FROM chat_sessions WHERE room_id = ?1",
        )?;
        let row = stmt
            .query_row(params![room_id], |row| {
                Ok(SessionLogRow {
                    id: row.get(0)?,
                    room_id: row.get(1)?,
                    ip_a: row.get(2)?,
                    ip_b: row.get(3)?,
                    started_at: row.get::<_, i64>(4)? as u64,
                    ended_at: row.get::<_, Option<i64>>(5)?.map(|t| t as u64),
                    message_count: row.get::<_, i64>(6)? as u64,
                    is_active: row.get::<_, i64>(7)? != 0,
                })
            })
            .optional()?;
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Message log
    // -----------------------------------------------------------------------

    pub fn append_message(
        &self,
        room_id: &str,
        sender_ip: &str,
        content: &str,
        sent_at: u64,
        flagged: bool,
        flag_reason: Option<&str>,
    ) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO chat_messages (room_id, sender_ip, content, sent_at, flagged, flag_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                room_id,
                sender_ip,
                content,
                sent_at as i64,
                flagged as i32,
                flag_reason,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_room_messages(&self, room_id: &str) -> Result<Vec<MessageLogRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, room_id, sender_ip, content, sent_at, flagged, flag_reason
             FROM chat_messages WHERE room_id = ?1 ORDER BY sent_at, id",
        )?;
        let rows = stmt.query_map(params![room_id], |row| {
            Ok(MessageLogRow {
                id: row.get(0)?,
                room_id: row.get(1)?,
                sender_ip: row.get(2)?,
                content: row.get(3)?,
                sent_at: row.get::<_, i64>(4)? as u64,
                flagged: row.get::<_, i64>(5)? != 0,
                flag_reason: row.get(6)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Appeals
    // -----------------------------------------------------------------------

    pub fn insert_appeal(
        &self,
        ip: &str,
        contact_email: &str,
        reason: &str,
        now: u64,
    ) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO ban_appeals (ip_address, contact_email, reason, status, submitted_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![ip, contact_email, reason, now as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn has_pending_appeal(&self, ip: &str) -> Result<bool, StorageError> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM ban_appeals WHERE ip_address = ?1 AND status = 'pending')",
            params![ip],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    pub fn get_appeal(&self, id: i64) -> Result<Option<AppealRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, ip_address, contact_email, reason, status,
                    submitted_at, reviewed_at, reviewer, notes
             FROM ban_appeals WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![id], |row| Self::appeal_from_row(row))
            .optional()?;
        Ok(row)
    }

    pub fn list_appeals(&self, status: Option<&str>) -> Result<Vec<AppealRow>, StorageError> {
        let mut result = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, ip_address, contact_email, reason, status,
                            submitted_at, reviewed_at, reviewer, notes
                     FROM ban_appeals WHERE status = ?1 ORDER BY submitted_at DESC",
                )?;
                let rows = stmt.query_map(params![status], |row| Self::appeal_from_row(row))?;
                for row in rows {
                    result.push(row?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, ip_address, contact_email, reason, status,
                            submitted_at, reviewed_at, reviewer, notes
                     FROM ban_appeals ORDER BY submitted_at DESC",
                )?;
                let rows = stmt.query_map([], |row| Self::appeal_from_row(row))?;
                for row in rows {
                    result.push(row?);
                }
            }
        }
        Ok(result)
    }

    pub fn resolve_appeal(
        &self,
        id: i64,
        status: &str,
        reviewer: &str,
        notes: Option<&str>,
        reviewed_at: u64,
    ) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE ban_appeals SET status = ?1, reviewer = ?2, notes = ?3, reviewed_at = ?4
             WHERE id = ?5 AND status = 'pending'",
            params![status, reviewer, notes, reviewed_at as i64, id],
        )?;
        Ok(affected > 0)
    }

    fn appeal_from_row(row: &rusqlite::Row<'_>) -> Result<AppealRow, rusqlite::Error> {
        Ok(AppealRow {
            id: row.get(0)?,
            ip_address: row.get(1)?,
            contact_email: row.get(2)?,
            reason: row.get(3)?,
            status: row.get(4)?,
            submitted_at: row.get::<_, i64>(5)? as u64,
            reviewed_at: row.get::<_, Option<i64>>(6)?.map(|t| t as u64),
            reviewer: row.get(7)?,
            notes: row.get(8)?,
        })
    }

    // -----------------------------------------------------------------------
    // Rate-limit windows
    // -----------------------------------------------------------------------

    pub fn get_rate_window(
        &self,
        ip: &str,
        action: &str,
    ) -> Result<Option<RateWindowRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT ip_address, action, count, window_start
             FROM rate_limits WHERE ip_address = ?1 AND action = ?2",
        )?;
        let row = stmt
            .query_row(params![ip, action], |row| {
                Ok(RateWindowRow {
                    ip_address: row.get(0)?,
                    action: row.get(1)?,
                    count: row.get::<_, i64>(2)? as u32,
                    window_start: row.get::<_, i64>(3)? as u64,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Count one action against the `(ip, action)` window.  A window that
    /// started before `stale_before` is replaced rather than incremented, so
    /// the whole read-modify-write stays a single statement.
    pub fn bump_rate_window(
        &self,
        ip: &str,
        action: &str,
        now: u64,
        stale_before: u64,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO rate_limits (ip_address, action, count, window_start)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(ip_address, action) DO UPDATE SET
                 count = CASE WHEN window_start < ?4 THEN 1 ELSE count + 1 END,
                 window_start = CASE WHEN window_start < ?4 THEN ?3 ELSE window_start END",
            params![ip, action, now as i64, stale_before as i64],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub fn upsert_daily_stats(&self, row: &DailyStatsRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO daily_stats (day, message_count, unique_ips, peak_rooms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(day) DO UPDATE SET
                 message_count = excluded.message_count,
                 unique_ips = excluded.unique_ips,
                 peak_rooms = excluded.peak_rooms",
            params![
                row.day,
                row.message_count as i64,
                row.unique_ips as i64,
                row.peak_rooms as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_daily_stats(&self, day: &str) -> Result<Option<DailyStatsRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT day, message_count, unique_ips, peak_rooms
             FROM daily_stats WHERE day = ?1",
        )?;
        let row = stmt
            .query_row(params![day], |row| {
                Ok(DailyStatsRow {
                    day: row.get(0)?,
                    message_count: row.get::<_, i64>(1)? as u64,
                    unique_ips: row.get::<_, i64>(2)? as u64,
                    peak_rooms: row.get::<_, i64>(3)? as u64,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn upsert_hourly_stats(&self, row: &HourlyStatsRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO hourly_stats (day, hour, message_count, active_rooms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(day, hour) DO UPDATE SET
                 message_count = excluded.message_count,
                 active_rooms = excluded.active_rooms",
            params![
                row.day,
                row.hour,
                row.message_count as i64,
                row.active_rooms as i64,
            ],
        )?;
        Ok(())
    }

    pub fn list_hourly_stats(&self, day: &str) -> Result<Vec<HourlyStatsRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT day, hour, message_count, active_rooms
             FROM hourly_stats WHERE day = ?1 ORDER BY hour",
        )?;
        let rows = stmt.query_map(params![day], |row| {
            Ok(HourlyStatsRow {
                day: row.get(0)?,
                hour: row.get(1)?,
                message_count: row.get::<_, i64>(2)? as u64,
                active_rooms: row.get::<_, i64>(3)? as u64,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
