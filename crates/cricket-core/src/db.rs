// SQLite persistence for rooms, season datasets, audit logs, and sessions.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::room::{LogEntry, Room, RoomCode};
use crate::scoring::{BattingStats, BowlingStats, SeasonPlayer};

/// Typed store failures that callers may want to tell apart from I/O.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The room changed between load and commit; nothing was written.
    #[error("room {code} was modified concurrently (expected version {expected})")]
    Conflict { code: String, expected: i64 },
}

/// A room document together with the version it was read at.
#[derive(Debug, Clone)]
pub struct StoredRoom {
    pub room: Room,
    pub version: i64,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredStats {
    #[serde(default)]
    batting: BattingStats,
    #[serde(default)]
    bowling: BowlingStats,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path` and ensure all tables exist.
    /// `":memory:"` gives an ephemeral database for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rooms (
                id         TEXT PRIMARY KEY,
                version    INTEGER NOT NULL,
                doc        TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS season_players (
                season    TEXT NOT NULL,
                player_id TEXT NOT NULL,
                name      TEXT NOT NULL,
                stats     TEXT NOT NULL,
                PRIMARY KEY (season, player_id)
            );

            CREATE TABLE IF NOT EXISTS room_logs (
                room_id TEXT NOT NULL REFERENCES rooms(id),
                ts      INTEGER NOT NULL,
                message TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_room_logs_room ON room_logs(room_id, ts);

            CREATE TABLE IF NOT EXISTS sessions (
                room_id TEXT NOT NULL REFERENCES rooms(id),
                uid     TEXT NOT NULL,
                team_id TEXT NOT NULL,
                PRIMARY KEY (room_id, uid)
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Panics only if another thread panicked while holding the lock.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    /// Store a brand-new room at version 1. Fails if the code is taken.
    pub fn insert_room(&self, room: &Room) -> Result<i64> {
        let conn = self.conn();
        let doc = serde_json::to_string(room).context("failed to serialize room")?;
        conn.execute(
            "INSERT INTO rooms (id, version, doc, created_at) VALUES (?1, 1, ?2, ?3)",
            params![room.code.as_str(), doc, room.created_at],
        )
        .with_context(|| format!("failed to insert room {}", room.code))?;
        Ok(1)
    }

    pub fn room_exists(&self, code: &RoomCode) -> Result<bool> {
        let conn = self.conn();
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM rooms WHERE id = ?1)",
                params![code.as_str()],
                |row| row.get(0),
            )
            .context("failed to check room existence")?;
        Ok(exists)
    }

    pub fn load_room(&self, code: &RoomCode) -> Result<Option<StoredRoom>> {
        let conn = self.conn();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT doc, version FROM rooms WHERE id = ?1",
                params![code.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to query room")?;

        match row {
            Some((doc, version)) => {
                let room: Room = serde_json::from_str(&doc)
                    .with_context(|| format!("failed to deserialize room {code}"))?;
                Ok(Some(StoredRoom { room, version }))
            }
            None => Ok(None),
        }
    }

    /// Replace the room document if it is still at `expected_version`.
    ///
    /// Returns the new version. A zero-row update yields
    /// [`StoreError::Conflict`] and leaves the stored room as it was.
    pub fn commit_room(&self, room: &Room, expected_version: i64) -> Result<i64> {
        let conn = self.conn();
        let doc = serde_json::to_string(room).context("failed to serialize room")?;
        let changed = conn
            .execute(
                "UPDATE rooms SET doc = ?1, version = version + 1
                 WHERE id = ?2 AND version = ?3",
                params![doc, room.code.as_str(), expected_version],
            )
            .context("failed to commit room")?;
        if changed == 0 {
            return Err(StoreError::Conflict {
                code: room.code.display_code(),
                expected: expected_version,
            }
            .into());
        }
        Ok(expected_version + 1)
    }

    /// Rooms whose auction needs timer attention: `running` or
    /// `showing_result`.
    pub fn live_room_codes(&self) -> Result<Vec<RoomCode>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM rooms
                 WHERE json_extract(doc, '$.auction.status') IN ('running', 'showing_result')
                 ORDER BY id",
            )
            .context("failed to prepare live_room_codes query")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to query live rooms")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map live room rows")?;
        Ok(ids.iter().filter_map(|id| RoomCode::parse(id)).collect())
    }

    // ------------------------------------------------------------------
    // Season datasets
    // ------------------------------------------------------------------

    /// Replace every stored player of `season` in a single transaction.
    pub fn import_season(&self, season: &str, players: &[SeasonPlayer]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("failed to begin season import transaction")?;
        tx.execute("DELETE FROM season_players WHERE season = ?1", params![season])
            .context("failed to clear previous season rows")?;

        for player in players {
            let stats = serde_json::to_string(&StoredStats {
                batting: player.batting.clone(),
                bowling: player.bowling.clone(),
            })
            .context("failed to serialize player stats")?;
            tx.execute(
                "INSERT INTO season_players (season, player_id, name, stats)
                 VALUES (?1, ?2, ?3, ?4)",
                params![season, player.id, player.name, stats],
            )
            .with_context(|| format!("failed to insert season player {}", player.id))?;
        }

        tx.commit().context("failed to commit season import")?;
        Ok(players.len())
    }

    pub fn load_season(&self, season: &str) -> Result<Vec<SeasonPlayer>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT player_id, name, stats FROM season_players
                 WHERE season = ?1 ORDER BY player_id",
            )
            .context("failed to prepare load_season query")?;

        let rows = stmt
            .query_map(params![season], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("failed to query season players")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map season player rows")?;

        rows.into_iter()
            .map(|(id, name, stats)| -> Result<SeasonPlayer> {
                let stats: StoredStats = serde_json::from_str(&stats)
                    .with_context(|| format!("failed to deserialize stats for {id}"))?;
                Ok(SeasonPlayer {
                    id,
                    name,
                    batting: stats.batting,
                    bowling: stats.bowling,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Audit log
    // ------------------------------------------------------------------

    pub fn append_log(&self, code: &RoomCode, ts: i64, message: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO room_logs (room_id, ts, message) VALUES (?1, ?2, ?3)",
            params![code.as_str(), ts, message],
        )
        .context("failed to append room log")?;
        Ok(())
    }

    /// The most recent `limit` log lines, oldest first.
    pub fn load_logs(&self, code: &RoomCode, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT ts, message FROM (
                    SELECT rowid AS seq, ts, message FROM room_logs
                    WHERE room_id = ?1
                    ORDER BY ts DESC, seq DESC
                    LIMIT ?2
                 ) ORDER BY ts, seq",
            )
            .context("failed to prepare load_logs query")?;

        let entries = stmt
            .query_map(params![code.as_str(), limit as i64], |row| {
                Ok(LogEntry {
                    ts: row.get(0)?,
                    message: row.get(1)?,
                })
            })
            .context("failed to query room logs")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map room log rows")?;
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Remember which team `uid` plays for in this room.
    pub fn save_session(&self, code: &RoomCode, uid: &str, team_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO sessions (room_id, uid, team_id) VALUES (?1, ?2, ?3)",
            params![code.as_str(), uid, team_id],
        )
        .context("failed to save session")?;
        Ok(())
    }

    pub fn load_session(&self, code: &RoomCode, uid: &str) -> Result<Option<String>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT team_id FROM sessions WHERE room_id = ?1 AND uid = ?2",
            params![code.as_str(), uid],
            |row| row.get(0),
        )
        .optional()
        .context("failed to load session")
    }
}
