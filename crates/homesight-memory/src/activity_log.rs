//! SQLite activity log.
//!
//! Every [`HistoryEntry`] a session records can be journaled here so it
//! survives the bounded in-memory ring. Old rows are removed with
//! [`ActivityLog::prune_older_than`].
//!
//! # Storage layout
//!
//! | column      | type    | description                               |
//! |-------------|---------|-------------------------------------------|
//! | id          | TEXT    | UUID v4 primary key                       |
//! | session_id  | TEXT    | Camera session                            |
//! | kind        | TEXT    | `perception`, `decision`, `failure`, ...  |
//! | recorded_at | INTEGER | Unix milliseconds (UTC)                   |
//! | summary     | TEXT    | One-line summary                          |
//! | entry       | TEXT    | The full entry as JSON                    |
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use homesight_memory::ActivityLog;
//! use homesight_types::{HistoryEntry, HomeError, SessionId, Stage, StageFailure};
//!
//! let log = ActivityLog::open_in_memory().unwrap();
//! log.append(&HistoryEntry::Failure(StageFailure {
//!     session_id: SessionId::new("porch"),
//!     stage: Stage::Stream,
//!     epoch: 0,
//!     sequence: 0,
//!     error: HomeError::Stream { camera: "porch".into(), details: "gone".into() },
//!     at: Utc::now(),
//! }))
//! .unwrap();
//! assert_eq!(log.recent(&SessionId::new("porch"), 10).unwrap().len(), 1);
//! ```

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use homesight_types::{HistoryEntry, SessionId};
use rusqlite::{Connection, params};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ActivityLogError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// One journaled entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub kind: String,
    pub recorded_at: DateTime<Utc>,
    pub summary: String,
    pub entry: HistoryEntry,
}

pub struct ActivityLog {
    conn: Connection,
}

impl ActivityLog {
    /// Open (or create) the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ActivityLogError> {
        let log = Self {
            conn: Connection::open(path)?,
        };
        log.init_schema()?;
        Ok(log)
    }

    pub fn open_in_memory() -> Result<Self, ActivityLogError> {
        let log = Self {
            conn: Connection::open_in_memory()?,
        };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<(), ActivityLogError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS activity (
                id          TEXT NOT NULL PRIMARY KEY,
                session_id  TEXT NOT NULL,
                kind        TEXT NOT NULL,
                recorded_at INTEGER NOT NULL,
                summary     TEXT NOT NULL,
                entry       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS activity_session_time
                ON activity (session_id, recorded_at);",
        )?;
        Ok(())
    }

    /// Journal `entry`, stamped with its own timestamp.
    pub fn append(&self, entry: &HistoryEntry) -> Result<Uuid, ActivityLogError> {
        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO activity (id, session_id, kind, recorded_at, summary, entry)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                entry.session_id().as_str(),
                entry.kind(),
                entry.at().timestamp_millis(),
                entry.summary(),
                serde_json::to_string(entry)?,
            ],
        )?;
        Ok(id)
    }

    /// Up to `limit` records of `session_id`, newest first.
    pub fn recent(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, ActivityLogError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, kind, recorded_at, summary, entry
             FROM activity
             WHERE session_id = ?1
             ORDER BY recorded_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id.as_str(), limit as i64], |row| {
            let id: String = row.get(0)?;
            let session: String = row.get(1)?;
            let kind: String = row.get(2)?;
            let millis: i64 = row.get(3)?;
            let summary: String = row.get(4)?;
            let entry: String = row.get(5)?;
            Ok((id, session, kind, millis, summary, entry))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, session, kind, millis, summary, entry) = row?;
            let id = Uuid::parse_str(&id).map_err(|e| {
                rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text)
            })?;
            let recorded_at = Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
                rusqlite::Error::IntegralValueOutOfRange(3, millis)
            })?;
            records.push(ActivityRecord {
                id,
                session_id: SessionId::new(session),
                kind,
                recorded_at,
                summary,
                entry: serde_json::from_str(&entry)?,
            });
        }
        Ok(records)
    }

    /// Delete every record older than `cutoff`. Returns the number removed.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, ActivityLogError> {
        let removed = self.conn.execute(
            "DELETE FROM activity WHERE recorded_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        if removed > 0 {
            tracing::debug!(removed, %cutoff, "activity log pruned");
        }
        Ok(removed)
    }

    pub fn count(&self) -> Result<u64, ActivityLogError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM activity", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}
