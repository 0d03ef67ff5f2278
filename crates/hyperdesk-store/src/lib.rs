//! # HYPERDESK Store
//!
//! Embedded relational persistence over SQLite.
//!
//! Six tables: `devices`, `sessions`, `audit_events`, `transfers`,
//! `file_requests`, `preferences`. The schema is created idempotently at
//! open; older database files gain missing `sessions` columns (`token`,
//! `conflict_rule`) by additive migration. Every mutating statement runs in
//! its own implicit transaction.
//!
//! The store is shared across the controller, the control loop, and transfer
//! workers; the connection is serialized behind a mutex.

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use hyperdesk_core::models::{
    Device, FileRequest, RequestStatus, Requester, Session, SessionStatus, TransferJob,
};
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store was closed and a caller raced a write
    #[error("store is closed")]
    Closed,

    /// A stored timestamp failed to parse
    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(String),

    /// The database parent directory could not be created
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A session row joined with its peer device name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPeer {
    /// Session identifier
    pub session_id: String,
    /// Peer device identifier
    pub peer_device_id: String,
    /// Peer name, `"Unknown"` when the device row is gone
    pub peer_name: String,
}

/// Durable store handle.
pub struct Store {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the database at `path` and ensure the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or schema creation
    /// fails.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        let store = Self {
            conn: Mutex::new(Some(conn)),
            path,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Open the default database at `<cwd>/data/hyperdesk.db`.
    ///
    /// # Errors
    ///
    /// Returns an error if the working directory is unavailable or the
    /// database cannot be opened.
    pub fn open_default() -> Result<Self> {
        let path = std::env::current_dir()?.join("data").join("hyperdesk.db");
        Self::open(path)
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the store. Later calls fail with [`StoreError::Closed`].
    pub fn close(&self) {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = guard.take() {
            if let Err((_, error)) = conn.close() {
                tracing::warn!("error closing database: {error}");
            }
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StoreError::Closed),
        }
    }

    /// Upsert a device row, refreshing `last_seen`.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure.
    pub fn record_device(&self, device: &Device) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO devices (id, name, ip, status, capabilities, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    device.id,
                    device.name,
                    device.ip,
                    device.status.as_str(),
                    device.capabilities.join(","),
                    utc_now(),
                ],
            )?;
            Ok(())
        })
    }

    /// Upsert a session row with its full policy core.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure.
    pub fn record_session(&self, session: &Session) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions
                 (id, host_device_id, peer_device_id, status, mode, approval_required,
                  conflict_rule, token, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    session.id,
                    session.host_device.id,
                    session.peer_device.id,
                    session.status.as_str(),
                    session.policy.mode.as_str(),
                    i64::from(session.policy.approval_required),
                    session.policy.conflict_rule.as_str(),
                    session.token,
                    session.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Flip a session's status without touching the rest of the row.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure.
    pub fn update_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET status = ?1 WHERE id = ?2",
                params![status.as_str(), session_id],
            )?;
            Ok(())
        })
    }

    /// Append an audit event.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure.
    pub fn record_audit_event(
        &self,
        session_id: &str,
        event_type: &str,
        details: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_events (session_id, event_type, details, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, event_type, details, utc_now()],
            )?;
            Ok(())
        })
    }

    /// Upsert a transfer row.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure.
    pub fn record_transfer(&self, session_id: &str, job: &TransferJob) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO transfers
                 (id, session_id, path, direction, status, progress, checksum, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job.id,
                    session_id,
                    job.path,
                    job.direction.as_str(),
                    job.status.as_str(),
                    job.progress,
                    job.checksum,
                    utc_now(),
                ],
            )?;
            Ok(())
        })
    }

    /// Upsert a file request row.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure.
    pub fn record_request(&self, request: &FileRequest) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO file_requests
                 (id, session_id, path, requester, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    request.id,
                    request.session_id,
                    request.path,
                    request.requester.as_str(),
                    request.status.as_str(),
                    request.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Requests for one session, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on read failure or a corrupt timestamp.
    pub fn list_requests(&self, session_id: &str) -> Result<Vec<FileRequest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, path, requester, status, created_at
                 FROM file_requests
                 WHERE session_id = ?1
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![session_id], request_from_row)?;
            collect_requests(rows)
        })
    }

    /// Request history, for one session or for all of them.
    ///
    /// # Errors
    ///
    /// Returns an error on read failure or a corrupt timestamp.
    pub fn list_requests_history(&self, session_id: Option<&str>) -> Result<Vec<FileRequest>> {
        self.with_conn(|conn| match session_id {
            Some(id) => {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, path, requester, status, created_at
                     FROM file_requests
                     WHERE session_id = ?1
                     ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![id], request_from_row)?;
                collect_requests(rows)
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, path, requester, status, created_at
                     FROM file_requests
                     ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map([], request_from_row)?;
                collect_requests(rows)
            }
        })
    }

    /// All sessions joined with their peer device names, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on read failure.
    pub fn list_sessions_with_peers(&self) -> Result<Vec<SessionPeer>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sessions.id AS session_id,
                        sessions.peer_device_id AS peer_device_id,
                        devices.name AS peer_name
                 FROM sessions
                 LEFT JOIN devices ON sessions.peer_device_id = devices.id
                 ORDER BY sessions.created_at DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SessionPeer {
                    session_id: row.get("session_id")?,
                    peer_device_id: row.get("peer_device_id")?,
                    peer_name: row
                        .get::<_, Option<String>>("peer_name")?
                        .unwrap_or_else(|| "Unknown".to_string()),
                })
            })?;
            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row?);
            }
            Ok(sessions)
        })
    }

    /// Set a preference key.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure.
    pub fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO preferences (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// Read a preference, with a default for missing keys.
    ///
    /// # Errors
    ///
    /// Returns an error on read failure.
    pub fn get_preference(&self, key: &str, default: &str) -> Result<String> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT value FROM preferences WHERE key = ?1")?;
            let value = stmt
                .query_row(params![key], |row| row.get::<_, String>(0))
                .map(Some)
                .or_else(|error| match error {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            Ok(value.unwrap_or_else(|| default.to_string()))
        })
    }

    /// Typed helper: integer preference, falling back on parse failure.
    ///
    /// # Errors
    ///
    /// Returns an error on read failure.
    pub fn get_preference_int(&self, key: &str, default: i64) -> Result<i64> {
        let raw = self.get_preference(key, &default.to_string())?;
        Ok(raw.parse().unwrap_or(default))
    }

    /// Typed helper: boolean preference. `"True"`, `"true"`, and `"1"` are
    /// truthy; everything else is false.
    ///
    /// # Errors
    ///
    /// Returns an error on read failure.
    pub fn get_preference_bool(&self, key: &str, default: bool) -> Result<bool> {
        let raw = self.get_preference(key, if default { "true" } else { "false" })?;
        Ok(matches!(raw.as_str(), "True" | "true" | "1"))
    }

    /// The whole preference map.
    ///
    /// # Errors
    ///
    /// Returns an error on read failure.
    pub fn list_preferences(&self) -> Result<HashMap<String, String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM preferences")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut map = HashMap::new();
            for row in rows {
                let (key, value) = row?;
                map.insert(key, value);
            }
            Ok(map)
        })
    }

    fn initialize(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS devices (
                     id TEXT PRIMARY KEY,
                     name TEXT NOT NULL,
                     ip TEXT NOT NULL,
                     status TEXT NOT NULL,
                     capabilities TEXT NOT NULL,
                     last_seen TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                     id TEXT PRIMARY KEY,
                     host_device_id TEXT NOT NULL,
                     peer_device_id TEXT NOT NULL,
                     status TEXT NOT NULL,
                     mode TEXT NOT NULL,
                     approval_required INTEGER NOT NULL,
                     conflict_rule TEXT,
                     token TEXT,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS audit_events (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     session_id TEXT NOT NULL,
                     event_type TEXT NOT NULL,
                     details TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS transfers (
                     id TEXT PRIMARY KEY,
                     session_id TEXT NOT NULL,
                     path TEXT NOT NULL,
                     direction TEXT NOT NULL,
                     status TEXT NOT NULL,
                     progress REAL NOT NULL,
                     checksum TEXT,
                     updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS file_requests (
                     id TEXT PRIMARY KEY,
                     session_id TEXT NOT NULL,
                     path TEXT NOT NULL,
                     requester TEXT NOT NULL,
                     status TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS preferences (
                     key TEXT PRIMARY KEY,
                     value TEXT NOT NULL
                 );",
            )?;
            ensure_columns(conn, "sessions", &[("token", "TEXT"), ("conflict_rule", "TEXT")])?;
            Ok(())
        })
    }
}

/// Additive migration: add any of `columns` missing from `table`.
fn ensure_columns(conn: &Connection, table: &str, columns: &[(&str, &str)]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>("name"))?
        .collect::<std::result::Result<_, _>>()?;
    for (name, definition) in columns {
        if !existing.iter().any(|c| c == name) {
            tracing::info!("migrating {table}: adding column {name}");
            conn.execute(
                &format!("ALTER TABLE {table} ADD COLUMN {name} {definition}"),
                [],
            )?;
        }
    }
    Ok(())
}

struct RawRequest {
    id: String,
    session_id: String,
    path: String,
    requester: String,
    status: String,
    created_at: String,
}

fn request_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRequest> {
    Ok(RawRequest {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        path: row.get("path")?,
        requester: row.get("requester")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
    })
}

fn collect_requests(
    rows: impl Iterator<Item = rusqlite::Result<RawRequest>>,
) -> Result<Vec<FileRequest>> {
    let mut requests = Vec::new();
    for row in rows {
        let raw = row?;
        requests.push(FileRequest {
            created_at: parse_timestamp(&raw.created_at)?,
            id: raw.id,
            session_id: raw.session_id,
            path: raw.path,
            requester: Requester::parse(&raw.requester),
            status: RequestStatus::parse(&raw.status),
        });
    }
    Ok(requests)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(raw.to_string()))
}

fn utc_now() -> String {
    Utc::now().to_rfc3339()
}
