//! Durable relational store.
//!
//! A single SQLite connection in WAL mode, shared by handle. WAL gives
//! unrestricted readers while one writer commits; multi-row writes go
//! through [`Store::with_tx`] so a logical action is either fully visible
//! or absent. Schema lives in forward-only migrations gated by an exclusive
//! transaction so only one process migrates at a time.

pub mod migrations;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

/// Shared handle to the persistent store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub async fn open(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| CoreError::StoreUnavailable(format!("open {}: {e}", path.display())))?;
        let store = Self::finish_open(conn)?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::StoreUnavailable(format!("open :memory:: {e}")))?;
        Self::finish_open(conn)
    }

    fn finish_open(conn: Connection) -> CoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let mut conn = conn;
        migrations::run(&mut conn)?;

        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a read (or single-statement write) against the connection.
    pub async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Run `f` inside one immediate transaction. Commits on `Ok`, rolls back
    /// on `Err` — callers never observe a partial logical action.
    pub async fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(CoreError::from)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(CoreError::from)?;
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, "transaction rolled back");
                // Dropping the transaction rolls it back.
                Err(err)
            }
        }
    }

    /// Current schema version.
    pub async fn schema_version(&self) -> CoreResult<i64> {
        self.with_conn(|conn| {
            let version: i64 =
                conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;
            Ok(version)
        })
        .await
    }
}

/// Canonical SQL timestamp encoding: RFC 3339 UTC with millisecond
/// precision, which sorts lexicographically.
pub fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn ts_from_sql(raw: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Internal(format!("bad timestamp {raw:?}: {e}")))
}
