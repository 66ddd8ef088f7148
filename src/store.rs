//! SQLite history of health snapshots and update events.
//!
//! Both tables are append-only. Write failures are logged and reported as
//! [`RecordOutcome::Dropped`]; read failures yield empty results.

use crate::collectors::health::{HealthSnapshot, HealthStatus};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::error;

pub const DEFAULT_RECENT_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("history store is closed")]
    Closed,
}

/// Result of an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Stored,
    /// The row was not written; the failure has already been logged.
    Dropped { reason: String },
}

impl RecordOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, RecordOutcome::Stored)
    }
}

/// A health snapshot as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredHealth {
    pub id: i64,
    pub timestamp_ms: i64,
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateLogEntry {
    pub id: i64,
    pub timestamp_ms: i64,
    pub update_name: String,
    pub status: String,
    pub details: String,
}

#[derive(Debug, Clone, Copy)]
enum Table {
    DeviceHealth,
    UpdateLogs,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::DeviceHealth => "device_health",
            Table::UpdateLogs => "update_logs",
        }
    }
}

pub struct HistoryStore {
    conn: Option<Connection>,
    last_health_ts: i64,
    last_update_ts: i64,
}

impl HistoryStore {
    /// Open or create the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        let last_health_ts = max_timestamp(&conn, Table::DeviceHealth)?;
        let last_update_ts = max_timestamp(&conn, Table::UpdateLogs)?;
        Ok(Self {
            conn: Some(conn),
            last_health_ts,
            last_update_ts,
        })
    }

    pub fn record_health(&mut self, snapshot: &HealthSnapshot) -> RecordOutcome {
        let result = self.insert_health(snapshot);
        outcome(Table::DeviceHealth, result)
    }

    pub fn record_update(&mut self, update_name: &str, status: &str, details: &str) -> RecordOutcome {
        let result = self.insert_update(update_name, status, details);
        outcome(Table::UpdateLogs, result)
    }

    /// Newest first, at most `limit` rows.
    pub fn recent_health(&self, limit: usize) -> Vec<StoredHealth> {
        self.query_recent_health(limit).unwrap_or_else(|err| {
            error!(table = "device_health", error = %err, "не удалось прочитать историю");
            Vec::new()
        })
    }

    /// Newest first, at most `limit` rows.
    pub fn recent_updates(&self, limit: usize) -> Vec<UpdateLogEntry> {
        self.query_recent_updates(limit).unwrap_or_else(|err| {
            error!(table = "update_logs", error = %err, "не удалось прочитать историю");
            Vec::new()
        })
    }

    /// Safe to call more than once; later calls do nothing.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_conn, err)) = conn.close() {
                error!(error = %err, "не удалось закрыть базу истории");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }

    fn insert_health(&mut self, snapshot: &HealthSnapshot) -> Result<(), StoreError> {
        let ts = next_timestamp(self.last_health_ts);
        self.conn()?.execute(
            "INSERT INTO device_health (timestamp, cpu_usage, memory_usage, disk_health, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ts,
                snapshot.cpu_usage,
                snapshot.memory_usage,
                snapshot.disk_health,
                snapshot.status.as_str()
            ],
        )?;
        self.last_health_ts = ts;
        Ok(())
    }

    fn insert_update(&mut self, update_name: &str, status: &str, details: &str) -> Result<(), StoreError> {
        let ts = next_timestamp(self.last_update_ts);
        self.conn()?.execute(
            "INSERT INTO update_logs (update_name, status, timestamp, details)
             VALUES (?1, ?2, ?3, ?4)",
            params![update_name, status, ts, details],
        )?;
        self.last_update_ts = ts;
        Ok(())
    }

    fn query_recent_health(&self, limit: usize) -> Result<Vec<StoredHealth>, StoreError> {
        let mut stmt = self.conn()?.prepare(
            "SELECT id, timestamp, cpu_usage, memory_usage, disk_health, status
             FROM device_health ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![clamp_limit(limit)], |row| {
            let status: String = row.get(5)?;
            Ok(StoredHealth {
                id: row.get(0)?,
                timestamp_ms: row.get(1)?,
                snapshot: HealthSnapshot {
                    cpu_usage: row.get(2)?,
                    memory_usage: row.get(3)?,
                    disk_health: row.get(4)?,
                    status: HealthStatus::parse(&status),
                },
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn query_recent_updates(&self, limit: usize) -> Result<Vec<UpdateLogEntry>, StoreError> {
        let mut stmt = self.conn()?.prepare(
            "SELECT id, timestamp, update_name, status, details
             FROM update_logs ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![clamp_limit(limit)], |row| {
            Ok(UpdateLogEntry {
                id: row.get(0)?,
                timestamp_ms: row.get(1)?,
                update_name: row.get(2)?,
                status: row.get(3)?,
                details: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

impl Drop for HistoryStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS device_health (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            cpu_usage REAL NOT NULL,
            memory_usage REAL NOT NULL,
            disk_health TEXT NOT NULL,
            status TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS update_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            update_name TEXT NOT NULL,
            status TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            details TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_device_health_timestamp ON device_health(timestamp);
        CREATE INDEX IF NOT EXISTS idx_update_logs_timestamp ON update_logs(timestamp);
        ",
    )?;
    Ok(())
}

fn max_timestamp(conn: &Connection, table: Table) -> Result<i64, StoreError> {
    let sql = format!("SELECT COALESCE(MAX(timestamp), 0) FROM {}", table.name());
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

fn outcome(table: Table, result: Result<(), StoreError>) -> RecordOutcome {
    match result {
        Ok(()) => RecordOutcome::Stored,
        Err(err) => {
            error!(
                table = table.name(),
                error = %err,
                "не удалось записать историю, строка отброшена"
            );
            RecordOutcome::Dropped {
                reason: err.to_string(),
            }
        }
    }
}

/// Strictly increasing per table, even within one millisecond.
fn next_timestamp(last: i64) -> i64 {
    now_unix_ms().max(last.saturating_add(1))
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot(cpu: f64) -> HealthSnapshot {
        HealthSnapshot {
            cpu_usage: cpu,
            memory_usage: 50.0,
            disk_health: "Healthy".to_string(),
            status: if cpu >= 80.0 {
                HealthStatus::Warning
            } else {
                HealthStatus::Ok
            },
        }
    }

    #[test]
    fn recent_health_is_newest_first_and_limited() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        for i in 0..15 {
            assert!(store.record_health(&snapshot(i as f64)).is_stored());
        }

        let recent = store.recent_health(10);
        assert_eq!(recent.len(), 10);
        assert!(recent
            .windows(2)
            .all(|w| w[0].timestamp_ms > w[1].timestamp_ms));
        assert_eq!(recent[0].snapshot.cpu_usage, 14.0);
        assert_eq!(recent[9].snapshot.cpu_usage, 5.0);
    }

    #[test]
    fn recent_health_with_fewer_rows_than_limit() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.record_health(&snapshot(90.0));
        let recent = store.recent_health(DEFAULT_RECENT_LIMIT);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].snapshot.status, HealthStatus::Warning);
        assert!(store.recent_health(0).is_empty());
    }

    #[test]
    fn update_log_round_trip() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.record_update("KB1,KB2", "success", "installed");
        store.record_update("KB3", "error", "reboot pending");

        let recent = store.recent_updates(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].update_name, "KB3");
        assert_eq!(recent[0].status, "error");
        assert_eq!(recent[1].details, "installed");
    }

    #[test]
    fn tables_are_independent() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.record_update("KB1", "success", "");
        assert!(store.recent_health(10).is_empty());
        assert_eq!(store.recent_updates(10).len(), 1);
    }

    #[test]
    fn write_failure_is_dropped_not_raised() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.db");
        let mut store = HistoryStore::open(&path).unwrap();

        let other = Connection::open(&path).unwrap();
        other.execute_batch("DROP TABLE device_health;").unwrap();
        drop(other);

        let outcome = store.record_health(&snapshot(10.0));
        assert!(matches!(outcome, RecordOutcome::Dropped { .. }));
        assert!(store.recent_health(10).is_empty());
    }

    #[test]
    fn writes_after_close_are_dropped() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.close();
        assert_eq!(
            store.record_update("KB1", "success", ""),
            RecordOutcome::Dropped {
                reason: "history store is closed".to_string()
            }
        );
        assert!(store.recent_updates(10).is_empty());
    }

    #[test]
    fn close_twice_is_harmless() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.close();
        store.close();
        assert!(store.is_closed());
    }

    #[test]
    fn reopen_keeps_history_and_ordering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");

        let mut store = HistoryStore::open(&path).unwrap();
        store.record_health(&snapshot(1.0));
        let first_ts = store.recent_health(1)[0].timestamp_ms;
        drop(store);

        let mut store = HistoryStore::open(&path).unwrap();
        store.record_health(&snapshot(2.0));
        let recent = store.recent_health(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].snapshot.cpu_usage, 2.0);
        assert!(recent[0].timestamp_ms > first_ts);
    }
}
