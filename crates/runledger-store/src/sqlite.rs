use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use serde_json::Value;

use crate::{KvBackend, KvRow, StoreError};

/// VM instructions between deadline checks.
const PROGRESS_CHECK_OPS: i32 = 1_000;

/// Single-table key/value backend. The schema is created when the handle is
/// opened, so a live handle always has its table.
#[derive(Debug)]
pub struct SqliteKv {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    timeout: Duration,
}

impl SqliteKv {
    pub fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn, Some(path.to_path_buf()), timeout)
    }

    pub fn open_in_memory(timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, None, timeout)
    }

    fn from_connection(
        conn: Connection,
        path: Option<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        conn.busy_timeout(timeout)?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            timeout,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `op` under the configured deadline. A statement still running at
    /// the deadline is interrupted, which rolls back its write.
    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;

        let deadline = Instant::now().checked_add(self.timeout);
        conn.progress_handler(
            PROGRESS_CHECK_OPS,
            Some(move || deadline.is_some_and(|deadline| Instant::now() >= deadline)),
        );
        let result = op(&mut *conn);
        conn.progress_handler(PROGRESS_CHECK_OPS, None::<fn() -> bool>);

        result.map_err(|err| self.classify(err))
    }

    fn classify(&self, err: StoreError) -> StoreError {
        match err {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(
                    failure.code,
                    ErrorCode::OperationInterrupted | ErrorCode::DatabaseBusy
                ) =>
            {
                StoreError::Timeout(self.timeout)
            }
            other => other,
        }
    }
}

impl KvBackend for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.with_conn(|conn| read_value(conn, key))
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.with_conn(|conn| write_value(conn, key, value))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn delete_if(&self, key: &str, expected: &Value) -> Result<bool, StoreError> {
        let raw = serde_json::to_string(expected)?;
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM kv WHERE key = ?1 AND value = ?2",
                params![key, raw],
            )?;
            Ok(removed > 0)
        })
    }

    fn set_many(&self, entries: &[(String, Value)]) -> Result<Vec<bool>, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut existed = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                existed.push(read_value(&tx, key)?.is_some());
                write_value(&tx, key, value)?;
            }
            tx.commit()?;
            Ok(existed)
        })
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<KvRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT key, value, updated_at
                FROM kv
                WHERE substr(key, 1, length(?1)) = ?1
                ORDER BY rowid
                "#,
            )?;

            let rows = stmt.query_map(params![prefix], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (key, raw, updated_at) = row?;
                records.push(KvRow {
                    key,
                    value: serde_json::from_str(&raw)?,
                    updated_at,
                });
            }
            Ok(records)
        })
    }

    fn count_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM kv WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
            )?;
            Ok(removed)
        })
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<Value>) -> Option<Value>,
    ) -> Result<Option<Value>, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = read_value(&tx, key)?;
            let next = apply(current);
            if let Some(value) = &next {
                write_value(&tx, key, value)?;
            }
            tx.commit()?;
            Ok(next)
        })
    }
}

fn read_value(conn: &Connection, key: &str) -> Result<Option<Value>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    raw.map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(StoreError::from)
}

fn write_value(conn: &Connection, key: &str, value: &Value) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)?;
    let updated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    conn.execute(
        r#"
        INSERT INTO kv (key, value, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
        params![key, raw, updated_at],
    )?;

    Ok(())
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;

    Ok(())
}
