//! SQLite-backed snapshot storage for native shells.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};

use crate::capabilities::kv::{KvError, KvKey, KvStore, StorageErrorCode, MAX_VALUE_SIZE};
use crate::queue::UnixTimeMs;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    key         TEXT PRIMARY KEY NOT NULL,
    value       TEXT NOT NULL,
    checksum    TEXT NOT NULL,
    updated_at  INTEGER NOT NULL
);
";

pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let conn = Connection::open(path).map_err(map_sqlite_error)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, KvError> {
        // FULL sync: a returned set() must survive power loss.
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))
            .map_err(map_sqlite_error)?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(map_sqlite_error)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, KvError>,
    ) -> Result<T, KvError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "connection mutex poisoned"))?;
        f(&conn)
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> KvError {
    use rusqlite::ErrorCode;

    let code = match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) => StorageErrorCode::Busy,
        Some(ErrorCode::DatabaseLocked) => StorageErrorCode::Locked,
        Some(ErrorCode::DiskFull) => StorageErrorCode::DiskFull,
        Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
            StorageErrorCode::Corrupted
        }
        Some(ErrorCode::PermissionDenied) | Some(ErrorCode::ReadOnly) => {
            StorageErrorCode::PermissionDenied
        }
        _ => StorageErrorCode::Unknown,
    };
    KvError::storage(code, e.to_string())
}

#[async_trait]
impl KvStore for SqliteKvStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &KvKey) -> Result<Option<String>, KvError> {
        let row: Option<(String, String)> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT value, checksum FROM snapshots WHERE key = ?1",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(map_sqlite_error)
        })?;

        let Some((value, checksum)) = row else {
            return Ok(None);
        };

        let actual = blake3::hash(value.as_bytes()).to_hex();
        if actual.as_str() != checksum {
            return Err(KvError::Corrupted {
                key: key.to_string(),
                reason: format!("integrity check failed: expected {checksum}, got {actual}"),
            });
        }

        Ok(Some(value))
    }

    #[instrument(skip(self, value), fields(key = %key, bytes = value.len()))]
    async fn set(&self, key: &KvKey, value: String) -> Result<(), KvError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }

        let checksum = blake3::hash(value.as_bytes()).to_hex().to_string();
        let now = UnixTimeMs::now().0 as i64;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO snapshots (key, value, checksum, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    checksum = excluded.checksum,
                    updated_at = excluded.updated_at",
                params![key.as_str(), value, checksum, now],
            )
            .map_err(map_sqlite_error)
        })?;

        debug!("Snapshot row written");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        let removed = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM snapshots WHERE key = ?1",
                params![key.as_str()],
            )
            .map_err(map_sqlite_error)
        })?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn roundtrip_in_memory() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let key = KvKey::mutation_queue();

        assert_eq!(store.get(&key).await.unwrap(), None);

        store.set(&key, "[1]".to_string()).await.unwrap();
        store.set(&key, "[1,2]".to_string()).await.unwrap();

        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("[1,2]"));
    }

    #[tokio::test]
    async fn persists_across_connections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("core.db");
        let key = KvKey::shadow("watchlists").unwrap();

        {
            let store = SqliteKvStore::open(&path).unwrap();
            store.set(&key, r#"{"entities":[]}"#.to_string()).await.unwrap();
        }

        let store = SqliteKvStore::open(&path).unwrap();
        assert_eq!(
            store.get(&key).await.unwrap().as_deref(),
            Some(r#"{"entities":[]}"#)
        );
    }

    #[tokio::test]
    async fn tampered_row_detected() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let key = KvKey::auth_user();
        store.set(&key, r#"{"id":"u1"}"#.to_string()).await.unwrap();

        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE snapshots SET value = '{\"id\":\"u2\"}' WHERE key = ?1",
                    params![key.as_str()],
                )
                .map_err(map_sqlite_error)
            })
            .unwrap();

        let result = store.get(&key).await;
        assert!(matches!(result, Err(KvError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let key = KvKey::auth_token();

        assert!(!store.delete(&key).await.unwrap());
        store.set(&key, "\"t\"".to_string()).await.unwrap();
        assert!(store.delete(&key).await.unwrap());
    }
}
