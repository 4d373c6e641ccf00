use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use image_archiver_core::{ExportedFile, LockState, NewExportedFile};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use uuid::Uuid;

use crate::store::{ExportLedger, RunLock, StoreError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed ledger and lock. Each method opens a fresh connection on the blocking pool.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = open(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS exported_files (
                source_item_id TEXT PRIMARY KEY,
                source_item_name TEXT NOT NULL,
                destination_file_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS backup_lock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                is_running INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                owner TEXT
            );
            INSERT OR IGNORE INTO backup_lock (id, is_running) VALUES (1, 0);",
        )
        .context("bootstrap sqlite schema")?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            f(&conn)
        })
        .await?
    }
}

fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).context("open archive db")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

#[async_trait::async_trait]
impl ExportLedger for SqliteStore {
    async fn is_exported(&self, source_item_id: &str) -> Result<bool> {
        let id = source_item_id.to_owned();
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM exported_files WHERE source_item_id = ?1",
                    [&id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn mark_exported(&self, file: &NewExportedFile) -> Result<ExportedFile> {
        let exported = file.clone().into_exported(Utc::now());
        self.with_conn(move |conn| {
            let res = conn.execute(
                "INSERT INTO exported_files
                 (source_item_id, source_item_name, destination_file_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    exported.source_item_id,
                    exported.source_item_name,
                    exported.destination_file_id,
                    format_ts(exported.created_at),
                ],
            );
            match res {
                Ok(_) => Ok(exported),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::LedgerConflict {
                        source_item_id: exported.source_item_id,
                    }
                    .into())
                }
                Err(e) => Err(anyhow::Error::new(e).context("insert exported file")),
            }
        })
        .await
    }

    async fn list_exported(&self, limit: i64) -> Result<Vec<ExportedFile>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT source_item_id, source_item_name, destination_file_id, created_at
                 FROM exported_files ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], row_to_exported)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Into::into)
        })
        .await
    }

    async fn count_exported(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let n = conn.query_row("SELECT COUNT(*) FROM exported_files", [], |r| r.get(0))?;
            Ok(n)
        })
        .await
    }
}

#[async_trait::async_trait]
impl RunLock for SqliteStore {
    async fn try_acquire(&self, owner: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE backup_lock SET is_running = 1, started_at = ?1, owner = ?2
                     WHERE id = 1 AND is_running = 0",
                    params![format_ts(Utc::now()), owner.to_string()],
                )
                .context("acquire backup lock")?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release(&self, owner: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE backup_lock SET is_running = 0, owner = NULL
                     WHERE id = 1 AND owner = ?1",
                    [owner.to_string()],
                )
                .context("release backup lock")?;
            Ok(changed == 1)
        })
        .await
    }

    async fn force_release(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE backup_lock SET is_running = 0, owner = NULL WHERE id = 1",
                [],
            )
            .context("force release backup lock")?;
            Ok(())
        })
        .await
    }

    async fn lock_state(&self) -> Result<LockState> {
        self.with_conn(|conn| {
            let state = conn.query_row(
                "SELECT is_running, started_at, owner FROM backup_lock WHERE id = 1",
                [],
                |row| {
                    let started_at: Option<String> = row.get(1)?;
                    let owner: Option<String> = row.get(2)?;
                    Ok(LockState {
                        is_running: row.get(0)?,
                        started_at: started_at.map(|raw| parse_ts(1, raw)).transpose()?,
                        owner: owner.and_then(|raw| Uuid::parse_str(&raw).ok()),
                    })
                },
            )?;
            Ok(state)
        })
        .await
    }
}

fn row_to_exported(row: &rusqlite::Row) -> rusqlite::Result<ExportedFile> {
    Ok(ExportedFile {
        source_item_id: row.get(0)?,
        source_item_name: row.get(1)?,
        destination_file_id: row.get(2)?,
        created_at: parse_ts(3, row.get(3)?)?,
    })
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(tmp.path().join("archive.db")).expect("store");
        (tmp, store)
    }

    #[tokio::test]
    async fn mark_then_is_exported() {
        let (_tmp, store) = temp_store();
        assert!(!store.is_exported("F1").await.unwrap());

        let row = store
            .mark_exported(&NewExportedFile::new("F1", "cat.png", "drive-1"))
            .await
            .unwrap();
        assert_eq!(row.destination_file_id, "drive-1");
        assert!(store.is_exported("F1").await.unwrap());
        assert!(!store.is_exported("F2").await.unwrap());
        assert_eq!(store.count_exported().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_mark_is_a_conflict_and_keeps_original() {
        let (_tmp, store) = temp_store();
        store
            .mark_exported(&NewExportedFile::new("F1", "cat.png", "drive-1"))
            .await
            .unwrap();

        let err = store
            .mark_exported(&NewExportedFile::new("F1", "cat.png", "drive-2"))
            .await
            .unwrap_err();
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::LedgerConflict { source_item_id }) => assert_eq!(source_item_id, "F1"),
            None => panic!("expected ledger conflict, got {err:#}"),
        }

        let rows = store.list_exported(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].destination_file_id, "drive-1");
    }

    #[tokio::test]
    async fn list_is_newest_first_and_limited() {
        let (_tmp, store) = temp_store();
        for i in 0..3 {
            store
                .mark_exported(&NewExportedFile::new(format!("F{i}"), "x.png", format!("d{i}")))
                .await
                .unwrap();
        }
        let rows = store.list_exported(2).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.source_item_id.as_str()).collect();
        assert_eq!(ids, ["F2", "F1"]);
    }

    #[tokio::test]
    async fn acquire_is_exclusive_until_released() {
        let (_tmp, store) = temp_store();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(store.try_acquire(first).await.unwrap());
        assert!(!store.try_acquire(second).await.unwrap());

        let state = store.lock_state().await.unwrap();
        assert!(state.is_running);
        assert_eq!(state.owner, Some(first));
        assert!(state.started_at.is_some());

        assert!(store.release(first).await.unwrap());
        assert!(!store.lock_state().await.unwrap().is_running);
        assert!(store.try_acquire(second).await.unwrap());
    }

    #[tokio::test]
    async fn release_by_non_owner_leaves_lock_held() {
        let (_tmp, store) = temp_store();
        let owner = Uuid::new_v4();
        assert!(store.try_acquire(owner).await.unwrap());

        assert!(!store.release(Uuid::new_v4()).await.unwrap());
        assert!(store.lock_state().await.unwrap().is_running);

        store.force_release().await.unwrap();
        let state = store.lock_state().await.unwrap();
        assert!(!state.is_running);
        assert!(state.owner.is_none());
    }

    #[tokio::test]
    async fn lock_row_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("archive.db");
        let owner = Uuid::new_v4();
        {
            let store = SqliteStore::new(path.clone()).unwrap();
            assert!(store.try_acquire(owner).await.unwrap());
        }
        let reopened = SqliteStore::new(path).unwrap();
        let state = reopened.lock_state().await.unwrap();
        assert!(state.is_running);
        assert_eq!(state.owner, Some(owner));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_has_single_winner() {
        let (_tmp, store) = temp_store();
        let store = Arc::new(store);

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.try_acquire(Uuid::new_v4()).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in attempts {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn corrupt_timestamp_is_an_error_not_a_fresh_time() {
        let (tmp, store) = temp_store();
        store
            .mark_exported(&NewExportedFile::new("F1", "cat.png", "drive-1"))
            .await
            .unwrap();
        let conn = Connection::open(tmp.path().join("archive.db")).unwrap();
        conn.execute(
            "UPDATE exported_files SET created_at = 'yesterday' WHERE source_item_id = 'F1'",
            [],
        )
        .unwrap();
        conn.execute("UPDATE backup_lock SET started_at = 'soon' WHERE id = 1", [])
            .unwrap();

        let err = store.list_exported(10).await.unwrap_err();
        assert!(
            matches!(
                err.downcast_ref::<rusqlite::Error>(),
                Some(rusqlite::Error::FromSqlConversionFailure(3, Type::Text, _))
            ),
            "{err:#}"
        );
        assert!(store.lock_state().await.is_err());
    }
}
