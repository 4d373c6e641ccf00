use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::postgres_store::PostgresStore;
use crate::sqlite_store::SqliteStore;
use crate::store::{ExportLedger, RunLock};

/// Handles to the ledger and the run lock, both living in the same database.
#[derive(Clone)]
pub struct ArchiveRepository {
    root: PathBuf,
    ledger: Arc<dyn ExportLedger>,
    lock: Arc<dyn RunLock>,
}

impl ArchiveRepository {
    /// Postgres when `database_url` is set, otherwise SQLite under `<root>/state`.
    pub async fn init(root: impl Into<PathBuf>, database_url: Option<&str>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("state")).context("create state directory")?;

        match database_url {
            Some(url) => {
                info!("using postgres archive store");
                let store = Arc::new(PostgresStore::new(url).await?);
                Ok(Self::from_parts(root, store.clone(), store))
            }
            None => {
                let db_path = root.join("state").join("archive.db");
                info!(path = %db_path.display(), "using sqlite archive store");
                let store = Arc::new(SqliteStore::new(db_path)?);
                Ok(Self::from_parts(root, store.clone(), store))
            }
        }
    }

    /// Synchronous SQLite-only constructor, used by tests and tools.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("state")).context("create state directory")?;
        let store = Arc::new(SqliteStore::new(root.join("state").join("archive.db"))?);
        Ok(Self::from_parts(root, store.clone(), store))
    }

    pub fn from_parts(
        root: PathBuf,
        ledger: Arc<dyn ExportLedger>,
        lock: Arc<dyn RunLock>,
    ) -> Self {
        Self { root, ledger, lock }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch directory for in-flight downloads.
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch")
    }

    pub fn ledger(&self) -> Arc<dyn ExportLedger> {
        self.ledger.clone()
    }

    pub fn lock(&self) -> Arc<dyn RunLock> {
        self.lock.clone()
    }
}

#[cfg(test)]
mod tests {
    use image_archiver_core::NewExportedFile;
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn sqlite_repository_shares_one_database() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = ArchiveRepository::init(tmp.path(), None).await.expect("repo");
        assert!(tmp.path().join("state").join("archive.db").exists());

        repo.ledger()
            .mark_exported(&NewExportedFile::new("F1", "a.png", "d1"))
            .await
            .unwrap();
        let reopened = ArchiveRepository::new(tmp.path()).unwrap();
        assert!(reopened.ledger().is_exported("F1").await.unwrap());

        let owner = Uuid::new_v4();
        assert!(repo.lock().try_acquire(owner).await.unwrap());
        assert!(!reopened.lock().try_acquire(Uuid::new_v4()).await.unwrap());
        assert!(reopened.lock().release(owner).await.unwrap());
    }

    #[test]
    fn scratch_dir_lives_under_root() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = ArchiveRepository::new(tmp.path()).unwrap();
        assert_eq!(repo.scratch_dir(), tmp.path().join("scratch"));
        assert_eq!(repo.root(), tmp.path());
    }
}
