use anyhow::{Context, Result};
use chrono::Utc;
use image_archiver_core::{ExportedFile, LockState, NewExportedFile};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::store::{ExportLedger, RunLock, StoreError};

const UNIQUE_VIOLATION: &str = "23505";

/// Postgres-backed ledger and lock.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connect to postgres")?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS exported_files (
                source_item_id TEXT PRIMARY KEY,
                source_item_name TEXT NOT NULL,
                destination_file_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("create exported_files table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backup_lock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                is_running BOOLEAN NOT NULL DEFAULT FALSE,
                started_at TIMESTAMPTZ,
                owner UUID
            )",
        )
        .execute(&self.pool)
        .await
        .context("create backup_lock table")?;

        sqlx::query(
            "INSERT INTO backup_lock (id, is_running) VALUES (1, FALSE) ON CONFLICT (id) DO NOTHING",
        )
        .execute(&self.pool)
        .await
        .context("seed backup_lock row")?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl ExportLedger for PostgresStore {
    async fn is_exported(&self, source_item_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM exported_files WHERE source_item_id = $1")
            .bind(source_item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn mark_exported(&self, file: &NewExportedFile) -> Result<ExportedFile> {
        let exported = file.clone().into_exported(Utc::now());
        let res = sqlx::query(
            "INSERT INTO exported_files
             (source_item_id, source_item_name, destination_file_id, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&exported.source_item_id)
        .bind(&exported.source_item_name)
        .bind(&exported.destination_file_id)
        .bind(exported.created_at)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(exported),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                Err(StoreError::LedgerConflict {
                    source_item_id: exported.source_item_id,
                }
                .into())
            }
            Err(e) => Err(anyhow::Error::new(e).context("insert exported file")),
        }
    }

    async fn list_exported(&self, limit: i64) -> Result<Vec<ExportedFile>> {
        let rows = sqlx::query(
            "SELECT source_item_id, source_item_name, destination_file_id, created_at
             FROM exported_files ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| ExportedFile {
                source_item_id: r.get("source_item_id"),
                source_item_name: r.get("source_item_name"),
                destination_file_id: r.get("destination_file_id"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn count_exported(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM exported_files")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[async_trait::async_trait]
impl RunLock for PostgresStore {
    async fn try_acquire(&self, owner: Uuid) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE backup_lock SET is_running = TRUE, started_at = $1, owner = $2
             WHERE id = 1 AND is_running = FALSE",
        )
        .bind(Utc::now())
        .bind(owner)
        .execute(&self.pool)
        .await
        .context("acquire backup lock")?;
        Ok(res.rows_affected() == 1)
    }

    async fn release(&self, owner: Uuid) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE backup_lock SET is_running = FALSE, owner = NULL WHERE id = 1 AND owner = $1",
        )
        .bind(owner)
        .execute(&self.pool)
        .await
        .context("release backup lock")?;
        Ok(res.rows_affected() == 1)
    }

    async fn force_release(&self) -> Result<()> {
        sqlx::query("UPDATE backup_lock SET is_running = FALSE, owner = NULL WHERE id = 1")
            .execute(&self.pool)
            .await
            .context("force release backup lock")?;
        Ok(())
    }

    async fn lock_state(&self) -> Result<LockState> {
        let row = sqlx::query("SELECT is_running, started_at, owner FROM backup_lock WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(LockState {
            is_running: row.get("is_running"),
            started_at: row.get("started_at"),
            owner: row.get("owner"),
        })
    }
}
