use anyhow::Result;
use image_archiver_core::{ExportedFile, LockState, NewExportedFile};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A second insert for an already-archived source item. The walker filters
    /// exported ids first, so hitting this means an upstream logic fault.
    #[error("source item {source_item_id} is already in the ledger")]
    LedgerConflict { source_item_id: String },
}

/// Durable record of which source items have been archived and where they went.
#[async_trait::async_trait]
pub trait ExportLedger: Send + Sync {
    /// Pure existence check.
    async fn is_exported(&self, source_item_id: &str) -> Result<bool>;

    /// Insert a new record. Fails with [`StoreError::LedgerConflict`] if the id is present.
    async fn mark_exported(&self, file: &NewExportedFile) -> Result<ExportedFile>;

    /// Newest records first.
    async fn list_exported(&self, limit: i64) -> Result<Vec<ExportedFile>>;

    async fn count_exported(&self) -> Result<i64>;
}

/// Single-row try-lock serializing archive runs across processes.
#[async_trait::async_trait]
pub trait RunLock: Send + Sync {
    /// Atomic compare-and-swap from not running to running. Never waits.
    async fn try_acquire(&self, owner: Uuid) -> Result<bool>;

    /// Clear the lock if `owner` still holds it. Returns whether anything was cleared.
    async fn release(&self, owner: Uuid) -> Result<bool>;

    /// Clear the lock regardless of holder. Operator recovery after a crash.
    async fn force_release(&self) -> Result<()>;

    async fn lock_state(&self) -> Result<LockState>;
}
