use thiserror::Error;

/// Reasons a run ends early. Lock contention is not here: it is a skip, not a failure.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to fetch history page (cursor {cursor:?}): {message}")]
    FeedFetchFailure {
        cursor: Option<String>,
        message: String,
    },
    #[error("transfer of {item_id} failed after {attempts} attempts: {message}")]
    TransferFailure {
        item_id: String,
        attempts: u32,
        message: String,
    },
    #[error("ledger already has a record for {source_item_id}")]
    LedgerConflict { source_item_id: String },
    #[error("ledger operation failed: {0}")]
    Ledger(String),
    #[error("run cancelled")]
    Cancelled,
}
