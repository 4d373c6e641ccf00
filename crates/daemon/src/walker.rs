use std::sync::Arc;

use image_archiver_core::{CandidateItem, NewExportedFile, RunError};
use image_archiver_providers::MessageFeed;
use image_archiver_storage::{ExportLedger, StoreError};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::transfer::{ItemTransfer, RetryPolicy};

pub const DEFAULT_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone)]
pub struct WalkerSettings {
    pub channel_id: String,
    pub page_size: u32,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WalkSummary {
    pub pages: u32,
    pub transferred: u32,
    pub skipped_non_image: u32,
    pub skipped_exported: u32,
}

/// Walks the channel history page by page and archives every image not yet in the ledger.
///
/// Strictly sequential: one page fetch or one transfer in flight at a time, in feed order.
pub struct HistoryWalker {
    feed: Arc<dyn MessageFeed>,
    ledger: Arc<dyn ExportLedger>,
    transfer: ItemTransfer,
    settings: WalkerSettings,
}

impl HistoryWalker {
    pub fn new(
        feed: Arc<dyn MessageFeed>,
        ledger: Arc<dyn ExportLedger>,
        transfer: ItemTransfer,
        settings: WalkerSettings,
    ) -> Self {
        Self {
            feed,
            ledger,
            transfer,
            settings,
        }
    }

    /// Page fetch errors abort immediately; item errors abort once retries run out.
    pub async fn run(&self, cancel: &watch::Receiver<bool>) -> Result<WalkSummary, RunError> {
        let mut summary = WalkSummary::default();
        let mut cursor: Option<String> = None;

        loop {
            if is_cancelled(cancel) {
                return Err(RunError::Cancelled);
            }
            let page = self
                .feed
                .list_page(
                    &self.settings.channel_id,
                    cursor.as_deref(),
                    self.settings.page_size,
                )
                .await
                .map_err(|e| RunError::FeedFetchFailure {
                    cursor: cursor.clone(),
                    message: format!("{e:#}"),
                })?;
            summary.pages += 1;
            debug!(page = summary.pages, cursor = ?cursor, "processing history page");

            for message in page.messages {
                for item in message.files {
                    self.process(item, &mut summary, cancel).await?;
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(summary)
    }

    async fn process(
        &self,
        item: CandidateItem,
        summary: &mut WalkSummary,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), RunError> {
        if !item.is_image() {
            debug!(item_id = %item.id, mime_type = %item.mime_type, "skipping non-image");
            summary.skipped_non_image += 1;
            return Ok(());
        }

        let exported = self
            .ledger
            .is_exported(&item.id)
            .await
            .map_err(|e| RunError::Ledger(format!("{e:#}")))?;
        if exported {
            debug!(item_id = %item.id, "already archived");
            summary.skipped_exported += 1;
            return Ok(());
        }

        if is_cancelled(cancel) {
            return Err(RunError::Cancelled);
        }

        let destination_file_id = self
            .settings
            .retry
            .run(&item.id, || self.transfer.transfer(&item))
            .await
            .map_err(|e| RunError::TransferFailure {
                item_id: item.id.clone(),
                attempts: e.attempts,
                message: format!("{:#}", e.last_error),
            })?;

        self.ledger
            .mark_exported(&NewExportedFile::new(
                item.id.as_str(),
                item.name.as_str(),
                destination_file_id.as_str(),
            ))
            .await
            .map_err(|e| match e.downcast_ref::<StoreError>() {
                Some(StoreError::LedgerConflict { source_item_id }) => RunError::LedgerConflict {
                    source_item_id: source_item_id.clone(),
                },
                None => RunError::Ledger(format!("{e:#}")),
            })?;

        summary.transferred += 1;
        info!(
            item_id = %item.id,
            name = %item.name,
            destination_file_id = %destination_file_id,
            "archived image"
        );
        Ok(())
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}
