use std::path::Path;

use anyhow::Result;
use image_archiver_core::CandidateItem;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub files: Vec<CandidateItem>,
}

/// One page of channel history. `next_cursor` is `None` on the last page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
}

/// Source side: paginated channel history plus authenticated file download.
#[async_trait::async_trait]
pub trait MessageFeed: Send + Sync {
    async fn list_page(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<HistoryPage>;

    /// Stream the file at `url` into `dest`, returning the number of bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}
