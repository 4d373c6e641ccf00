pub mod drive;
pub mod error;
pub mod feed;
pub mod slack;
pub mod store;

use std::time::Duration;

use anyhow::{Context, Result};

pub use drive::{DriveClient, DriveConfig};
pub use error::ProviderError;
pub use feed::{HistoryPage, Message, MessageFeed};
pub use slack::{SlackClient, SlackConfig};
pub use store::{FileStore, UploadedFile};

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("image-archiver/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build http client")
}

/// Turn a non-2xx response into [`ProviderError::Status`], keeping the body for the log.
pub(crate) async fn check_status(
    service: &'static str,
    resp: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        service,
        status: status.as_u16(),
        body,
    }
    .into())
}
