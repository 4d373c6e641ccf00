use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use image_archiver_core::CandidateItem;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::ProviderError;
use crate::feed::{HistoryPage, Message, MessageFeed};
use crate::{check_status, http_client};

pub const DEFAULT_API_BASE: &str = "https://slack.com/api";

#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub token: String,
    pub api_base: String,
    pub timeout: Duration,
}

/// Slack Web API client for `conversations.history` and private file downloads.
pub struct SlackClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    messages: Vec<RawMessage>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    url_private_download: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

impl SlackClient {
    pub fn new(config: SlackConfig) -> Result<Self> {
        if config.token.is_empty() {
            return Err(ProviderError::MissingCredentials("slack").into());
        }
        Ok(Self {
            http: http_client(config.timeout)?,
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            token: config.token,
        })
    }
}

impl From<RawFile> for CandidateItem {
    fn from(raw: RawFile) -> Self {
        CandidateItem {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            id: raw.id,
            mime_type: raw.mimetype.unwrap_or_default(),
            download_url: raw.url_private_download.unwrap_or_default(),
        }
    }
}

impl From<HistoryResponse> for HistoryPage {
    fn from(resp: HistoryResponse) -> Self {
        HistoryPage {
            messages: resp
                .messages
                .into_iter()
                .map(|m| Message {
                    files: m.files.into_iter().map(CandidateItem::from).collect(),
                })
                .collect(),
            next_cursor: resp
                .response_metadata
                .and_then(|m| m.next_cursor)
                .filter(|c| !c.is_empty()),
        }
    }
}

#[async_trait::async_trait]
impl MessageFeed for SlackClient {
    async fn list_page(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<HistoryPage> {
        let mut query = vec![
            ("channel", channel_id.to_owned()),
            ("limit", page_size.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_owned()));
        }

        let resp = self
            .http
            .get(format!("{}/conversations.history", self.api_base))
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await
            .context("request conversations.history")?;
        let body: HistoryResponse = check_status("slack", resp)
            .await?
            .json()
            .await
            .context("decode conversations.history")?;

        if !body.ok {
            let code = body.error.unwrap_or_else(|| "unknown_error".to_owned());
            return Err(ProviderError::Api(code).into());
        }
        let page = HistoryPage::from(body);
        debug!(
            messages = page.messages.len(),
            has_more = page.next_cursor.is_some(),
            "fetched history page"
        );
        Ok(page)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("request file download {url}"))?;
        let mut resp = check_status("slack", resp).await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("create scratch file {}", dest.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.context("read download body")? {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write scratch file {}", dest.display()))?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}
