use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::store::{FileStore, UploadedFile};
use crate::{check_status, http_client};

pub const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload";

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub access_token: String,
    pub upload_base: String,
    pub timeout: Duration,
}

/// Google Drive v3 multipart uploader. Asks only for the new file's id back.
pub struct DriveClient {
    http: reqwest::Client,
    upload_base: String,
    access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileMetadata<'a> {
    name: &'a str,
    parents: [&'a str; 1],
    mime_type: &'a str,
}

impl DriveClient {
    pub fn new(config: DriveConfig) -> Result<Self> {
        if config.access_token.is_empty() {
            return Err(ProviderError::MissingCredentials("drive").into());
        }
        Ok(Self {
            http: http_client(config.timeout)?,
            upload_base: config.upload_base.trim_end_matches('/').to_owned(),
            access_token: config.access_token,
        })
    }
}

/// `multipart/related` body: JSON metadata part followed by the media part.
fn related_body(boundary: &str, metadata: &[u8], mime_type: &str, media: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + media.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(format!("Content-Type: {mime_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[async_trait::async_trait]
impl FileStore for DriveClient {
    async fn upload(
        &self,
        name: &str,
        mime_type: &str,
        folder_id: &str,
        source: &Path,
    ) -> Result<UploadedFile> {
        let media = tokio::fs::read(source)
            .await
            .with_context(|| format!("read scratch file {}", source.display()))?;
        let metadata = serde_json::to_vec(&FileMetadata {
            name,
            parents: [folder_id],
            mime_type,
        })?;
        let boundary = format!("image-archiver-{}", Uuid::new_v4().simple());
        let body = related_body(&boundary, &metadata, mime_type, &media);

        let resp = self
            .http
            .post(format!("{}/drive/v3/files", self.upload_base))
            .query(&[
                ("uploadType", "multipart"),
                ("fields", "id"),
                ("supportsAllDrives", "true"),
            ])
            .bearer_auth(&self.access_token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await
            .context("request drive upload")?;

        check_status("drive", resp)
            .await?
            .json::<UploadedFile>()
            .await
            .context("decode drive upload response")
    }
}
