use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadedFile {
    pub id: String,
}

/// Destination side: upload one local file into a folder, returning the assigned id.
#[async_trait::async_trait]
pub trait FileStore: Send + Sync {
    async fn upload(
        &self,
        name: &str,
        mime_type: &str,
        folder_id: &str,
        source: &Path,
    ) -> Result<UploadedFile>;
}
