use serde::{Deserialize, Serialize};

const IMAGE_PREFIX: &str = "image/";

/// An attachment seen while walking the channel history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateItem {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub download_url: String,
}

impl CandidateItem {
    pub fn is_image(&self) -> bool {
        is_image(&self.mime_type)
    }
}

/// Prefix match on the declared content type. Case-sensitive, no trimming.
pub fn is_image(mime_type: &str) -> bool {
    mime_type.starts_with(IMAGE_PREFIX)
}
