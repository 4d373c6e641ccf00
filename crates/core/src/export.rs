use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One archived attachment: the ledger row keyed by the source item id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportedFile {
    pub source_item_id: String,
    pub source_item_name: String,
    pub destination_file_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExportedFile {
    pub source_item_id: String,
    pub source_item_name: String,
    pub destination_file_id: String,
}

impl NewExportedFile {
    pub fn new(
        source_item_id: impl Into<String>,
        source_item_name: impl Into<String>,
        destination_file_id: impl Into<String>,
    ) -> Self {
        Self {
            source_item_id: source_item_id.into(),
            source_item_name: source_item_name.into(),
            destination_file_id: destination_file_id.into(),
        }
    }

    pub fn into_exported(self, created_at: DateTime<Utc>) -> ExportedFile {
        ExportedFile {
            source_item_id: self.source_item_id,
            source_item_name: self.source_item_name,
            destination_file_id: self.destination_file_id,
            created_at,
        }
    }
}
