//! Per-version metadata written next to each changelog file.

use crate::changelog::ChangelogFormat;
use crate::checkpoint::{CheckpointFileManager, CompressionCodec};
use crate::error::{Result, StoreError};
use crate::types::{ColumnFamilySchema, Version};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use tracing::warn;

/// How version N's changelog was written and which families exist after it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct VersionMetadata {
    pub version: Version,
    pub changelog_format: ChangelogFormat,
    pub compression: CompressionCodec,
    pub column_families: Vec<ColumnFamilySchema>,
    /// Families created or dropped during this version, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub family_events: Vec<FamilyEvent>,
}

/// A family definition change, positioned in the changelog stream.
///
/// `at_record` counts the records written before the change. A `None`
/// schema drops the family; `Some` creates it fresh, discarding any data
/// an earlier family of the same name held.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FamilyEvent {
    pub at_record: u64,
    pub name: String,
    pub schema: Option<ColumnFamilySchema>,
}

impl VersionMetadata {
    pub(crate) fn write(&self, file_manager: &dyn CheckpointFileManager, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        let mut out = file_manager.create_atomic(path)?;
        if let Err(e) = out.write_all(&bytes) {
            if let Err(cleanup) = out.cancel() {
                warn!(path = %path.display(), error = %cleanup, "Failed to cancel metadata file");
            }
            return Err(e.into());
        }
        out.close()?;
        Ok(())
    }

    pub(crate) fn read(file_manager: &dyn CheckpointFileManager, path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        file_manager.open(path)?.read_to_end(&mut bytes)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Corruption(format!("metadata {} is unreadable: {}", path.display(), e))
        })
    }
}
