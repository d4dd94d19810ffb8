//! Changelog record types.

use crate::error::{Result, StoreError};
use crate::types::DEFAULT_COL_FAMILY_NAME;
use std::fmt;

/// Tag written in front of every V2 record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordType {
    Eof,
    Put,
    Delete,
    Merge,
}

impl RecordType {
    pub fn to_byte(self) -> u8 {
        match self {
            RecordType::Eof => 0x00,
            RecordType::Put => 0x01,
            RecordType::Delete => 0x10,
            RecordType::Merge => 0x11,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(RecordType::Eof),
            0x01 => Ok(RecordType::Put),
            0x10 => Ok(RecordType::Delete),
            0x11 => Ok(RecordType::Merge),
            other => Err(StoreError::Corruption(format!(
                "Unknown changelog record type: 0x{:02x}",
                other
            ))),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordType::Eof => "EOF_RECORD",
            RecordType::Put => "PUT_RECORD",
            RecordType::Delete => "DELETE_RECORD",
            RecordType::Merge => "MERGE_RECORD",
        };
        f.write_str(name)
    }
}

/// One mutation read from or written to a changelog file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangelogRecord {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        column_family: String,
    },
    Delete {
        key: Vec<u8>,
        column_family: String,
    },
    Merge {
        key: Vec<u8>,
        value: Vec<u8>,
        column_family: String,
    },
}

impl ChangelogRecord {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, column_family: &str) -> Self {
        ChangelogRecord::Put {
            key: key.into(),
            value: value.into(),
            column_family: column_family.to_string(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>, column_family: &str) -> Self {
        ChangelogRecord::Delete {
            key: key.into(),
            column_family: column_family.to_string(),
        }
    }

    pub fn merge(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, column_family: &str) -> Self {
        ChangelogRecord::Merge {
            key: key.into(),
            value: value.into(),
            column_family: column_family.to_string(),
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            ChangelogRecord::Put { .. } => RecordType::Put,
            ChangelogRecord::Delete { .. } => RecordType::Delete,
            ChangelogRecord::Merge { .. } => RecordType::Merge,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            ChangelogRecord::Put { key, .. }
            | ChangelogRecord::Delete { key, .. }
            | ChangelogRecord::Merge { key, .. } => key,
        }
    }

    /// `None` for deletes.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            ChangelogRecord::Put { value, .. } | ChangelogRecord::Merge { value, .. } => {
                Some(value)
            }
            ChangelogRecord::Delete { .. } => None,
        }
    }

    pub fn column_family(&self) -> &str {
        match self {
            ChangelogRecord::Put { column_family, .. }
            | ChangelogRecord::Delete { column_family, .. }
            | ChangelogRecord::Merge { column_family, .. } => column_family,
        }
    }

    pub fn is_default_family(&self) -> bool {
        self.column_family() == DEFAULT_COL_FAMILY_NAME
    }
}
