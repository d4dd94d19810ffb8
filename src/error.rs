//! Error types for the state store.

use crate::types::Version;
use thiserror::Error;

/// Main error type for state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Unsupported operation {operation}: {detail}")]
    UnsupportedOperation { operation: String, detail: String },

    #[error("Cannot call {operation} in handle state {state}")]
    InvalidHandleState { operation: String, state: String },

    #[error("Invalid handle state transition from {from} to {to}")]
    InvalidHandleTransition { from: String, to: String },

    #[error("Cannot call {operation} on a store that is {state}")]
    InvalidStoreState { operation: String, state: String },

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    #[error("Column family {name} already exists with a different schema")]
    ColumnFamilySchemaMismatch { name: String },

    #[error("Operation {operation} is not valid on column family {family}: {detail}")]
    InvalidColumnFamilyOperation {
        operation: String,
        family: String,
        detail: String,
    },

    #[error("Column family name is reserved: {0}")]
    ReservedColumnFamily(String),

    #[error("Version not found: {0}")]
    VersionNotFound(Version),

    #[error("Invalid argument for {operation}: {detail}")]
    InvalidArgument { operation: String, detail: String },

    #[error("Null value passed to {operation} on state {state}")]
    NullValue { operation: String, state: String },

    #[error("Invalid TTL config for state {state}: {detail}")]
    InvalidTtlConfig { state: String, detail: String },

    #[error("Timers are not supported for time mode {0}")]
    TimersNotSupported(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("State store is locked by another provider")]
    Locked,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl StoreError {
    /// True for errors that make a changelog or snapshot file unusable.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Corruption(_)
                | StoreError::ChecksumMismatch { .. }
                | StoreError::InvalidFormat(_)
        )
    }

    pub(crate) fn unsupported(operation: &str, detail: impl Into<String>) -> Self {
        StoreError::UnsupportedOperation {
            operation: operation.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid_argument(operation: &str, detail: impl Into<String>) -> Self {
        StoreError::InvalidArgument {
            operation: operation.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
