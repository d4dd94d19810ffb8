//! Changelog writers.
//!
//! Both formats share an [`OutputSink`] that owns the atomic output file
//! and its compression stream. Each format encodes records on its own.

use super::record::{ChangelogRecord, RecordType};
use super::ChangelogFormat;
use crate::checkpoint::{CheckpointFileManager, CompressedWriter, CompressionCodec};
use crate::error::{Result, StoreError};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Appends mutation records for one store version.
pub trait ChangelogWriter: Send {
    fn format(&self) -> ChangelogFormat;

    /// Put into the default column family.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn put_cf(&mut self, key: &[u8], value: &[u8], column_family: &str) -> Result<()>;

    /// Delete from the default column family.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    fn delete_cf(&mut self, key: &[u8], column_family: &str) -> Result<()>;

    fn merge(&mut self, key: &[u8], value: &[u8], column_family: &str) -> Result<()>;

    /// Write the terminator and publish the file. On failure the writer is
    /// aborted before the error is returned.
    fn commit(&mut self) -> Result<()>;

    /// Discard the file. Safe to call repeatedly and after a failure.
    fn abort(&mut self);

    /// Number of records appended so far.
    fn num_records(&self) -> u64;

    /// Append an already-built record. Default-family puts and deletes go
    /// through `put`/`delete` so V1 accepts them.
    fn write_record(&mut self, record: &ChangelogRecord) -> Result<()> {
        let default_family = record.is_default_family();
        match record {
            ChangelogRecord::Put { key, value, .. } if default_family => self.put(key, value),
            ChangelogRecord::Put {
                key,
                value,
                column_family,
            } => self.put_cf(key, value, column_family),
            ChangelogRecord::Delete { key, .. } if default_family => self.delete(key),
            ChangelogRecord::Delete { key, column_family } => self.delete_cf(key, column_family),
            ChangelogRecord::Merge {
                key,
                value,
                column_family,
            } => self.merge(key, value, column_family),
        }
    }
}

/// Output file plus compression stream, released by commit or abort.
struct OutputSink {
    path: PathBuf,
    out: Option<CompressedWriter>,
    num_records: u64,
}

impl OutputSink {
    fn create(
        file_manager: &dyn CheckpointFileManager,
        path: &Path,
        codec: CompressionCodec,
    ) -> Result<Self> {
        let stream = file_manager.create_atomic(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            out: Some(codec.wrap_output(stream)),
            num_records: 0,
        })
    }

    fn stream(&mut self, operation: &str) -> Result<&mut CompressedWriter> {
        self.out.as_mut().ok_or_else(|| StoreError::InvalidStoreState {
            operation: operation.to_string(),
            state: "closed".to_string(),
        })
    }

    fn write_u8(&mut self, operation: &str, value: u8) -> Result<()> {
        self.stream(operation)?.write_all(&[value])?;
        Ok(())
    }

    fn write_i32(&mut self, operation: &str, value: i32) -> Result<()> {
        self.stream(operation)?.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, operation: &str, bytes: &[u8]) -> Result<()> {
        let len = i32::try_from(bytes.len()).map_err(|_| {
            StoreError::invalid_argument(operation, format!("field of {} bytes", bytes.len()))
        })?;
        self.write_i32(operation, len)?;
        self.stream(operation)?.write_all(bytes)?;
        Ok(())
    }

    fn publish(&mut self) -> Result<()> {
        let out = self.out.take().ok_or_else(|| StoreError::InvalidStoreState {
            operation: "commit".to_string(),
            state: "closed".to_string(),
        })?;
        out.finish()?.close()?;
        debug!(path = %self.path.display(), records = self.num_records, "Committed changelog");
        Ok(())
    }

    fn cancel(&mut self) {
        let Some(out) = self.out.take() else {
            return;
        };
        match out.finish() {
            Ok(stream) => {
                if let Err(e) = stream.cancel() {
                    warn!(path = %self.path.display(), error = %e, "Failed to cancel changelog file");
                }
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to close changelog stream during abort");
            }
        }
    }
}

/// Single default column family, no merge.
///
/// `int32 keyLen | key | int32 valueLen | value`, `valueLen = -1` for
/// deletes, `keyLen = -1` terminates the file.
pub struct ChangelogWriterV1 {
    sink: OutputSink,
}

impl ChangelogWriterV1 {
    pub fn new(
        file_manager: &dyn CheckpointFileManager,
        path: &Path,
        codec: CompressionCodec,
    ) -> Result<Self> {
        Ok(Self {
            sink: OutputSink::create(file_manager, path, codec)?,
        })
    }

    fn commit_inner(&mut self) -> Result<()> {
        self.sink.write_i32("commit", -1)?;
        self.sink.publish()
    }
}

impl ChangelogWriter for ChangelogWriterV1 {
    fn format(&self) -> ChangelogFormat {
        ChangelogFormat::V1
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.sink.write_bytes("put", key)?;
        self.sink.write_bytes("put", value)?;
        self.sink.num_records += 1;
        Ok(())
    }

    fn put_cf(&mut self, _key: &[u8], _value: &[u8], column_family: &str) -> Result<()> {
        Err(StoreError::unsupported(
            "put",
            format!(
                "changelog format v1 has no column families (got {})",
                column_family
            ),
        ))
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.sink.write_bytes("delete", key)?;
        self.sink.write_i32("delete", -1)?;
        self.sink.num_records += 1;
        Ok(())
    }

    fn delete_cf(&mut self, _key: &[u8], column_family: &str) -> Result<()> {
        Err(StoreError::unsupported(
            "delete",
            format!(
                "changelog format v1 has no column families (got {})",
                column_family
            ),
        ))
    }

    fn merge(&mut self, _key: &[u8], _value: &[u8], _column_family: &str) -> Result<()> {
        Err(StoreError::unsupported(
            "merge",
            "changelog format v1 does not record merges",
        ))
    }

    fn commit(&mut self) -> Result<()> {
        if let Err(e) = self.commit_inner() {
            self.abort();
            return Err(e);
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.sink.cancel();
    }

    fn num_records(&self) -> u64 {
        self.sink.num_records
    }
}

/// Column families and merges.
///
/// `byte type | int32 keyLen | key | int32 valueLen | value |
/// int32 familyLen | family`; a single `EOF` byte terminates the file.
pub struct ChangelogWriterV2 {
    sink: OutputSink,
}

impl ChangelogWriterV2 {
    pub fn new(
        file_manager: &dyn CheckpointFileManager,
        path: &Path,
        codec: CompressionCodec,
    ) -> Result<Self> {
        Ok(Self {
            sink: OutputSink::create(file_manager, path, codec)?,
        })
    }

    fn write_entry(
        &mut self,
        record_type: RecordType,
        key: &[u8],
        value: Option<&[u8]>,
        column_family: &str,
    ) -> Result<()> {
        let operation = match record_type {
            RecordType::Put => "put",
            RecordType::Delete => "delete",
            RecordType::Merge => "merge",
            RecordType::Eof => {
                return Err(StoreError::invalid_argument(
                    "write",
                    "EOF is written by commit only",
                ))
            }
        };

        self.sink.write_u8(operation, record_type.to_byte())?;
        self.sink.write_bytes(operation, key)?;
        match value {
            Some(value) => self.sink.write_bytes(operation, value)?,
            None => self.sink.write_i32(operation, -1)?,
        }
        self.sink.write_bytes(operation, column_family.as_bytes())?;
        self.sink.num_records += 1;
        Ok(())
    }

    fn commit_inner(&mut self) -> Result<()> {
        self.sink.write_u8("commit", RecordType::Eof.to_byte())?;
        self.sink.publish()
    }
}

impl ChangelogWriter for ChangelogWriterV2 {
    fn format(&self) -> ChangelogFormat {
        ChangelogFormat::V2
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_cf(key, value, crate::types::DEFAULT_COL_FAMILY_NAME)
    }

    fn put_cf(&mut self, key: &[u8], value: &[u8], column_family: &str) -> Result<()> {
        self.write_entry(RecordType::Put, key, Some(value), column_family)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.delete_cf(key, crate::types::DEFAULT_COL_FAMILY_NAME)
    }

    fn delete_cf(&mut self, key: &[u8], column_family: &str) -> Result<()> {
        self.write_entry(RecordType::Delete, key, None, column_family)
    }

    fn merge(&mut self, key: &[u8], value: &[u8], column_family: &str) -> Result<()> {
        self.write_entry(RecordType::Merge, key, Some(value), column_family)
    }

    fn commit(&mut self) -> Result<()> {
        if let Err(e) = self.commit_inner() {
            self.abort();
            return Err(e);
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.sink.cancel();
    }

    fn num_records(&self) -> u64 {
        self.sink.num_records
    }
}
