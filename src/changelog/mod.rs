//! Changelog (write-ahead log) files.
//!
//! One changelog file holds every mutation of one store version. Applied in
//! write order on top of the previous version it reproduces the new version
//! exactly. Two wire formats exist: V1 knows a single column family and no
//! merges, V2 tags every record with its type and column family.

mod reader;
mod record;
mod writer;

pub use reader::{ChangelogReader, ChangelogReaderV1, ChangelogReaderV2};
pub use record::{ChangelogRecord, RecordType};
pub use writer::{ChangelogWriter, ChangelogWriterV1, ChangelogWriterV2};

use crate::checkpoint::{CheckpointFileManager, CompressionCodec};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Changelog wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChangelogFormat {
    V1,
    #[default]
    V2,
}

/// Create a writer for a new changelog file at `path`.
pub fn create_writer(
    file_manager: &dyn CheckpointFileManager,
    path: &Path,
    format: ChangelogFormat,
    codec: CompressionCodec,
) -> Result<Box<dyn ChangelogWriter>> {
    Ok(match format {
        ChangelogFormat::V1 => Box::new(ChangelogWriterV1::new(file_manager, path, codec)?),
        ChangelogFormat::V2 => Box::new(ChangelogWriterV2::new(file_manager, path, codec)?),
    })
}

/// Open a committed changelog file written with `format` and `codec`.
pub fn open_reader(
    file_manager: &dyn CheckpointFileManager,
    path: &Path,
    format: ChangelogFormat,
    codec: CompressionCodec,
) -> Result<Box<dyn ChangelogReader>> {
    let input = codec.wrap_input(file_manager.open(path)?);
    let source = path.display().to_string();
    Ok(match format {
        ChangelogFormat::V1 => Box::new(ChangelogReaderV1::new(input, source)),
        ChangelogFormat::V2 => Box::new(ChangelogReaderV2::new(input, source)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::LocalCheckpointFileManager;
    use crate::error::StoreError;
    use tempfile::TempDir;

    fn write_and_read(
        format: ChangelogFormat,
        codec: CompressionCodec,
        records: &[ChangelogRecord],
    ) -> Vec<ChangelogRecord> {
        let dir = TempDir::new().unwrap();
        let fm = LocalCheckpointFileManager;
        let path = dir.path().join("1.changelog");

        let mut writer = create_writer(&fm, &path, format, codec).unwrap();
        for record in records {
            match format {
                ChangelogFormat::V1 => match record {
                    ChangelogRecord::Put { key, value, .. } => writer.put(key, value).unwrap(),
                    ChangelogRecord::Delete { key, .. } => writer.delete(key).unwrap(),
                    ChangelogRecord::Merge { .. } => unreachable!(),
                },
                ChangelogFormat::V2 => writer.write_record(record).unwrap(),
            }
        }
        writer.commit().unwrap();

        open_reader(&fm, &path, format, codec)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_v1_round_trip() {
        let records = vec![
            ChangelogRecord::put(b"k1".to_vec(), b"v1".to_vec(), "default"),
            ChangelogRecord::put(b"k2".to_vec(), Vec::new(), "default"),
            ChangelogRecord::delete(b"k1".to_vec(), "default"),
        ];
        for codec in [CompressionCodec::None, CompressionCodec::Gzip] {
            assert_eq!(write_and_read(ChangelogFormat::V1, codec, &records), records);
        }
    }

    #[test]
    fn test_v2_round_trip() {
        let records = vec![
            ChangelogRecord::put(b"k1".to_vec(), b"v1".to_vec(), "default"),
            ChangelogRecord::merge(b"k1".to_vec(), b"v2".to_vec(), "list"),
            ChangelogRecord::delete(b"k".to_vec(), "f"),
            ChangelogRecord::put(Vec::new(), b"empty-key".to_vec(), "$ttl_count"),
        ];
        for codec in [CompressionCodec::None, CompressionCodec::Gzip] {
            assert_eq!(write_and_read(ChangelogFormat::V2, codec, &records), records);
        }
    }

    #[test]
    fn test_v2_delete_reads_back_without_value() {
        let read = write_and_read(
            ChangelogFormat::V2,
            CompressionCodec::None,
            &[ChangelogRecord::delete(b"k".to_vec(), "f")],
        );
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].record_type(), RecordType::Delete);
        assert_eq!(read[0].key(), b"k");
        assert_eq!(read[0].value(), None);
        assert_eq!(read[0].column_family(), "f");
    }

    #[test]
    fn test_uncommitted_file_cannot_be_read() {
        let dir = TempDir::new().unwrap();
        let fm = LocalCheckpointFileManager;
        let path = dir.path().join("1.changelog");

        let mut writer =
            create_writer(&fm, &path, ChangelogFormat::V1, CompressionCodec::None).unwrap();
        writer.put(b"k", b"v").unwrap();
        assert!(matches!(
            writer.put_cf(b"k", b"v", "other"),
            Err(StoreError::UnsupportedOperation { .. })
        ));
        writer.abort();

        let err = open_reader(&fm, &path, ChangelogFormat::V1, CompressionCodec::None)
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Io(_)));
    }
}
