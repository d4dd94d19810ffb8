//! Full snapshots of one store version.
//!
//! Layout: `SNP\0 | format version | body | crc32(body)`. The body holds
//! every column family: its schema as JSON followed by its entries.

use super::engine::{ColumnFamily, KvEngine};
use crate::checkpoint::CheckpointFileManager;
use crate::encoding::{RowReader, RowWriter};
use crate::error::{Result, StoreError};
use crate::types::{ColumnFamilySchema, Version};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{info, warn};

/// Magic bytes for snapshot files.
const SNAPSHOT_MAGIC: &[u8; 4] = b"SNP\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

pub(crate) fn write_snapshot(
    file_manager: &dyn CheckpointFileManager,
    path: &Path,
    version: Version,
    engine: &KvEngine,
) -> Result<()> {
    let mut body = RowWriter::new();
    let mut families: Vec<&ColumnFamily> = engine.families().collect();
    families.sort_by(|a, b| a.schema.name.cmp(&b.schema.name));

    body.put_u64(version.0);
    body.put_u64(families.len() as u64);
    for family in families {
        body.put_bytes(&serde_json::to_vec(&family.schema)?);
        body.put_u64(family.data.len() as u64);
        for (key, value) in &family.data {
            body.put_bytes(key).put_bytes(value);
        }
    }
    let body = body.finish();
    let checksum = crc32fast::hash(&body).to_be_bytes();

    let mut out = file_manager.create_atomic(path)?;
    let parts: [&[u8]; 4] = [
        SNAPSHOT_MAGIC,
        &[SNAPSHOT_VERSION],
        &body,
        &checksum,
    ];
    if let Err(e) = write_parts(&mut *out, &parts) {
        if let Err(cleanup) = out.cancel() {
            warn!(path = %path.display(), error = %cleanup, "Failed to cancel snapshot file");
        }
        return Err(e.into());
    }
    out.close()?;

    info!(version = version.0, bytes = body.len(), path = %path.display(), "Wrote state snapshot");
    Ok(())
}

fn write_parts<W: Write + ?Sized>(out: &mut W, parts: &[&[u8]]) -> std::io::Result<()> {
    for part in parts {
        out.write_all(part)?;
    }
    Ok(())
}

pub(crate) fn read_snapshot(
    file_manager: &dyn CheckpointFileManager,
    path: &Path,
    expected_version: Version,
) -> Result<KvEngine> {
    let mut bytes = Vec::new();
    file_manager.open(path)?.read_to_end(&mut bytes)?;

    if bytes.len() < SNAPSHOT_MAGIC.len() + 1 + 4 {
        return Err(StoreError::Corruption(format!(
            "snapshot {} is too short",
            path.display()
        )));
    }
    if &bytes[..4] != SNAPSHOT_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid snapshot magic".into()));
    }
    if bytes[4] != SNAPSHOT_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported snapshot version: {}",
            bytes[4]
        )));
    }

    let body = &bytes[5..bytes.len() - 4];
    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&bytes[bytes.len() - 4..]);
    let stored_checksum = u32::from_be_bytes(checksum_bytes);
    let computed_checksum = crc32fast::hash(body);
    if stored_checksum != computed_checksum {
        return Err(StoreError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    let mut reader = RowReader::new(body);
    let version = Version(reader.u64()?);
    if version != expected_version {
        return Err(StoreError::Corruption(format!(
            "snapshot {} holds version {}, expected {}",
            path.display(),
            version,
            expected_version
        )));
    }

    let mut engine = KvEngine::new();
    let family_count = reader.u64()?;
    for _ in 0..family_count {
        let schema: ColumnFamilySchema = serde_json::from_slice(reader.bytes()?)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        let entry_count = reader.u64()?;
        let mut data = BTreeMap::new();
        for _ in 0..entry_count {
            let key = reader.bytes()?.to_vec();
            let value = reader.bytes()?.to_vec();
            data.insert(key, value);
        }
        engine.insert_family(ColumnFamily { schema, data });
    }

    if !reader.is_exhausted() {
        return Err(StoreError::Corruption(format!(
            "snapshot {} has {} trailing bytes",
            path.display(),
            reader.remaining()
        )));
    }
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::LocalCheckpointFileManager;
    use crate::types::{KeyEncoderSpec, Schema};
    use tempfile::TempDir;

    fn sample_engine() -> KvEngine {
        let mut engine = KvEngine::new();
        engine.put(b"k", b"v", "default").unwrap();
        engine
            .create_family(ColumnFamilySchema::new(
                "list",
                Schema::binary(&["key"]),
                Schema::binary(&["value"]),
                KeyEncoderSpec::NoPrefix,
                true,
            ))
            .unwrap();
        engine.put(b"g", b"a", "list").unwrap();
        engine.merge(b"g", b"b", "list").unwrap();
        engine
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let fm = LocalCheckpointFileManager;
        let path = dir.path().join("5.snapshot");

        write_snapshot(&fm, &path, Version(5), &sample_engine()).unwrap();
        let engine = read_snapshot(&fm, &path, Version(5)).unwrap();

        assert_eq!(engine.get(b"k", "default").unwrap(), Some(b"v".to_vec()));
        assert_eq!(
            engine.values(b"g", "list").unwrap(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert_eq!(engine.schemas(), sample_engine().schemas());
    }

    #[test]
    fn test_snapshot_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let fm = LocalCheckpointFileManager;
        let path = dir.path().join("5.snapshot");
        write_snapshot(&fm, &path, Version(5), &sample_engine()).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let err = read_snapshot(&fm, &path, Version(5)).err().unwrap();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
    }
}
