//! Durable checkpoint files.
//!
//! Changelog, metadata and snapshot files are written through a
//! [`CheckpointFileManager`], which publishes a file atomically on close
//! and discards it on cancel, so a half-written file is never visible.

mod compression;
mod file_manager;

pub use compression::{CompressedWriter, CompressionCodec};
pub use file_manager::{
    AtomicFile, CancellableStream, CheckpointFileManager, LocalCheckpointFileManager,
};
