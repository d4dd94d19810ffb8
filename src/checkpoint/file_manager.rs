//! Checkpoint file manager with atomic create semantics.

use crate::error::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An output stream that is published by `close` and discarded by `cancel`.
pub trait CancellableStream: Write + Send {
    /// Flush, sync and publish the file under its final name.
    fn close(self: Box<Self>) -> io::Result<()>;

    /// Discard everything written so far.
    fn cancel(self: Box<Self>) -> io::Result<()>;
}

/// File system operations needed by the state store.
pub trait CheckpointFileManager: Send + Sync {
    /// Create a file that becomes visible at `path` only once closed.
    fn create_atomic(&self, path: &Path) -> Result<Box<dyn CancellableStream>>;

    /// Open a published file for reading.
    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>>;

    fn exists(&self, path: &Path) -> bool;

    /// File names (not paths) inside `dir`. Missing directories list as empty.
    fn list(&self, dir: &Path) -> Result<Vec<String>>;

    fn delete(&self, path: &Path) -> Result<()>;

    fn mkdirs(&self, dir: &Path) -> Result<()>;
}

/// [`CheckpointFileManager`] over the local file system.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalCheckpointFileManager;

impl CheckpointFileManager for LocalCheckpointFileManager {
    fn create_atomic(&self, path: &Path) -> Result<Box<dyn CancellableStream>> {
        Ok(Box::new(AtomicFile::create(path)?))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let file = File::open(path)?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn mkdirs(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        Ok(())
    }
}

/// A file written under a temporary name and renamed into place on close.
///
/// Dropping an `AtomicFile` without closing it removes the temporary file.
pub struct AtomicFile {
    final_path: PathBuf,
    temp_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AtomicFile {
    pub fn create(final_path: impl AsRef<Path>) -> io::Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();
        let file_name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let temp_name = format!(
            ".{}.{}-{}.tmp",
            file_name,
            std::process::id(),
            TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let temp_path = final_path.with_file_name(temp_name);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        Ok(Self {
            final_path,
            temp_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.final_path
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "atomic file already closed"))
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl CancellableStream for AtomicFile {
    fn close(mut self: Box<Self>) -> io::Result<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        // Drop the handle before renaming.
        self.writer = None;
        fs::rename(&self.temp_path, &self.final_path)?;
        Ok(())
    }

    fn cancel(mut self: Box<Self>) -> io::Result<()> {
        self.writer = None;
        match fs::remove_file(&self.temp_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}
