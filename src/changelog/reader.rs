//! Changelog readers.
//!
//! Readers are lazy, forward-only and cannot be restarted. Reaching the
//! terminator ends iteration; any malformed field is reported once as a
//! corruption error, after which the reader yields nothing more.

use super::record::{ChangelogRecord, RecordType};
use super::ChangelogFormat;
use crate::error::{Result, StoreError};
use crate::types::DEFAULT_COL_FAMILY_NAME;
use std::io::{self, Read};

/// Forward-only sequence of changelog records.
pub trait ChangelogReader: Iterator<Item = Result<ChangelogRecord>> + Send {
    fn format(&self) -> ChangelogFormat;

    /// True once the terminator was read or iteration stopped on an error.
    fn is_finished(&self) -> bool;
}

/// Big-endian field decoding over the decompressed input.
struct RecordInput {
    input: Box<dyn Read + Send>,
    source: String,
}

impl RecordInput {
    fn corrupt(&self, detail: impl std::fmt::Display) -> StoreError {
        StoreError::Corruption(format!("{}: {}", self.source, detail))
    }

    fn read_exact(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        match self.input.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(self.corrupt(format!("truncated while reading {}", what)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_u8(&mut self, what: &str) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf, what)?;
        Ok(buf[0])
    }

    fn read_i32(&mut self, what: &str) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf, what)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Read a field whose length prefix was already consumed.
    fn read_body(&mut self, len: i32, what: &str) -> Result<Vec<u8>> {
        let len = usize::try_from(len)
            .map_err(|_| self.corrupt(format!("invalid {} length {}", what, len)))?;
        let mut body = Vec::with_capacity(len.min(64 * 1024));
        let read = (&mut self.input).take(len as u64).read_to_end(&mut body)?;
        if read != len {
            return Err(self.corrupt(format!(
                "truncated {}: expected {} bytes, got {}",
                what, len, read
            )));
        }
        Ok(body)
    }

    /// Length-prefixed field that must be present.
    fn read_field(&mut self, what: &str) -> Result<Vec<u8>> {
        let len = self.read_i32(what)?;
        if len < 0 {
            return Err(self.corrupt(format!("invalid {} length {}", what, len)));
        }
        self.read_body(len, what)
    }
}

/// Reader for files produced by [`super::ChangelogWriterV1`].
pub struct ChangelogReaderV1 {
    input: RecordInput,
    finished: bool,
}

impl ChangelogReaderV1 {
    pub fn new(input: Box<dyn Read + Send>, source: impl Into<String>) -> Self {
        Self {
            input: RecordInput {
                input,
                source: source.into(),
            },
            finished: false,
        }
    }

    fn read_record(&mut self) -> Result<Option<ChangelogRecord>> {
        let key_len = self.input.read_i32("key length")?;
        if key_len == -1 {
            return Ok(None);
        }
        if key_len < 0 {
            return Err(self.input.corrupt(format!("invalid key length {}", key_len)));
        }
        let key = self.input.read_body(key_len, "key")?;

        let value_len = self.input.read_i32("value length")?;
        let record = match value_len {
            -1 => ChangelogRecord::delete(key, DEFAULT_COL_FAMILY_NAME),
            len if len < 0 => {
                return Err(self.input.corrupt(format!("invalid value length {}", len)));
            }
            len => {
                let value = self.input.read_body(len, "value")?;
                ChangelogRecord::put(key, value, DEFAULT_COL_FAMILY_NAME)
            }
        };
        Ok(Some(record))
    }
}

impl Iterator for ChangelogReaderV1 {
    type Item = Result<ChangelogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl ChangelogReader for ChangelogReaderV1 {
    fn format(&self) -> ChangelogFormat {
        ChangelogFormat::V1
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Reader for files produced by [`super::ChangelogWriterV2`].
pub struct ChangelogReaderV2 {
    input: RecordInput,
    finished: bool,
}

impl ChangelogReaderV2 {
    pub fn new(input: Box<dyn Read + Send>, source: impl Into<String>) -> Self {
        Self {
            input: RecordInput {
                input,
                source: source.into(),
            },
            finished: false,
        }
    }

    fn read_column_family(&mut self) -> Result<String> {
        let bytes = self.input.read_field("column family")?;
        String::from_utf8(bytes)
            .map_err(|e| self.input.corrupt(format!("column family is not UTF-8: {}", e)))
    }

    fn read_record(&mut self) -> Result<Option<ChangelogRecord>> {
        let tag = self.input.read_u8("record type")?;
        let record_type =
            RecordType::from_byte(tag).map_err(|e| self.input.corrupt(e.to_string()))?;

        let record = match record_type {
            RecordType::Eof => return Ok(None),
            RecordType::Put | RecordType::Merge => {
                let key = self.input.read_field("key")?;
                let value = self.input.read_field("value")?;
                let column_family = self.read_column_family()?;
                if record_type == RecordType::Put {
                    ChangelogRecord::Put {
                        key,
                        value,
                        column_family,
                    }
                } else {
                    ChangelogRecord::Merge {
                        key,
                        value,
                        column_family,
                    }
                }
            }
            RecordType::Delete => {
                let key = self.input.read_field("key")?;
                let value_len = self.input.read_i32("value length")?;
                if value_len != -1 {
                    return Err(self.input.corrupt(format!(
                        "delete record carries value length {}",
                        value_len
                    )));
                }
                let column_family = self.read_column_family()?;
                ChangelogRecord::Delete { key, column_family }
            }
        };
        Ok(Some(record))
    }
}

impl Iterator for ChangelogReaderV2 {
    type Item = Result<ChangelogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl ChangelogReader for ChangelogReaderV2 {
    fn format(&self) -> ChangelogFormat {
        ChangelogFormat::V2
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}
