//! Fixed binary row layouts.
//!
//! Rows are sequences of fields:
//! - bytes: `u32 len (BE) | bytes`
//! - ordered i64: 8 bytes BE with the sign bit flipped, so byte order
//!   matches numeric order
//! - u64: 8 bytes BE
//! - nullable i64: `u8 present | i64 (BE)`, the i64 is zero when absent

use crate::error::{Result, StoreError};

const SIGN_BIT: u64 = 1 << 63;

/// Encode an i64 so that lexicographic byte order equals numeric order.
pub fn encode_ordered_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ SIGN_BIT).to_be_bytes()
}

pub fn decode_ordered_i64(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ SIGN_BIT) as i64
}

/// Builds one row.
#[derive(Debug, Default)]
pub struct RowWriter {
    buf: Vec<u8>,
}

impl RowWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_ordered_i64(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&encode_ordered_i64(value));
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_nullable_i64(&mut self, value: Option<i64>) -> &mut Self {
        match value {
            Some(v) => {
                self.buf.push(1);
                self.buf.extend_from_slice(&v.to_be_bytes());
            }
            None => {
                self.buf.push(0);
                self.buf.extend_from_slice(&0i64.to_be_bytes());
            }
        }
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Reads the fields of one row in order.
#[derive(Debug)]
pub struct RowReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RowReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(StoreError::Corruption(format!(
                "row too short reading {}: need {} bytes at offset {}, row has {}",
                what,
                len,
                self.pos,
                self.buf.len()
            ))),
        }
    }

    fn take_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = u32::from_be_bytes(self.take_array::<4>("field length")?) as usize;
        self.take(len, "field")
    }

    pub fn ordered_i64(&mut self) -> Result<i64> {
        Ok(decode_ordered_i64(self.take_array::<8>("ordered i64")?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array::<8>("u64")?))
    }

    pub fn nullable_i64(&mut self) -> Result<Option<i64>> {
        let present = self.take(1, "null flag")?[0];
        let value = i64::from_be_bytes(self.take_array::<8>("i64")?);
        match present {
            0 => Ok(None),
            1 => Ok(Some(value)),
            other => Err(StoreError::Corruption(format!(
                "invalid null flag {} in row",
                other
            ))),
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}
