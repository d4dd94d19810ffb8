//! Binary row encoding of state keys and values.
//!
//! Encodings are stable across restarts: changelog replay depends on the
//! same logical key always producing the same bytes.

pub mod row;
mod state_encoder;

pub use row::{decode_ordered_i64, encode_ordered_i64, RowReader, RowWriter};
pub use state_encoder::{deserialize, serialize, StateTypeEncoder, TtlIndexEntry};
