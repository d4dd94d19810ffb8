//! Secondary index of expiration timestamps shared by the TTL state types.
//!
//! Each TTL-enabled variable owns a range-scan family `$ttl_<state>` whose
//! keys are `ordered i64 expiration | grouping key [| user key]`, so a
//! forward scan visits the earliest expirations first.

use crate::encoding::RowReader;
use crate::error::Result;
use crate::store::StateStore;
use crate::types::{ColumnFamilySchema, DataType, Field, KeyEncoderSpec, Schema};
use std::sync::Arc;

/// Index rows carry no payload.
const EMPTY_ROW: &[u8] = &[];

pub(crate) fn ttl_family_name(state_name: &str) -> String {
    format!("$ttl_{}", state_name)
}

pub(crate) fn min_expiry_family_name(state_name: &str) -> String {
    format!("$min_{}", state_name)
}

/// TTL settings bound to the batch that created the variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TtlContext {
    pub duration_ms: i64,
    pub batch_timestamp_ms: i64,
}

impl TtlContext {
    /// Expiration stamped on values written in this batch.
    pub(crate) fn expiration_ms(&self) -> i64 {
        self.batch_timestamp_ms.saturating_add(self.duration_ms)
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.batch_timestamp_ms
    }
}

#[derive(Clone)]
pub(crate) struct TtlIndex {
    family: String,
    store: Arc<StateStore>,
}

impl TtlIndex {
    pub(crate) fn create(store: Arc<StateStore>, state_name: &str, with_user_key: bool) -> Result<Self> {
        let family = ttl_family_name(state_name);
        let mut key_schema = Schema::new(vec![
            Field::new("expirationMs", DataType::Int64, false),
            Field::new("groupingKey", DataType::Binary, false),
        ]);
        if with_user_key {
            key_schema = key_schema.with_field(Field::new("userKey", DataType::Binary, false));
        }
        store.create_family(ColumnFamilySchema::new(
            family.as_str(),
            key_schema,
            Schema::binary(&["__empty__"]),
            KeyEncoderSpec::RangeScan {
                ordering_ordinals: vec![0],
            },
            false,
        ))?;
        Ok(Self { family, store })
    }

    pub(crate) fn insert(&self, row: &[u8]) -> Result<()> {
        self.store.put(row, EMPTY_ROW, &self.family)
    }

    pub(crate) fn remove(&self, row: &[u8]) -> Result<()> {
        self.store.remove(row, &self.family)
    }

    pub(crate) fn contains(&self, row: &[u8]) -> Result<bool> {
        Ok(self.store.get(row, &self.family)?.is_some())
    }

    /// Replace the entry `old` by `new`, writing nothing when they are equal.
    pub(crate) fn upsert(&self, old: Option<&[u8]>, new: &[u8]) -> Result<()> {
        if old == Some(new) {
            return Ok(());
        }
        if let Some(old) = old {
            self.remove(old)?;
        }
        self.insert(new)
    }

    /// Rows whose expiration is at or before `now_ms`, earliest first.
    pub(crate) fn expired_rows(&self, now_ms: i64) -> Result<Vec<Vec<u8>>> {
        let mut expired = Vec::new();
        for (row, _) in self.store.iterator(&self.family)? {
            if RowReader::new(&row).ordered_i64()? > now_ms {
                break;
            }
            expired.push(row);
        }
        Ok(expired)
    }

    /// Every row of the index in expiration order.
    pub(crate) fn rows(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .store
            .iterator(&self.family)?
            .into_iter()
            .map(|(row, _)| row)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_names() {
        assert_eq!(ttl_family_name("count"), "$ttl_count");
        assert_eq!(min_expiry_family_name("events"), "$min_events");
    }

    #[test]
    fn test_expiration_saturates() {
        let ctx = TtlContext {
            duration_ms: i64::MAX,
            batch_timestamp_ms: 10,
        };
        assert_eq!(ctx.expiration_ms(), i64::MAX);
        assert_eq!(ctx.now_ms(), 10);
    }
}
