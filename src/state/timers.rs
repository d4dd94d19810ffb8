//! Timers registered per grouping key.
//!
//! Two internal families hold every timer:
//! - `key -> timestamp`: `grouping key | ordered ts`, prefix-scanned to list
//!   the timers of one key
//! - `timestamp -> key`: `ordered ts | grouping key`, range-scanned to find
//!   expired timers across all keys in firing order

use crate::encoding::{deserialize, serialize, RowReader, RowWriter};
use crate::error::{Result, StoreError};
use crate::store::StateStore;
use crate::types::{ColumnFamilySchema, DataType, Field, KeyEncoderSpec, Schema, TimeMode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

const EMPTY_ROW: &[u8] = &[];

pub(crate) struct TimerState<K> {
    store: Arc<StateStore>,
    key_to_ts: String,
    ts_to_key: String,
    _key: PhantomData<fn() -> K>,
}

impl<K> TimerState<K>
where
    K: Serialize + DeserializeOwned,
{
    pub(crate) fn new(store: Arc<StateStore>, time_mode: TimeMode) -> Result<Self> {
        let prefix = match time_mode {
            TimeMode::ProcessingTime => "$procTimers",
            TimeMode::EventTime => "$eventTimers",
            TimeMode::NoTime => return Err(StoreError::TimersNotSupported(time_mode.to_string())),
        };
        let key_to_ts = format!("{}_keyToTimestamp", prefix);
        let ts_to_key = format!("{}_timestampToKey", prefix);

        store.create_family(ColumnFamilySchema::new(
            key_to_ts.as_str(),
            Schema::new(vec![
                Field::new("key", DataType::Binary, false),
                Field::new("expiryTimestampMs", DataType::Int64, false),
            ]),
            Schema::binary(&["__empty__"]),
            KeyEncoderSpec::PrefixScan { num_prefix_cols: 1 },
            false,
        ))?;
        store.create_family(ColumnFamilySchema::new(
            ts_to_key.as_str(),
            Schema::new(vec![
                Field::new("expiryTimestampMs", DataType::Int64, false),
                Field::new("key", DataType::Binary, false),
            ]),
            Schema::binary(&["__empty__"]),
            KeyEncoderSpec::RangeScan {
                ordering_ordinals: vec![0],
            },
            false,
        ))?;

        Ok(Self {
            store,
            key_to_ts,
            ts_to_key,
            _key: PhantomData,
        })
    }

    fn rows(&self, key: &K, expiry_ms: i64) -> Result<(Vec<u8>, Vec<u8>)> {
        let grouping_key = serialize(key)?;
        let by_key = RowWriter::with_capacity(grouping_key.len() + 12)
            .put_bytes(&grouping_key)
            .put_ordered_i64(expiry_ms)
            .finish();
        let by_ts = RowWriter::with_capacity(grouping_key.len() + 12)
            .put_ordered_i64(expiry_ms)
            .put_bytes(&grouping_key)
            .finish();
        Ok((by_key, by_ts))
    }

    /// Returns false when the timer was already registered.
    pub(crate) fn register(&self, key: &K, expiry_ms: i64) -> Result<bool> {
        let (by_key, by_ts) = self.rows(key, expiry_ms)?;
        if self.store.get(&by_key, &self.key_to_ts)?.is_some() {
            return Ok(false);
        }
        self.store.put(&by_key, EMPTY_ROW, &self.key_to_ts)?;
        self.store.put(&by_ts, EMPTY_ROW, &self.ts_to_key)?;
        Ok(true)
    }

    /// Returns false when no such timer existed.
    pub(crate) fn delete(&self, key: &K, expiry_ms: i64) -> Result<bool> {
        let (by_key, by_ts) = self.rows(key, expiry_ms)?;
        if self.store.get(&by_key, &self.key_to_ts)?.is_none() {
            return Ok(false);
        }
        self.store.remove(&by_key, &self.key_to_ts)?;
        self.store.remove(&by_ts, &self.ts_to_key)?;
        Ok(true)
    }

    /// Timers of `key`, earliest first.
    pub(crate) fn list(&self, key: &K) -> Result<Vec<i64>> {
        let prefix = RowWriter::new().put_bytes(&serialize(key)?).finish();
        self.store
            .prefix_scan(&prefix, &self.key_to_ts)?
            .iter()
            .map(|(row, _)| {
                let mut reader = RowReader::new(row);
                reader.bytes()?;
                reader.ordered_i64()
            })
            .collect()
    }

    /// Timers of every key firing strictly before `threshold_ms`, in firing order.
    pub(crate) fn expired(&self, threshold_ms: i64) -> Result<Vec<(K, i64)>> {
        let mut expired = Vec::new();
        for (row, _) in self.store.iterator(&self.ts_to_key)? {
            let mut reader = RowReader::new(&row);
            let expiry_ms = reader.ordered_i64()?;
            if expiry_ms >= threshold_ms {
                break;
            }
            expired.push((deserialize(reader.bytes()?)?, expiry_ms));
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::open_store;
    use tempfile::TempDir;

    #[test]
    fn test_register_list_expire() {
        let dir = TempDir::new().unwrap();
        let (_provider, store) = open_store(&dir);
        let timers = TimerState::<String>::new(store, TimeMode::ProcessingTime).unwrap();
        let (a, b) = ("a".to_string(), "b".to_string());

        timers.register(&a, 300).unwrap();
        assert!(timers.register(&a, 100).unwrap());
        assert!(!timers.register(&a, 100).unwrap());
        timers.register(&b, 200).unwrap();
        timers.register(&b, -5).unwrap();

        assert_eq!(timers.list(&a).unwrap(), vec![100, 300]);
        assert_eq!(timers.list(&b).unwrap(), vec![-5, 200]);
        assert_eq!(
            timers.expired(300).unwrap(),
            vec![(b.clone(), -5), (a.clone(), 100), (b.clone(), 200)]
        );

        assert!(timers.delete(&a, 100).unwrap());
        assert!(!timers.delete(&a, 12345).unwrap());
        assert_eq!(timers.list(&a).unwrap(), vec![300]);
        assert_eq!(timers.expired(301).unwrap().len(), 3);
    }

    #[test]
    fn test_no_time_rejected() {
        let dir = TempDir::new().unwrap();
        let (_provider, store) = open_store(&dir);
        assert!(matches!(
            TimerState::<String>::new(store, TimeMode::NoTime),
            Err(StoreError::TimersNotSupported(_))
        ));
    }
}
