//! Single value per grouping key.

use super::ttl::{TtlContext, TtlIndex};
use super::TtlCleanable;
use crate::encoding::StateTypeEncoder;
use crate::error::Result;
use crate::store::StateStore;
use crate::types::{ColumnFamilySchema, KeyEncoderSpec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// One optional value per grouping key, optionally expiring.
///
/// Expired values are hidden from reads as soon as the batch timestamp
/// reaches their expiration, but stay in the store until the handle's TTL
/// sweep calls [`ValueState::clear_if_expired`].
pub struct ValueState<K, V> {
    name: String,
    store: Arc<StateStore>,
    encoder: StateTypeEncoder<K, V>,
    ttl: Option<(TtlContext, TtlIndex)>,
}

impl<K, V> Clone for ValueState<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: Arc::clone(&self.store),
            encoder: self.encoder.clone(),
            ttl: self.ttl.clone(),
        }
    }
}

impl<K, V> ValueState<K, V>
where
    K: Serialize,
    V: Serialize + DeserializeOwned,
{
    pub(crate) fn new(store: Arc<StateStore>, name: &str, ttl: Option<TtlContext>) -> Result<Self> {
        let encoder = StateTypeEncoder::<K, V>::new(name, ttl.is_some());
        store.create_family(ColumnFamilySchema::new(
            name,
            StateTypeEncoder::<K, V>::key_schema(),
            encoder.value_schema(),
            KeyEncoderSpec::NoPrefix,
            false,
        ))?;
        let ttl = match ttl {
            Some(ctx) => Some((ctx, TtlIndex::create(Arc::clone(&store), name, false)?)),
            None => None,
        };
        Ok(Self {
            name: name.to_string(),
            store,
            encoder,
            ttl,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn now_ms(&self) -> Option<i64> {
        self.ttl.as_ref().map(|(ctx, _)| ctx.now_ms())
    }

    fn live_row(&self, key: &K) -> Result<Option<Vec<u8>>> {
        let row = match self.store.get(&self.encoder.encode_grouping_key(key)?, &self.name)? {
            Some(row) => row,
            None => return Ok(None),
        };
        if let Some(now) = self.now_ms() {
            if self.encoder.is_expired(&row, now)? {
                return Ok(None);
            }
        }
        Ok(Some(row))
    }

    pub fn exists(&self, key: &K) -> Result<bool> {
        Ok(self.live_row(key)?.is_some())
    }

    /// The value of `key`, `None` when absent or expired.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.live_row(key)?
            .map(|row| self.encoder.decode_value(&row))
            .transpose()
    }

    /// The stored value even if it has expired.
    pub fn get_without_enforcing_ttl(&self, key: &K) -> Result<Option<V>> {
        self.store
            .get(&self.encoder.encode_grouping_key(key)?, &self.name)?
            .map(|row| self.encoder.decode_value(&row))
            .transpose()
    }

    /// The stored value with its expiration, expired or not.
    pub fn get_ttl_value(&self, key: &K) -> Result<Option<(V, i64)>> {
        let row = match self.store.get(&self.encoder.encode_grouping_key(key)?, &self.name)? {
            Some(row) => row,
            None => return Ok(None),
        };
        Ok(match self.encoder.decode_ttl_expiration_ms(&row)? {
            Some(expiration_ms) => Some((self.encoder.decode_value(&row)?, expiration_ms)),
            None => None,
        })
    }

    /// Expirations indexed for `key`.
    pub fn get_values_in_ttl_state(&self, key: &K) -> Result<Vec<i64>> {
        let (_, index) = match &self.ttl {
            Some(ttl) => ttl,
            None => return Ok(Vec::new()),
        };
        let grouping_key = self.encoder.serialize_grouping_key(key)?;
        let mut expirations = Vec::new();
        for row in index.rows()? {
            let entry = self.encoder.decode_ttl_row(&row)?;
            if entry.grouping_key == grouping_key {
                expirations.push(entry.expiration_ms);
            }
        }
        Ok(expirations)
    }

    pub fn update(&self, key: &K, value: &V) -> Result<()> {
        let grouping_key = self.encoder.serialize_grouping_key(key)?;
        let encoded_key = self.encoder.encode_serialized_grouping_key(&grouping_key);
        match &self.ttl {
            Some((ctx, index)) => {
                let expiration_ms = ctx.expiration_ms();
                let old_row = self
                    .store
                    .get(&encoded_key, &self.name)?
                    .map(|row| self.encoder.decode_ttl_expiration_ms(&row))
                    .transpose()?
                    .flatten()
                    .map(|old| self.encoder.encode_ttl_row(old, &grouping_key, None));
                let new_row = self.encoder.encode_ttl_row(expiration_ms, &grouping_key, None);
                index.upsert(old_row.as_deref(), &new_row)?;
                let value_row = self.encoder.encode_value(value, Some(expiration_ms))?;
                self.store.put(&encoded_key, &value_row, &self.name)
            }
            None => {
                let value_row = self.encoder.encode_value(value, None)?;
                self.store.put(&encoded_key, &value_row, &self.name)
            }
        }
    }

    pub fn clear(&self, key: &K) -> Result<()> {
        let grouping_key = self.encoder.serialize_grouping_key(key)?;
        let encoded_key = self.encoder.encode_serialized_grouping_key(&grouping_key);
        if let Some((_, index)) = &self.ttl {
            if let Some(row) = self.store.get(&encoded_key, &self.name)? {
                if let Some(expiration_ms) = self.encoder.decode_ttl_expiration_ms(&row)? {
                    index.remove(&self.encoder.encode_ttl_row(expiration_ms, &grouping_key, None))?;
                }
            }
        }
        self.store.remove(&encoded_key, &self.name)
    }

    /// Remove the value of `key` if it has expired. Returns the number of
    /// values removed.
    pub fn clear_if_expired(&self, key: &K) -> Result<u64> {
        let grouping_key = self.encoder.serialize_grouping_key(key)?;
        self.clear_if_expired_serialized(&grouping_key)
    }

    fn clear_if_expired_serialized(&self, grouping_key: &[u8]) -> Result<u64> {
        let (ctx, index) = match &self.ttl {
            Some(ttl) => ttl,
            None => return Ok(0),
        };
        let encoded_key = self.encoder.encode_serialized_grouping_key(grouping_key);
        let row = match self.store.get(&encoded_key, &self.name)? {
            Some(row) => row,
            None => return Ok(0),
        };
        match self.encoder.decode_ttl_expiration_ms(&row)? {
            Some(expiration_ms) if expiration_ms <= ctx.now_ms() => {
                index.remove(&self.encoder.encode_ttl_row(expiration_ms, grouping_key, None))?;
                self.store.remove(&encoded_key, &self.name)?;
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

impl<K, V> TtlCleanable for ValueState<K, V>
where
    K: Serialize,
    V: Serialize + DeserializeOwned,
{
    fn state_name(&self) -> &str {
        &self.name
    }

    fn clear_expired_state(&self) -> Result<u64> {
        let (ctx, index) = match &self.ttl {
            Some(ttl) => ttl,
            None => return Ok(0),
        };
        let mut removed = 0;
        for row in index.expired_rows(ctx.now_ms())? {
            let entry = self.encoder.decode_ttl_row(&row)?;
            removed += self.clear_if_expired_serialized(&entry.grouping_key)?;
            if index.contains(&row)? {
                index.remove(&row)?;
            }
        }
        debug!(state = %self.name, removed, "Cleared expired values");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::open_store;
    use tempfile::TempDir;

    fn ttl(batch_timestamp_ms: i64) -> Option<TtlContext> {
        Some(TtlContext {
            duration_ms: 1000,
            batch_timestamp_ms,
        })
    }

    #[test]
    fn test_update_get_clear() {
        let dir = TempDir::new().unwrap();
        let (_provider, store) = open_store(&dir);
        let state = ValueState::<String, u64>::new(store, "count", None).unwrap();
        let key = "user-1".to_string();

        assert!(!state.exists(&key).unwrap());
        state.update(&key, &3).unwrap();
        assert_eq!(state.get(&key).unwrap(), Some(3));
        state.update(&key, &4).unwrap();
        assert_eq!(state.get(&key).unwrap(), Some(4));
        state.clear(&key).unwrap();
        assert_eq!(state.get(&key).unwrap(), None);
        assert_eq!(state.get_values_in_ttl_state(&key).unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_expired_value_hidden_until_swept() {
        let dir = TempDir::new().unwrap();
        let (_provider, store) = open_store(&dir);
        let writer = ValueState::<String, u64>::new(Arc::clone(&store), "count", ttl(0)).unwrap();
        let key = "user-1".to_string();
        writer.update(&key, &7).unwrap();
        assert_eq!(writer.get_values_in_ttl_state(&key).unwrap(), vec![1000]);

        let later = ValueState::<String, u64>::new(store, "count", ttl(1000)).unwrap();
        assert_eq!(later.get(&key).unwrap(), None);
        assert_eq!(later.get_without_enforcing_ttl(&key).unwrap(), Some(7));
        assert_eq!(later.get_ttl_value(&key).unwrap(), Some((7, 1000)));

        assert_eq!(later.clear_expired_state().unwrap(), 1);
        assert_eq!(later.get_without_enforcing_ttl(&key).unwrap(), None);
        assert!(later.get_values_in_ttl_state(&key).unwrap().is_empty());
    }

    #[test]
    fn test_update_moves_index_entry() {
        let dir = TempDir::new().unwrap();
        let (_provider, store) = open_store(&dir);
        let first = ValueState::<String, u64>::new(Arc::clone(&store), "count", ttl(0)).unwrap();
        let key = "k".to_string();
        first.update(&key, &1).unwrap();

        let second = ValueState::<String, u64>::new(store, "count", ttl(500)).unwrap();
        second.update(&key, &2).unwrap();
        assert_eq!(second.get_values_in_ttl_state(&key).unwrap(), vec![1500]);
        assert_eq!(second.clear_if_expired(&key).unwrap(), 0);
    }
}
