//! Ordered list of values per grouping key.

use super::ttl::{min_expiry_family_name, TtlContext, TtlIndex};
use super::TtlCleanable;
use crate::encoding::{RowReader, RowWriter, StateTypeEncoder};
use crate::error::{Result, StoreError};
use crate::store::StateStore;
use crate::types::{ColumnFamilySchema, DataType, Field, KeyEncoderSpec, Schema};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// TTL bookkeeping of a list: every element carries its own expiration,
/// `$min_<state>` remembers the smallest one per key and the TTL index holds
/// one entry per key at that minimum.
#[derive(Clone)]
struct ListTtl {
    ctx: TtlContext,
    index: TtlIndex,
    min_family: String,
}

/// A list of values per grouping key, backed by a multi-value family.
pub struct ListState<K, V> {
    name: String,
    store: Arc<StateStore>,
    encoder: StateTypeEncoder<K, V>,
    ttl: Option<ListTtl>,
}

impl<K, V> Clone for ListState<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: Arc::clone(&self.store),
            encoder: self.encoder.clone(),
            ttl: self.ttl.clone(),
        }
    }
}

impl<K, V> ListState<K, V>
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
            true,
        ))?;
        let ttl = match ttl {
            Some(ctx) => {
                let min_family = min_expiry_family_name(name);
                store.create_family(ColumnFamilySchema::new(
                    min_family.as_str(),
                    StateTypeEncoder::<K, V>::key_schema(),
                    Schema::new(vec![Field::new("minExpirationMs", DataType::Int64, false)]),
                    KeyEncoderSpec::NoPrefix,
                    false,
                ))?;
                Some(ListTtl {
                    ctx,
                    index: TtlIndex::create(Arc::clone(&store), name, false)?,
                    min_family,
                })
            }
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

    fn encoded_key(&self, key: &K) -> Result<(Vec<u8>, Vec<u8>)> {
        let grouping_key = self.encoder.serialize_grouping_key(key)?;
        let encoded_key = self.encoder.encode_serialized_grouping_key(&grouping_key);
        Ok((grouping_key, encoded_key))
    }

    fn live_rows(&self, encoded_key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let rows = self.store.values_iterator(encoded_key, &self.name)?;
        let ttl = match &self.ttl {
            Some(ttl) => ttl,
            None => return Ok(rows),
        };
        let mut live = Vec::with_capacity(rows.len());
        for row in rows {
            if !self.encoder.is_expired(&row, ttl.ctx.now_ms())? {
                live.push(row);
            }
        }
        Ok(live)
    }

    pub fn exists(&self, key: &K) -> Result<bool> {
        let (_, encoded_key) = self.encoded_key(key)?;
        Ok(!self.live_rows(&encoded_key)?.is_empty())
    }

    /// Unexpired values of `key` in insertion order.
    pub fn get(&self, key: &K) -> Result<Vec<V>> {
        let (_, encoded_key) = self.encoded_key(key)?;
        self.live_rows(&encoded_key)?
            .iter()
            .map(|row| self.encoder.decode_value(row))
            .collect()
    }

    /// Every stored value with its expiration, expired or not.
    pub fn get_ttl_values(&self, key: &K) -> Result<Vec<(V, i64)>> {
        let (_, encoded_key) = self.encoded_key(key)?;
        let mut values = Vec::new();
        for row in self.store.values_iterator(&encoded_key, &self.name)? {
            if let Some(expiration_ms) = self.encoder.decode_ttl_expiration_ms(&row)? {
                values.push((self.encoder.decode_value(&row)?, expiration_ms));
            }
        }
        Ok(values)
    }

    /// Expirations indexed for `key`; at most one, the list minimum.
    pub fn get_values_in_ttl_state(&self, key: &K) -> Result<Vec<i64>> {
        let ttl = match &self.ttl {
            Some(ttl) => ttl,
            None => return Ok(Vec::new()),
        };
        let grouping_key = self.encoder.serialize_grouping_key(key)?;
        let mut expirations = Vec::new();
        for row in ttl.index.rows()? {
            let entry = self.encoder.decode_ttl_row(&row)?;
            if entry.grouping_key == grouping_key {
                expirations.push(entry.expiration_ms);
            }
        }
        Ok(expirations)
    }

    /// Replace the list of `key` with `values`.
    pub fn put(&self, key: &K, values: &[V]) -> Result<()> {
        if values.is_empty() {
            return Err(StoreError::invalid_argument(
                "put",
                format!("empty list passed to list state {}", self.name),
            ));
        }
        let (grouping_key, encoded_key) = self.encoded_key(key)?;
        let expiration_ms = self.ttl.as_ref().map(|ttl| ttl.ctx.expiration_ms());
        let rows = self.encode_rows(values, expiration_ms)?;

        let (first, rest) = rows.split_first().ok_or_else(|| {
            StoreError::invalid_argument("put", format!("empty list for state {}", self.name))
        })?;
        self.store.put(&encoded_key, first, &self.name)?;
        for row in rest {
            self.store.merge(&encoded_key, row, &self.name)?;
        }

        if let (Some(ttl), Some(expiration_ms)) = (&self.ttl, expiration_ms) {
            self.set_min_expiration(ttl, &grouping_key, &encoded_key, Some(expiration_ms))?;
        }
        Ok(())
    }

    pub fn append_value(&self, key: &K, value: &V) -> Result<()> {
        self.append_list(key, std::slice::from_ref(value))
    }

    pub fn append_list(&self, key: &K, values: &[V]) -> Result<()> {
        if values.is_empty() {
            return Err(StoreError::invalid_argument(
                "appendList",
                format!("empty list passed to list state {}", self.name),
            ));
        }
        let (grouping_key, encoded_key) = self.encoded_key(key)?;
        let expiration_ms = self.ttl.as_ref().map(|ttl| ttl.ctx.expiration_ms());
        for row in self.encode_rows(values, expiration_ms)? {
            self.store.merge(&encoded_key, &row, &self.name)?;
        }

        if let (Some(ttl), Some(expiration_ms)) = (&self.ttl, expiration_ms) {
            let new_min = match self.min_expiration(ttl, &encoded_key)? {
                Some(current) => current.min(expiration_ms),
                None => expiration_ms,
            };
            self.set_min_expiration(ttl, &grouping_key, &encoded_key, Some(new_min))?;
        }
        Ok(())
    }

    pub fn clear(&self, key: &K) -> Result<()> {
        let (grouping_key, encoded_key) = self.encoded_key(key)?;
        if let Some(ttl) = &self.ttl {
            self.set_min_expiration(ttl, &grouping_key, &encoded_key, None)?;
        }
        self.store.remove(&encoded_key, &self.name)
    }

    /// Drop the expired elements of `key`'s list, keeping the survivors in
    /// their original order. Returns the number of elements removed.
    pub fn clear_if_expired(&self, key: &K) -> Result<u64> {
        let grouping_key = self.encoder.serialize_grouping_key(key)?;
        self.clear_if_expired_serialized(&grouping_key)
    }

    fn clear_if_expired_serialized(&self, grouping_key: &[u8]) -> Result<u64> {
        let ttl = match &self.ttl {
            Some(ttl) => ttl,
            None => return Ok(0),
        };
        let encoded_key = self.encoder.encode_serialized_grouping_key(grouping_key);
        let rows = self.store.values_iterator(&encoded_key, &self.name)?;

        let mut survivors = Vec::with_capacity(rows.len());
        let mut new_min: Option<i64> = None;
        for row in rows.iter() {
            match self.encoder.decode_ttl_expiration_ms(row)? {
                Some(expiration_ms) if expiration_ms <= ttl.ctx.now_ms() => {}
                expiration_ms => {
                    if let Some(expiration_ms) = expiration_ms {
                        new_min = Some(new_min.map_or(expiration_ms, |m| m.min(expiration_ms)));
                    }
                    survivors.push(row);
                }
            }
        }
        let removed = (rows.len() - survivors.len()) as u64;
        if removed == 0 {
            return Ok(0);
        }

        match survivors.split_first() {
            Some((first, rest)) => {
                self.store.put(&encoded_key, first, &self.name)?;
                for row in rest {
                    self.store.merge(&encoded_key, row, &self.name)?;
                }
            }
            None => self.store.remove(&encoded_key, &self.name)?,
        }
        self.set_min_expiration(ttl, grouping_key, &encoded_key, new_min)?;
        Ok(removed)
    }

    fn encode_rows(&self, values: &[V], expiration_ms: Option<i64>) -> Result<Vec<Vec<u8>>> {
        values
            .iter()
            .map(|value| self.encoder.encode_value(value, expiration_ms))
            .collect()
    }

    fn min_expiration(&self, ttl: &ListTtl, encoded_key: &[u8]) -> Result<Option<i64>> {
        match self.store.get(encoded_key, &ttl.min_family)? {
            Some(row) => Ok(Some(RowReader::new(&row).ordered_i64()?)),
            None => Ok(None),
        }
    }

    /// Point the min-expiry row and the TTL index at `new_min`, removing
    /// both when it is `None`.
    fn set_min_expiration(
        &self,
        ttl: &ListTtl,
        grouping_key: &[u8],
        encoded_key: &[u8],
        new_min: Option<i64>,
    ) -> Result<()> {
        let old_row = self
            .min_expiration(ttl, encoded_key)?
            .map(|old| self.encoder.encode_ttl_row(old, grouping_key, None));
        match new_min {
            Some(new_min) => {
                let new_row = self.encoder.encode_ttl_row(new_min, grouping_key, None);
                ttl.index.upsert(old_row.as_deref(), &new_row)?;
                let min_row = RowWriter::with_capacity(8).put_ordered_i64(new_min).finish();
                self.store.put(encoded_key, &min_row, &ttl.min_family)
            }
            None => {
                if let Some(old_row) = old_row {
                    ttl.index.remove(&old_row)?;
                    self.store.remove(encoded_key, &ttl.min_family)?;
                }
                Ok(())
            }
        }
    }
}

impl<K, V> TtlCleanable for ListState<K, V>
where
    K: Serialize,
    V: Serialize + DeserializeOwned,
{
    fn state_name(&self) -> &str {
        &self.name
    }

    fn clear_expired_state(&self) -> Result<u64> {
        let ttl = match &self.ttl {
            Some(ttl) => ttl,
            None => return Ok(0),
        };
        let mut removed = 0;
        for row in ttl.index.expired_rows(ttl.ctx.now_ms())? {
            let entry = self.encoder.decode_ttl_row(&row)?;
            removed += self.clear_if_expired_serialized(&entry.grouping_key)?;
            if ttl.index.contains(&row)? {
                ttl.index.remove(&row)?;
            }
        }
        debug!(state = %self.name, removed, "Cleared expired list elements");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::open_store;
    use tempfile::TempDir;

    fn list(store: &Arc<StateStore>, batch_timestamp_ms: i64) -> ListState<String, String> {
        ListState::new(
            Arc::clone(store),
            "events",
            Some(TtlContext {
                duration_ms: 100,
                batch_timestamp_ms,
            }),
        )
        .unwrap()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_put_append_get() {
        let dir = TempDir::new().unwrap();
        let (_provider, store) = open_store(&dir);
        let state = ListState::<String, String>::new(store, "events", None).unwrap();
        let key = "g".to_string();

        assert!(state.get(&key).unwrap().is_empty());
        state.put(&key, &strings(&["a", "b"])).unwrap();
        state.append_value(&key, &"c".to_string()).unwrap();
        state.append_list(&key, &strings(&["d"])).unwrap();
        assert_eq!(state.get(&key).unwrap(), strings(&["a", "b", "c", "d"]));

        state.put(&key, &strings(&["z"])).unwrap();
        assert_eq!(state.get(&key).unwrap(), strings(&["z"]));
        state.clear(&key).unwrap();
        assert!(!state.exists(&key).unwrap());
    }

    #[test]
    fn test_empty_lists_rejected() {
        let dir = TempDir::new().unwrap();
        let (_provider, store) = open_store(&dir);
        let state = ListState::<String, String>::new(store, "events", None).unwrap();
        let key = "g".to_string();
        assert!(matches!(
            state.put(&key, &[]),
            Err(StoreError::InvalidArgument { .. })
        ));
        assert!(matches!(
            state.append_list(&key, &[]),
            Err(StoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_partial_expiry_keeps_order() {
        let dir = TempDir::new().unwrap();
        let (_provider, store) = open_store(&dir);
        let key = "g".to_string();

        list(&store, 0).append_value(&key, &"a".to_string()).unwrap();
        let later = list(&store, 50);
        later.append_list(&key, &strings(&["b", "c"])).unwrap();
        assert_eq!(later.get_values_in_ttl_state(&key).unwrap(), vec![100]);

        let sweep = list(&store, 100);
        assert_eq!(sweep.get(&key).unwrap(), strings(&["b", "c"]));
        assert_eq!(sweep.clear_expired_state().unwrap(), 1);
        assert_eq!(
            sweep.get_ttl_values(&key).unwrap(),
            vec![("b".to_string(), 150), ("c".to_string(), 150)]
        );
        assert_eq!(sweep.get_values_in_ttl_state(&key).unwrap(), vec![150]);

        let end = list(&store, 150);
        assert_eq!(end.clear_expired_state().unwrap(), 2);
        assert!(end.get_ttl_values(&key).unwrap().is_empty());
        assert!(end.get_values_in_ttl_state(&key).unwrap().is_empty());
    }
}
