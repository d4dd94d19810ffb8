//! Map of user keys to values per grouping key.

use super::ttl::{TtlContext, TtlIndex};
use super::TtlCleanable;
use crate::encoding::{deserialize, StateTypeEncoder};
use crate::error::Result;
use crate::store::StateStore;
use crate::types::{ColumnFamilySchema, KeyEncoderSpec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// A map per grouping key. Entries are stored under composite keys
/// `grouping key | user key` so one prefix scan reads a whole map, and each
/// entry expires on its own.
pub struct MapState<K, UK, V> {
    name: String,
    store: Arc<StateStore>,
    encoder: StateTypeEncoder<K, V>,
    ttl: Option<(TtlContext, TtlIndex)>,
    _user_key: PhantomData<fn() -> UK>,
}

impl<K, UK, V> Clone for MapState<K, UK, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: Arc::clone(&self.store),
            encoder: self.encoder.clone(),
            ttl: self.ttl.clone(),
            _user_key: PhantomData,
        }
    }
}

impl<K, UK, V> MapState<K, UK, V>
where
    K: Serialize,
    UK: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub(crate) fn new(store: Arc<StateStore>, name: &str, ttl: Option<TtlContext>) -> Result<Self> {
        let encoder = StateTypeEncoder::<K, V>::new(name, ttl.is_some());
        store.create_family(ColumnFamilySchema::new(
            name,
            StateTypeEncoder::<K, V>::composite_key_schema(),
            encoder.value_schema(),
            KeyEncoderSpec::PrefixScan { num_prefix_cols: 1 },
            false,
        ))?;
        let ttl = match ttl {
            Some(ctx) => Some((ctx, TtlIndex::create(Arc::clone(&store), name, true)?)),
            None => None,
        };
        Ok(Self {
            name: name.to_string(),
            store,
            encoder,
            ttl,
            _user_key: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_live(&self, row: &[u8]) -> Result<bool> {
        match &self.ttl {
            Some((ctx, _)) => Ok(!self.encoder.is_expired(row, ctx.now_ms())?),
            None => Ok(true),
        }
    }

    /// Unexpired `(composite key, value row)` pairs of `key`'s map.
    fn live_entries(&self, key: &K) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let prefix = self.encoder.encode_grouping_key(key)?;
        let mut live = Vec::new();
        for (composite_key, row) in self.store.prefix_scan(&prefix, &self.name)? {
            if self.is_live(&row)? {
                live.push((composite_key, row));
            }
        }
        Ok(live)
    }

    fn live_row(&self, key: &K, user_key: &UK) -> Result<Option<Vec<u8>>> {
        let composite_key = self.encoder.encode_composite_key(key, user_key)?;
        match self.store.get(&composite_key, &self.name)? {
            Some(row) if self.is_live(&row)? => Ok(Some(row)),
            _ => Ok(None),
        }
    }

    /// True when `key`'s map has at least one unexpired entry.
    pub fn exists(&self, key: &K) -> Result<bool> {
        Ok(!self.live_entries(key)?.is_empty())
    }

    pub fn get_value(&self, key: &K, user_key: &UK) -> Result<Option<V>> {
        self.live_row(key, user_key)?
            .map(|row| self.encoder.decode_value(&row))
            .transpose()
    }

    pub fn contains_key(&self, key: &K, user_key: &UK) -> Result<bool> {
        Ok(self.live_row(key, user_key)?.is_some())
    }

    pub fn update_value(&self, key: &K, user_key: &UK, value: &V) -> Result<()> {
        let grouping_key = self.encoder.serialize_grouping_key(key)?;
        let serialized_user_key = self.encoder.serialize_user_key(user_key)?;
        let composite_key = self
            .encoder
            .encode_composite_key_serialized(&grouping_key, &serialized_user_key);
        let expiration_ms = match &self.ttl {
            Some((ctx, index)) => {
                let expiration_ms = ctx.expiration_ms();
                let old_row = self
                    .store
                    .get(&composite_key, &self.name)?
                    .map(|row| self.encoder.decode_ttl_expiration_ms(&row))
                    .transpose()?
                    .flatten()
                    .map(|old| {
                        self.encoder
                            .encode_ttl_row(old, &grouping_key, Some(&serialized_user_key))
                    });
                let new_row = self.encoder.encode_ttl_row(
                    expiration_ms,
                    &grouping_key,
                    Some(&serialized_user_key),
                );
                index.upsert(old_row.as_deref(), &new_row)?;
                Some(expiration_ms)
            }
            None => None,
        };
        let value_row = self.encoder.encode_value(value, expiration_ms)?;
        self.store.put(&composite_key, &value_row, &self.name)
    }

    /// Unexpired entries of `key`'s map in user-key byte order.
    pub fn iterator(&self, key: &K) -> Result<Vec<(UK, V)>> {
        self.live_entries(key)?
            .iter()
            .map(|(composite_key, row)| {
                Ok((
                    self.encoder.decode_user_key(composite_key)?,
                    self.encoder.decode_value(row)?,
                ))
            })
            .collect()
    }

    pub fn keys(&self, key: &K) -> Result<Vec<UK>> {
        self.live_entries(key)?
            .iter()
            .map(|(composite_key, _)| self.encoder.decode_user_key(composite_key))
            .collect()
    }

    pub fn values(&self, key: &K) -> Result<Vec<V>> {
        self.live_entries(key)?
            .iter()
            .map(|(_, row)| self.encoder.decode_value(row))
            .collect()
    }

    pub fn remove_key(&self, key: &K, user_key: &UK) -> Result<()> {
        let composite_key = self.encoder.encode_composite_key(key, user_key)?;
        self.remove_entry(&composite_key)
    }

    /// Remove every entry of `key`'s map, expired ones included.
    pub fn clear(&self, key: &K) -> Result<()> {
        let prefix = self.encoder.encode_grouping_key(key)?;
        for (composite_key, _) in self.store.prefix_scan(&prefix, &self.name)? {
            self.remove_entry(&composite_key)?;
        }
        Ok(())
    }

    fn remove_entry(&self, composite_key: &[u8]) -> Result<()> {
        if let Some((_, index)) = &self.ttl {
            if let Some(row) = self.store.get(composite_key, &self.name)? {
                if let Some(expiration_ms) = self.encoder.decode_ttl_expiration_ms(&row)? {
                    let (grouping_key, user_key) = self.encoder.decode_composite_key(composite_key)?;
                    index.remove(&self.encoder.encode_ttl_row(
                        expiration_ms,
                        &grouping_key,
                        Some(&user_key),
                    ))?;
                }
            }
        }
        self.store.remove(composite_key, &self.name)
    }

    /// Remove the entry for `user_key` if it has expired. Returns the number
    /// of entries removed.
    pub fn clear_if_expired(&self, key: &K, user_key: &UK) -> Result<u64> {
        let composite_key = self.encoder.encode_composite_key(key, user_key)?;
        self.clear_if_expired_encoded(&composite_key)
    }

    fn clear_if_expired_encoded(&self, composite_key: &[u8]) -> Result<u64> {
        let ctx = match &self.ttl {
            Some((ctx, _)) => ctx,
            None => return Ok(0),
        };
        match self.store.get(composite_key, &self.name)? {
            Some(row) if self.encoder.is_expired(&row, ctx.now_ms())? => {
                self.remove_entry(composite_key)?;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    /// The stored value of `user_key` with its expiration, expired or not.
    pub fn get_ttl_value(&self, key: &K, user_key: &UK) -> Result<Option<(V, i64)>> {
        let composite_key = self.encoder.encode_composite_key(key, user_key)?;
        let row = match self.store.get(&composite_key, &self.name)? {
            Some(row) => row,
            None => return Ok(None),
        };
        Ok(match self.encoder.decode_ttl_expiration_ms(&row)? {
            Some(expiration_ms) => Some((self.encoder.decode_value(&row)?, expiration_ms)),
            None => None,
        })
    }

    /// `(user key, expiration)` pairs indexed for `key`, earliest first.
    pub fn get_key_values_in_ttl_state(&self, key: &K) -> Result<Vec<(UK, i64)>> {
        let (_, index) = match &self.ttl {
            Some(ttl) => ttl,
            None => return Ok(Vec::new()),
        };
        let grouping_key = self.encoder.serialize_grouping_key(key)?;
        let mut entries = Vec::new();
        for row in index.rows()? {
            let entry = self.encoder.decode_ttl_row(&row)?;
            if entry.grouping_key != grouping_key {
                continue;
            }
            if let Some(user_key) = entry.user_key {
                entries.push((deserialize(&user_key)?, entry.expiration_ms));
            }
        }
        Ok(entries)
    }
}

impl<K, UK, V> TtlCleanable for MapState<K, UK, V>
where
    K: Serialize,
    UK: Serialize + DeserializeOwned,
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
            if let Some(user_key) = &entry.user_key {
                let composite_key = self
                    .encoder
                    .encode_composite_key_serialized(&entry.grouping_key, user_key);
                removed += self.clear_if_expired_encoded(&composite_key)?;
            }
            if index.contains(&row)? {
                index.remove(&row)?;
            }
        }
        debug!(state = %self.name, removed, "Cleared expired map entries");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::open_store;
    use tempfile::TempDir;

    type Sessions = MapState<String, String, i64>;

    fn map(store: &Arc<StateStore>, batch_timestamp_ms: Option<i64>) -> Sessions {
        let ttl = batch_timestamp_ms.map(|batch_timestamp_ms| TtlContext {
            duration_ms: 5000,
            batch_timestamp_ms,
        });
        MapState::new(Arc::clone(store), "sessions", ttl).unwrap()
    }

    #[test]
    fn test_map_operations() {
        let dir = TempDir::new().unwrap();
        let (_provider, store) = open_store(&dir);
        let state = map(&store, None);
        let (g, other) = ("g".to_string(), "h".to_string());

        state.update_value(&g, &"b".to_string(), &2).unwrap();
        state.update_value(&g, &"a".to_string(), &1).unwrap();
        state.update_value(&other, &"a".to_string(), &9).unwrap();

        assert_eq!(
            state.iterator(&g).unwrap(),
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
        assert_eq!(state.keys(&g).unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(state.values(&g).unwrap(), vec![1, 2]);
        assert!(state.contains_key(&g, &"a".to_string()).unwrap());

        state.remove_key(&g, &"a".to_string()).unwrap();
        assert_eq!(state.get_value(&g, &"a".to_string()).unwrap(), None);
        state.clear(&g).unwrap();
        assert!(!state.exists(&g).unwrap());
        assert_eq!(state.get_value(&other, &"a".to_string()).unwrap(), Some(9));
    }

    #[test]
    fn test_entry_expires_at_deadline() {
        let dir = TempDir::new().unwrap();
        let (_provider, store) = open_store(&dir);
        let g = "g".to_string();
        let k1 = "k1".to_string();

        map(&store, Some(0)).update_value(&g, &k1, &10).unwrap();

        let before = map(&store, Some(4999));
        assert_eq!(before.get_value(&g, &k1).unwrap(), Some(10));
        assert_eq!(before.clear_expired_state().unwrap(), 0);

        let at = map(&store, Some(5000));
        assert_eq!(at.get_value(&g, &k1).unwrap(), None);
        assert_eq!(at.get_key_values_in_ttl_state(&g).unwrap(), vec![(k1.clone(), 5000)]);
        assert_eq!(at.clear_expired_state().unwrap(), 1);
        assert!(at.get_key_values_in_ttl_state(&g).unwrap().is_empty());
        assert_eq!(at.get_ttl_value(&g, &k1).unwrap(), None);
    }

    #[test]
    fn test_clear_removes_expired_entries_and_index() {
        let dir = TempDir::new().unwrap();
        let (_provider, store) = open_store(&dir);
        let g = "g".to_string();
        map(&store, Some(0)).update_value(&g, &"old".to_string(), &1).unwrap();

        let later = map(&store, Some(6000));
        later.update_value(&g, &"new".to_string(), &2).unwrap();
        later.clear(&g).unwrap();
        assert!(later.get_key_values_in_ttl_state(&g).unwrap().is_empty());
        assert_eq!(later.get_ttl_value(&g, &"old".to_string()).unwrap(), None);
    }
}
