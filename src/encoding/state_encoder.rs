//! Typed grouping keys, user keys and values to binary rows.

use super::row::{RowReader, RowWriter};
use crate::error::{Result, StoreError};
use crate::types::{DataType, Field, Schema};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// MessagePack encoding of `nil`, produced by `None` and `()`.
const MSGPACK_NIL: u8 = 0xc0;

/// Serialize a key or value deterministically.
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

fn is_null(serialized: &[u8]) -> bool {
    serialized == [MSGPACK_NIL]
}

/// One decoded TTL index row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TtlIndexEntry {
    pub expiration_ms: i64,
    pub grouping_key: Vec<u8>,
    pub user_key: Option<Vec<u8>>,
}

/// Encodes the rows of one state variable.
///
/// `has_ttl` decides whether value rows carry the trailing expiration field.
pub struct StateTypeEncoder<K, V> {
    state_name: String,
    has_ttl: bool,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for StateTypeEncoder<K, V> {
    fn clone(&self) -> Self {
        Self {
            state_name: self.state_name.clone(),
            has_ttl: self.has_ttl,
            _marker: PhantomData,
        }
    }
}

impl<K, V> StateTypeEncoder<K, V>
where
    K: Serialize,
    V: Serialize + DeserializeOwned,
{
    pub fn new(state_name: impl Into<String>, has_ttl: bool) -> Self {
        Self {
            state_name: state_name.into(),
            has_ttl,
            _marker: PhantomData,
        }
    }

    pub fn has_ttl(&self) -> bool {
        self.has_ttl
    }

    /// Key schema of single-key state.
    pub fn key_schema() -> Schema {
        Schema::binary(&["key"])
    }

    /// Key schema of map state.
    pub fn composite_key_schema() -> Schema {
        Schema::binary(&["key", "userKey"])
    }

    pub fn value_schema(&self) -> Schema {
        let schema = Schema::binary(&["value"]);
        if self.has_ttl {
            schema.with_field(Field::new("ttlExpirationMs", DataType::Int64, true))
        } else {
            schema
        }
    }

    pub fn serialize_grouping_key(&self, key: &K) -> Result<Vec<u8>> {
        let bytes = serialize(key)?;
        if is_null(&bytes) {
            return Err(StoreError::NullValue {
                operation: "encodeGroupingKey".to_string(),
                state: self.state_name.clone(),
            });
        }
        Ok(bytes)
    }

    pub fn encode_grouping_key(&self, key: &K) -> Result<Vec<u8>> {
        Ok(self.encode_serialized_grouping_key(&self.serialize_grouping_key(key)?))
    }

    pub fn encode_serialized_grouping_key(&self, grouping_key: &[u8]) -> Vec<u8> {
        RowWriter::with_capacity(grouping_key.len() + 4)
            .put_bytes(grouping_key)
            .finish()
    }

    /// Serialized grouping key of a row built by `encode_grouping_key`.
    pub fn decode_grouping_key(&self, row: &[u8]) -> Result<Vec<u8>> {
        Ok(RowReader::new(row).bytes()?.to_vec())
    }

    pub fn serialize_user_key<UK: Serialize>(&self, user_key: &UK) -> Result<Vec<u8>> {
        let bytes = serialize(user_key)?;
        if is_null(&bytes) {
            return Err(StoreError::NullValue {
                operation: "encodeCompositeKey".to_string(),
                state: self.state_name.clone(),
            });
        }
        Ok(bytes)
    }

    pub fn encode_composite_key<UK: Serialize>(&self, key: &K, user_key: &UK) -> Result<Vec<u8>> {
        let grouping_key = self.serialize_grouping_key(key)?;
        let user_key = self.serialize_user_key(user_key)?;
        Ok(self.encode_composite_key_serialized(&grouping_key, &user_key))
    }

    pub fn encode_composite_key_serialized(&self, grouping_key: &[u8], user_key: &[u8]) -> Vec<u8> {
        RowWriter::with_capacity(grouping_key.len() + user_key.len() + 8)
            .put_bytes(grouping_key)
            .put_bytes(user_key)
            .finish()
    }

    /// Split a composite key into its serialized grouping and user keys.
    pub fn decode_composite_key(&self, row: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut reader = RowReader::new(row);
        let grouping_key = reader.bytes()?.to_vec();
        let user_key = reader.bytes()?.to_vec();
        Ok((grouping_key, user_key))
    }

    pub fn decode_user_key<UK: DeserializeOwned>(&self, row: &[u8]) -> Result<UK> {
        let (_, user_key) = self.decode_composite_key(row)?;
        deserialize(&user_key)
    }

    pub fn encode_value(&self, value: &V, expiration_ms: Option<i64>) -> Result<Vec<u8>> {
        let bytes = serialize(value)?;
        if is_null(&bytes) {
            return Err(StoreError::NullValue {
                operation: "encodeValue".to_string(),
                state: self.state_name.clone(),
            });
        }
        let mut writer = RowWriter::with_capacity(bytes.len() + 13);
        writer.put_bytes(&bytes);
        if self.has_ttl {
            writer.put_nullable_i64(expiration_ms);
        }
        Ok(writer.finish())
    }

    pub fn decode_value(&self, row: &[u8]) -> Result<V> {
        deserialize(RowReader::new(row).bytes()?)
    }

    pub fn decode_ttl_expiration_ms(&self, row: &[u8]) -> Result<Option<i64>> {
        if !self.has_ttl {
            return Ok(None);
        }
        let mut reader = RowReader::new(row);
        reader.bytes()?;
        reader.nullable_i64()
    }

    /// A row expires once `now_ms` reaches its expiration.
    pub fn is_expired(&self, row: &[u8], now_ms: i64) -> Result<bool> {
        Ok(match self.decode_ttl_expiration_ms(row)? {
            Some(expiration_ms) => expiration_ms <= now_ms,
            None => false,
        })
    }

    pub fn encode_ttl_row(
        &self,
        expiration_ms: i64,
        grouping_key: &[u8],
        user_key: Option<&[u8]>,
    ) -> Vec<u8> {
        let mut writer = RowWriter::with_capacity(grouping_key.len() + 20);
        writer.put_ordered_i64(expiration_ms).put_bytes(grouping_key);
        if let Some(user_key) = user_key {
            writer.put_bytes(user_key);
        }
        writer.finish()
    }

    pub fn decode_ttl_row(&self, row: &[u8]) -> Result<TtlIndexEntry> {
        let mut reader = RowReader::new(row);
        let expiration_ms = reader.ordered_i64()?;
        let grouping_key = reader.bytes()?.to_vec();
        let user_key = if reader.is_exhausted() {
            None
        } else {
            Some(reader.bytes()?.to_vec())
        };
        Ok(TtlIndexEntry {
            expiration_ms,
            grouping_key,
            user_key,
        })
    }

    pub fn decode_user_key_from_ttl_row<UK: DeserializeOwned>(&self, row: &[u8]) -> Result<UK> {
        let entry = self.decode_ttl_row(row)?;
        let user_key = entry.user_key.ok_or_else(|| {
            StoreError::Corruption(format!(
                "TTL row of state {} has no user key",
                self.state_name
            ))
        })?;
        deserialize(&user_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Session {
        user: String,
        clicks: u32,
    }

    #[test]
    fn test_value_with_and_without_ttl() {
        let plain = StateTypeEncoder::<String, Session>::new("s", false);
        let ttl = StateTypeEncoder::<String, Session>::new("s", true);
        let session = Session {
            user: "ann".into(),
            clicks: 3,
        };

        let row = plain.encode_value(&session, Some(10)).unwrap();
        assert_eq!(plain.decode_value(&row).unwrap(), session);
        assert_eq!(plain.decode_ttl_expiration_ms(&row).unwrap(), None);
        assert!(!plain.is_expired(&row, i64::MAX).unwrap());

        let row = ttl.encode_value(&session, Some(5000)).unwrap();
        assert_eq!(ttl.decode_value(&row).unwrap(), session);
        assert_eq!(ttl.decode_ttl_expiration_ms(&row).unwrap(), Some(5000));
        assert!(!ttl.is_expired(&row, 4999).unwrap());
        assert!(ttl.is_expired(&row, 5000).unwrap());

        let row = ttl.encode_value(&session, None).unwrap();
        assert!(!ttl.is_expired(&row, i64::MAX).unwrap());
        assert_eq!(ttl.value_schema().len(), 2);
    }

    #[test]
    fn test_composite_key_halves() {
        let encoder = StateTypeEncoder::<String, i64>::new("m", true);
        let row = encoder
            .encode_composite_key(&"group".to_string(), &"k1".to_string())
            .unwrap();

        let (grouping, user) = encoder.decode_composite_key(&row).unwrap();
        assert_eq!(grouping, serialize("group").unwrap());
        assert_eq!(user, serialize("k1").unwrap());
        assert_eq!(encoder.decode_user_key::<String>(&row).unwrap(), "k1");

        // The grouping key row is a prefix of every composite key in the group.
        let prefix = encoder.encode_grouping_key(&"group".to_string()).unwrap();
        assert!(row.starts_with(&prefix));
    }

    #[test]
    fn test_ttl_rows_sort_by_expiration() {
        let encoder = StateTypeEncoder::<String, i64>::new("m", true);
        let g = serialize("g").unwrap();
        let uk = serialize("k1").unwrap();

        let late = encoder.encode_ttl_row(9000, &g, Some(&uk));
        let early = encoder.encode_ttl_row(-1, &g, None);
        assert!(early < late);

        let entry = encoder.decode_ttl_row(&late).unwrap();
        assert_eq!(entry.expiration_ms, 9000);
        assert_eq!(entry.grouping_key, g);
        assert_eq!(entry.user_key, Some(uk));
        assert_eq!(
            encoder.decode_user_key_from_ttl_row::<String>(&late).unwrap(),
            "k1"
        );
        assert_eq!(encoder.decode_ttl_row(&early).unwrap().user_key, None);
    }

    #[test]
    fn test_null_values_rejected() {
        let encoder = StateTypeEncoder::<String, Option<i64>>::new("opt", false);
        let err = encoder.encode_value(&None, None).unwrap_err();
        assert!(matches!(err, StoreError::NullValue { .. }));
        assert!(encoder.encode_value(&Some(1), None).is_ok());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let encoder = StateTypeEncoder::<(String, u32), Session>::new("s", true);
        let key = ("a".to_string(), 7);
        let session = Session {
            user: "bob".into(),
            clicks: 1,
        };
        assert_eq!(
            encoder.encode_grouping_key(&key).unwrap(),
            encoder.encode_grouping_key(&key).unwrap()
        );
        assert_eq!(
            encoder.encode_value(&session, Some(1)).unwrap(),
            encoder.encode_value(&session, Some(1)).unwrap()
        );
    }
}
