//! In-memory ordered key-value engine holding the column families of one
//! store version.
//!
//! Multi-value families keep all values of a key in one framed blob
//! (`u32 len | value` repeated) so that a merge is an append.

use crate::changelog::ChangelogRecord;
use crate::error::{Result, StoreError};
use crate::types::{ColumnFamilySchema, StateStoreMetrics, DEFAULT_COL_FAMILY_NAME};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// One key-value pair returned by scans.
pub type KeyValue = (Vec<u8>, Vec<u8>);

#[derive(Clone, Debug)]
pub(crate) struct ColumnFamily {
    pub(crate) schema: ColumnFamilySchema,
    pub(crate) data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl ColumnFamily {
    fn new(schema: ColumnFamilySchema) -> Self {
        Self {
            schema,
            data: BTreeMap::new(),
        }
    }
}

fn frame_value(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

/// Split a multi-value blob into its values.
pub(crate) fn unframe_values(blob: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut values = Vec::new();
    let mut pos = 0usize;
    while pos < blob.len() {
        if pos + 4 > blob.len() {
            return Err(StoreError::Corruption(
                "truncated multi-value frame header".into(),
            ));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&blob[pos..pos + 4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        pos += 4;
        if pos + len > blob.len() {
            return Err(StoreError::Corruption("truncated multi-value frame".into()));
        }
        values.push(blob[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(values)
}

/// Smallest key strictly greater than every key starting with `prefix`.
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

#[derive(Clone, Debug)]
pub(crate) struct KvEngine {
    families: HashMap<String, ColumnFamily>,
}

impl Default for KvEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine {
    /// Engine holding only the empty default family.
    pub(crate) fn new() -> Self {
        let mut families = HashMap::new();
        families.insert(
            DEFAULT_COL_FAMILY_NAME.to_string(),
            ColumnFamily::new(ColumnFamilySchema::default_family()),
        );
        Self { families }
    }

    pub(crate) fn family(&self, name: &str) -> Result<&ColumnFamily> {
        self.families
            .get(name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(name.to_string()))
    }

    fn family_mut(&mut self, name: &str) -> Result<&mut ColumnFamily> {
        self.families
            .get_mut(name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(name.to_string()))
    }

    pub(crate) fn has_family(&self, name: &str) -> bool {
        self.families.contains_key(name)
    }

    pub(crate) fn schemas(&self) -> Vec<ColumnFamilySchema> {
        let mut schemas: Vec<_> = self.families.values().map(|f| f.schema.clone()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Returns false when an identical family already exists.
    pub(crate) fn create_family(&mut self, schema: ColumnFamilySchema) -> Result<bool> {
        if let Some(existing) = self.families.get(&schema.name) {
            if existing.schema.is_compatible_with(&schema) {
                return Ok(false);
            }
            return Err(StoreError::ColumnFamilySchemaMismatch { name: schema.name });
        }
        self.families
            .insert(schema.name.clone(), ColumnFamily::new(schema));
        Ok(true)
    }

    /// Install or replace a family definition, keeping existing data.
    pub(crate) fn set_family_schema(&mut self, schema: ColumnFamilySchema) {
        match self.families.get_mut(&schema.name) {
            Some(family) => family.schema = schema,
            None => {
                self.families
                    .insert(schema.name.clone(), ColumnFamily::new(schema));
            }
        }
    }

    pub(crate) fn insert_family(&mut self, family: ColumnFamily) {
        self.families.insert(family.schema.name.clone(), family);
    }

    pub(crate) fn remove_family(&mut self, name: &str) -> Option<ColumnFamily> {
        self.families.remove(name)
    }

    pub(crate) fn retain_families(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.families.retain(|name, _| keep(name));
    }

    pub(crate) fn families(&self) -> impl Iterator<Item = &ColumnFamily> {
        self.families.values()
    }

    pub(crate) fn get(&self, key: &[u8], family: &str) -> Result<Option<Vec<u8>>> {
        let family = self.family(family)?;
        if family.schema.multi_value {
            return Err(StoreError::InvalidColumnFamilyOperation {
                operation: "get".into(),
                family: family.schema.name.clone(),
                detail: "use valuesIterator on multi-value families".into(),
            });
        }
        Ok(family.data.get(key).cloned())
    }

    pub(crate) fn put(&mut self, key: &[u8], value: &[u8], family: &str) -> Result<()> {
        let family = self.family_mut(family)?;
        let stored = if family.schema.multi_value {
            let mut framed = Vec::with_capacity(value.len() + 4);
            frame_value(&mut framed, value);
            framed
        } else {
            value.to_vec()
        };
        family.data.insert(key.to_vec(), stored);
        Ok(())
    }

    pub(crate) fn delete(&mut self, key: &[u8], family: &str) -> Result<()> {
        self.family_mut(family)?.data.remove(key);
        Ok(())
    }

    pub(crate) fn merge(&mut self, key: &[u8], value: &[u8], family: &str) -> Result<()> {
        let family = self.family_mut(family)?;
        if !family.schema.multi_value {
            return Err(StoreError::InvalidColumnFamilyOperation {
                operation: "merge".into(),
                family: family.schema.name.clone(),
                detail: "family does not hold multiple values per key".into(),
            });
        }
        let blob = family.data.entry(key.to_vec()).or_default();
        frame_value(blob, value);
        Ok(())
    }

    pub(crate) fn values(&self, key: &[u8], family: &str) -> Result<Vec<Vec<u8>>> {
        let family = self.family(family)?;
        if !family.schema.multi_value {
            return Err(StoreError::InvalidColumnFamilyOperation {
                operation: "valuesIterator".into(),
                family: family.schema.name.clone(),
                detail: "family does not hold multiple values per key".into(),
            });
        }
        match family.data.get(key) {
            Some(blob) => unframe_values(blob),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn prefix_scan(&self, prefix: &[u8], family: &str) -> Result<Vec<KeyValue>> {
        let family = self.family(family)?;
        if !family.schema.key_encoder.supports_prefix_scan() {
            return Err(StoreError::InvalidColumnFamilyOperation {
                operation: "prefixScan".into(),
                family: family.schema.name.clone(),
                detail: "family was created without a prefix or range scan encoder".into(),
            });
        }
        let upper = match prefix_upper_bound(prefix) {
            Some(upper) => Bound::Excluded(upper),
            None => Bound::Unbounded,
        };
        Ok(family
            .data
            .range::<Vec<u8>, _>((Bound::Included(prefix.to_vec()), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    pub(crate) fn iter(&self, family: &str) -> Result<Vec<KeyValue>> {
        let family = self.family(family)?;
        Ok(family
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Apply one replayed changelog record.
    pub(crate) fn apply(&mut self, record: &ChangelogRecord) -> Result<()> {
        let family = record.column_family();
        if !self.has_family(family) {
            return Err(StoreError::Corruption(format!(
                "changelog references unknown column family {}",
                family
            )));
        }
        match record {
            ChangelogRecord::Put { key, value, .. } => self.put(key, value, family),
            ChangelogRecord::Delete { key, .. } => self.delete(key, family),
            ChangelogRecord::Merge { key, value, .. } => self.merge(key, value, family),
        }
    }

    pub(crate) fn metrics(&self) -> StateStoreMetrics {
        let mut metrics = StateStoreMetrics {
            num_column_families: self.families.len() as u64,
            ..Default::default()
        };
        for family in self.families.values() {
            metrics.num_keys += family.data.len() as u64;
            metrics.memory_used_bytes += family
                .data
                .iter()
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum::<u64>();
        }
        metrics
    }
}
