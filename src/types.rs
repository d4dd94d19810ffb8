//! Core types for the state store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the column family every store carries.
pub const DEFAULT_COL_FAMILY_NAME: &str = "default";

/// Default store name inside one operator partition.
pub const DEFAULT_STORE_NAME: &str = "default";

/// Monotonically increasing store version. Version 0 is the empty store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Version(pub u64);

impl Version {
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Version(self.0 - 1))
        } else {
            None
        }
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one logical store instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StateStoreId {
    pub checkpoint_root: PathBuf,
    pub operator_id: u64,
    pub partition_id: u32,
    pub store_name: String,
}

impl StateStoreId {
    pub fn new(checkpoint_root: impl Into<PathBuf>, operator_id: u64, partition_id: u32) -> Self {
        Self {
            checkpoint_root: checkpoint_root.into(),
            operator_id,
            partition_id,
            store_name: DEFAULT_STORE_NAME.to_string(),
        }
    }

    pub fn with_store_name(mut self, store_name: impl Into<String>) -> Self {
        self.store_name = store_name.into();
        self
    }

    /// Directory holding this store's changelog, metadata and snapshot files.
    pub fn store_checkpoint_location(&self) -> PathBuf {
        let base = self
            .checkpoint_root
            .join(self.operator_id.to_string())
            .join(self.partition_id.to_string());
        if self.store_name == DEFAULT_STORE_NAME {
            base
        } else {
            base.join(&self.store_name)
        }
    }
}

impl fmt::Display for StateStoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StateStoreId[op={}, part={}, name={}]",
            self.operator_id, self.partition_id, self.store_name
        )
    }
}

/// A store id bound to one query run; the unit of provider caching.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StateStoreProviderId {
    pub store_id: StateStoreId,
    pub query_run_id: String,
}

impl StateStoreProviderId {
    pub fn new(store_id: StateStoreId, query_run_id: impl Into<String>) -> Self {
        Self {
            store_id,
            query_run_id: query_run_id.into(),
        }
    }
}

/// Field types appearing in the fixed row layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Binary,
    Int64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Ordered list of fields describing a key or value row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Schema made of non-nullable binary columns.
    pub fn binary(names: &[&str]) -> Self {
        Self {
            fields: names
                .iter()
                .map(|name| Field::new(*name, DataType::Binary, false))
                .collect(),
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// How keys of a column family are encoded, which decides the scans it supports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyEncoderSpec {
    /// Exact-key lookups only.
    NoPrefix,
    /// Scans over all keys sharing the first `num_prefix_cols` key columns.
    PrefixScan { num_prefix_cols: usize },
    /// Ordered scans on the listed key columns.
    RangeScan { ordering_ordinals: Vec<usize> },
}

impl KeyEncoderSpec {
    pub fn supports_prefix_scan(&self) -> bool {
        !matches!(self, KeyEncoderSpec::NoPrefix)
    }
}

/// Full definition of a column family.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFamilySchema {
    pub name: String,
    pub key_schema: Schema,
    pub value_schema: Schema,
    pub key_encoder: KeyEncoderSpec,
    pub multi_value: bool,
}

impl ColumnFamilySchema {
    pub fn new(
        name: impl Into<String>,
        key_schema: Schema,
        value_schema: Schema,
        key_encoder: KeyEncoderSpec,
        multi_value: bool,
    ) -> Self {
        Self {
            name: name.into(),
            key_schema,
            value_schema,
            key_encoder,
            multi_value,
        }
    }

    /// The always-present raw binary family.
    pub fn default_family() -> Self {
        Self::new(
            DEFAULT_COL_FAMILY_NAME,
            Schema::binary(&["key"]),
            Schema::binary(&["value"]),
            KeyEncoderSpec::NoPrefix,
            false,
        )
    }

    /// Same definition, ignoring the name.
    pub fn is_compatible_with(&self, other: &ColumnFamilySchema) -> bool {
        self.key_schema == other.key_schema
            && self.value_schema == other.value_schema
            && self.key_encoder == other.key_encoder
            && self.multi_value == other.multi_value
    }
}

/// Internal families use names the operator cannot declare.
pub fn is_internal_col_family(name: &str) -> bool {
    name.starts_with('$')
}

/// Which clock timers and TTL follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeMode {
    NoTime,
    ProcessingTime,
    EventTime,
}

impl fmt::Display for TimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeMode::NoTime => "NoTime",
            TimeMode::ProcessingTime => "ProcessingTime",
            TimeMode::EventTime => "EventTime",
        };
        f.write_str(name)
    }
}

/// Time-to-live of the values of one state variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtlConfig {
    pub ttl_duration: Duration,
}

impl TtlConfig {
    pub fn new(ttl_duration: Duration) -> Self {
        Self { ttl_duration }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    pub fn duration_ms(&self) -> i64 {
        i64::try_from(self.ttl_duration.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Per micro-batch time information.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BatchContext {
    pub batch_id: u64,
    /// Processing timestamp of the batch; drives every TTL computation.
    pub batch_timestamp_ms: i64,
    pub watermark_ms: Option<i64>,
}

impl BatchContext {
    pub fn new(batch_id: u64, batch_timestamp_ms: i64) -> Self {
        Self {
            batch_id,
            batch_timestamp_ms,
            watermark_ms: None,
        }
    }

    pub fn with_watermark(mut self, watermark_ms: i64) -> Self {
        self.watermark_ms = Some(watermark_ms);
        self
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateStoreMetrics {
    pub num_keys: u64,
    pub memory_used_bytes: u64,
    pub num_column_families: u64,
}
