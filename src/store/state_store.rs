//! Writable and read-only handles on one store version.

use super::engine::{KeyValue, KvEngine};
use super::metadata::{FamilyEvent, VersionMetadata};
use super::provider::ProviderShared;
use crate::changelog::ChangelogWriter;
use crate::error::{Result, StoreError};
use crate::types::{
    is_internal_col_family, ColumnFamilySchema, KeyEncoderSpec, Schema, StateStoreId,
    StateStoreMetrics, Version, DEFAULT_COL_FAMILY_NAME,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StoreState {
    Updating,
    Committed(Version),
    Aborted,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreState::Updating => f.write_str("UPDATING"),
            StoreState::Committed(_) => f.write_str("COMMITTED"),
            StoreState::Aborted => f.write_str("ABORTED"),
        }
    }
}

struct StoreInner {
    engine: KvEngine,
    writer: Option<Box<dyn ChangelogWriter>>,
    family_events: Vec<FamilyEvent>,
    state: StoreState,
}

impl StoreInner {
    fn closed_error(&self, operation: &str) -> StoreError {
        StoreError::InvalidStoreState {
            operation: operation.to_string(),
            state: self.state.to_string(),
        }
    }

    fn engine(&self, operation: &str) -> Result<&KvEngine> {
        match self.state {
            StoreState::Updating => Ok(&self.engine),
            _ => Err(self.closed_error(operation)),
        }
    }

    fn active(&mut self, operation: &str) -> Result<(&mut KvEngine, &mut dyn ChangelogWriter)> {
        if self.state != StoreState::Updating {
            return Err(self.closed_error(operation));
        }
        match self.writer.as_mut() {
            Some(writer) => Ok((&mut self.engine, writer.as_mut())),
            None => Err(StoreError::InvalidStoreState {
                operation: operation.to_string(),
                state: self.state.to_string(),
            }),
        }
    }

    fn abort(&mut self) -> bool {
        if self.state != StoreState::Updating {
            return false;
        }
        if let Some(mut writer) = self.writer.take() {
            writer.abort();
        }
        self.state = StoreState::Aborted;
        self.engine = KvEngine::new();
        self.family_events.clear();
        true
    }
}

/// A store opened on top of one committed version.
///
/// Every mutation is appended to the changelog of the next version before it
/// is applied to the in-memory engine. `commit` makes the next version
/// durable; `abort` (or dropping an uncommitted store) discards it. Once
/// committed or aborted, every further call fails with `InvalidStoreState`.
pub struct StateStore {
    id: StateStoreId,
    version: Version,
    shared: Arc<ProviderShared>,
    inner: Mutex<StoreInner>,
}

impl StateStore {
    pub(crate) fn new(
        shared: Arc<ProviderShared>,
        version: Version,
        engine: KvEngine,
        writer: Box<dyn ChangelogWriter>,
    ) -> Self {
        Self {
            id: shared.store_id().clone(),
            version,
            shared,
            inner: Mutex::new(StoreInner {
                engine,
                writer: Some(writer),
                family_events: Vec::new(),
                state: StoreState::Updating,
            }),
        }
    }

    pub fn id(&self) -> &StateStoreId {
        &self.id
    }

    /// The version this store was loaded from.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn has_committed(&self) -> bool {
        matches!(self.inner.lock().state, StoreState::Committed(_))
    }

    /// Declare a column family. Repeating an identical declaration is a no-op.
    pub fn create_column_family_if_absent(
        &self,
        name: &str,
        key_schema: Schema,
        value_schema: Schema,
        key_encoder: KeyEncoderSpec,
        multi_value: bool,
    ) -> Result<()> {
        if is_internal_col_family(name) {
            return Err(StoreError::ReservedColumnFamily(name.to_string()));
        }
        self.create_family(ColumnFamilySchema::new(
            name,
            key_schema,
            value_schema,
            key_encoder,
            multi_value,
        ))
    }

    /// Declare a family without the reserved-name check.
    pub(crate) fn create_family(&self, schema: ColumnFamilySchema) -> Result<()> {
        let mut inner = self.inner.lock();
        let (engine, writer) = inner.active("createColFamilyIfAbsent")?;
        let at_record = writer.num_records();
        let name = schema.name.clone();
        if engine.create_family(schema.clone())? {
            inner.family_events.push(FamilyEvent {
                at_record,
                name: name.clone(),
                schema: Some(schema),
            });
            debug!(family = %name, store = %self.id, "Created column family");
        }
        Ok(())
    }

    pub fn has_column_family(&self, name: &str) -> Result<bool> {
        Ok(self.inner.lock().engine("hasColumnFamily")?.has_family(name))
    }

    /// Drop a family and its data. Returns false when it did not exist.
    pub fn remove_column_family(&self, name: &str) -> Result<bool> {
        if name == DEFAULT_COL_FAMILY_NAME {
            return Err(StoreError::ReservedColumnFamily(name.to_string()));
        }
        let mut inner = self.inner.lock();
        let (engine, writer) = inner.active("removeColFamilyIfExists")?;
        let keys: Vec<Vec<u8>> = match engine.family(name) {
            Ok(family) => family.data.keys().cloned().collect(),
            Err(StoreError::ColumnFamilyNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        for key in &keys {
            writer.delete_cf(key, name)?;
        }
        engine.remove_family(name);
        let at_record = writer.num_records();
        inner.family_events.push(FamilyEvent {
            at_record,
            name: name.to_string(),
            schema: None,
        });
        debug!(family = %name, removed = keys.len(), "Removed column family");
        Ok(true)
    }

    pub fn get(&self, key: &[u8], column_family: &str) -> Result<Option<Vec<u8>>> {
        self.inner.lock().engine("get")?.get(key, column_family)
    }

    pub fn put(&self, key: &[u8], value: &[u8], column_family: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let (engine, writer) = inner.active("put")?;
        engine.family(column_family)?;
        if column_family == DEFAULT_COL_FAMILY_NAME {
            writer.put(key, value)?;
        } else {
            writer.put_cf(key, value, column_family)?;
        }
        engine.put(key, value, column_family)
    }

    pub fn remove(&self, key: &[u8], column_family: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let (engine, writer) = inner.active("remove")?;
        engine.family(column_family)?;
        if column_family == DEFAULT_COL_FAMILY_NAME {
            writer.delete(key)?;
        } else {
            writer.delete_cf(key, column_family)?;
        }
        engine.delete(key, column_family)
    }

    /// Append a value under `key` in a multi-value family.
    pub fn merge(&self, key: &[u8], value: &[u8], column_family: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let (engine, writer) = inner.active("merge")?;
        if !engine.family(column_family)?.schema.multi_value {
            return Err(StoreError::InvalidColumnFamilyOperation {
                operation: "merge".into(),
                family: column_family.to_string(),
                detail: "family does not hold multiple values per key".into(),
            });
        }
        writer.merge(key, value, column_family)?;
        engine.merge(key, value, column_family)
    }

    /// Entries whose key starts with `prefix`, in key order.
    pub fn prefix_scan(&self, prefix: &[u8], column_family: &str) -> Result<Vec<KeyValue>> {
        self.inner
            .lock()
            .engine("prefixScan")?
            .prefix_scan(prefix, column_family)
    }

    pub fn values_iterator(&self, key: &[u8], column_family: &str) -> Result<Vec<Vec<u8>>> {
        self.inner
            .lock()
            .engine("valuesIterator")?
            .values(key, column_family)
    }

    /// Every entry of a family in key order.
    pub fn iterator(&self, column_family: &str) -> Result<Vec<KeyValue>> {
        self.inner.lock().engine("iterator")?.iter(column_family)
    }

    pub fn metrics(&self) -> Result<StateStoreMetrics> {
        Ok(self.inner.lock().engine("metrics")?.metrics())
    }

    /// Make the next version durable and return it.
    pub fn commit(&self) -> Result<Version> {
        let mut inner = self.inner.lock();
        inner.active("commit")?;
        let new_version = self.version.next();
        let file_manager = self.shared.file_manager();

        // Re-running an older batch replaces its version and everything
        // built on top of it.
        if let Err(e) = self.shared.discard_versions_from(new_version) {
            inner.abort();
            return Err(e);
        }

        let meta = VersionMetadata {
            version: new_version,
            changelog_format: self.shared.conf().changelog_format,
            compression: self.shared.conf().compression,
            column_families: inner.engine.schemas(),
            family_events: std::mem::take(&mut inner.family_events),
        };
        let meta_path = self.shared.meta_path(new_version);
        if let Err(e) = meta.write(file_manager, &meta_path) {
            inner.abort();
            return Err(e);
        }

        let num_records = inner.writer.as_ref().map_or(0, |w| w.num_records());
        let commit_result = match inner.writer.take() {
            Some(mut writer) => writer.commit(),
            None => Ok(()),
        };
        if let Err(e) = commit_result {
            if let Err(cleanup) = file_manager.delete(&meta_path) {
                warn!(version = new_version.0, error = %cleanup, "Failed to delete metadata of aborted commit");
            }
            inner.abort();
            return Err(e);
        }

        inner.state = StoreState::Committed(new_version);
        let engine = std::mem::take(&mut inner.engine);
        self.shared.record_commit(new_version, engine);

        info!(
            store = %self.id,
            version = new_version.0,
            records = num_records,
            "Committed state store version"
        );
        Ok(new_version)
    }

    /// Discard every change made through this store. Idempotent.
    pub fn abort(&self) {
        if self.inner.lock().abort() {
            info!(store = %self.id, version = self.version.0, "Aborted state store");
        }
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        if self.inner.get_mut().abort() {
            debug!(store = %self.id, version = self.version.0, "Dropped uncommitted state store");
        }
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

/// Read-only view of one committed version.
#[derive(Clone)]
pub struct ReadStateStore {
    id: StateStoreId,
    version: Version,
    engine: Arc<KvEngine>,
}

impl ReadStateStore {
    pub(crate) fn new(id: StateStoreId, version: Version, engine: Arc<KvEngine>) -> Self {
        Self {
            id,
            version,
            engine,
        }
    }

    pub fn id(&self) -> &StateStoreId {
        &self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn has_column_family(&self, name: &str) -> bool {
        self.engine.has_family(name)
    }

    pub fn column_families(&self) -> Vec<ColumnFamilySchema> {
        self.engine.schemas()
    }

    pub fn get(&self, key: &[u8], column_family: &str) -> Result<Option<Vec<u8>>> {
        self.engine.get(key, column_family)
    }

    pub fn prefix_scan(&self, prefix: &[u8], column_family: &str) -> Result<Vec<KeyValue>> {
        self.engine.prefix_scan(prefix, column_family)
    }

    pub fn values_iterator(&self, key: &[u8], column_family: &str) -> Result<Vec<Vec<u8>>> {
        self.engine.values(key, column_family)
    }

    pub fn iterator(&self, column_family: &str) -> Result<Vec<KeyValue>> {
        self.engine.iter(column_family)
    }

    pub fn metrics(&self) -> StateStoreMetrics {
        self.engine.metrics()
    }
}

impl fmt::Debug for ReadStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadStateStore")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish()
    }
}
