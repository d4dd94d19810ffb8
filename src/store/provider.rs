//! Loads store versions from checkpoint files and hands out stores.

use super::engine::KvEngine;
use super::metadata::{FamilyEvent, VersionMetadata};
use super::snapshot::{read_snapshot, write_snapshot};
use super::state_store::{ReadStateStore, StateStore};
use crate::changelog::{self, ChangelogFormat};
use crate::checkpoint::{CheckpointFileManager, CompressionCodec, LocalCheckpointFileManager};
use crate::error::{Result, StoreError};
use crate::types::{StateStoreId, StateStoreProviderId, Version};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CHANGELOG_SUFFIX: &str = "changelog";
const META_SUFFIX: &str = "meta";
const SNAPSHOT_SUFFIX: &str = "snapshot";

/// Provider configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateStoreConf {
    /// Wire format of newly written changelog files.
    pub changelog_format: ChangelogFormat,

    /// Compression applied to newly written changelog files.
    pub compression: CompressionCodec,

    /// Changelog files accumulated since the last snapshot before
    /// maintenance writes a new one.
    pub min_deltas_for_snapshot: u64,

    /// Number of recent versions that stay recoverable after maintenance.
    pub min_versions_to_retain: u64,

    /// Loaded versions kept in memory.
    pub max_versions_in_cache: usize,
}

impl Default for StateStoreConf {
    fn default() -> Self {
        Self {
            changelog_format: ChangelogFormat::V2,
            compression: CompressionCodec::None,
            min_deltas_for_snapshot: 10,
            min_versions_to_retain: 100,
            max_versions_in_cache: 2,
        }
    }
}

/// State shared by a provider and the stores it hands out.
pub(crate) struct ProviderShared {
    provider_id: StateStoreProviderId,
    conf: StateStoreConf,
    dir: PathBuf,
    file_manager: Arc<dyn CheckpointFileManager>,
    cache: Mutex<LruCache<Version, Arc<KvEngine>>>,
    latest: Mutex<Version>,
    lock_file: File,
}

impl ProviderShared {
    pub(crate) fn store_id(&self) -> &StateStoreId {
        &self.provider_id.store_id
    }

    pub(crate) fn conf(&self) -> &StateStoreConf {
        &self.conf
    }

    pub(crate) fn file_manager(&self) -> &dyn CheckpointFileManager {
        self.file_manager.as_ref()
    }

    fn file_path(&self, version: Version, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", version.0, suffix))
    }

    pub(crate) fn changelog_path(&self, version: Version) -> PathBuf {
        self.file_path(version, CHANGELOG_SUFFIX)
    }

    pub(crate) fn meta_path(&self, version: Version) -> PathBuf {
        self.file_path(version, META_SUFFIX)
    }

    pub(crate) fn snapshot_path(&self, version: Version) -> PathBuf {
        self.file_path(version, SNAPSHOT_SUFFIX)
    }

    /// Called once a store has made `version` durable.
    pub(crate) fn record_commit(&self, version: Version, engine: KvEngine) {
        self.cache.lock().put(version, Arc::new(engine));
        *self.latest.lock() = version;
    }

    /// Forget `first` and every later version, in memory and on disk.
    pub(crate) fn discard_versions_from(&self, first: Version) -> Result<()> {
        {
            let mut cache = self.cache.lock();
            let stale: Vec<Version> = cache
                .iter()
                .map(|(v, _)| *v)
                .filter(|v| *v >= first)
                .collect();
            for version in stale {
                cache.pop(&version);
            }
        }
        {
            let mut latest = self.latest.lock();
            if *latest >= first {
                *latest = first.prev().unwrap_or_default();
            }
        }

        let mut orphans: Vec<(Version, String)> = self
            .file_manager
            .list(&self.dir)?
            .into_iter()
            .filter_map(|name| {
                [META_SUFFIX, CHANGELOG_SUFFIX, SNAPSHOT_SUFFIX]
                    .iter()
                    .find_map(|suffix| parse_versioned_file(&name, suffix))
                    .filter(|v| *v >= first)
                    .map(|v| (v, name))
            })
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }

        // Newest first and metadata before data, so an interrupted discard
        // still leaves a gapless history behind.
        orphans.sort_by_key(|(v, name)| (Reverse(*v), !name.ends_with(META_SUFFIX)));
        for (_, name) in &orphans {
            self.file_manager.delete(&self.dir.join(name))?;
        }
        info!(
            store = %self.store_id(),
            first_version = first.0,
            deleted = orphans.len(),
            "Discarded superseded versions"
        );
        Ok(())
    }

    /// Versions that have a file with `suffix`, ascending.
    fn list_versions(&self, suffix: &str) -> Result<Vec<Version>> {
        let mut versions: Vec<Version> = self
            .file_manager
            .list(&self.dir)?
            .iter()
            .filter_map(|name| parse_versioned_file(name, suffix))
            .collect();
        versions.sort();
        Ok(versions)
    }

    fn load_engine(&self, version: Version) -> Result<Arc<KvEngine>> {
        if version == Version(0) {
            return Ok(Arc::new(KvEngine::new()));
        }

        let cached = {
            let mut cache = self.cache.lock();
            if let Some(engine) = cache.get(&version) {
                return Ok(Arc::clone(engine));
            }
            cache
                .iter()
                .filter(|(v, _)| **v <= version)
                .max_by_key(|(v, _)| **v)
                .map(|(v, engine)| (*v, Arc::clone(engine)))
        };

        if version > *self.latest.lock() || !self.file_manager.exists(&self.meta_path(version)) {
            return Err(StoreError::VersionNotFound(version));
        }

        let snapshot = self
            .list_versions(SNAPSHOT_SUFFIX)?
            .into_iter()
            .filter(|v| *v <= version)
            .max();

        let (base, mut engine) = match (cached, snapshot) {
            (Some((cached_version, engine)), Some(snapshot_version))
                if cached_version >= snapshot_version =>
            {
                (cached_version, (*engine).clone())
            }
            (Some((cached_version, engine)), None) => (cached_version, (*engine).clone()),
            (_, Some(snapshot_version)) => {
                let engine = read_snapshot(
                    self.file_manager(),
                    &self.snapshot_path(snapshot_version),
                    snapshot_version,
                )?;
                (snapshot_version, engine)
            }
            (None, None) => (Version(0), KvEngine::new()),
        };

        debug!(
            store = %self.store_id(),
            base = base.0,
            target = version.0,
            "Loading state store version"
        );
        let mut next = base.next();
        while next <= version {
            self.replay_version(&mut engine, next)?;
            next = next.next();
        }

        let engine = Arc::new(engine);
        self.cache.lock().put(version, Arc::clone(&engine));
        Ok(engine)
    }

    /// Apply changelog `version` on top of `version - 1`.
    fn replay_version(&self, engine: &mut KvEngine, version: Version) -> Result<()> {
        let meta_path = self.meta_path(version);
        if !self.file_manager.exists(&meta_path) {
            return Err(StoreError::VersionNotFound(version));
        }
        let meta = VersionMetadata::read(self.file_manager(), &meta_path)?;
        if meta.version != version {
            return Err(StoreError::Corruption(format!(
                "metadata {} describes version {}",
                meta_path.display(),
                meta.version
            )));
        }

        // Metadata without family events only lists the families alive
        // afterwards; those must exist before their records.
        if meta.family_events.is_empty() {
            for schema in &meta.column_families {
                if !engine.has_family(&schema.name) {
                    engine.set_family_schema(schema.clone());
                }
            }
        }
        let mut events = meta.family_events.iter().peekable();

        let reader = changelog::open_reader(
            self.file_manager(),
            &self.changelog_path(version),
            meta.changelog_format,
            meta.compression,
        )?;
        let mut records = 0u64;
        for record in reader {
            let record = record?;
            while let Some(event) = events.next_if(|e| e.at_record <= records) {
                apply_family_event(engine, event);
            }
            // Without family events, a family created and dropped within
            // this version never shows up in the metadata.
            if meta.family_events.is_empty() && !engine.has_family(record.column_family()) {
                records += 1;
                continue;
            }
            engine.apply(&record)?;
            records += 1;
        }
        for event in events {
            apply_family_event(engine, event);
        }

        for schema in &meta.column_families {
            engine.set_family_schema(schema.clone());
        }
        let live: HashSet<&str> = meta
            .column_families
            .iter()
            .map(|schema| schema.name.as_str())
            .collect();
        engine.retain_families(|name| live.contains(name));

        debug!(version = version.0, records, "Replayed changelog");
        Ok(())
    }
}

impl Drop for ProviderShared {
    fn drop(&mut self) {
        // Best-effort unlock; closing the file releases it anyway
        let _ = self.lock_file.unlock();
    }
}

fn apply_family_event(engine: &mut KvEngine, event: &FamilyEvent) {
    engine.remove_family(&event.name);
    if let Some(schema) = &event.schema {
        engine.set_family_schema(schema.clone());
    }
}

fn parse_versioned_file(name: &str, suffix: &str) -> Option<Version> {
    let (stem, ext) = name.rsplit_once('.')?;
    if ext != suffix {
        return None;
    }
    stem.parse::<u64>().ok().map(Version)
}

/// Owns the checkpoint directory of one store and serves its versions.
///
/// Only one provider may hold a store directory at a time; a second `open`
/// fails with `StoreError::Locked` until the first provider and every store
/// it handed out are dropped.
pub struct StateStoreProvider {
    shared: Arc<ProviderShared>,
}

impl StateStoreProvider {
    /// Open a store on the local filesystem.
    pub fn open(provider_id: StateStoreProviderId, conf: StateStoreConf) -> Result<Self> {
        Self::open_with_file_manager(provider_id, conf, Arc::new(LocalCheckpointFileManager))
    }

    pub fn open_with_file_manager(
        provider_id: StateStoreProviderId,
        conf: StateStoreConf,
        file_manager: Arc<dyn CheckpointFileManager>,
    ) -> Result<Self> {
        let dir = provider_id.store_id.store_checkpoint_location();
        file_manager.mkdirs(&dir)?;
        let lock_file = Self::acquire_lock(&dir)?;

        let cache_size = NonZeroUsize::new(conf.max_versions_in_cache).unwrap_or(NonZeroUsize::MIN);
        let shared = Arc::new(ProviderShared {
            provider_id,
            conf,
            dir,
            file_manager,
            cache: Mutex::new(LruCache::new(cache_size)),
            latest: Mutex::new(Version(0)),
            lock_file,
        });

        let latest = shared
            .list_versions(CHANGELOG_SUFFIX)?
            .into_iter()
            .filter(|v| shared.file_manager.exists(&shared.meta_path(*v)))
            .max()
            .unwrap_or_default();
        *shared.latest.lock() = latest;

        info!(
            store = %shared.store_id(),
            query_run_id = %shared.provider_id.query_run_id,
            latest_version = latest.0,
            "Opened state store provider"
        );
        Ok(Self { shared })
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_file = File::create(dir.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }

    pub fn id(&self) -> &StateStoreProviderId {
        &self.shared.provider_id
    }

    pub fn conf(&self) -> &StateStoreConf {
        &self.shared.conf
    }

    /// Newest committed version, 0 when nothing was committed yet.
    pub fn latest_version(&self) -> Version {
        *self.shared.latest.lock()
    }

    /// Writable store on top of `version`; its commit produces `version + 1`.
    ///
    /// Committing on top of an older version re-runs that batch: every
    /// version after `version` is discarded before the new one is published.
    pub fn get_store(&self, version: Version) -> Result<StateStore> {
        let engine = self.shared.load_engine(version)?;
        let writer = changelog::create_writer(
            self.shared.file_manager(),
            &self.shared.changelog_path(version.next()),
            self.shared.conf.changelog_format,
            self.shared.conf.compression,
        )?;
        Ok(StateStore::new(
            Arc::clone(&self.shared),
            version,
            (*engine).clone(),
            writer,
        ))
    }

    /// Read-only view of a committed version.
    pub fn get_read_store(&self, version: Version) -> Result<ReadStateStore> {
        let engine = self.shared.load_engine(version)?;
        Ok(ReadStateStore::new(
            self.shared.store_id().clone(),
            version,
            engine,
        ))
    }

    /// Snapshot the latest version if enough changelogs piled up, then delete
    /// files no retained version needs.
    pub fn do_maintenance(&self) -> Result<()> {
        let latest = self.latest_version();
        if latest == Version(0) {
            return Ok(());
        }

        let snapshots = self.shared.list_versions(SNAPSHOT_SUFFIX)?;
        let last_snapshot = snapshots.last().copied().unwrap_or_default();
        if latest.0 - last_snapshot.0 >= self.shared.conf.min_deltas_for_snapshot {
            let engine = self.shared.load_engine(latest)?;
            write_snapshot(
                self.shared.file_manager(),
                &self.shared.snapshot_path(latest),
                latest,
                &engine,
            )?;
        }

        self.cleanup(latest)
    }

    fn cleanup(&self, latest: Version) -> Result<()> {
        let retain = self.shared.conf.min_versions_to_retain.max(1);
        if latest.0 <= retain {
            return Ok(());
        }
        let oldest_retained = Version(latest.0 - retain + 1);

        // The newest snapshot at or below the oldest retained version is the
        // base every retained version is rebuilt from.
        let base = match self
            .shared
            .list_versions(SNAPSHOT_SUFFIX)?
            .into_iter()
            .filter(|v| *v <= oldest_retained)
            .max()
        {
            Some(base) => base,
            None => return Ok(()),
        };

        let fm = self.shared.file_manager();
        let mut deleted = 0usize;
        for name in fm.list(&self.shared.dir)? {
            let stale = [CHANGELOG_SUFFIX, META_SUFFIX, SNAPSHOT_SUFFIX]
                .iter()
                .filter_map(|suffix| parse_versioned_file(&name, suffix))
                .any(|v| v < base);
            if !stale {
                continue;
            }
            match fm.delete(&self.shared.dir.join(&name)) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(file = %name, error = %e, "Failed to delete old checkpoint file"),
            }
        }

        if deleted > 0 {
            info!(
                store = %self.shared.store_id(),
                base_snapshot = base.0,
                deleted,
                "Deleted old checkpoint files"
            );
        }
        Ok(())
    }
}
