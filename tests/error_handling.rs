//! Error handling and edge case tests.

use statestore::{
    BatchContext, KeyEncoderSpec, Schema, StateStore, StateStoreConf, StateStoreId,
    StateStoreProvider, StateStoreProviderId, StatefulProcessorHandle, StoreError, TimeMode,
    Version,
};
use std::sync::Arc;
use tempfile::TempDir;

fn test_provider(dir: &TempDir) -> StateStoreProvider {
    StateStoreProvider::open(
        StateStoreProviderId::new(StateStoreId::new(dir.path(), 0, 0), "errors"),
        StateStoreConf::default(),
    )
    .unwrap()
}

fn create_family(store: &StateStore, name: &str, encoder: KeyEncoderSpec, multi_value: bool) {
    store
        .create_column_family_if_absent(
            name,
            Schema::binary(&["key"]),
            Schema::binary(&["value"]),
            encoder,
            multi_value,
        )
        .unwrap();
}

// --- Store Errors ---

#[test]
fn test_unknown_column_family() {
    let dir = TempDir::new().unwrap();
    let provider = test_provider(&dir);
    let store = provider.get_store(Version(0)).unwrap();

    assert!(matches!(
        store.get(b"k", "missing"),
        Err(StoreError::ColumnFamilyNotFound(_))
    ));
    assert!(matches!(
        store.put(b"k", b"v", "missing"),
        Err(StoreError::ColumnFamilyNotFound(_))
    ));
    assert!(!store.remove_column_family("missing").unwrap());
}

#[test]
fn test_schema_mismatch_on_redefinition() {
    let dir = TempDir::new().unwrap();
    let provider = test_provider(&dir);
    let store = provider.get_store(Version(0)).unwrap();

    create_family(&store, "f", KeyEncoderSpec::NoPrefix, false);
    create_family(&store, "f", KeyEncoderSpec::NoPrefix, false);
    let result = store.create_column_family_if_absent(
        "f",
        Schema::binary(&["key"]),
        Schema::binary(&["value"]),
        KeyEncoderSpec::PrefixScan { num_prefix_cols: 1 },
        false,
    );
    assert!(matches!(
        result,
        Err(StoreError::ColumnFamilySchemaMismatch { .. })
    ));
}

#[test]
fn test_reserved_family_names() {
    let dir = TempDir::new().unwrap();
    let provider = test_provider(&dir);
    let store = provider.get_store(Version(0)).unwrap();

    let result = store.create_column_family_if_absent(
        "$ttl_x",
        Schema::binary(&["key"]),
        Schema::binary(&["value"]),
        KeyEncoderSpec::NoPrefix,
        false,
    );
    assert!(matches!(result, Err(StoreError::ReservedColumnFamily(_))));
    assert!(matches!(
        store.remove_column_family("default"),
        Err(StoreError::ReservedColumnFamily(_))
    ));
}

#[test]
fn test_operation_family_mismatch() {
    let dir = TempDir::new().unwrap();
    let provider = test_provider(&dir);
    let store = provider.get_store(Version(0)).unwrap();
    create_family(&store, "list", KeyEncoderSpec::NoPrefix, true);

    assert!(matches!(
        store.merge(b"k", b"v", "default"),
        Err(StoreError::InvalidColumnFamilyOperation { .. })
    ));
    assert!(matches!(
        store.prefix_scan(b"k", "default"),
        Err(StoreError::InvalidColumnFamilyOperation { .. })
    ));
    assert!(matches!(
        store.get(b"k", "list"),
        Err(StoreError::InvalidColumnFamilyOperation { .. })
    ));
    assert!(matches!(
        store.values_iterator(b"k", "default"),
        Err(StoreError::InvalidColumnFamilyOperation { .. })
    ));
}

#[test]
fn test_store_unusable_after_commit_or_abort() {
    let dir = TempDir::new().unwrap();
    let provider = test_provider(&dir);

    let store = provider.get_store(Version(0)).unwrap();
    store.put(b"k", b"v", "default").unwrap();
    assert_eq!(store.commit().unwrap(), Version(1));
    assert!(store.has_committed());
    match store.put(b"k", b"v", "default") {
        Err(StoreError::InvalidStoreState { operation, state }) => {
            assert_eq!(operation, "put");
            assert_eq!(state, "COMMITTED");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(matches!(
        store.commit(),
        Err(StoreError::InvalidStoreState { .. })
    ));

    let store = provider.get_store(Version(1)).unwrap();
    store.abort();
    assert!(!store.has_committed());
    assert!(matches!(
        store.get(b"k", "default"),
        Err(StoreError::InvalidStoreState { .. })
    ));
}

#[test]
fn test_missing_version() {
    let dir = TempDir::new().unwrap();
    let provider = test_provider(&dir);
    assert!(matches!(
        provider.get_store(Version(4)),
        Err(StoreError::VersionNotFound(Version(4)))
    ));
}

#[test]
fn test_provider_lock_held_by_open_stores() {
    let dir = TempDir::new().unwrap();
    let provider = test_provider(&dir);
    let store = provider.get_store(Version(0)).unwrap();
    drop(provider);

    let id = StateStoreProviderId::new(StateStoreId::new(dir.path(), 0, 0), "errors");
    assert!(matches!(
        StateStoreProvider::open(id.clone(), StateStoreConf::default()),
        Err(StoreError::Locked)
    ));
    drop(store);
    assert!(StateStoreProvider::open(id, StateStoreConf::default()).is_ok());
}

// --- State Errors ---

#[test]
fn test_null_values_rejected() {
    let dir = TempDir::new().unwrap();
    let provider = test_provider(&dir);
    let store = Arc::new(provider.get_store(Version(0)).unwrap());
    let mut handle = StatefulProcessorHandle::<String>::new(
        Arc::clone(&store),
        TimeMode::NoTime,
        BatchContext::new(0, 0),
    )
    .unwrap();

    let value = handle.get_value_state::<Option<u64>>("opt", None).unwrap();
    assert!(matches!(
        value.update(&"k".to_string(), &None),
        Err(StoreError::NullValue { .. })
    ));
    value.update(&"k".to_string(), &Some(1)).unwrap();
    assert_eq!(value.get(&"k".to_string()).unwrap(), Some(Some(1)));

    let mut keyed = StatefulProcessorHandle::<Option<String>>::new(
        store,
        TimeMode::NoTime,
        BatchContext::new(0, 0),
    )
    .unwrap();
    let map = keyed.get_map_state::<String, u64>("m", None).unwrap();
    assert!(matches!(
        map.update_value(&None, &"uk".to_string(), &1),
        Err(StoreError::NullValue { .. })
    ));
}

#[test]
fn test_timers_without_time_mode() {
    let dir = TempDir::new().unwrap();
    let provider = test_provider(&dir);
    let store = Arc::new(provider.get_store(Version(0)).unwrap());
    let handle =
        StatefulProcessorHandle::<String>::new(store, TimeMode::NoTime, BatchContext::new(0, 0))
            .unwrap();
    assert!(matches!(
        handle.get_expired_timers(100),
        Err(StoreError::TimersNotSupported(_))
    ));
}
