//! Handle lifecycle enforcement and the batch driver.

use statestore::{
    run_batch, BatchContext, HandleState, ListState, Result, StateStoreConf, StateStoreId,
    StateStoreProvider, StateStoreProviderId, StatefulProcessor, StatefulProcessorHandle,
    StoreError, TimeMode, TtlConfig, Version,
};
use std::sync::Arc;
use tempfile::TempDir;

fn provider(dir: &TempDir) -> StateStoreProvider {
    StateStoreProvider::open(
        StateStoreProviderId::new(StateStoreId::new(dir.path(), 2, 5), "lifecycle"),
        StateStoreConf::default(),
    )
    .unwrap()
}

fn open_handle(
    provider: &StateStoreProvider,
    time_mode: TimeMode,
) -> StatefulProcessorHandle<String> {
    let store = Arc::new(provider.get_store(provider.latest_version()).unwrap());
    StatefulProcessorHandle::new(store, time_mode, BatchContext::new(0, 1_000)).unwrap()
}

#[test]
fn test_state_creation_after_created_fails() {
    let dir = TempDir::new().unwrap();
    let provider = provider(&dir);

    for state in [
        HandleState::Initialized,
        HandleState::DataProcessed,
        HandleState::TimerProcessed,
        HandleState::Closed,
    ] {
        let mut handle = open_handle(&provider, TimeMode::ProcessingTime);
        handle.set_handle_state(state).unwrap();

        let err = handle.get_value_state::<u64>("v", None).err().unwrap();
        match err {
            StoreError::InvalidHandleState { operation, state: reported } => {
                assert_eq!(operation, "getValueState");
                assert_eq!(reported, state.to_string());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(handle.get_list_state::<u64>("l", None).is_err());
        assert!(handle.get_map_state::<String, u64>("m", None).is_err());
        assert!(handle.delete_if_exists("v").is_err());
    }
}

#[test]
fn test_timers_only_between_initialized_and_timer_processed() {
    let dir = TempDir::new().unwrap();
    let provider = provider(&dir);
    let key = "k".to_string();
    let mut handle = open_handle(&provider, TimeMode::EventTime);

    assert!(matches!(
        handle.register_timer(&key, 1),
        Err(StoreError::InvalidHandleState { .. })
    ));
    handle.set_handle_state(HandleState::Initialized).unwrap();
    handle.register_timer(&key, 1).unwrap();
    handle.set_handle_state(HandleState::DataProcessed).unwrap();
    handle.delete_timer(&key, 1).unwrap();
    assert!(handle.list_timers(&key).unwrap().is_empty());

    handle.set_handle_state(HandleState::TimerProcessed).unwrap();
    assert!(matches!(
        handle.register_timer(&key, 2),
        Err(StoreError::InvalidHandleState { .. })
    ));
    assert!(matches!(
        handle.set_handle_state(HandleState::Created),
        Err(StoreError::InvalidHandleTransition { .. })
    ));
}

#[test]
fn test_reserved_state_names_rejected() {
    let dir = TempDir::new().unwrap();
    let provider = provider(&dir);
    let mut handle = open_handle(&provider, TimeMode::NoTime);
    assert!(matches!(
        handle.get_value_state::<u64>("$ttl_x", None),
        Err(StoreError::ReservedColumnFamily(_))
    ));
}

/// Buffers rows per key and flushes them when the key's timer fires.
#[derive(Default)]
struct Sessionizer {
    buffer: Option<ListState<String, String>>,
}

impl StatefulProcessor<String, String, (String, Vec<String>)> for Sessionizer {
    fn init(&mut self, handle: &mut StatefulProcessorHandle<String>) -> Result<()> {
        self.buffer = Some(handle.get_list_state("buffer", Some(TtlConfig::from_millis(60_000)))?);
        Ok(())
    }

    fn handle_input_rows(
        &mut self,
        key: &String,
        rows: Vec<String>,
        handle: &mut StatefulProcessorHandle<String>,
    ) -> Result<Vec<(String, Vec<String>)>> {
        let buffer = self.buffer.as_ref().expect("declared in init");
        if !buffer.exists(key)? {
            handle.register_timer(key, handle.batch().batch_timestamp_ms + 100)?;
        }
        buffer.append_list(key, &rows)?;
        Ok(Vec::new())
    }

    fn handle_expired_timer(
        &mut self,
        key: &String,
        _expiry_ms: i64,
        _handle: &mut StatefulProcessorHandle<String>,
    ) -> Result<Vec<(String, Vec<String>)>> {
        let buffer = self.buffer.as_ref().expect("declared in init");
        let rows = buffer.get(key)?;
        buffer.clear(key)?;
        Ok(vec![(key.clone(), rows)])
    }
}

#[test]
fn test_timers_fire_in_later_batch() {
    let dir = TempDir::new().unwrap();
    let provider = provider(&dir);
    let mut processor = Sessionizer::default();
    let user = "user".to_string();

    let first = run_batch(
        &provider,
        Version(0),
        TimeMode::ProcessingTime,
        BatchContext::new(0, 1_000),
        &mut processor,
        vec![(user.clone(), vec!["a".to_string(), "b".to_string()])],
    )
    .unwrap();
    assert!(first.outputs.is_empty());
    assert_eq!(first.num_timers_fired, 0);

    let second = run_batch(
        &provider,
        first.version,
        TimeMode::ProcessingTime,
        BatchContext::new(1, 1_050),
        &mut processor,
        vec![(user.clone(), vec!["c".to_string()])],
    )
    .unwrap();
    assert!(second.outputs.is_empty());

    let third = run_batch(
        &provider,
        second.version,
        TimeMode::ProcessingTime,
        BatchContext::new(2, 1_101),
        &mut processor,
        Vec::new(),
    )
    .unwrap();
    assert_eq!(third.num_timers_fired, 1);
    assert_eq!(
        third.outputs,
        vec![(user.clone(), vec!["a".to_string(), "b".to_string(), "c".to_string()])]
    );

    let read = provider.get_read_store(third.version).unwrap();
    assert!(read.iterator("buffer").unwrap().is_empty());
    assert!(read.iterator("$procTimers_timestampToKey").unwrap().is_empty());
}
