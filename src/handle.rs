//! Lifecycle-checked access to state variables and timers for one batch.

use crate::error::{Result, StoreError};
use crate::state::timers::TimerState;
use crate::state::ttl::{min_expiry_family_name, ttl_family_name, TtlContext};
use crate::state::{ListState, MapState, TtlCleanable, ValueState};
use crate::store::StateStore;
use crate::types::{is_internal_col_family, BatchContext, TimeMode, TtlConfig};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Phase of a stateful processor within one batch. Phases only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandleState {
    /// State variables and their families may be declared.
    Created,
    /// `init` returned; timers may be registered.
    Initialized,
    /// Every input row of the batch was handled.
    DataProcessed,
    /// Every expired timer was handled.
    TimerProcessed,
    Closed,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Created => "CREATED",
            HandleState::Initialized => "INITIALIZED",
            HandleState::DataProcessed => "DATA_PROCESSED",
            HandleState::TimerProcessed => "TIMER_PROCESSED",
            HandleState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandleMetrics {
    /// Values, list elements and map entries removed by TTL sweeps.
    pub num_expired_removed: u64,
    pub num_ttl_states: u64,
    pub num_registered_timers: u64,
    pub num_deleted_timers: u64,
}

/// Gives a stateful processor its state variables and timers, enforcing
/// which operation is legal in which [`HandleState`].
///
/// Every operation takes the grouping key explicitly.
pub struct StatefulProcessorHandle<K> {
    store: Arc<StateStore>,
    time_mode: TimeMode,
    batch: BatchContext,
    state: HandleState,
    ttl_states: Vec<Arc<dyn TtlCleanable>>,
    timers: Option<TimerState<K>>,
    metrics: HandleMetrics,
}

impl<K> StatefulProcessorHandle<K>
where
    K: Serialize + DeserializeOwned + 'static,
{
    pub fn new(store: Arc<StateStore>, time_mode: TimeMode, batch: BatchContext) -> Result<Self> {
        let timers = match time_mode {
            TimeMode::NoTime => None,
            _ => Some(TimerState::new(Arc::clone(&store), time_mode)?),
        };
        Ok(Self {
            store,
            time_mode,
            batch,
            state: HandleState::Created,
            ttl_states: Vec::new(),
            timers,
            metrics: HandleMetrics::default(),
        })
    }

    pub fn handle_state(&self) -> HandleState {
        self.state
    }

    pub fn time_mode(&self) -> TimeMode {
        self.time_mode
    }

    pub fn batch(&self) -> &BatchContext {
        &self.batch
    }

    pub fn metrics(&self) -> &HandleMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Move to `new_state`. Staying in the current state is allowed.
    pub fn set_handle_state(&mut self, new_state: HandleState) -> Result<()> {
        if new_state < self.state {
            return Err(StoreError::InvalidHandleTransition {
                from: self.state.to_string(),
                to: new_state.to_string(),
            });
        }
        if new_state != self.state {
            debug!(from = %self.state, to = %new_state, "Handle state transition");
            self.state = new_state;
        }
        Ok(())
    }

    fn verify_state(&self, operation: &str, allowed: bool) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(StoreError::InvalidHandleState {
                operation: operation.to_string(),
                state: self.state.to_string(),
            })
        }
    }

    fn verify_state_creation(&self, operation: &str, state_name: &str) -> Result<()> {
        self.verify_state(operation, self.state == HandleState::Created)?;
        if is_internal_col_family(state_name) {
            return Err(StoreError::ReservedColumnFamily(state_name.to_string()));
        }
        Ok(())
    }

    fn ttl_context(&self, state_name: &str, ttl: Option<TtlConfig>) -> Result<Option<TtlContext>> {
        let ttl = match ttl {
            Some(ttl) => ttl,
            None => return Ok(None),
        };
        if self.time_mode == TimeMode::EventTime {
            return Err(StoreError::InvalidTtlConfig {
                state: state_name.to_string(),
                detail: "TTL is not supported with event time".to_string(),
            });
        }
        let duration_ms = ttl.duration_ms();
        if duration_ms <= 0 {
            return Err(StoreError::InvalidTtlConfig {
                state: state_name.to_string(),
                detail: "TTL duration must be positive".to_string(),
            });
        }
        Ok(Some(TtlContext {
            duration_ms,
            batch_timestamp_ms: self.batch.batch_timestamp_ms,
        }))
    }

    fn register_ttl_state(&mut self, state: Arc<dyn TtlCleanable>) {
        debug!(state = %state.state_name(), "Registered state for TTL cleanup");
        self.ttl_states.push(state);
        self.metrics.num_ttl_states = self.ttl_states.len() as u64;
    }

    pub fn get_value_state<V>(
        &mut self,
        state_name: &str,
        ttl: Option<TtlConfig>,
    ) -> Result<ValueState<K, V>>
    where
        V: Serialize + DeserializeOwned + 'static,
    {
        self.verify_state_creation("getValueState", state_name)?;
        let ttl = self.ttl_context(state_name, ttl)?;
        let state = ValueState::new(Arc::clone(&self.store), state_name, ttl)?;
        if ttl.is_some() {
            self.register_ttl_state(Arc::new(state.clone()));
        }
        Ok(state)
    }

    pub fn get_list_state<V>(
        &mut self,
        state_name: &str,
        ttl: Option<TtlConfig>,
    ) -> Result<ListState<K, V>>
    where
        V: Serialize + DeserializeOwned + 'static,
    {
        self.verify_state_creation("getListState", state_name)?;
        let ttl = self.ttl_context(state_name, ttl)?;
        let state = ListState::new(Arc::clone(&self.store), state_name, ttl)?;
        if ttl.is_some() {
            self.register_ttl_state(Arc::new(state.clone()));
        }
        Ok(state)
    }

    pub fn get_map_state<UK, V>(
        &mut self,
        state_name: &str,
        ttl: Option<TtlConfig>,
    ) -> Result<MapState<K, UK, V>>
    where
        UK: Serialize + DeserializeOwned + 'static,
        V: Serialize + DeserializeOwned + 'static,
    {
        self.verify_state_creation("getMapState", state_name)?;
        let ttl = self.ttl_context(state_name, ttl)?;
        let state = MapState::new(Arc::clone(&self.store), state_name, ttl)?;
        if ttl.is_some() {
            self.register_ttl_state(Arc::new(state.clone()));
        }
        Ok(state)
    }

    /// Drop a state variable and its internal families if present.
    pub fn delete_if_exists(&mut self, state_name: &str) -> Result<bool> {
        self.verify_state_creation("deleteIfExists", state_name)?;
        let removed = self.store.remove_column_family(state_name)?;
        for internal in [ttl_family_name(state_name), min_expiry_family_name(state_name)] {
            self.store.remove_column_family(&internal)?;
        }
        self.ttl_states.retain(|s| s.state_name() != state_name);
        self.metrics.num_ttl_states = self.ttl_states.len() as u64;
        if removed {
            info!(state = %state_name, "Deleted state variable");
        }
        Ok(removed)
    }

    fn timers(&self, operation: &str) -> Result<&TimerState<K>> {
        let timers = self
            .timers
            .as_ref()
            .ok_or_else(|| StoreError::TimersNotSupported(self.time_mode.to_string()))?;
        self.verify_state(
            operation,
            self.state >= HandleState::Initialized && self.state < HandleState::TimerProcessed,
        )?;
        Ok(timers)
    }

    pub fn register_timer(&mut self, key: &K, expiry_ms: i64) -> Result<()> {
        if self.timers("registerTimer")?.register(key, expiry_ms)? {
            self.metrics.num_registered_timers += 1;
        }
        Ok(())
    }

    pub fn delete_timer(&mut self, key: &K, expiry_ms: i64) -> Result<()> {
        if self.timers("deleteTimer")?.delete(key, expiry_ms)? {
            self.metrics.num_deleted_timers += 1;
        }
        Ok(())
    }

    /// Timers registered for `key`, earliest first.
    pub fn list_timers(&self, key: &K) -> Result<Vec<i64>> {
        self.timers("listTimers")?.list(key)
    }

    /// Timers of every key firing strictly before `threshold_ms`, in firing order.
    pub fn get_expired_timers(&self, threshold_ms: i64) -> Result<Vec<(K, i64)>> {
        self.timers
            .as_ref()
            .ok_or_else(|| StoreError::TimersNotSupported(self.time_mode.to_string()))?
            .expired(threshold_ms)
    }

    /// Sweep every TTL-enabled variable in declaration order.
    pub fn do_ttl_cleanup(&mut self) -> Result<u64> {
        self.verify_state("doTtlCleanup", self.state < HandleState::Closed)?;
        let mut removed = 0;
        for state in &self.ttl_states {
            let count = state.clear_expired_state()?;
            debug!(state = %state.state_name(), removed = count, "TTL sweep");
            removed += count;
        }
        self.metrics.num_expired_removed += removed;
        Ok(removed)
    }

    pub fn close(&mut self) -> Result<()> {
        self.set_handle_state(HandleState::Closed)
    }
}
