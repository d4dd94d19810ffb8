//! User-defined stateful logic and the driver running it over one batch.

use crate::error::Result;
use crate::handle::{HandleState, StatefulProcessorHandle};
use crate::store::StateStoreProvider;
use crate::types::{BatchContext, TimeMode, Version};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Arbitrary stateful logic over keyed input rows.
///
/// `init` runs first in every batch and is the only place state variables
/// may be declared; they should be kept in `self` for the handlers.
pub trait StatefulProcessor<K, I, O> {
    fn init(&mut self, handle: &mut StatefulProcessorHandle<K>) -> Result<()>;

    /// Handle all rows of one grouping key.
    fn handle_input_rows(
        &mut self,
        key: &K,
        rows: Vec<I>,
        handle: &mut StatefulProcessorHandle<K>,
    ) -> Result<Vec<O>>;

    /// Handle one timer of `key` that fired.
    fn handle_expired_timer(
        &mut self,
        _key: &K,
        _expiry_ms: i64,
        _handle: &mut StatefulProcessorHandle<K>,
    ) -> Result<Vec<O>> {
        Ok(Vec::new())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Result of one committed batch.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchOutput<O> {
    pub version: Version,
    pub outputs: Vec<O>,
    pub num_timers_fired: u64,
    pub num_expired_removed: u64,
}

/// Run `processor` over `inputs` on top of `version` and commit the result
/// as `version + 1`. On error the store is aborted and nothing is committed.
pub fn run_batch<K, I, O, P>(
    provider: &StateStoreProvider,
    version: Version,
    time_mode: TimeMode,
    batch: BatchContext,
    processor: &mut P,
    inputs: Vec<(K, Vec<I>)>,
) -> Result<BatchOutput<O>>
where
    K: Serialize + DeserializeOwned + 'static,
    P: StatefulProcessor<K, I, O>,
{
    let store = Arc::new(provider.get_store(version)?);
    let result = StatefulProcessorHandle::new(Arc::clone(&store), time_mode, batch)
        .and_then(|mut handle| drive(&mut handle, processor, inputs));

    match result {
        Ok((outputs, num_timers_fired, num_expired_removed)) => {
            let version = store.commit()?;
            info!(
                batch_id = batch.batch_id,
                version = version.0,
                outputs = outputs.len(),
                num_timers_fired,
                num_expired_removed,
                "Completed batch"
            );
            Ok(BatchOutput {
                version,
                outputs,
                num_timers_fired,
                num_expired_removed,
            })
        }
        Err(e) => {
            warn!(batch_id = batch.batch_id, error = %e, "Batch failed, aborting state store");
            store.abort();
            Err(e)
        }
    }
}

fn drive<K, I, O, P>(
    handle: &mut StatefulProcessorHandle<K>,
    processor: &mut P,
    inputs: Vec<(K, Vec<I>)>,
) -> Result<(Vec<O>, u64, u64)>
where
    K: Serialize + DeserializeOwned + 'static,
    P: StatefulProcessor<K, I, O>,
{
    processor.init(handle)?;
    handle.set_handle_state(HandleState::Initialized)?;

    let mut outputs = Vec::new();
    for (key, rows) in inputs {
        outputs.extend(processor.handle_input_rows(&key, rows, handle)?);
    }
    handle.set_handle_state(HandleState::DataProcessed)?;

    let threshold_ms = match handle.time_mode() {
        TimeMode::NoTime => None,
        TimeMode::ProcessingTime => Some(handle.batch().batch_timestamp_ms),
        TimeMode::EventTime => handle.batch().watermark_ms,
    };
    let mut num_timers_fired = 0;
    if let Some(threshold_ms) = threshold_ms {
        for (key, expiry_ms) in handle.get_expired_timers(threshold_ms)? {
            outputs.extend(processor.handle_expired_timer(&key, expiry_ms, handle)?);
            handle.delete_timer(&key, expiry_ms)?;
            num_timers_fired += 1;
        }
    }
    handle.set_handle_state(HandleState::TimerProcessed)?;

    let num_expired_removed = handle.do_ttl_cleanup()?;
    processor.close()?;
    handle.close()?;
    Ok((outputs, num_timers_fired, num_expired_removed))
}
