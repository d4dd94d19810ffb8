//! # State Store
//!
//! A versioned, TTL-aware key-value state store for stateful stream
//! operators.
//!
//! ## Core Concepts
//!
//! - **Versions**: Every batch commits a new immutable version; version N is
//!   version N-1 plus changelog file N
//! - **Changelog**: Binary write-ahead log of put/delete/merge records in two
//!   wire formats (V1, V2)
//! - **Column families**: Named sub-stores holding one state variable each
//! - **State variables**: Typed value, list and map state with optional TTL
//! - **Handle**: Lifecycle-checked access to state variables and timers
//!
//! ## Example
//!
//! ```ignore
//! use statestore::{
//!     BatchContext, StateStoreConf, StateStoreId, StateStoreProvider,
//!     StateStoreProviderId, StatefulProcessorHandle, TimeMode, TtlConfig, Version,
//! };
//! use std::sync::Arc;
//!
//! let provider = StateStoreProvider::open(
//!     StateStoreProviderId::new(StateStoreId::new("./checkpoint/state", 0, 0), "run-1"),
//!     StateStoreConf::default(),
//! )?;
//!
//! let store = Arc::new(provider.get_store(Version(0))?);
//! let mut handle = StatefulProcessorHandle::<String>::new(
//!     Arc::clone(&store),
//!     TimeMode::ProcessingTime,
//!     BatchContext::new(0, 1_700_000_000_000),
//! )?;
//!
//! // Values expire 10 seconds after their last update
//! let count = handle.get_value_state::<u64>("count", Some(TtlConfig::from_millis(10_000)))?;
//! count.update(&"user-1".to_string(), &1)?;
//!
//! handle.do_ttl_cleanup()?;
//! let version = store.commit()?;
//! ```

pub mod changelog;
pub mod checkpoint;
pub mod encoding;
pub mod error;
pub mod handle;
pub mod processor;
pub mod state;
pub mod store;
pub mod types;

// Re-exports
pub use changelog::{
    create_writer, open_reader, ChangelogFormat, ChangelogReader, ChangelogRecord,
    ChangelogWriter, RecordType,
};
pub use checkpoint::{CheckpointFileManager, CompressionCodec, LocalCheckpointFileManager};
pub use encoding::StateTypeEncoder;
pub use error::{Result, StoreError};
pub use handle::{HandleMetrics, HandleState, StatefulProcessorHandle};
pub use processor::{run_batch, BatchOutput, StatefulProcessor};
pub use state::{ListState, MapState, TtlCleanable, ValueState};
pub use store::{KeyValue, ReadStateStore, StateStore, StateStoreConf, StateStoreProvider};
pub use types::*;
