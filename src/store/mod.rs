//! Versioned state store.
//!
//! Version N of a store is version N-1 plus changelog file N. Each version
//! directory entry consists of:
//! - `N.changelog`: every mutation made while building version N
//! - `N.meta`: changelog format, codec and column families of version N
//! - `N.snapshot` (optional): a full image of version N
//!
//! A [`StateStoreProvider`] owns one store directory, replays changelogs on
//! top of the nearest snapshot or cached version, and hands out writable
//! [`StateStore`]s and read-only [`ReadStateStore`]s.

mod engine;
mod metadata;
mod provider;
mod snapshot;
mod state_store;

pub use engine::KeyValue;
pub use provider::{StateStoreConf, StateStoreProvider};
pub use state_store::{ReadStateStore, StateStore};
