//! Typed state variables stored in column families of a [`StateStore`].
//!
//! [`StateStore`]: crate::store::StateStore

mod list;
mod map;
pub(crate) mod timers;
pub(crate) mod ttl;
mod value;

pub use list::ListState;
pub use map::MapState;
pub use value::ValueState;

use crate::error::Result;

/// A state variable whose expired entries can be swept.
pub trait TtlCleanable: Send + Sync {
    fn state_name(&self) -> &str;

    /// Remove every entry that expired at or before the batch timestamp and
    /// return how many were removed.
    fn clear_expired_state(&self) -> Result<u64>;
}
