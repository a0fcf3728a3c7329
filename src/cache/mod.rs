//! Versioned response cache.
//!
//! This module provides the cache store used by the offline layer:
//! - Named namespaces tagged with a generation, evicted all-or-nothing
//! - Immutable response snapshots keyed by method + normalized URL
//! - Staleness decided at read time, never stored with the entry

mod key;
mod layer;
mod storage;
#[cfg(test)]
pub mod testing;
mod traits;

pub use key::RequestKey;
pub use layer::CacheLayer;
pub use storage::SqliteStorage;
pub use traits::{CacheEntry, CacheResult, CacheSource, CacheStorage, Namespace};
