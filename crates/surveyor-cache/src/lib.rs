// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

//! Query result cache for surveyor discovery adapters.
//!
//! Every adapter answer (an item, a set of items, or a typed query error) is
//! cachable with a bounded TTL. The cache provides:
//!
//! - a multi-key lookup model: queries are identified by an SST triple
//!   (source, scope, type) plus method, query string and unique attribute
//!   value, with unset fields acting as wildcards ([`CacheKey`]),
//! - at-most-one-concurrent-fetch semantics per key: concurrent callers of
//!   the same key coalesce onto a single in-flight upstream call,
//! - two interchangeable backends behind one contract: the in-memory
//!   ordered-index [`MemoryBackend`] and the disk-backed
//!   [`PersistentBackend`],
//! - a background purger that wakes for the next entry to expire,
//! - disk-full recovery for the persistent backend.
//!
//! The usual flow for an adapter:
//!
//! ```ignore
//! match cache.lookup(name, method, scope, item_type, query, false).await? {
//!     CacheResult::Hit { items, .. } => return Ok(items),
//!     CacheResult::ErrorHit { error, .. } => return Err(error),
//!     CacheResult::Miss { key, work } => {
//!         // Fetch upstream; `work` (when present) keeps concurrent callers
//!         // parked until a result is stored or the guard is dropped.
//!         match upstream_fetch().await {
//!             Ok(item) => cache.store_item(item.clone(), ttl, &key)?,
//!             Err(error) => cache.store_error(error.clone(), ttl, &key)?,
//!         }
//!     }
//! }
//! ```

mod cache;
mod entry;
mod error;
mod key;
mod memory;
mod metrics;
mod parameters;
mod pending;
mod persistent;
mod purger;

#[cfg(test)]
mod tests;

pub use cache::{
    Backend, Cache, CacheResult, CachedData, MemoryCache, PersistentCache, PurgeStats,
};
pub use entry::{CachedPayload, CachedResult, MIN_TTL};
pub use error::CacheError;
pub use key::{CacheKey, IndexValues, Sst};
pub use memory::MemoryBackend;
pub use metrics::CacheMetrics;
pub use parameters::CacheParameters;
pub use pending::WorkGuard;
pub use persistent::PersistentBackend;
