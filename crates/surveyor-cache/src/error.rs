// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// Cached query errors are not represented here: a stored
/// [`QueryError`](surveyor_types::QueryError) is data, returned as a cache
/// hit. `CacheError` covers failures of the cache machinery itself.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache file was closed and deleted via `close_and_destroy`; every
    /// subsequent operation reports this instead of panicking.
    #[error("cache has been destroyed")]
    Destroyed,

    /// The storage device reported it is out of space. Handled internally by
    /// the persistent backend's recovery path and only visible to callers
    /// when recovery itself fails.
    #[error("storage device is full")]
    DiskFull,

    /// The underlying key-value store failed.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl CacheError {
    pub(crate) fn storage(err: impl ToString) -> Self {
        CacheError::Storage(err.to_string())
    }
}
