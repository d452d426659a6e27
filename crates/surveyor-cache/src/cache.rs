// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use std::{
    marker::PhantomData,
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use prometheus::Registry;
use serde::{de::DeserializeOwned, Serialize};
use surveyor_types::{Item, QueryError, QueryMethod};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    entry::{epoch_nanos, floor_ttl, CachedPayload, CachedResult},
    error::CacheError,
    key::CacheKey,
    memory::MemoryBackend,
    metrics::CacheMetrics,
    parameters::CacheParameters,
    pending::{PendingWork, WorkGuard},
    persistent::PersistentBackend,
    purger::{Purger, PurgerHandle},
};

/// Data found in the cache for a key: a set of items, or the typed error the
/// upstream produced last time.
#[derive(Clone, Debug)]
pub enum CachedData<I> {
    Items(Vec<I>),
    Error(QueryError),
}

/// Statistics of one purge run.
#[derive(Clone, Debug)]
pub struct PurgeStats {
    pub num_purged: u64,
    pub duration: Duration,
    /// Expiry of the earliest surviving entry, if any. The purger schedules
    /// its next wake-up from this.
    pub next_expiry: Option<SystemTime>,
}

/// Storage contract shared by the memory and persistent backends. The
/// lookup protocol, pending-work coalescing and purger scheduling live on
/// [`Cache`]; only storage differs between backends.
pub trait Backend<I>: Send + Sync + 'static {
    /// Returns everything stored under keys matching `key`, or `None` for a
    /// cache miss. Expired entries are invisible; a stored error shadows
    /// stored items.
    fn search(&self, key: &CacheKey) -> Result<Option<CachedData<I>>, CacheError>;

    /// Inserts a result, replacing any entry with the same identity. The
    /// primary and expiry indexes are updated atomically.
    fn store(&self, result: CachedResult<I>) -> Result<(), CacheError>;

    /// Removes every entry matching `key`, expired or not.
    fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;

    /// Drops all entries in all SST buckets.
    fn clear(&self) -> Result<(), CacheError>;

    /// Removes entries whose expiry is strictly before `before`.
    fn purge(&self, before: SystemTime) -> Result<PurgeStats, CacheError>;
}

/// The outcome of a [`Cache::lookup`].
#[derive(Debug)]
pub enum CacheResult<I> {
    /// The cache answered with items.
    Hit { key: CacheKey, items: Vec<I> },
    /// The cache answered with the error the upstream produced last time.
    ErrorHit { key: CacheKey, error: QueryError },
    /// Nothing cached. When `work` is present this caller owns the upstream
    /// fetch: it must end with [`Cache::store_item`], [`Cache::store_error`]
    /// or by dropping the guard (which cancels and wakes any waiters).
    Miss {
        key: CacheKey,
        work: Option<WorkGuard>,
    },
}

pub(crate) struct CacheInner<I, B> {
    pub(crate) backend: B,
    pub(crate) pending: Arc<PendingWork>,
    pub(crate) metrics: Arc<CacheMetrics>,
    pub(crate) parameters: CacheParameters,
    /// Earliest upcoming expiry hinted by writers; `u64::MAX` when none.
    /// The purger consumes hints to advance its timer.
    pub(crate) expiry_hint: watch::Sender<u64>,
    purger: Mutex<Option<PurgerHandle>>,
    _marker: PhantomData<fn() -> I>,
}

impl<I, B: Backend<I>> CacheInner<I, B> {
    pub(crate) fn purge_with_metrics(&self, before: SystemTime) -> Result<PurgeStats, CacheError> {
        let stats = self.backend.purge(before)?;
        self.metrics.purged_entries.inc_by(stats.num_purged);
        self.metrics
            .purge_duration
            .observe(stats.duration.as_secs_f64());
        debug!(
            num_purged = stats.num_purged,
            next_expiry = ?stats.next_expiry,
            "purged expired entries"
        );
        Ok(stats)
    }
}

/// A query result cache.
///
/// Every answer an adapter produces (an item, a set of items, or a typed
/// error) is cachable with a bounded TTL, so repeated queries from the
/// request graph do not stampede upstream APIs, and concurrent callers
/// waiting for the same upstream call coalesce into a single in-flight
/// fetch. All methods are thread-safe; clones share the same cache.
pub struct Cache<I, B> {
    inner: Arc<CacheInner<I, B>>,
}

impl<I, B> Clone for Cache<I, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Cache over the in-process ordered-index backend.
pub type MemoryCache<I> = Cache<I, MemoryBackend<I>>;

/// Cache persisted in a single file on disk.
pub type PersistentCache<I> = Cache<I, PersistentBackend<I>>;

impl<I: Item> MemoryCache<I> {
    pub fn new_memory(parameters: CacheParameters, registry: &Registry) -> Self {
        let metrics = CacheMetrics::new(registry);
        Self::from_parts(MemoryBackend::new(), parameters, metrics)
    }
}

impl<I> PersistentCache<I>
where
    I: Item + Serialize + DeserializeOwned,
{
    pub fn open_persistent(
        parameters: CacheParameters,
        registry: &Registry,
    ) -> Result<Self, CacheError> {
        let metrics = CacheMetrics::new(registry);
        let backend = PersistentBackend::open(&parameters, metrics.clone())?;
        Ok(Self::from_parts(backend, parameters, metrics))
    }

    /// Closes the database and deletes the cache file. The cache stays
    /// usable as an object; operations report [`CacheError::Destroyed`].
    pub fn close_and_destroy(&self) -> Result<(), CacheError> {
        self.inner.backend.close_and_destroy()
    }

    /// Bytes deleted since the last compaction.
    pub fn deleted_bytes(&self) -> u64 {
        self.inner.backend.deleted_bytes()
    }
}

impl<I: Item, B: Backend<I>> Cache<I, B> {
    fn from_parts(backend: B, parameters: CacheParameters, metrics: Arc<CacheMetrics>) -> Self {
        let (expiry_hint, _) = watch::channel(u64::MAX);
        Self {
            inner: Arc::new(CacheInner {
                backend,
                pending: Arc::new(PendingWork::new()),
                metrics,
                parameters,
                expiry_hint,
                purger: Mutex::new(None),
                _marker: PhantomData,
            }),
        }
    }

    /// Looks up the cached answer for a query.
    ///
    /// On a miss with no fetch in flight, the returned [`CacheResult::Miss`]
    /// carries a [`WorkGuard`]: this caller owns the upstream fetch and all
    /// concurrent lookups of the same key block until it stores a result or
    /// drops the guard. On a miss while a fetch is in flight, this call
    /// waits for the producer, then re-reads the cache. Dropping the future
    /// while waiting detaches this caller without affecting the producer.
    pub async fn lookup(
        &self,
        source_name: &str,
        method: QueryMethod,
        scope: &str,
        item_type: &str,
        query: &str,
        ignore_cache: bool,
    ) -> Result<CacheResult<I>, CacheError> {
        let key = CacheKey::for_query(source_name, method, scope, item_type, query);
        if ignore_cache {
            debug!(key = %key, ignore_cache, "lookup bypassing cache");
            self.inner.metrics.cache_misses.inc();
            return Ok(CacheResult::Miss { key, work: None });
        }

        if let Some(found) = self.search_checked(&key, method)? {
            return Ok(self.hit(key, found));
        }

        let key_string = key.to_string();
        let (should_work, entry) = self.inner.pending.start_work(key_string.clone());
        if should_work {
            debug!(key = %key_string, "cache miss, caller owns the upstream fetch");
            self.inner.metrics.cache_misses.inc();
            let work = WorkGuard::new(self.inner.pending.clone(), key_string, entry);
            return Ok(CacheResult::Miss {
                key,
                work: Some(work),
            });
        }

        debug!(key = %key_string, "cache miss, waiting for the in-flight fetch");
        if !self.inner.pending.wait(&entry).await {
            debug!(key = %key_string, "in-flight fetch was cancelled");
            self.inner.metrics.cache_misses.inc();
            return Ok(CacheResult::Miss { key, work: None });
        }
        match self.search_checked(&key, method)? {
            Some(found) => Ok(self.hit(key, found)),
            None => {
                // The producer completed without storing anything.
                debug!(key = %key_string, "nothing stored by the in-flight fetch");
                self.inner.metrics.cache_misses.inc();
                Ok(CacheResult::Miss { key, work: None })
            }
        }
    }

    /// Stores an item under `key` and completes its pending work, waking
    /// waiters. `ttl` is floored at [`MIN_TTL`](crate::MIN_TTL).
    pub fn store_item(&self, item: I, ttl: Duration, key: &CacheKey) -> Result<(), CacheError> {
        let ttl = floor_ttl(ttl);
        let expiry_nanos = epoch_nanos(SystemTime::now() + ttl);
        let mut index_values = key.to_index_values();
        // The unique-attribute projection is stored regardless of write
        // method, so later GETs can address items discovered by LIST or
        // SEARCH.
        index_values.unique_attribute_value = item.unique_attribute_value();
        let globally_unique_name = item.globally_unique_name();
        debug!(key = %key, ttl = ?ttl, name = %globally_unique_name, "storing item");

        let result = self.inner.backend.store(CachedResult {
            expiry_nanos,
            index_values,
            globally_unique_name,
            payload: CachedPayload::Item(item),
        });
        // Complete strictly after the write: waiters woken here re-read the
        // cache and must observe it.
        self.inner.pending.complete(&key.to_string());
        self.inner.metrics.stored_items.inc();
        self.note_expiry(expiry_nanos);
        result
    }

    /// Stores a query error under `key` and completes its pending work.
    /// `NotFound` and `NoScope` answers are worth caching for a long time;
    /// transient errors are the caller's judgement call.
    pub fn store_error(
        &self,
        error: QueryError,
        ttl: Duration,
        key: &CacheKey,
    ) -> Result<(), CacheError> {
        let ttl = floor_ttl(ttl);
        let expiry_nanos = epoch_nanos(SystemTime::now() + ttl);
        debug!(key = %key, ttl = ?ttl, error = %error, "storing error");

        let result = self.inner.backend.store(CachedResult {
            expiry_nanos,
            index_values: key.to_index_values(),
            globally_unique_name: String::new(),
            payload: CachedPayload::Error(error),
        });
        self.inner.pending.complete(&key.to_string());
        self.inner.metrics.stored_errors.inc();
        self.note_expiry(expiry_nanos);
        result
    }

    /// Cancels the pending work for `key` without storing anything. Current
    /// waiters report a miss and fall back to their own fetches; future
    /// lookups start fresh.
    pub fn cancel_pending_work(&self, key: &CacheKey) {
        self.inner.pending.cancel(&key.to_string());
    }

    /// Raw backend search, without the GET duplicate handling of `lookup`
    /// and without touching pending work.
    pub fn search(&self, key: &CacheKey) -> Result<Option<CachedData<I>>, CacheError> {
        self.inner.backend.search(key)
    }

    pub fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        debug!(key = %key, "deleting entries");
        self.inner.backend.delete(key)
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        debug!("clearing cache");
        self.inner.backend.clear()?;
        self.inner.expiry_hint.send_replace(u64::MAX);
        Ok(())
    }

    /// Removes entries whose expiry is strictly before `before`.
    pub fn purge(&self, before: SystemTime) -> Result<PurgeStats, CacheError> {
        self.inner.purge_with_metrics(before)
    }

    /// Starts the background purger. Only one purger runs per cache
    /// instance; repeated starts are no-ops. Must be called from within a
    /// tokio runtime; the purger runs until [`stop_purger`](Self::stop_purger)
    /// or runtime shutdown.
    pub fn start_purger(&self) {
        let mut slot = self.inner.purger.lock();
        if slot.is_some() {
            return;
        }
        *slot = Some(Purger::start(Arc::clone(&self.inner)));
    }

    /// Stops the background purger and waits for it to exit.
    pub async fn stop_purger(&self) {
        let handle = self.inner.purger.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub fn min_wait_time(&self) -> Duration {
        self.inner.parameters.min_wait_time
    }

    fn hit(&self, key: CacheKey, found: CachedData<I>) -> CacheResult<I> {
        self.inner.metrics.cache_hits.inc();
        match found {
            CachedData::Items(items) => {
                debug!(key = %key, hit = true, num_items = items.len(), "cache hit");
                CacheResult::Hit { key, items }
            }
            CachedData::Error(error) => {
                debug!(key = %key, hit = true, error = %error, "cache hit, stored error");
                CacheResult::ErrorHit { key, error }
            }
        }
    }

    /// Backend search plus the defensive GET rule: a GET addresses at most
    /// one item, so two or more matches mean the index is unusable for this
    /// key. The key is deleted and the lookup treated as a miss, with the
    /// occurrence counted so adapter bugs stay visible.
    fn search_checked(
        &self,
        key: &CacheKey,
        method: QueryMethod,
    ) -> Result<Option<CachedData<I>>, CacheError> {
        match self.inner.backend.search(key)? {
            Some(CachedData::Items(items)) if method == QueryMethod::Get && items.len() > 1 => {
                warn!(key = %key, num_items = items.len(), "GET matched multiple items, deleting key");
                self.inner.metrics.duplicate_get_deletes.inc();
                self.inner.backend.delete(key)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn note_expiry(&self, expiry_nanos: u64) {
        self.inner.expiry_hint.send_if_modified(|current| {
            if expiry_nanos < *current {
                *current = expiry_nanos;
                true
            } else {
                false
            }
        });
    }
}
