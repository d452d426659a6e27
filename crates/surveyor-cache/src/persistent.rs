// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

//! Disk-resident cache backend.
//!
//! Entries live in a single-file embedded B-tree store with three tables:
//!
//! - `items`: `"{sst_hash}|{entry_key}"` -> serialized [`CachedResult`],
//! - `expiry`: `"{expiry_nanos_big_endian}|{sst_hash}|{entry_key}"` -> (),
//! - `meta`: the persisted `deleted_bytes` counter.
//!
//! The big-endian expiry prefix makes chronological iteration and byte-order
//! iteration the same thing. The store has its own single-writer discipline,
//! so every regular operation holds only the read side of the backend lock;
//! the write side is reserved for compaction, cache-file rebuild and
//! `close_and_destroy`, which replace the database object itself.

use std::{
    fs, io,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Instant, SystemTime},
};

use bincode::Options;
use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};
use serde::{de::DeserializeOwned, Serialize};
use surveyor_types::{Item, QueryError};
use tracing::{debug, error, info, warn};

use crate::{
    cache::{Backend, CachedData, PurgeStats},
    entry::{epoch_nanos, time_from_nanos, CachedPayload, CachedResult},
    error::CacheError,
    key::CacheKey,
    metrics::CacheMetrics,
    parameters::CacheParameters,
};

const ITEMS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("items");
const EXPIRY_TABLE: TableDefinition<&[u8], ()> = TableDefinition::new("expiry");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const DELETED_BYTES_KEY: &str = "deleted_bytes";

/// Length of the expiry-key prefix: 8 big-endian nanos bytes + `|`.
const EXPIRY_PREFIX_LEN: usize = 9;

fn be_fix_int_ser(nanos: u64) -> Vec<u8> {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .serialize(&nanos)
        .expect("serialization failed")
}

fn item_key(sst_hash: &str, entry_key: &str) -> Vec<u8> {
    format!("{sst_hash}|{entry_key}").into_bytes()
}

fn expiry_key(nanos: u64, sst_hash: &str, entry_key: &str) -> Vec<u8> {
    let mut key = be_fix_int_ser(nanos);
    key.push(b'|');
    key.extend_from_slice(sst_hash.as_bytes());
    key.push(b'|');
    key.extend_from_slice(entry_key.as_bytes());
    key
}

fn expiry_key_nanos(key: &[u8]) -> Option<u64> {
    let prefix = key.get(..8)?;
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .deserialize(prefix)
        .ok()
}

/// Reads the expiry out of a serialized value without deserializing the
/// payload; relies on `expiry_nanos` being the first field of
/// [`CachedResult`]'s layout.
fn value_expiry(bytes: &[u8]) -> Option<u64> {
    let prefix = bytes.get(..8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(prefix);
    Some(u64::from_le_bytes(buf))
}

fn is_no_space(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::StorageFull
}

fn from_storage(err: redb::StorageError) -> CacheError {
    if let redb::StorageError::Io(io) = &err {
        if is_no_space(io) {
            return CacheError::DiskFull;
        }
    }
    CacheError::storage(err)
}

fn from_transaction(err: redb::TransactionError) -> CacheError {
    match err {
        redb::TransactionError::Storage(err) => from_storage(err),
        other => CacheError::storage(other),
    }
}

fn from_table(err: redb::TableError) -> CacheError {
    match err {
        TableError::Storage(err) => from_storage(err),
        other => CacheError::storage(other),
    }
}

fn from_commit(err: redb::CommitError) -> CacheError {
    match err {
        redb::CommitError::Storage(err) => from_storage(err),
        other => CacheError::storage(other),
    }
}

fn from_database(err: redb::DatabaseError) -> CacheError {
    match err {
        redb::DatabaseError::Storage(err) => from_storage(err),
        other => CacheError::storage(other),
    }
}

fn from_compaction(err: redb::CompactionError) -> CacheError {
    match err {
        redb::CompactionError::Storage(err) => from_storage(err),
        other => CacheError::storage(other),
    }
}

/// A prepared write, kept in byte form so the disk-full recovery path can
/// retry it without re-serializing.
struct WritePlan {
    item_key: Vec<u8>,
    expiry_key: Vec<u8>,
    value: Vec<u8>,
    sst_hash: String,
    entry_key: String,
}

struct PersistentInner {
    /// `None` after `close_and_destroy` or a failed rebuild; every operation
    /// then reports [`CacheError::Destroyed`].
    db: RwLock<Option<Database>>,
    path: PathBuf,
    /// Bytes turned into garbage since the last compaction. Persisted in the
    /// meta table; monotonically non-decreasing between compactions.
    deleted_bytes: Mutex<u64>,
    compact_threshold: u64,
    metrics: Arc<CacheMetrics>,
}

impl PersistentInner {
    /// Opens (or creates) the cache file, creates the tables, and loads the
    /// persisted `deleted_bytes` counter.
    fn open_database(path: &Path) -> Result<(Database, u64), CacheError> {
        let db = Database::create(path).map_err(from_database)?;
        let txn = db.begin_write().map_err(from_transaction)?;
        let deleted_bytes = {
            txn.open_table(ITEMS_TABLE).map_err(from_table)?;
            txn.open_table(EXPIRY_TABLE).map_err(from_table)?;
            let meta = txn.open_table(META_TABLE).map_err(from_table)?;
            let value = meta
                .get(DELETED_BYTES_KEY)
                .map_err(from_storage)?
                .map(|guard| guard.value())
                .unwrap_or(0);
            value
        };
        txn.commit().map_err(from_commit)?;
        Ok((db, deleted_bytes))
    }

    fn apply_write(&self, plan: &WritePlan) -> Result<(), CacheError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(CacheError::Destroyed)?;
        Self::apply_write_in(db, plan, &self.deleted_bytes)
    }

    fn apply_write_in(
        db: &Database,
        plan: &WritePlan,
        deleted_bytes: &Mutex<u64>,
    ) -> Result<(), CacheError> {
        let txn = db.begin_write().map_err(from_transaction)?;
        let mut counter = deleted_bytes.lock();
        let mut freed = 0u64;
        {
            let mut items = txn.open_table(ITEMS_TABLE).map_err(from_table)?;
            let mut expiry = txn.open_table(EXPIRY_TABLE).map_err(from_table)?;

            // An overwritten live value must lose its expiry slot before the
            // new slot is written, or the purger would later delete the slot
            // the new value occupies.
            let stale = items
                .get(plan.item_key.as_slice())
                .map_err(from_storage)?
                .map(|guard| {
                    let value = guard.value();
                    (value_expiry(value), value.len() as u64)
                });
            if let Some((Some(old_nanos), old_len)) = stale {
                let old_expiry_key = expiry_key(old_nanos, &plan.sst_hash, &plan.entry_key);
                expiry
                    .remove(old_expiry_key.as_slice())
                    .map_err(from_storage)?;
                freed += old_len + old_expiry_key.len() as u64;
            }

            items
                .insert(plan.item_key.as_slice(), plan.value.as_slice())
                .map_err(from_storage)?;
            expiry
                .insert(plan.expiry_key.as_slice(), ())
                .map_err(from_storage)?;

            if freed > 0 {
                let mut meta = txn.open_table(META_TABLE).map_err(from_table)?;
                meta.insert(DELETED_BYTES_KEY, *counter + freed)
                    .map_err(from_storage)?;
            }
        }
        txn.commit().map_err(from_commit)?;
        *counter += freed;
        Ok(())
    }

    fn purge_in(
        db: &Database,
        before: SystemTime,
        deleted_bytes: &Mutex<u64>,
    ) -> Result<PurgeStats, CacheError> {
        let started = Instant::now();
        let cutoff = epoch_nanos(before);

        // Read-only scan: everything strictly before the cutoff is doomed;
        // the first survivor becomes the next scheduled wake-up.
        let mut doomed: Vec<Vec<u8>> = Vec::new();
        let mut next_expiry = None;
        {
            let txn = db.begin_read().map_err(from_transaction)?;
            let expiry = match txn.open_table(EXPIRY_TABLE) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => {
                    return Ok(PurgeStats {
                        num_purged: 0,
                        duration: started.elapsed(),
                        next_expiry: None,
                    })
                }
                Err(err) => return Err(from_table(err)),
            };
            for row in expiry.range::<&[u8]>(..).map_err(from_storage)? {
                let (key, _) = row.map_err(from_storage)?;
                let key = key.value();
                let Some(nanos) = expiry_key_nanos(key) else {
                    warn!("skipping malformed expiry key");
                    continue;
                };
                if nanos < cutoff {
                    doomed.push(key.to_vec());
                } else {
                    next_expiry = Some(time_from_nanos(nanos));
                    break;
                }
            }
        }

        if doomed.is_empty() {
            return Ok(PurgeStats {
                num_purged: 0,
                duration: started.elapsed(),
                next_expiry,
            });
        }

        // One write transaction deletes from both tables and persists the
        // updated deleted-bytes counter.
        let txn = db.begin_write().map_err(from_transaction)?;
        let mut counter = deleted_bytes.lock();
        let mut freed = 0u64;
        let mut num_purged = 0u64;
        {
            let mut items = txn.open_table(ITEMS_TABLE).map_err(from_table)?;
            let mut expiry = txn.open_table(EXPIRY_TABLE).map_err(from_table)?;
            for doomed_key in &doomed {
                // An entry overwritten since the scan has a fresh expiry
                // slot; its old slot is already gone and the entry is live.
                if expiry
                    .remove(doomed_key.as_slice())
                    .map_err(from_storage)?
                    .is_none()
                {
                    continue;
                }
                let item_key = &doomed_key[EXPIRY_PREFIX_LEN..];
                let value_len = items
                    .remove(item_key)
                    .map_err(from_storage)?
                    .map(|guard| guard.value().len() as u64)
                    .unwrap_or(0);
                freed += doomed_key.len() as u64 + item_key.len() as u64 + value_len;
                num_purged += 1;
            }
            let mut meta = txn.open_table(META_TABLE).map_err(from_table)?;
            meta.insert(DELETED_BYTES_KEY, *counter + freed)
                .map_err(from_storage)?;
        }
        txn.commit().map_err(from_commit)?;
        *counter += freed;

        Ok(PurgeStats {
            num_purged,
            duration: started.elapsed(),
            next_expiry,
        })
    }

    fn clear_in(db: &Database, deleted_bytes: &Mutex<u64>) -> Result<(), CacheError> {
        let txn = db.begin_write().map_err(from_transaction)?;
        let mut counter = deleted_bytes.lock();
        txn.delete_table(ITEMS_TABLE).map_err(from_table)?;
        txn.delete_table(EXPIRY_TABLE).map_err(from_table)?;
        txn.delete_table(META_TABLE).map_err(from_table)?;
        {
            txn.open_table(ITEMS_TABLE).map_err(from_table)?;
            txn.open_table(EXPIRY_TABLE).map_err(from_table)?;
            let mut meta = txn.open_table(META_TABLE).map_err(from_table)?;
            meta.insert(DELETED_BYTES_KEY, 0u64).map_err(from_storage)?;
        }
        txn.commit().map_err(from_commit)?;
        *counter = 0;
        Ok(())
    }

    /// First escalation step beyond the inline retry: under the exclusive
    /// lock, purge and retry; if the disk is still full, close the database,
    /// delete the cache file and start over empty. The pending write is
    /// abandoned in that case.
    fn recover_locked(&self, plan: WritePlan) {
        let mut slot = self.db.write();
        if let Some(db) = slot.as_ref() {
            if let Err(err) = Self::purge_in(db, SystemTime::now(), &self.deleted_bytes) {
                debug!("purge during locked disk-full recovery failed: {err}");
            }
            match Self::apply_write_in(db, &plan, &self.deleted_bytes) {
                Ok(()) => {
                    info!("cache write landed after locked purge");
                    return;
                }
                Err(CacheError::DiskFull) => {}
                Err(err) => {
                    warn!("cache write failed during locked recovery: {err}");
                    return;
                }
            }
        } else {
            return;
        }

        self.metrics.cache_rebuilds.inc();
        warn!(
            path = %self.path.display(),
            "rebuilding cache file after repeated disk-full failures"
        );
        *slot = None;
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("could not delete cache file: {err}");
        }
        match Self::open_database(&self.path) {
            Ok((db, deleted_bytes)) => {
                *slot = Some(db);
                *self.deleted_bytes.lock() = deleted_bytes;
                info!("cache file rebuilt empty");
            }
            Err(err) => {
                error!("could not reopen cache file, cache is now inert: {err}");
            }
        }
    }

    /// Offline rewrite of the cache file to reclaim the space held by
    /// deleted entries. Holds the exclusive lock for its whole duration.
    fn compact(&self) -> Result<(), CacheError> {
        let mut slot = self.db.write();
        let db = slot.as_mut().ok_or(CacheError::Destroyed)?;
        info!(path = %self.path.display(), "compacting cache file");
        match db.compact() {
            Ok(_) => {
                let txn = db.begin_write().map_err(from_transaction)?;
                {
                    let mut meta = txn.open_table(META_TABLE).map_err(from_table)?;
                    meta.insert(DELETED_BYTES_KEY, 0u64).map_err(from_storage)?;
                }
                txn.commit().map_err(from_commit)?;
                *self.deleted_bytes.lock() = 0;
                self.metrics.compactions.inc();
                Ok(())
            }
            Err(err) => {
                let err = from_compaction(err);
                if !matches!(err, CacheError::DiskFull) {
                    return Err(err);
                }
                // Disk-full mid-compaction: same terminal path as a failed
                // write, already under the exclusive lock.
                self.metrics.cache_rebuilds.inc();
                warn!(
                    path = %self.path.display(),
                    "rebuilding cache file after disk-full compaction"
                );
                *slot = None;
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!("could not delete cache file: {err}");
                }
                let (db, deleted_bytes) = Self::open_database(&self.path)?;
                *slot = Some(db);
                *self.deleted_bytes.lock() = deleted_bytes;
                Ok(())
            }
        }
    }

    fn recover_disk_full(self: Arc<Self>, plan: WritePlan) -> Result<(), CacheError> {
        self.metrics.disk_full_recoveries.inc();
        warn!(
            path = %self.path.display(),
            "cache write failed with a full disk; purging expired entries and retrying"
        );
        {
            let guard = self.db.read();
            let db = guard.as_ref().ok_or(CacheError::Destroyed)?;
            if let Err(err) = Self::purge_in(db, SystemTime::now(), &self.deleted_bytes) {
                debug!("inline purge during disk-full recovery failed: {err}");
            }
            match Self::apply_write_in(db, &plan, &self.deleted_bytes) {
                Err(CacheError::DiskFull) => {}
                other => return other,
            }
        }
        warn!("disk still full after purge; scheduling locked recovery");
        std::thread::spawn(move || self.recover_locked(plan));
        Ok(())
    }
}

/// Cache backend persisted in a single file.
pub struct PersistentBackend<I> {
    inner: Arc<PersistentInner>,
    _marker: PhantomData<fn() -> I>,
}

impl<I> PersistentBackend<I> {
    pub(crate) fn open(
        parameters: &CacheParameters,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self, CacheError> {
        let path = parameters
            .path
            .clone()
            .ok_or_else(|| CacheError::storage("persistent cache requires a file path"))?;
        let (db, deleted_bytes) = PersistentInner::open_database(&path)?;
        info!(path = %path.display(), deleted_bytes, "opened cache file");
        Ok(Self {
            inner: Arc::new(PersistentInner {
                db: RwLock::new(Some(db)),
                path,
                deleted_bytes: Mutex::new(deleted_bytes),
                compact_threshold: parameters.compact_threshold,
                metrics,
            }),
            _marker: PhantomData,
        })
    }

    /// Bytes deleted since the last compaction, as persisted in the meta
    /// table.
    pub fn deleted_bytes(&self) -> u64 {
        *self.inner.deleted_bytes.lock()
    }

    /// Closes the database and deletes the cache file. The cache object
    /// stays usable; every subsequent operation reports
    /// [`CacheError::Destroyed`].
    pub fn close_and_destroy(&self) -> Result<(), CacheError> {
        let mut slot = self.inner.db.write();
        if slot.take().is_none() {
            return Err(CacheError::Destroyed);
        }
        *self.inner.deleted_bytes.lock() = 0;
        info!(path = %self.inner.path.display(), "destroying cache file");
        fs::remove_file(&self.inner.path).map_err(CacheError::storage)
    }
}

impl<I> Backend<I> for PersistentBackend<I>
where
    I: Item + Serialize + DeserializeOwned,
{
    fn search(&self, key: &CacheKey) -> Result<Option<CachedData<I>>, CacheError> {
        let guard = self.inner.db.read();
        let db = guard.as_ref().ok_or(CacheError::Destroyed)?;

        let txn = db.begin_read().map_err(from_transaction)?;
        let items = match txn.open_table(ITEMS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(from_table(err)),
        };

        let now = epoch_nanos(SystemTime::now());
        let prefix = format!("{}|", key.sst.hash()).into_bytes();
        let mut found = Vec::new();
        let mut error: Option<QueryError> = None;
        for row in items
            .range::<&[u8]>(prefix.as_slice()..)
            .map_err(from_storage)?
        {
            let (raw_key, raw_value) = row.map_err(from_storage)?;
            if !raw_key.value().starts_with(&prefix) {
                break;
            }
            let entry: CachedResult<I> = match bcs::from_bytes(raw_value.value()) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping corrupt cache entry: {err}");
                    continue;
                }
            };
            if entry.is_expired_at(now) || !key.matches(&entry.index_values) {
                continue;
            }
            match entry.payload {
                CachedPayload::Item(item) => found.push(item),
                CachedPayload::Error(err) => error = Some(err),
            }
        }

        // An error shadows items under the same key.
        if let Some(error) = error {
            return Ok(Some(CachedData::Error(error)));
        }
        if found.is_empty() {
            Ok(None)
        } else {
            Ok(Some(CachedData::Items(found)))
        }
    }

    fn store(&self, result: CachedResult<I>) -> Result<(), CacheError> {
        let value = match bcs::to_bytes(&result) {
            Ok(value) => value,
            Err(err) => {
                // Re-fetching upstream later is cheaper than corrupting the
                // index with a half-written entry.
                debug!("dropping unserializable cache entry: {err}");
                return Ok(());
            }
        };
        let sst_hash = result.index_values.sst_hash.clone();
        let entry_key = result.entry_key();
        let plan = WritePlan {
            item_key: item_key(&sst_hash, &entry_key),
            expiry_key: expiry_key(result.expiry_nanos, &sst_hash, &entry_key),
            value,
            sst_hash,
            entry_key,
        };
        match self.inner.apply_write(&plan) {
            Err(CacheError::DiskFull) => Arc::clone(&self.inner).recover_disk_full(plan),
            other => other,
        }
    }

    fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let guard = self.inner.db.read();
        let db = guard.as_ref().ok_or(CacheError::Destroyed)?;

        let txn = db.begin_write().map_err(from_transaction)?;
        let mut counter = self.inner.deleted_bytes.lock();
        let mut freed = 0u64;
        {
            let mut items = txn.open_table(ITEMS_TABLE).map_err(from_table)?;
            let mut expiry = txn.open_table(EXPIRY_TABLE).map_err(from_table)?;

            let prefix = format!("{}|", key.sst.hash()).into_bytes();
            // Expiry is deliberately ignored: deletion must also clean up
            // entries that have expired but not yet been purged.
            let mut victims: Vec<(Vec<u8>, Vec<u8>, u64)> = Vec::new();
            for row in items
                .range::<&[u8]>(prefix.as_slice()..)
                .map_err(from_storage)?
            {
                let (raw_key, raw_value) = row.map_err(from_storage)?;
                if !raw_key.value().starts_with(&prefix) {
                    break;
                }
                let entry: CachedResult<I> = match bcs::from_bytes(raw_value.value()) {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!("skipping corrupt cache entry: {err}");
                        continue;
                    }
                };
                if !key.matches(&entry.index_values) {
                    continue;
                }
                victims.push((
                    raw_key.value().to_vec(),
                    expiry_key(entry.expiry_nanos, &key.sst.hash(), &entry.entry_key()),
                    raw_value.value().len() as u64,
                ));
            }

            for (victim_item_key, victim_expiry_key, value_len) in victims {
                items
                    .remove(victim_item_key.as_slice())
                    .map_err(from_storage)?;
                expiry
                    .remove(victim_expiry_key.as_slice())
                    .map_err(from_storage)?;
                freed += victim_item_key.len() as u64 + victim_expiry_key.len() as u64 + value_len;
            }
            if freed > 0 {
                let mut meta = txn.open_table(META_TABLE).map_err(from_table)?;
                meta.insert(DELETED_BYTES_KEY, *counter + freed)
                    .map_err(from_storage)?;
            }
        }
        txn.commit().map_err(from_commit)?;
        *counter += freed;
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        let guard = self.inner.db.read();
        let db = guard.as_ref().ok_or(CacheError::Destroyed)?;
        PersistentInner::clear_in(db, &self.inner.deleted_bytes)
    }

    fn purge(&self, before: SystemTime) -> Result<PurgeStats, CacheError> {
        let stats = {
            let guard = self.inner.db.read();
            let db = guard.as_ref().ok_or(CacheError::Destroyed)?;
            PersistentInner::purge_in(db, before, &self.inner.deleted_bytes)?
        };
        let deleted_bytes = *self.inner.deleted_bytes.lock();
        if deleted_bytes >= self.inner.compact_threshold {
            debug!(deleted_bytes, "deleted bytes over threshold, compacting");
            self.inner.compact()?;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use tempfile::TempDir;

    use super::PersistentBackend;
    use crate::{
        cache::{Backend, CachedData},
        entry::{epoch_nanos, CachedPayload, CachedResult},
        error::CacheError,
        key::CacheKey,
        metrics::test_metrics,
        parameters::CacheParameters,
        tests::TestItem,
    };
    use surveyor_types::{Item as _, QueryError, QueryErrorType, QueryMethod};

    fn parameters(dir: &TempDir) -> CacheParameters {
        CacheParameters {
            path: Some(dir.path().join("cache.redb")),
            ..Default::default()
        }
    }

    fn backend(dir: &TempDir) -> PersistentBackend<TestItem> {
        PersistentBackend::open(&parameters(dir), test_metrics()).unwrap()
    }

    fn stored(key: &CacheKey, item: TestItem, ttl: Duration) -> CachedResult<TestItem> {
        let mut index_values = key.to_index_values();
        index_values.unique_attribute_value = item.unique_attribute_value();
        CachedResult {
            expiry_nanos: epoch_nanos(SystemTime::now() + ttl),
            index_values,
            globally_unique_name: item.globally_unique_name(),
            payload: CachedPayload::Item(item),
        }
    }

    fn items(found: Option<CachedData<TestItem>>) -> Vec<TestItem> {
        match found {
            Some(CachedData::Items(items)) => items,
            other => panic!("expected items, got {other:?}"),
        }
    }

    #[test]
    fn store_and_search_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        backend
            .store(stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(10)))
            .unwrap();

        let found = items(backend.search(&key).unwrap());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].globally_unique_name(), "a");
    }

    #[test]
    fn reopening_picks_up_prior_contents() {
        let dir = TempDir::new().unwrap();
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        {
            let backend = backend(&dir);
            backend
                .store(stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(60)))
                .unwrap();
        }
        let backend: PersistentBackend<TestItem> = backend(&dir);
        let found = items(backend.search(&key).unwrap());
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn get_finds_entries_written_by_search() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let search_key = CacheKey::for_query("src", QueryMethod::Search, "scope", "type", "q");
        backend
            .store(stored(
                &search_key,
                TestItem::new("a", "attr-a"),
                Duration::from_secs(10),
            ))
            .unwrap();

        let get_key = CacheKey::for_query("src", QueryMethod::Get, "scope", "type", "attr-a");
        assert_eq!(items(backend.search(&get_key).unwrap()).len(), 1);
    }

    #[test]
    fn error_shadows_items() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        backend
            .store(stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(10)))
            .unwrap();
        let error = QueryError::new(QueryErrorType::NotFound, "gone", "scope", "src", "type");
        backend
            .store(CachedResult {
                expiry_nanos: epoch_nanos(SystemTime::now() + Duration::from_secs(10)),
                index_values: key.to_index_values(),
                globally_unique_name: String::new(),
                payload: CachedPayload::Error(error.clone()),
            })
            .unwrap();

        match backend.search(&key).unwrap() {
            Some(CachedData::Error(found)) => assert_eq!(found, error),
            other => panic!("expected cached error, got {other:?}"),
        }
    }

    #[test]
    fn overwrite_replaces_the_expiry_slot() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        backend
            .store(stored(&key, TestItem::new("a", "attr-1"), Duration::from_millis(150)))
            .unwrap();
        // Same identity, later expiry. The old expiry slot must be gone, so
        // a purge past the first expiry removes nothing.
        backend
            .store(stored(&key, TestItem::new("a", "attr-1"), Duration::from_secs(60)))
            .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        let stats = backend.purge(SystemTime::now()).unwrap();
        assert_eq!(stats.num_purged, 0);
        assert_eq!(items(backend.search(&key).unwrap()).len(), 1);
        // Overwriting counted the stale value as deleted bytes.
        assert!(backend.deleted_bytes() > 0);
    }

    #[test]
    fn purge_removes_only_expired_entries() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        backend
            .store(stored(&key, TestItem::new("soon", "attr-1"), Duration::ZERO))
            .unwrap();
        backend
            .store(stored(&key, TestItem::new("later", "attr-2"), Duration::from_secs(60)))
            .unwrap();

        std::thread::sleep(Duration::from_millis(150));
        let stats = backend.purge(SystemTime::now()).unwrap();
        assert_eq!(stats.num_purged, 1);
        assert!(stats.next_expiry.is_some());
        assert!(backend.deleted_bytes() > 0);

        let remaining = items(backend.search(&key).unwrap());
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].globally_unique_name(), "later");
    }

    #[test]
    fn delete_and_clear() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        backend
            .store(stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(10)))
            .unwrap();
        backend.delete(&key).unwrap();
        assert!(backend.search(&key).unwrap().is_none());

        backend
            .store(stored(&key, TestItem::new("b", "attr-b"), Duration::from_secs(10)))
            .unwrap();
        backend.clear().unwrap();
        assert!(backend.search(&key).unwrap().is_none());
        assert_eq!(backend.deleted_bytes(), 0);
    }

    #[test]
    fn destroyed_cache_reports_typed_errors() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        backend.close_and_destroy().unwrap();

        assert!(matches!(
            backend.search(&key),
            Err(CacheError::Destroyed)
        ));
        assert!(matches!(
            backend.store(stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(1))),
            Err(CacheError::Destroyed)
        ));
        assert!(matches!(
            backend.purge(SystemTime::now()),
            Err(CacheError::Destroyed)
        ));
        assert!(matches!(
            backend.close_and_destroy(),
            Err(CacheError::Destroyed)
        ));
    }
}
