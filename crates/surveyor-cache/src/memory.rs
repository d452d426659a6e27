// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Instant, SystemTime},
};

use parking_lot::RwLock;
use surveyor_types::{Item, QueryError};

use crate::{
    cache::{Backend, CachedData, PurgeStats},
    entry::{epoch_nanos, time_from_nanos, CachedPayload, CachedResult},
    error::CacheError,
    key::CacheKey,
};

/// Key of the global expiry index: `(expiry_nanos, sst_hash, entry_key)`.
/// The trailing entry key makes the ordering deterministic even for equal
/// expiries; without it, purging could delete a live entry that happened to
/// share an expiry instant with a dead one.
type ExpiryKey = (u64, String, String);

/// Ordered indexes over the entries of one SST bucket.
///
/// Every entry is present in all three maps simultaneously, keyed by the
/// index value it can be found under plus its entry key as tiebreaker, and
/// also in the backend's global expiry index.
struct IndexSet<I> {
    by_unique_attr: BTreeMap<(String, String), Arc<CachedResult<I>>>,
    by_method: BTreeMap<(String, String), Arc<CachedResult<I>>>,
    by_query: BTreeMap<(String, String), Arc<CachedResult<I>>>,
}

// Derived Default would require I: Default.
impl<I> Default for IndexSet<I> {
    fn default() -> Self {
        Self {
            by_unique_attr: BTreeMap::new(),
            by_method: BTreeMap::new(),
            by_query: BTreeMap::new(),
        }
    }
}

impl<I> IndexSet<I> {
    /// Collects candidates through the most specific index the key allows:
    /// unique attribute > query > method > full scan. Candidates still need
    /// the full match check; an index narrows by one field only.
    fn scan(&self, key: &CacheKey) -> Vec<Arc<CachedResult<I>>> {
        if let Some(unique_attribute_value) = &key.unique_attribute_value {
            Self::scan_from_pivot(&self.by_unique_attr, unique_attribute_value)
        } else if let Some(query) = &key.query {
            Self::scan_from_pivot(&self.by_query, query)
        } else if let Some(method) = key.method {
            Self::scan_from_pivot(&self.by_method, method.as_str())
        } else {
            self.by_unique_attr.values().cloned().collect()
        }
    }

    /// Iterates ascending from `(value, "")` while the index value matches.
    fn scan_from_pivot(
        index: &BTreeMap<(String, String), Arc<CachedResult<I>>>,
        value: &str,
    ) -> Vec<Arc<CachedResult<I>>> {
        index
            .range((value.to_owned(), String::new())..)
            .take_while(|((indexed, _), _)| indexed == value)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    fn insert(&mut self, entry_key: &str, entry: Arc<CachedResult<I>>) -> Option<Arc<CachedResult<I>>> {
        let values = &entry.index_values;
        let previous = self.by_unique_attr.insert(
            (values.unique_attribute_value.clone(), entry_key.to_owned()),
            entry.clone(),
        );
        self.by_query
            .insert((values.query.clone(), entry_key.to_owned()), entry.clone());
        self.by_method.insert(
            (values.method.as_str().to_owned(), entry_key.to_owned()),
            entry,
        );
        previous
    }

    fn remove(&mut self, entry: &CachedResult<I>) {
        let entry_key = entry.entry_key();
        let values = &entry.index_values;
        self.by_unique_attr
            .remove(&(values.unique_attribute_value.clone(), entry_key.clone()));
        self.by_query
            .remove(&(values.query.clone(), entry_key.clone()));
        self.by_method
            .remove(&(values.method.as_str().to_owned(), entry_key));
    }

    fn is_empty(&self) -> bool {
        self.by_unique_attr.is_empty()
    }
}

struct MemoryInner<I> {
    /// SST hash -> ordered indexes over that bucket's entries.
    indexes: HashMap<String, IndexSet<I>>,
    expiry_index: BTreeMap<ExpiryKey, Arc<CachedResult<I>>>,
}

impl<I> Default for MemoryInner<I> {
    fn default() -> Self {
        Self {
            indexes: HashMap::new(),
            expiry_index: BTreeMap::new(),
        }
    }
}

/// In-process cache backend: concurrent ordered indexes keyed by SST.
///
/// One reader/writer lock protects all maps; readers take the read side,
/// mutators the write side. The primary indexes and the expiry index are
/// updated within one critical section, so readers never observe an entry
/// in one but not the other.
pub struct MemoryBackend<I> {
    inner: RwLock<MemoryInner<I>>,
}

impl<I> MemoryBackend<I> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
        }
    }
}

impl<I> Default for MemoryBackend<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Item> Backend<I> for MemoryBackend<I> {
    fn search(&self, key: &CacheKey) -> Result<Option<CachedData<I>>, CacheError> {
        let now = epoch_nanos(SystemTime::now());
        let inner = self.inner.read();
        let Some(set) = inner.indexes.get(&key.sst.hash()) else {
            return Ok(None);
        };

        let mut items = Vec::new();
        let mut error: Option<QueryError> = None;
        for entry in set.scan(key) {
            if entry.is_expired_at(now) || !key.matches(&entry.index_values) {
                continue;
            }
            match &entry.payload {
                CachedPayload::Item(item) => items.push(item.clone()),
                CachedPayload::Error(err) => error = Some(err.clone()),
            }
        }

        // An error shadows items under the same key.
        if let Some(error) = error {
            return Ok(Some(CachedData::Error(error)));
        }
        if items.is_empty() {
            Ok(None)
        } else {
            Ok(Some(CachedData::Items(items)))
        }
    }

    fn store(&self, result: CachedResult<I>) -> Result<(), CacheError> {
        let sst_hash = result.index_values.sst_hash.clone();
        let entry_key = result.entry_key();
        let expiry_nanos = result.expiry_nanos;
        let entry = Arc::new(result);

        let mut guard = self.inner.write();
        let MemoryInner {
            indexes,
            expiry_index,
        } = &mut *guard;
        let set = indexes.entry(sst_hash.clone()).or_default();
        if let Some(previous) = set.insert(&entry_key, entry.clone()) {
            // Overwrite: drop the stale expiry slot before inserting the new
            // one, or the purger would later delete the live entry.
            expiry_index.remove(&(previous.expiry_nanos, sst_hash.clone(), entry_key.clone()));
        }
        expiry_index.insert((expiry_nanos, sst_hash, entry_key), entry);
        Ok(())
    }

    fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut guard = self.inner.write();
        let MemoryInner {
            indexes,
            expiry_index,
        } = &mut *guard;
        let sst_hash = key.sst.hash();
        let Some(set) = indexes.get_mut(&sst_hash) else {
            return Ok(());
        };

        // Expiry is deliberately ignored: deletion must also clean up
        // entries that have expired but not yet been purged.
        let victims: Vec<_> = set
            .scan(key)
            .into_iter()
            .filter(|entry| key.matches(&entry.index_values))
            .collect();
        for entry in victims {
            set.remove(&entry);
            expiry_index.remove(&(entry.expiry_nanos, sst_hash.clone(), entry.entry_key()));
        }
        if set.is_empty() {
            indexes.remove(&sst_hash);
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        *self.inner.write() = MemoryInner::default();
        Ok(())
    }

    fn purge(&self, before: SystemTime) -> Result<PurgeStats, CacheError> {
        let started = Instant::now();
        let cutoff = epoch_nanos(before);
        let mut num_purged = 0u64;

        let mut guard = self.inner.write();
        let MemoryInner {
            indexes,
            expiry_index,
        } = &mut *guard;
        while let Some(first) = expiry_index.first_entry() {
            let (expiry_nanos, sst_hash, _) = first.key();
            if *expiry_nanos >= cutoff {
                break;
            }
            let sst_hash = sst_hash.clone();
            let entry = first.remove();
            if let Some(set) = indexes.get_mut(&sst_hash) {
                set.remove(&entry);
                if set.is_empty() {
                    indexes.remove(&sst_hash);
                }
            }
            num_purged += 1;
        }
        let next_expiry = expiry_index
            .keys()
            .next()
            .map(|(nanos, _, _)| time_from_nanos(*nanos));

        Ok(PurgeStats {
            num_purged,
            duration: started.elapsed(),
            next_expiry,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::MemoryBackend;
    use crate::{
        cache::{Backend, CachedData},
        entry::{epoch_nanos, CachedPayload, CachedResult},
        key::CacheKey,
        tests::TestItem,
    };
    use surveyor_types::{Item as _, QueryError, QueryErrorType, QueryMethod};

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
    fn list_store_and_search() {
        let backend = MemoryBackend::new();
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        backend
            .store(stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(10)))
            .unwrap();
        backend
            .store(stored(&key, TestItem::new("b", "attr-b"), Duration::from_secs(10)))
            .unwrap();

        let found = items(backend.search(&key).unwrap());
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn get_finds_entries_written_by_search() {
        let backend = MemoryBackend::new();
        let search_key = CacheKey::for_query("src", QueryMethod::Search, "scope", "type", "q");
        backend
            .store(stored(
                &search_key,
                TestItem::new("a", "attr-a"),
                Duration::from_secs(10),
            ))
            .unwrap();

        let get_key = CacheKey::for_query("src", QueryMethod::Get, "scope", "type", "attr-a");
        let found = items(backend.search(&get_key).unwrap());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].globally_unique_name(), "a");
    }

    #[test]
    fn ssts_are_isolated() {
        let backend = MemoryBackend::new();
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        backend
            .store(stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(10)))
            .unwrap();

        let other_scope = CacheKey::for_query("src", QueryMethod::List, "other", "type", "");
        assert!(backend.search(&other_scope).unwrap().is_none());
        let other_source = CacheKey::for_query("other", QueryMethod::List, "scope", "type", "");
        assert!(backend.search(&other_source).unwrap().is_none());
    }

    #[test]
    fn expired_entries_are_invisible() {
        let backend = MemoryBackend::new();
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        let mut result = stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(10));
        result.expiry_nanos = epoch_nanos(SystemTime::now() - Duration::from_secs(1));
        backend.store(result).unwrap();

        assert!(backend.search(&key).unwrap().is_none());
    }

    #[test]
    fn error_shadows_items() {
        let backend = MemoryBackend::new();
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        backend
            .store(stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(10)))
            .unwrap();
        let error = QueryError::new(QueryErrorType::Timeout, "slow", "scope", "src", "type");
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
    fn overwrite_leaves_one_expiry_slot() {
        let backend = MemoryBackend::new();
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        backend
            .store(stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(10)))
            .unwrap();
        backend
            .store(stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(20)))
            .unwrap();

        let inner = backend.inner.read();
        assert_eq!(inner.expiry_index.len(), 1);
        assert_eq!(inner.indexes.values().next().unwrap().by_method.len(), 1);
    }

    #[test]
    fn delete_removes_expired_entries_too() {
        let backend = MemoryBackend::new();
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        let mut result = stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(10));
        result.expiry_nanos = epoch_nanos(SystemTime::now() - Duration::from_secs(1));
        backend.store(result).unwrap();

        backend.delete(&key).unwrap();
        let inner = backend.inner.read();
        assert!(inner.indexes.is_empty());
        assert!(inner.expiry_index.is_empty());
    }

    #[test]
    fn purge_respects_the_cutoff() {
        let backend = MemoryBackend::new();
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        backend
            .store(stored(&key, TestItem::new("soon", "attr-1"), Duration::from_millis(200)))
            .unwrap();
        backend
            .store(stored(&key, TestItem::new("later", "attr-2"), Duration::from_secs(60)))
            .unwrap();

        let stats = backend
            .purge(SystemTime::now() + Duration::from_secs(1))
            .unwrap();
        assert_eq!(stats.num_purged, 1);
        let remaining = items(backend.search(&key).unwrap());
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].globally_unique_name(), "later");
        // The surviving entry's expiry is the next wake-up.
        let next = stats.next_expiry.expect("an entry remains");
        assert!(next > SystemTime::now() + Duration::from_secs(30));
    }

    #[test]
    fn clear_empties_everything() {
        let backend = MemoryBackend::new();
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        backend
            .store(stored(&key, TestItem::new("a", "attr-a"), Duration::from_secs(10)))
            .unwrap();
        backend.clear().unwrap();
        assert!(backend.search(&key).unwrap().is_none());
        assert!(backend.inner.read().expiry_index.is_empty());
    }
}
