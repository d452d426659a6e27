// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry, Histogram, IntCounter,
    Registry,
};

/// Metrics emitted by a cache instance.
pub struct CacheMetrics {
    /// Lookups answered from the cache, including cached errors.
    pub cache_hits: IntCounter,
    /// Lookups that had to go upstream.
    pub cache_misses: IntCounter,
    pub stored_items: IntCounter,
    pub stored_errors: IntCounter,
    pub purged_entries: IntCounter,
    /// GET lookups that matched more than one item and deleted the key.
    /// A non-zero value usually points at an adapter producing colliding
    /// unique attribute values.
    pub duplicate_get_deletes: IntCounter,
    pub disk_full_recoveries: IntCounter,
    /// Times the cache file was deleted and recreated because recovery from
    /// a full disk failed.
    pub cache_rebuilds: IntCounter,
    pub compactions: IntCounter,
    pub purge_duration: Histogram,
}

impl CacheMetrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        Arc::new(Self {
            cache_hits: register_int_counter_with_registry!(
                "cache_hits",
                "Lookups answered from the cache, including cached errors",
                registry
            )
            .unwrap(),
            cache_misses: register_int_counter_with_registry!(
                "cache_misses",
                "Lookups that missed and went upstream",
                registry
            )
            .unwrap(),
            stored_items: register_int_counter_with_registry!(
                "cache_stored_items",
                "Items written to the cache",
                registry
            )
            .unwrap(),
            stored_errors: register_int_counter_with_registry!(
                "cache_stored_errors",
                "Query errors written to the cache",
                registry
            )
            .unwrap(),
            purged_entries: register_int_counter_with_registry!(
                "cache_purged_entries",
                "Expired entries removed by purges",
                registry
            )
            .unwrap(),
            duplicate_get_deletes: register_int_counter_with_registry!(
                "cache_duplicate_get_deletes",
                "GET lookups that matched multiple items and deleted the key",
                registry
            )
            .unwrap(),
            disk_full_recoveries: register_int_counter_with_registry!(
                "cache_disk_full_recoveries",
                "Writes that triggered the disk-full recovery path",
                registry
            )
            .unwrap(),
            cache_rebuilds: register_int_counter_with_registry!(
                "cache_rebuilds",
                "Times the cache file was deleted and recreated",
                registry
            )
            .unwrap(),
            compactions: register_int_counter_with_registry!(
                "cache_compactions",
                "Successful compactions of the persistent cache file",
                registry
            )
            .unwrap(),
            purge_duration: register_histogram_with_registry!(
                "cache_purge_duration_seconds",
                "Wall-clock duration of purge runs",
                registry
            )
            .unwrap(),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_metrics() -> Arc<CacheMetrics> {
    CacheMetrics::new(&Registry::new())
}
