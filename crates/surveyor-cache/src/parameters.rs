// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Operational configuration of a cache instance.
///
/// NOTE: default values should make sense, so most operators should not
/// need to specify any field.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheParameters {
    /// Floor between successive purger runs, so a burst of entries expiring
    /// in quick succession does not busy-spin the purger.
    #[serde(default = "CacheParameters::default_min_wait_time")]
    pub min_wait_time: Duration,

    /// Deleted-bytes count that triggers compaction of the persistent
    /// backend after a purge.
    #[serde(default = "CacheParameters::default_compact_threshold")]
    pub compact_threshold: u64,

    /// The cache file path. Required for the persistent backend; opening an
    /// existing file picks up its prior contents unchanged.
    pub path: Option<PathBuf>,
}

impl CacheParameters {
    pub fn default_min_wait_time() -> Duration {
        Duration::from_secs(5)
    }

    pub fn default_compact_threshold() -> u64 {
        100 * 1024 * 1024
    }
}

impl Default for CacheParameters {
    fn default() -> Self {
        Self {
            min_wait_time: CacheParameters::default_min_wait_time(),
            compact_threshold: CacheParameters::default_compact_threshold(),
            path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::CacheParameters;

    #[test]
    fn defaults() {
        let parameters = CacheParameters::default();
        assert_eq!(parameters.min_wait_time, Duration::from_secs(5));
        assert_eq!(parameters.compact_threshold, 100 * 1024 * 1024);
        assert!(parameters.path.is_none());
    }
}
