// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use surveyor_types::QueryError;

use crate::key::IndexValues;

/// Floor applied to every TTL. Platform timer resolution and race-detector
/// overhead can make very small TTLs expire before a same-transaction read;
/// 100 ms is empirically sufficient.
pub const MIN_TTL: Duration = Duration::from_millis(100);

pub(crate) fn floor_ttl(ttl: Duration) -> Duration {
    ttl.max(MIN_TTL)
}

/// Wall-clock instant as nanoseconds since the Unix epoch. Instants before
/// the epoch clamp to zero.
pub(crate) fn epoch_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub(crate) fn time_from_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

/// The cached answer: exactly one of an item or a typed query error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CachedPayload<I> {
    Item(I),
    Error(QueryError),
}

/// One cache entry: a payload, the absolute instant it expires, and the
/// projection used to re-find it.
///
/// `expiry_nanos` must stay the first field: the persistent backend reads
/// it straight out of the serialized bytes without deserializing the item
/// payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedResult<I> {
    pub expiry_nanos: u64,
    pub index_values: IndexValues,
    /// Tiebreaker within an index value. Empty for stored errors, which
    /// have no item to name.
    pub globally_unique_name: String,
    pub payload: CachedPayload<I>,
}

impl<I> CachedResult<I> {
    pub fn is_expired_at(&self, now_nanos: u64) -> bool {
        self.expiry_nanos <= now_nanos
    }

    pub fn expiry(&self) -> SystemTime {
        time_from_nanos(self.expiry_nanos)
    }

    pub fn entry_key(&self) -> String {
        self.index_values.entry_key(&self.globally_unique_name)
    }
}
