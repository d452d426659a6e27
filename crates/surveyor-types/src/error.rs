// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed query, as reported by an adapter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryErrorType {
    /// The upstream system confirmed the item does not exist.
    NotFound,
    /// The query was sent to an adapter that does not serve the requested
    /// scope.
    NoScope,
    /// The upstream system was unreachable or too slow.
    Timeout,
    /// Anything else: malformed input, serialization failure, upstream 5xx.
    #[default]
    Other,
}

impl fmt::Display for QueryErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryErrorType::NotFound => "NOTFOUND",
            QueryErrorType::NoScope => "NOSCOPE",
            QueryErrorType::Timeout => "TIMEOUT",
            QueryErrorType::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// A typed error returned in place of items when a query fails.
///
/// Query errors are first-class values: they travel through the request
/// graph and are cached just like items, so that a confirmed `NotFound` does
/// not trigger a fresh upstream call from every interested caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{error_type} from {source_name} ({scope}/{item_type}): {error_string}")]
pub struct QueryError {
    pub error_type: QueryErrorType,
    pub error_string: String,
    /// Scope the failing query was addressed to.
    pub scope: String,
    /// Name of the adapter that produced the error.
    pub source_name: String,
    /// Item type the failing query asked for.
    pub item_type: String,
}

impl QueryError {
    pub fn new(
        error_type: QueryErrorType,
        error_string: impl Into<String>,
        scope: impl Into<String>,
        source_name: impl Into<String>,
        item_type: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            error_string: error_string.into(),
            scope: scope.into(),
            source_name: source_name.into(),
            item_type: item_type.into(),
        }
    }

    /// Whether retrying the query could plausibly produce a different
    /// answer. `NotFound` and `NoScope` are definitive; everything else is
    /// worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.error_type,
            QueryErrorType::NotFound | QueryErrorType::NoScope
        )
    }
}
