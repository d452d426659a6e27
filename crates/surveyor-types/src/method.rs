// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of query an adapter is asked to answer.
///
/// `Get` is the zero value: a method field that was never set deserializes
/// and compares as `Get`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryMethod {
    /// Fetch a single item by its unique attribute value.
    #[default]
    Get,
    /// Fetch all items in a scope.
    List,
    /// Fetch items matching a free-form query string.
    Search,
}

impl QueryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMethod::Get => "GET",
            QueryMethod::List => "LIST",
            QueryMethod::Search => "SEARCH",
        }
    }

    /// Stable wire representation, used in storage keys.
    pub fn as_u8(&self) -> u8 {
        match self {
            QueryMethod::Get => 0,
            QueryMethod::List => 1,
            QueryMethod::Search => 2,
        }
    }
}

impl fmt::Display for QueryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
