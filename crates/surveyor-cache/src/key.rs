// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use surveyor_types::QueryMethod;

/// The source + scope + type triple that partitions the cache into
/// independent namespaces. Entries under different SSTs never interact,
/// even if every other field collides.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Sst {
    pub source_name: String,
    pub scope: String,
    pub item_type: String,
}

impl Sst {
    pub fn new(
        source_name: impl Into<String>,
        scope: impl Into<String>,
        item_type: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            scope: scope.into(),
            item_type: item_type.into(),
        }
    }

    /// Stable bucket identifier: hex-encoded SHA-256 over the concatenated
    /// fields.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source_name.as_bytes());
        hasher.update(self.scope.as_bytes());
        hasher.update(self.item_type.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// The flat projection stored alongside every entry and used for matching.
///
/// Only the fields relevant to the write that produced the entry are
/// populated; unset strings are empty and an unset method is the zero value
/// ([`QueryMethod::Get`]).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexValues {
    pub sst_hash: String,
    pub unique_attribute_value: String,
    pub method: QueryMethod,
    pub query: String,
}

impl IndexValues {
    /// The entry's identity within its SST bucket. Two writes with the same
    /// entry key replace each other; everything else coexists.
    pub fn entry_key(&self, globally_unique_name: &str) -> String {
        format!(
            "{}|{}|{}|{}",
            self.method.as_u8(),
            self.query,
            self.unique_attribute_value,
            globally_unique_name
        )
    }
}

/// A search specification over one SST bucket.
///
/// Optional fields that are set must match the stored projection exactly;
/// unset fields are wildcards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKey {
    pub sst: Sst,
    pub method: Option<QueryMethod>,
    pub query: Option<String>,
    pub unique_attribute_value: Option<String>,
}

impl CacheKey {
    /// Derives the cache key for a query.
    ///
    /// A LIST produces many items sharing one key, so it is addressed by
    /// method alone. A SEARCH distinguishes different query strings within
    /// the same SST. A GET is addressed by the item's unique attribute
    /// value, which is stored on every entry regardless of write method, so
    /// a GET can also hit items previously stored by LIST or SEARCH.
    pub fn for_query(
        source_name: &str,
        method: QueryMethod,
        scope: &str,
        item_type: &str,
        query: &str,
    ) -> Self {
        let sst = Sst::new(source_name, scope, item_type);
        match method {
            QueryMethod::Get => Self {
                sst,
                method: None,
                query: None,
                unique_attribute_value: Some(query.to_owned()),
            },
            QueryMethod::List => Self {
                sst,
                method: Some(QueryMethod::List),
                query: None,
                unique_attribute_value: None,
            },
            QueryMethod::Search => Self {
                sst,
                method: Some(QueryMethod::Search),
                query: Some(query.to_owned()),
                unique_attribute_value: None,
            },
        }
    }

    /// Whether the stored projection satisfies this key. SST equality is
    /// the caller's responsibility (checked via bucket hash before matching
    /// is attempted).
    pub fn matches(&self, values: &IndexValues) -> bool {
        if let Some(method) = self.method {
            if method != values.method {
                return false;
            }
        }
        if let Some(query) = &self.query {
            if *query != values.query {
                return false;
            }
        }
        if let Some(unique_attribute_value) = &self.unique_attribute_value {
            if *unique_attribute_value != values.unique_attribute_value {
                return false;
            }
        }
        true
    }

    /// Collapses the optional fields to their zero values, producing the
    /// projection stored with a write under this key.
    pub fn to_index_values(&self) -> IndexValues {
        IndexValues {
            sst_hash: self.sst.hash(),
            unique_attribute_value: self.unique_attribute_value.clone().unwrap_or_default(),
            method: self.method.unwrap_or_default(),
            query: self.query.clone().unwrap_or_default(),
        }
    }
}

/// Deterministic, human-readable rendering. Used as the pending-work map
/// key and in trace attributes; unset fields render as `*`.
impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}|method=",
            self.sst.source_name, self.sst.scope, self.sst.item_type
        )?;
        match self.method {
            Some(method) => write!(f, "{method}")?,
            None => f.write_str("*")?,
        }
        write!(
            f,
            "|query={}|uav={}",
            self.query.as_deref().unwrap_or("*"),
            self.unique_attribute_value.as_deref().unwrap_or("*")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheKey, IndexValues, Sst};
    use surveyor_types::QueryMethod;

    #[test]
    fn sst_hash_is_stable_and_distinct() {
        let a = Sst::new("src", "scope", "type");
        let b = Sst::new("src", "scope", "type");
        let c = Sst::new("src", "scope", "other");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn get_key_addresses_by_unique_attribute() {
        let key = CacheKey::for_query("src", QueryMethod::Get, "scope", "type", "instance-1");
        assert_eq!(key.method, None);
        assert_eq!(key.query, None);
        assert_eq!(key.unique_attribute_value.as_deref(), Some("instance-1"));
    }

    #[test]
    fn list_key_ignores_query() {
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "ignored");
        assert_eq!(key.method, Some(QueryMethod::List));
        assert_eq!(key.query, None);
        assert_eq!(key.unique_attribute_value, None);
    }

    #[test]
    fn search_key_keeps_query() {
        let key = CacheKey::for_query("src", QueryMethod::Search, "scope", "type", "needle");
        assert_eq!(key.method, Some(QueryMethod::Search));
        assert_eq!(key.query.as_deref(), Some("needle"));
    }

    #[test]
    fn unset_fields_are_wildcards() {
        let get_key = CacheKey::for_query("src", QueryMethod::Get, "scope", "type", "attr-1");
        // An entry written by a SEARCH still carries the unique attribute
        // projection, so a GET by that attribute matches it.
        let search_written = IndexValues {
            sst_hash: get_key.sst.hash(),
            unique_attribute_value: "attr-1".into(),
            method: QueryMethod::Search,
            query: "needle".into(),
        };
        assert!(get_key.matches(&search_written));

        let other_attr = IndexValues {
            unique_attribute_value: "attr-2".into(),
            ..search_written.clone()
        };
        assert!(!get_key.matches(&other_attr));
    }

    #[test]
    fn set_fields_must_match_exactly() {
        let search_key = CacheKey::for_query("src", QueryMethod::Search, "scope", "type", "a");
        let mut values = search_key.to_index_values();
        assert!(search_key.matches(&values));
        values.query = "b".into();
        assert!(!search_key.matches(&values));
        values.query = "a".into();
        values.method = QueryMethod::List;
        assert!(!search_key.matches(&values));
    }

    #[test]
    fn index_values_collapse_to_zero_values() {
        let key = CacheKey::for_query("src", QueryMethod::List, "scope", "type", "");
        let values = key.to_index_values();
        assert_eq!(values.method, QueryMethod::List);
        assert_eq!(values.query, "");
        assert_eq!(values.unique_attribute_value, "");
        assert_eq!(values.sst_hash, key.sst.hash());
    }

    #[test]
    fn display_is_deterministic() {
        let a = CacheKey::for_query("src", QueryMethod::Search, "scope", "type", "q");
        let b = CacheKey::for_query("src", QueryMethod::Search, "scope", "type", "q");
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.to_string(), "src.scope.type|method=SEARCH|query=q|uav=*");
    }

    #[test]
    fn entry_key_includes_all_identity_fields() {
        let values = IndexValues {
            sst_hash: "h".into(),
            unique_attribute_value: "attr".into(),
            method: QueryMethod::List,
            query: "".into(),
        };
        assert_eq!(values.entry_key("name"), "1||attr|name");
    }
}
