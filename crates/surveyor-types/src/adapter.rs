// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::{Item, QueryError};

/// An adapter answers queries against one external system.
///
/// Implementations are expected to consult the query result cache before
/// every upstream fetch and to store the outcome (item, item set, or typed
/// error) afterwards, so that concurrent callers coalesce and repeated
/// queries do not stampede the upstream API.
#[async_trait]
pub trait Adapter: Send + Sync {
    type Item: Item;

    /// The item type this adapter discovers, e.g. `"dns-record"`.
    fn item_type(&self) -> &str;

    /// The adapter's unique name, e.g. `"route53-dns"`.
    fn name(&self) -> &str;

    /// The scopes this adapter can answer queries for.
    fn scopes(&self) -> Vec<String>;

    /// Fetch a single item by its unique attribute value.
    async fn get(
        &self,
        scope: &str,
        query: &str,
        ignore_cache: bool,
    ) -> Result<Self::Item, QueryError>;

    /// Fetch all items in the given scope.
    async fn list(&self, scope: &str, ignore_cache: bool) -> Result<Vec<Self::Item>, QueryError>;

    /// Fetch all items matching a free-form query string.
    async fn search(
        &self,
        scope: &str,
        query: &str,
        ignore_cache: bool,
    ) -> Result<Vec<Self::Item>, QueryError>;
}
