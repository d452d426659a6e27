// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

/// A discovered infrastructure item.
///
/// The cache and the request graph treat items as opaque payloads; the only
/// structure they rely on is the pair of identifiers below.
pub trait Item: Clone + Send + Sync + 'static {
    /// A stable identifier for this item across all scopes. Two items with
    /// the same globally unique name are the same item, regardless of which
    /// query discovered them.
    fn globally_unique_name(&self) -> String;

    /// The value of the item's unique attribute within its scope. This is
    /// the identifier a GET query addresses the item by.
    fn unique_attribute_value(&self) -> String;
}
