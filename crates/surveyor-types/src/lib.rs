// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared types for the surveyor discovery agent.
//!
//! Adapters answer three kinds of query against an external system (a cloud
//! API, DNS, HTTP, RDAP, ...): GET a single item by unique identifier, LIST
//! all items in a scope, and SEARCH by a free-form query string. This crate
//! holds the contracts shared between adapters and the query result cache:
//! the query method, the typed query error, the [`Item`] trait, and the
//! [`Adapter`] trait itself.

mod adapter;
mod error;
mod item;
mod method;

pub use adapter::Adapter;
pub use error::{QueryError, QueryErrorType};
pub use item::Item;
pub use method::QueryMethod;
