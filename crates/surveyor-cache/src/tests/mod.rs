// Copyright (c) Surveyor Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use surveyor_types::Item;


/// Minimal item used across the test suite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct TestItem {
    pub name: String,
    pub attr: String,
    pub payload: String,
}

impl TestItem {
    pub fn new(name: &str, attr: &str) -> Self {
        Self {
            name: name.to_owned(),
            attr: attr.to_owned(),
            payload: String::new(),
        }
    }

    pub fn with_payload(mut self, payload: &str) -> Self {
        self.payload = payload.to_owned();
        self
    }
}

impl Item for TestItem {
    fn globally_unique_name(&self) -> String {
        self.name.clone()
    }

    fn unique_attribute_value(&self) -> String {
        self.attr.clone()
    }
}
