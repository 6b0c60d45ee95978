// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module records produced by handlers

use crate::handler::{HandlerId, HandlerOrigin};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the default export
pub const DEFAULT_EXPORT: &str = "default";

/// Identifies one cacheable resolution: (url, handler identity, type)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Resolved asset url
    pub url: String,
    /// Identity of the producing handler
    pub handler: HandlerId,
    /// Asserted import type
    pub asserted_type: String,
}

impl CacheKey {
    /// Create a cache key
    pub fn new(url: impl Into<String>, handler: HandlerId, asserted_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handler,
            asserted_type: asserted_type.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] via {}", self.url, self.asserted_type, self.handler)
    }
}

/// Immutable exports produced for a resolved import
#[derive(Debug, PartialEq)]
pub struct ModuleRecord {
    exports: BTreeMap<String, Value>,
    handler: HandlerId,
    origin: HandlerOrigin,
    cache_key: CacheKey,
    fingerprint: String,
}

impl ModuleRecord {
    /// Build a record from validated exports
    pub fn new(
        exports: BTreeMap<String, Value>,
        origin: HandlerOrigin,
        cache_key: CacheKey,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            handler: cache_key.handler,
            exports,
            origin,
            cache_key,
            fingerprint: fingerprint.into(),
        }
    }

    /// Get an exported value
    pub fn get_export(&self, name: &str) -> Option<&Value> {
        self.exports.get(name)
    }

    /// Get the default export
    pub fn default_export(&self) -> Option<&Value> {
        self.exports.get(DEFAULT_EXPORT)
    }

    /// Exports other than `default`
    pub fn named_exports(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.exports
            .iter()
            .filter(|(name, _)| name.as_str() != DEFAULT_EXPORT)
            .map(|(name, value)| (name.as_str(), value))
    }

    /// All exports
    pub fn exports(&self) -> &BTreeMap<String, Value> {
        &self.exports
    }

    /// Whether `name` is exported
    pub fn has_export(&self, name: &str) -> bool {
        self.exports.contains_key(name)
    }

    /// Identity of the handler that produced this record
    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    /// Origin of the producing handler
    pub fn origin(&self) -> HandlerOrigin {
        self.origin
    }

    /// Cache key this record is stored under
    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    /// Fingerprint of the bytes this record was built from
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Exports as a namespace object
    pub fn namespace(&self) -> Value {
        let map: Map<String, Value> = self
            .exports
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }
}
