// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Native capability check
//!
//! Answers whether the host runtime can handle an asserted type without a
//! user handler. Answers are memoized per (type, mime), and per type for
//! [`NativeCheck::native_for`], for the life of the
//! process.

use crate::builtin;
use crate::handler::Handler;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Host table of natively supported types
pub trait NativeCapabilities: Send + Sync + 'static {
    /// Whether the host handles `asserted_type` delivered as `mime_type`
    fn supports(&self, asserted_type: &str, mime_type: &str) -> bool;

    /// The host handler for `asserted_type`, if any
    fn handler_for(&self, asserted_type: &str) -> Option<Handler>;
}

struct NativeEntry {
    /// Accepted mime types; empty accepts any
    mime_types: BTreeSet<String>,
    handler: Handler,
}

/// Simple in-process capability table
#[derive(Default)]
pub struct CapabilityTable {
    entries: HashMap<String, NativeEntry>,
}

impl CapabilityTable {
    /// Empty table: nothing is native
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the host's built-in JSON support
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.insert(
            "json",
            &["application/json", "text/json", "application/manifest+json"],
            builtin::json_handler(),
        );
        table
    }

    /// Register a native handler for `asserted_type`
    pub fn insert(&mut self, asserted_type: &str, mime_types: &[&str], handler: Handler) {
        self.entries.insert(
            asserted_type.to_string(),
            NativeEntry {
                mime_types: mime_types.iter().map(|m| m.to_ascii_lowercase()).collect(),
                handler,
            },
        );
    }
}

impl NativeCapabilities for CapabilityTable {
    fn supports(&self, asserted_type: &str, mime_type: &str) -> bool {
        self.entries.get(asserted_type).is_some_and(|entry| {
            entry.mime_types.is_empty()
                || entry.mime_types.contains(&mime_type.to_ascii_lowercase())
        })
    }

    fn handler_for(&self, asserted_type: &str) -> Option<Handler> {
        self.entries
            .get(asserted_type)
            .map(|entry| entry.handler.clone())
    }
}

/// Memoizing front for a [`NativeCapabilities`] table
pub struct NativeCheck {
    table: Arc<dyn NativeCapabilities>,
    /// (type, mime) -> available
    memo: DashMap<(String, String), bool>,
    /// type -> host has a handler, whatever the mime
    types: DashMap<String, bool>,
}

impl NativeCheck {
    /// Wrap a capability table
    pub fn new(table: Arc<dyn NativeCapabilities>) -> Self {
        Self {
            table,
            memo: DashMap::new(),
            types: DashMap::new(),
        }
    }

    /// Whether the host supports `asserted_type` delivered as `mime_type`
    pub fn available(&self, asserted_type: &str, mime_type: &str) -> bool {
        let key = (asserted_type.to_string(), mime_type.to_ascii_lowercase());
        if let Some(hit) = self.memo.get(&key) {
            return *hit;
        }
        let available = self.table.supports(asserted_type, mime_type);
        debug!(asserted_type, mime_type, available, "native capability");
        *self.memo.entry(key).or_insert(available)
    }

    /// Whether the host has any handler for `asserted_type`
    pub fn native_for(&self, asserted_type: &str) -> bool {
        if let Some(hit) = self.types.get(asserted_type) {
            return *hit;
        }
        let available = self.table.handler_for(asserted_type).is_some();
        *self.types.entry(asserted_type.to_string()).or_insert(available)
    }

    /// The host handler for `asserted_type`
    pub fn handler(&self, asserted_type: &str) -> Option<Handler> {
        self.table.handler_for(asserted_type)
    }

    #[cfg(test)]
    fn memoized(&self) -> usize {
        self.memo.len()
    }
}

impl Default for NativeCheck {
    fn default() -> Self {
        Self::new(Arc::new(CapabilityTable::with_defaults()))
    }
}
