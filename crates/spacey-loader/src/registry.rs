// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Global handler registry
//!
//! Maps asserted types to their default handler. Writes go through
//! [`HandlerRegistry::define`] under a single writer lock; reads take a
//! consistent snapshot.
//!
//! ```rust,ignore
//! let registry = HandlerRegistry::global();
//! registry.define(["scss", "css", "sass"], styles_handler)?;
//! assert!(registry.for_type("css").is_some());
//! ```

use crate::error::{ImportError, Result};
use crate::handler::{Handler, HandlerDescriptor};
use crate::native::NativeCheck;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

static GLOBAL_REGISTRY: OnceLock<Arc<HandlerRegistry>> = OnceLock::new();

/// One `define` call as seen by [`HandlerRegistry::entries`]
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Types still owned by this definition
    pub types: Vec<String>,
    /// The registered handler
    pub handler: Arc<HandlerDescriptor>,
}

#[derive(Default)]
struct RegistryState {
    by_type: HashMap<String, Arc<HandlerDescriptor>>,
    /// Definitions in order of their `define` call; shared with snapshots
    definitions: Arc<Vec<RegistryEntry>>,
}

/// Process-wide type -> default handler mapping
pub struct HandlerRegistry {
    state: RwLock<RegistryState>,
    native: Arc<NativeCheck>,
}

impl HandlerRegistry {
    /// Empty registry backed by the given native check
    pub fn new(native: Arc<NativeCheck>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            native,
        }
    }

    /// The process-wide registry, created empty on first use with the
    /// default native capability table
    pub fn global() -> Arc<HandlerRegistry> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(|| {
            debug!("Initializing global handler registry");
            Arc::new(HandlerRegistry::new(Arc::new(NativeCheck::default())))
        }))
    }

    /// Initialize the process-wide registry with a host native check.
    ///
    /// Fails if the global registry already exists.
    pub fn init_global(native: Arc<NativeCheck>) -> Result<Arc<HandlerRegistry>> {
        let registry = Arc::new(HandlerRegistry::new(native));
        GLOBAL_REGISTRY
            .set(Arc::clone(&registry))
            .map_err(|_| ImportError::registry("global handler registry is already initialized"))?;
        Ok(registry)
    }

    /// Install `handler` as the default for every type in `types`.
    ///
    /// All listed types switch over atomically. Types not listed keep their
    /// current handler.
    pub fn define<I, S>(&self, types: I, handler: Handler) -> Result<Arc<HandlerDescriptor>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut listed: Vec<String> = Vec::new();
        for t in types {
            let t = t.as_ref().trim();
            if t.is_empty() {
                return Err(ImportError::registry("type names must not be empty"));
            }
            if !handler.supports(t) {
                return Err(ImportError::registry(format!(
                    "handler '{}' does not support type '{}'",
                    handler.name(),
                    t
                )));
            }
            if !listed.iter().any(|existing| existing == t) {
                listed.push(t.to_string());
            }
        }
        if listed.is_empty() {
            return Err(ImportError::registry("define requires at least one type"));
        }

        let descriptor = Arc::new(HandlerDescriptor::registry(handler, &listed));

        let mut state = self.state.write();
        for t in &listed {
            state.by_type.insert(t.clone(), Arc::clone(&descriptor));
        }
        let definitions = Arc::make_mut(&mut state.definitions);
        for entry in definitions.iter_mut() {
            entry.types.retain(|t| !listed.contains(t));
        }
        definitions.retain(|entry| !entry.types.is_empty());
        definitions.push(RegistryEntry {
            types: listed.clone(),
            handler: Arc::clone(&descriptor),
        });
        drop(state);

        info!(
            handler = %descriptor.id(),
            name = descriptor.handler().name(),
            types = ?listed,
            "Defined import handler"
        );
        Ok(descriptor)
    }

    /// Current default handler for `asserted_type`
    pub fn for_type(&self, asserted_type: &str) -> Option<Arc<HandlerDescriptor>> {
        self.state.read().by_type.get(asserted_type).cloned()
    }

    /// Snapshot of all definitions in order of their latest `define`
    pub fn entries(&self) -> RegistryEntries {
        RegistryEntries {
            snapshot: Arc::clone(&self.state.read().definitions),
        }
    }

    /// Whether the host handles `asserted_type` natively.
    ///
    /// Independent of what is registered here.
    pub fn native_for(&self, asserted_type: &str) -> bool {
        self.native.native_for(asserted_type)
    }

    /// Native capability check shared with the loader
    pub fn native_check(&self) -> &Arc<NativeCheck> {
        &self.native
    }

    /// Number of types with a registered default
    pub fn len(&self) -> usize {
        self.state.read().by_type.len()
    }

    /// Whether no type has a registered default
    pub fn is_empty(&self) -> bool {
        self.state.read().by_type.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NativeCheck::default()))
    }
}

/// Snapshot of registry definitions.
///
/// Cheap to take and to clone; each clone iterates from the start again.
/// Later `define` calls are not visible through an existing snapshot.
#[derive(Debug, Clone)]
pub struct RegistryEntries {
    snapshot: Arc<Vec<RegistryEntry>>,
}

impl RegistryEntries {
    /// Iterate the snapshot
    pub fn iter(&self) -> std::slice::Iter<'_, RegistryEntry> {
        self.snapshot.iter()
    }

    /// Number of definitions
    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }
}

impl<'a> IntoIterator for &'a RegistryEntries {
    type Item = &'a RegistryEntry;
    type IntoIter = std::slice::Iter<'a, RegistryEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.snapshot.iter()
    }
}

impl IntoIterator for RegistryEntries {
    type Item = RegistryEntry;
    type IntoIter = RegistryEntriesIter;

    fn into_iter(self) -> Self::IntoIter {
        RegistryEntriesIter {
            snapshot: self.snapshot,
            position: 0,
        }
    }
}

/// Owning iterator over a registry snapshot
#[derive(Debug, Clone)]
pub struct RegistryEntriesIter {
    snapshot: Arc<Vec<RegistryEntry>>,
    position: usize,
}

impl Iterator for RegistryEntriesIter {
    type Item = RegistryEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.snapshot.get(self.position)?.clone();
        self.position += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.snapshot.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RegistryEntriesIter {}
