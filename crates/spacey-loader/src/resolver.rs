// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Handler resolution
//!
//! Turns the handler reference of an import into a [`HandlerDescriptor`]:
//!
//! - inline callables are wrapped as they are
//! - handler module paths are instantiated and must have exactly one
//!   callable default export taking `(bytes, context)`
//! - without a reference, the registry default is used, with native
//!   fallback governed by the configured [`FallbackPolicy`]
//!
//! An explicit reference never falls back to native handling.

use crate::config::FallbackPolicy;
use crate::error::{ImportError, Result};
use crate::handler::{Handler, HandlerDescriptor, HandlerId, HandlerOrigin};
use crate::native::NativeCheck;
use crate::record::DEFAULT_EXPORT;
use crate::registry::HandlerRegistry;
use crate::request::HandlerReference;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

/// Number of parameters a handler export must accept: `(bytes, context)`
pub const HANDLER_ARITY: usize = 2;

/// Optional export of a handler module listing the types it supports
pub const TYPES_EXPORT: &str = "types";

/// One export of an instantiated handler module
#[derive(Debug, Clone)]
pub enum ModuleExport {
    /// A callable with its declared parameter count
    Callable {
        /// The callable
        handler: Handler,
        /// Declared number of parameters
        arity: usize,
    },
    /// Plain data
    Value(Value),
}

/// An instantiated handler module
#[derive(Debug, Clone, Default)]
pub struct HandlerModule {
    exports: BTreeMap<String, ModuleExport>,
}

impl HandlerModule {
    /// Module with no exports
    pub fn new() -> Self {
        Self::default()
    }

    /// Module whose default export is `handler` with the expected arity
    pub fn with_default_handler(handler: Handler) -> Self {
        Self::new().with_export(
            DEFAULT_EXPORT,
            ModuleExport::Callable {
                handler,
                arity: HANDLER_ARITY,
            },
        )
    }

    /// Add an export
    pub fn with_export(mut self, name: impl Into<String>, export: ModuleExport) -> Self {
        self.exports.insert(name.into(), export);
        self
    }

    /// Look up an export
    pub fn get(&self, name: &str) -> Option<&ModuleExport> {
        self.exports.get(name)
    }
}

/// Host hook instantiating handler modules, each in its own context
#[async_trait]
pub trait ModuleInstantiator: Send + Sync + 'static {
    /// Instantiate the handler module at `path`
    async fn instantiate(&self, path: &str) -> anyhow::Result<HandlerModule>;
}

type ModuleFactory = Arc<dyn Fn() -> HandlerModule + Send + Sync>;

/// In-process table of handler modules.
///
/// Every instantiation calls the factory again, so each gets fresh state.
#[derive(Default)]
pub struct StaticModuleTable {
    factories: DashMap<String, ModuleFactory>,
    instantiations: AtomicUsize,
}

impl StaticModuleTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module factory under `path`
    pub fn register<F>(&self, path: impl Into<String>, factory: F)
    where
        F: Fn() -> HandlerModule + Send + Sync + 'static,
    {
        self.factories.insert(path.into(), Arc::new(factory));
    }

    /// Number of instantiations performed
    pub fn instantiation_count(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModuleInstantiator for StaticModuleTable {
    async fn instantiate(&self, path: &str) -> anyhow::Result<HandlerModule> {
        let factory = self
            .factories
            .get(path)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| anyhow::anyhow!("Cannot find handler module '{}'", path))?;
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(factory())
    }
}

/// Resolves handler references into descriptors
pub struct HandlerResolver {
    registry: Arc<HandlerRegistry>,
    native: Arc<NativeCheck>,
    instantiator: Arc<dyn ModuleInstantiator>,
    policy: FallbackPolicy,
    /// Verified handler modules by path
    modules: DashMap<String, Arc<HandlerDescriptor>>,
}

impl HandlerResolver {
    /// Create a resolver
    pub fn new(
        registry: Arc<HandlerRegistry>,
        instantiator: Arc<dyn ModuleInstantiator>,
        policy: FallbackPolicy,
    ) -> Self {
        let native = Arc::clone(registry.native_check());
        Self {
            registry,
            native,
            instantiator,
            policy,
            modules: DashMap::new(),
        }
    }

    /// Configured fallback policy
    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    /// Whether resolving `reference` depends on the mime type of the loaded
    /// asset, i.e. the choice may fall to a native handler.
    pub fn needs_mime_type(&self, reference: &HandlerReference, asserted_type: &str) -> bool {
        if !matches!(reference, HandlerReference::Absent) || !self.native.native_for(asserted_type) {
            return false;
        }
        match self.policy {
            FallbackPolicy::RegistryOnly => false,
            FallbackPolicy::NativeOnRegistryMiss => self.registry.for_type(asserted_type).is_none(),
            FallbackPolicy::PreferNative => true,
        }
    }

    /// Resolve the handler for one import.
    ///
    /// `mime_type` feeds the native capability check. When
    /// [`needs_mime_type`](Self::needs_mime_type) holds it must be the mime
    /// type the source loader reported for the asset.
    #[instrument(skip(self, reference, url), fields(url = %url))]
    pub async fn resolve(
        &self,
        reference: &HandlerReference,
        url: &Url,
        asserted_type: &str,
        mime_type: &str,
    ) -> Result<Arc<HandlerDescriptor>> {
        let descriptor = match reference {
            HandlerReference::Inline(handler) => Arc::new(HandlerDescriptor::inline(handler.clone())),
            HandlerReference::External(path) => self.resolve_module(path, url, asserted_type).await?,
            HandlerReference::Absent => self.resolve_default(url, asserted_type, mime_type)?,
        };

        if !descriptor.supports(asserted_type) {
            return Err(ImportError::resolution(
                url.as_str(),
                asserted_type,
                Some(descriptor.id()),
                format!(
                    "handler '{}' does not support type '{}' (supports: {})",
                    descriptor.handler().name(),
                    asserted_type,
                    descriptor
                        .supported_types()
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ));
        }

        debug!(
            handler = %descriptor.id(),
            origin = %descriptor.origin(),
            "Resolved handler"
        );
        Ok(descriptor)
    }

    async fn resolve_module(
        &self,
        path: &str,
        url: &Url,
        asserted_type: &str,
    ) -> Result<Arc<HandlerDescriptor>> {
        if let Some(descriptor) = self.modules.get(path) {
            return Ok(Arc::clone(descriptor.value()));
        }

        let id = HandlerId::derive(HandlerOrigin::ExternalModule, path);
        let fail = |reason: String| ImportError::resolution(url.as_str(), asserted_type, Some(id), reason);

        let module = self
            .instantiator
            .instantiate(path)
            .await
            .map_err(|e| fail(format!("cannot instantiate handler module '{}': {:#}", path, e)))?;

        let handler = match module.get(DEFAULT_EXPORT) {
            Some(ModuleExport::Callable { handler, arity }) if *arity == HANDLER_ARITY => handler.clone(),
            Some(ModuleExport::Callable { arity, .. }) => {
                return Err(fail(format!(
                    "default export of '{}' takes {} parameter(s), expected {} (bytes, context)",
                    path, arity, HANDLER_ARITY
                )));
            }
            Some(ModuleExport::Value(_)) => {
                return Err(fail(format!("default export of '{}' is not callable", path)));
            }
            None => {
                return Err(fail(format!("handler module '{}' has no default export", path)));
            }
        };

        let supported_types = match module.get(TYPES_EXPORT) {
            None => handler.supported_types().clone(),
            Some(ModuleExport::Value(Value::Array(items))) => {
                let mut types = BTreeSet::new();
                for item in items {
                    match item.as_str() {
                        Some(t) => {
                            types.insert(t.to_string());
                        }
                        None => {
                            return Err(fail(format!(
                                "'{}' export of '{}' must be a list of strings",
                                TYPES_EXPORT, path
                            )));
                        }
                    }
                }
                types
            }
            Some(_) => {
                return Err(fail(format!(
                    "'{}' export of '{}' must be a list of strings",
                    TYPES_EXPORT, path
                )));
            }
        };

        let descriptor = Arc::new(HandlerDescriptor::external(path, handler, supported_types));
        let descriptor = Arc::clone(
            self.modules
                .entry(path.to_string())
                .or_insert(descriptor)
                .value(),
        );
        debug!("Instantiated handler module '{}'", path);
        Ok(descriptor)
    }

    fn resolve_default(
        &self,
        url: &Url,
        asserted_type: &str,
        mime_type: &str,
    ) -> Result<Arc<HandlerDescriptor>> {
        let native = || {
            if self.native.available(asserted_type, mime_type) {
                self.native
                    .handler(asserted_type)
                    .map(|h| Arc::new(HandlerDescriptor::native(h)))
            } else {
                None
            }
        };

        let chosen = match self.policy {
            FallbackPolicy::RegistryOnly => self.registry.for_type(asserted_type),
            FallbackPolicy::NativeOnRegistryMiss => {
                self.registry.for_type(asserted_type).or_else(native)
            }
            FallbackPolicy::PreferNative => native().or_else(|| self.registry.for_type(asserted_type)),
        };

        chosen.ok_or_else(|| {
            let reason = if self.policy == FallbackPolicy::RegistryOnly && self.native.native_for(asserted_type) {
                format!(
                    "no handler registered for type '{}' (a native handler exists but policy is {})",
                    asserted_type, self.policy
                )
            } else {
                format!(
                    "no handler registered for type '{}' and no native handler available",
                    asserted_type
                )
            };
            ImportError::resolution(url.as_str(), asserted_type, None, reason)
        })
    }
}
