// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The import pipeline
//!
//! [`ModuleLoader`] drives one import through handler resolution, source
//! loading and single-flight invocation:
//!
//! ```text
//! Pending -> ResolvingHandler -> LoadingSource -> Invoking | CacheHit -> Completed
//!                    \                  \              \
//!                     +------------------+--------------+--> Failed
//! ```
//!
//! Nothing is retried across states; a new import is the unit of retry.

use crate::cache::{CacheStatus, ModuleRecordCache};
use crate::config::LoaderConfig;
use crate::error::{ImportError, Result};
use crate::handler::{Handler, HandlerDescriptor};
use crate::invoker::HandlerInvoker;
use crate::record::{CacheKey, ModuleRecord};
use crate::registry::HandlerRegistry;
use crate::request::{
    ImportAssertion, ImportBindings, ImportRequest, SpecifierResolver, UrlSpecifierResolver,
};
use crate::resolver::{HandlerResolver, ModuleInstantiator, StaticModuleTable};
use crate::source::{mime, Fetcher, FileFetcher, SourceLoader};
use crate::stats::LoaderStats;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Where an import is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    /// Created, not started
    Pending,
    /// Choosing a handler
    ResolvingHandler,
    /// Fetching the asset
    LoadingSource,
    /// Running the handler or waiting on another request running it
    Invoking,
    /// Answered from a stored record
    CacheHit,
    /// Record produced
    Completed,
    /// Rejected
    Failed,
}

impl ImportState {
    /// Whether no further transitions happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportState::Completed | ImportState::Failed)
    }
}

impl fmt::Display for ImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImportState::Pending => "pending",
            ImportState::ResolvingHandler => "resolving-handler",
            ImportState::LoadingSource => "loading-source",
            ImportState::Invoking => "invoking",
            ImportState::CacheHit => "cache-hit",
            ImportState::Completed => "completed",
            ImportState::Failed => "failed",
        };
        f.write_str(s)
    }
}

struct Transitions {
    state: ImportState,
}

impl Transitions {
    fn new() -> Self {
        Self {
            state: ImportState::Pending,
        }
    }

    fn advance(&mut self, next: ImportState) {
        debug!("{} -> {}", self.state, next);
        self.state = next;
    }
}

/// Builder for [`ModuleLoader`]
pub struct ModuleLoaderBuilder {
    config: LoaderConfig,
    registry: Option<Arc<HandlerRegistry>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    instantiator: Option<Arc<dyn ModuleInstantiator>>,
    specifiers: Option<Arc<dyn SpecifierResolver>>,
}

impl ModuleLoaderBuilder {
    /// Use `registry` instead of the process-wide one
    pub fn registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Fetch assets through `fetcher` (default: local files)
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Instantiate handler modules through `instantiator`
    pub fn instantiator(mut self, instantiator: Arc<dyn ModuleInstantiator>) -> Self {
        self.instantiator = Some(instantiator);
        self
    }

    /// Resolve specifiers through `specifiers` (default: relative to the cwd)
    pub fn specifier_resolver(mut self, specifiers: Arc<dyn SpecifierResolver>) -> Self {
        self.specifiers = Some(specifiers);
        self
    }

    /// Build the loader
    pub fn build(self) -> ModuleLoader {
        let registry = self.registry.unwrap_or_else(HandlerRegistry::global);
        let native = Arc::clone(registry.native_check());
        let fetcher = self.fetcher.unwrap_or_else(|| Arc::new(FileFetcher));
        let instantiator = self
            .instantiator
            .unwrap_or_else(|| Arc::new(StaticModuleTable::new()));
        let specifiers = self.specifiers.unwrap_or_else(|| {
            Arc::new(UrlSpecifierResolver::from_cwd().unwrap_or_else(UrlSpecifierResolver::without_base))
        });

        info!(
            "Module loader ready (policy: {}, handler timeout: {} ms, retries: {})",
            self.config.fallback_policy, self.config.handler_timeout_ms, self.config.load_retries
        );

        ModuleLoader {
            resolver: HandlerResolver::new(
                Arc::clone(&registry),
                instantiator,
                self.config.fallback_policy,
            ),
            source: SourceLoader::new(fetcher, native, &self.config),
            invoker: HandlerInvoker::new(self.config.handler_timeout()),
            cache: ModuleRecordCache::new(),
            stats: Arc::new(LoaderStats::new()),
            registry,
            specifiers,
            config: self.config,
        }
    }
}

/// Resolves typed imports into module records
pub struct ModuleLoader {
    config: LoaderConfig,
    registry: Arc<HandlerRegistry>,
    resolver: HandlerResolver,
    source: SourceLoader,
    invoker: HandlerInvoker,
    cache: ModuleRecordCache,
    specifiers: Arc<dyn SpecifierResolver>,
    stats: Arc<LoaderStats>,
}

impl ModuleLoader {
    /// Start building a loader from `config`
    pub fn builder(config: LoaderConfig) -> ModuleLoaderBuilder {
        ModuleLoaderBuilder {
            config,
            registry: None,
            fetcher: None,
            instantiator: None,
            specifiers: None,
        }
    }

    /// Import `specifier` as written in the module at `referrer`
    pub async fn import(
        &self,
        specifier: &str,
        referrer: Option<&Url>,
        assertion: ImportAssertion,
        bindings: ImportBindings,
    ) -> Result<Arc<ModuleRecord>> {
        let resolved = self.specifiers.resolve(specifier, referrer);

        // A malformed assertion is reported ahead of an unresolvable specifier
        let mut assertion = assertion;
        let shown_url = resolved.as_ref().map_or(specifier, |url| url.as_str());
        if let Err(err) = assertion.check(specifier, shown_url, &bindings) {
            self.stats.inc_imports();
            self.stats.inc_failures();
            return Err(err);
        }

        let url = match resolved {
            Ok(url) => url,
            Err(reason) => {
                self.stats.inc_imports();
                self.stats.inc_failures();
                return Err(ImportError::Load {
                    url: specifier.to_string(),
                    asserted_type: assertion.asserted_type().to_string(),
                    handler: None,
                    attempts: 0,
                    reason,
                });
            }
        };

        let request = match ImportRequest::new(specifier, url, assertion, bindings) {
            Ok(request) => request,
            Err(err) => {
                self.stats.inc_imports();
                self.stats.inc_failures();
                return Err(err);
            }
        };

        self.load(&request).await
    }

    /// Run a validated import through the pipeline
    #[instrument(skip(self, request), fields(url = %request.url(), asserted_type = %request.asserted_type()))]
    pub async fn load(&self, request: &ImportRequest) -> Result<Arc<ModuleRecord>> {
        self.stats.inc_imports();
        let mut transitions = Transitions::new();

        match self.run(request, &mut transitions).await {
            Ok(record) => {
                transitions.advance(ImportState::Completed);
                Ok(record)
            }
            Err(err) => {
                transitions.advance(ImportState::Failed);
                self.stats.inc_failures();
                warn!("Import of '{}' failed: {}", request.specifier(), err);
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        request: &ImportRequest,
        transitions: &mut Transitions,
    ) -> Result<Arc<ModuleRecord>> {
        let url = request.url();
        let asserted_type = request.asserted_type();

        transitions.advance(ImportState::ResolvingHandler);
        // A native choice waits for the mime type the source loader reports
        let resolved = if self.resolver.needs_mime_type(request.handler(), asserted_type) {
            None
        } else {
            Some(
                self.resolver
                    .resolve(request.handler(), url, asserted_type, mime::mime_from_extension(url))
                    .await?,
            )
        };

        transitions.advance(ImportState::LoadingSource);
        let asset = self
            .source
            .load(url, asserted_type, request.encoding())
            .await
            .map_err(|e| match &resolved {
                Some(descriptor) => e.with_handler(descriptor.id()),
                None => e,
            })?;
        self.stats.add_bytes(asset.bytes.len() as u64);

        let descriptor = match resolved {
            Some(descriptor) => descriptor,
            None => {
                self.resolver
                    .resolve(request.handler(), url, asserted_type, &asset.mime_type)
                    .await?
            }
        };

        let key = CacheKey::new(url.as_str(), descriptor.id(), asserted_type);
        let cached = self
            .cache
            .get(&key)
            .is_some_and(|record| record.fingerprint() == asset.fingerprint);
        transitions.advance(if cached {
            ImportState::CacheHit
        } else {
            ImportState::Invoking
        });

        let fingerprint = asset.fingerprint.clone();
        let compute = {
            let invoker = self.invoker.clone();
            let stats = Arc::clone(&self.stats);
            let descriptor: Arc<HandlerDescriptor> = Arc::clone(&descriptor);
            let key = key.clone();
            move || async move {
                stats.inc_invocations();
                invoker.invoke(&descriptor, &asset, key).await
            }
        };

        let (record, status) = self.cache.get_or_compute(key, &fingerprint, compute).await?;
        self.stats.record_status(status);
        if status != CacheStatus::Computed {
            debug!("Record for {} {}", url, status);
        }
        Ok(record)
    }

    /// Install `handler` as the registry default for `types`
    pub fn define<I, S>(&self, types: I, handler: Handler) -> Result<Arc<HandlerDescriptor>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.registry.define(types, handler)
    }

    /// Handler registry used for default lookups
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Record cache
    pub fn cache(&self) -> &ModuleRecordCache {
        &self.cache
    }

    /// Import counters
    pub fn stats(&self) -> &Arc<LoaderStats> {
        &self.stats
    }

    /// Active configuration
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::config::FallbackPolicy;
    use crate::error::ExecutionFailure;
    use crate::handler::HandlerOrigin;
    use crate::source::MemoryFetcher;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn loader(policy: FallbackPolicy) -> (Arc<MemoryFetcher>, ModuleLoader) {
        let fetcher = Arc::new(MemoryFetcher::new());
        let base = Url::parse("mem:///app/").unwrap();
        let loader = ModuleLoader::builder(LoaderConfig::new(policy))
            .registry(Arc::new(HandlerRegistry::default()))
            .fetcher(fetcher.clone())
            .specifier_resolver(Arc::new(UrlSpecifierResolver::new(base)))
            .build();
        (fetcher, loader)
    }

    #[tokio::test]
    async fn test_registry_default_import() {
        let (fetcher, loader) = loader(FallbackPolicy::RegistryOnly);
        fetcher.insert(&Url::parse("mem:///app/a.csv").unwrap(), "1,2\n3,4\n", None);
        loader.define(["csv"], builtin::csv_handler()).unwrap();

        let record = loader
            .import("./a.csv", None, ImportAssertion::new("csv"), ImportBindings::Default("rows".into()))
            .await
            .unwrap();

        assert_eq!(record.default_export(), Some(&json!([[1, 2], [3, 4]])));
        assert_eq!(record.origin(), HandlerOrigin::Registry);
        assert_eq!(loader.stats().invocations.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_repeat_import_hits_cache() {
        let (fetcher, loader) = loader(FallbackPolicy::NativeOnRegistryMiss);
        fetcher.insert(&Url::parse("mem:///app/data.json").unwrap(), r#"{"a":1}"#, None);

        let first = loader
            .import("./data.json", None, ImportAssertion::new("json"), ImportBindings::Dynamic)
            .await
            .unwrap();
        let second = loader
            .import("./data.json", None, ImportAssertion::new("json"), ImportBindings::Dynamic)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.origin(), HandlerOrigin::Native);
        assert_eq!(loader.stats().cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(loader.stats().invocations.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_load_error_carries_handler() {
        let (_, loader) = loader(FallbackPolicy::RegistryOnly);
        let handler = builtin::text_handler();
        let id = handler.id();

        let err = loader
            .import(
                "./missing.txt",
                None,
                ImportAssertion::new("text").with_handler(handler),
                ImportBindings::Default("text".into()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::Load { .. }));
        assert_eq!(err.handler(), Some(id));
        assert_eq!(loader.stats().failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_failed_invocation_is_retried_by_next_import() {
        let (fetcher, loader) = loader(FallbackPolicy::RegistryOnly);
        let url = Url::parse("mem:///app/a.txt").unwrap();
        fetcher.insert(&url, vec![0xff, 0xfe], Some("text/plain"));
        loader.define(["text"], builtin::text_handler()).unwrap();

        let err = loader
            .import("./a.txt", None, ImportAssertion::new("text"), ImportBindings::Dynamic)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::HandlerExecution { kind: ExecutionFailure::Failed, .. }
        ));

        fetcher.insert(&url, "hello", Some("text/plain"));
        let record = loader
            .import("./a.txt", None, ImportAssertion::new("text"), ImportBindings::Dynamic)
            .await
            .unwrap();
        assert_eq!(record.default_export(), Some(&json!("hello")));
        assert_eq!(loader.stats().invocations.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_unresolvable_specifier() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let loader = ModuleLoader::builder(LoaderConfig::new(FallbackPolicy::RegistryOnly))
            .registry(Arc::new(HandlerRegistry::default()))
            .fetcher(fetcher)
            .specifier_resolver(Arc::new(UrlSpecifierResolver::without_base()))
            .build();

        let err = loader
            .import("./a.csv", None, ImportAssertion::new("csv"), ImportBindings::Dynamic)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Load { attempts: 0, .. }));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ImportState::Completed.is_terminal());
        assert!(ImportState::Failed.is_terminal());
        assert!(!ImportState::CacheHit.is_terminal());
    }

    #[tokio::test]
    async fn test_malformed_assertion_reported_before_resolution() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let loader = ModuleLoader::builder(LoaderConfig::new(FallbackPolicy::RegistryOnly))
            .registry(Arc::new(HandlerRegistry::default()))
            .fetcher(fetcher)
            .specifier_resolver(Arc::new(UrlSpecifierResolver::without_base()))
            .build();

        let err = loader
            .import(
                "./a.csv",
                None,
                ImportAssertion::new("csv").with_handler_module("./csv.js"),
                ImportBindings::SideEffectOnly,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::Assertion { .. }));
        assert_eq!(err.url(), Some("./a.csv"));
        assert_eq!(err.asserted_type(), Some("csv"));
    }

    #[tokio::test]
    async fn test_native_choice_uses_transport_mime_type() {
        let (fetcher, loader) = loader(FallbackPolicy::NativeOnRegistryMiss);
        fetcher.insert(
            &Url::parse("mem:///app/api/data").unwrap(),
            r#"{"rows":2}"#,
            Some("application/json; charset=utf-8"),
        );
        fetcher.insert(&Url::parse("mem:///app/api/notes").unwrap(), "{}", Some("text/plain"));

        let record = loader
            .import("./api/data", None, ImportAssertion::new("json"), ImportBindings::Dynamic)
            .await
            .unwrap();
        assert_eq!(record.origin(), HandlerOrigin::Native);
        assert_eq!(record.default_export(), Some(&json!({ "rows": 2 })));

        let err = loader
            .import("./api/notes", None, ImportAssertion::new("json"), ImportBindings::Dynamic)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::HandlerResolution { .. }));
        assert!(err.to_string().contains("no native handler available"));
    }
}
