// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Import requests and assertion validation
//!
//! An import site looks like
//!
//! ```text
//! import rows from './a.csv' with { type: 'csv', handler: './csv-handler.js' };
//! ```
//!
//! The `with { .. }` part becomes an [`ImportAssertion`], the binding list an
//! [`ImportBindings`], and both are validated into an [`ImportRequest`].

use crate::error::{ImportError, Result};
use crate::handler::Handler;
use std::fmt;
use std::path::Path;
use url::Url;

/// Which handler an import asks for
#[derive(Clone)]
pub enum HandlerReference {
    /// Callable supplied at the import site
    Inline(Handler),
    /// Path of a handler module whose default export is the handler
    External(String),
    /// No handler named; the registry decides
    Absent,
}

impl HandlerReference {
    /// Whether the import named a handler explicitly
    pub fn is_explicit(&self) -> bool {
        !matches!(self, HandlerReference::Absent)
    }
}

impl fmt::Debug for HandlerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerReference::Inline(handler) => {
                write!(f, "Inline({} {})", handler.name(), handler.id())
            }
            HandlerReference::External(path) => write!(f, "External({:?})", path),
            HandlerReference::Absent => f.write_str("Absent"),
        }
    }
}

/// The `{ type, handler }` metadata of an import
#[derive(Debug, Clone)]
pub struct ImportAssertion {
    asserted_type: String,
    handler: HandlerReference,
    encoding: Option<String>,
}

impl ImportAssertion {
    /// Assertion with a type and no handler
    pub fn new(asserted_type: impl Into<String>) -> Self {
        Self {
            asserted_type: asserted_type.into(),
            handler: HandlerReference::Absent,
            encoding: None,
        }
    }

    /// Use an inline handler
    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handler = HandlerReference::Inline(handler);
        self
    }

    /// Use the default export of the handler module at `path`
    pub fn with_handler_module(mut self, path: impl Into<String>) -> Self {
        self.handler = HandlerReference::External(path.into());
        self
    }

    /// Request a text encoding (or `blob`)
    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    /// Build an assertion from raw key/value pairs as written at the import
    /// site. Recognized keys are `type`, `handler` and `encoding`.
    pub fn from_pairs<I, K, V>(specifier: &str, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut asserted_type: Option<String> = None;
        let mut handler: Option<String> = None;
        let mut encoding: Option<String> = None;
        let mut rejected: Option<String> = None;

        for (key, value) in pairs {
            let key = key.as_ref();
            let slot = match key {
                "type" => &mut asserted_type,
                "handler" => &mut handler,
                "encoding" => &mut encoding,
                other => {
                    rejected = Some(format!("unsupported assertion key '{}'", other));
                    break;
                }
            };
            if slot.is_some() {
                rejected = Some(format!("duplicate assertion key '{}'", key));
                break;
            }
            *slot = Some(value.into());
        }

        // Not resolved yet, so the specifier stands in for the url
        if let Some(reason) = rejected {
            let asserted_type = asserted_type.unwrap_or_default();
            return Err(ImportError::assertion(specifier, specifier, asserted_type, reason));
        }
        let asserted_type = asserted_type.ok_or_else(|| {
            ImportError::assertion(specifier, specifier, "", "missing required 'type' key")
        })?;

        Ok(Self {
            asserted_type,
            handler: handler.map_or(HandlerReference::Absent, HandlerReference::External),
            encoding,
        })
    }

    /// Check the assertion against the import's bindings, trimming the type.
    /// `url` is reported in errors.
    pub(crate) fn check(&mut self, specifier: &str, url: &str, bindings: &ImportBindings) -> Result<()> {
        let trimmed = self.asserted_type.trim();
        if trimmed.is_empty() {
            return Err(ImportError::assertion(specifier, url, "", "'type' must not be empty"));
        }
        self.asserted_type = trimmed.to_string();
        let fail = |reason: &str| ImportError::assertion(specifier, url, &self.asserted_type, reason);

        if let HandlerReference::External(path) = &self.handler {
            if path.trim().is_empty() {
                return Err(fail("'handler' module path must not be empty"));
            }
        }

        if self.handler.is_explicit() && *bindings == ImportBindings::SideEffectOnly {
            return Err(fail("a side-effect-only import cannot assert a handler"));
        }

        if let ImportBindings::Named(names) = bindings {
            if names.is_empty() || names.iter().any(|n| n.trim().is_empty()) {
                return Err(fail("named imports must list at least one non-empty name"));
            }
        }

        Ok(())
    }

    /// Asserted type
    pub fn asserted_type(&self) -> &str {
        &self.asserted_type
    }

    /// Handler reference
    pub fn handler(&self) -> &HandlerReference {
        &self.handler
    }

    /// Requested encoding
    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }
}

/// What an import binds in the importing module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportBindings {
    /// `import './a.csv'`
    SideEffectOnly,
    /// `import rows from './a.csv'`
    Default(String),
    /// `import { rows, columns } from './a.csv'`
    Named(Vec<String>),
    /// `import * as sheet from './a.csv'`
    Namespace(String),
    /// `import('./a.csv', ..)`, which yields the namespace
    Dynamic,
}

/// A validated import, immutable once created
#[derive(Debug, Clone)]
pub struct ImportRequest {
    specifier: String,
    url: Url,
    assertion: ImportAssertion,
    bindings: ImportBindings,
}

impl ImportRequest {
    /// Validate an import.
    ///
    /// Rejects an empty type, an empty handler module path, and a
    /// side-effect-only import that names a handler.
    pub fn new(
        specifier: impl Into<String>,
        url: Url,
        mut assertion: ImportAssertion,
        bindings: ImportBindings,
    ) -> Result<Self> {
        let specifier = specifier.into();
        assertion.check(&specifier, url.as_str(), &bindings)?;

        Ok(Self {
            specifier,
            url,
            assertion,
            bindings,
        })
    }

    /// Specifier as written
    pub fn specifier(&self) -> &str {
        &self.specifier
    }

    /// Resolved url
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Asserted type
    pub fn asserted_type(&self) -> &str {
        self.assertion.asserted_type()
    }

    /// Handler reference
    pub fn handler(&self) -> &HandlerReference {
        self.assertion.handler()
    }

    /// Requested encoding
    pub fn encoding(&self) -> Option<&str> {
        self.assertion.encoding()
    }

    /// Import bindings
    pub fn bindings(&self) -> &ImportBindings {
        &self.bindings
    }
}

/// Host specifier -> url resolution
pub trait SpecifierResolver: Send + Sync + 'static {
    /// Resolve `specifier` relative to `referrer` (or the resolver's base)
    fn resolve(&self, specifier: &str, referrer: Option<&Url>) -> std::result::Result<Url, String>;
}

/// Url-based resolution: absolute urls pass through, absolute paths become
/// `file:` urls, everything else is joined onto the referrer or base url
#[derive(Debug, Clone, Default)]
pub struct UrlSpecifierResolver {
    base: Option<Url>,
}

impl UrlSpecifierResolver {
    /// Resolve relative specifiers against `base`
    pub fn new(base: Url) -> Self {
        Self { base: Some(base) }
    }

    /// Resolver without a base url; relative specifiers need a referrer
    pub fn without_base() -> Self {
        Self::default()
    }

    /// Resolve relative specifiers against a directory
    pub fn from_directory(dir: &Path) -> Option<Self> {
        Url::from_directory_path(dir).ok().map(Self::new)
    }

    /// Resolve relative specifiers against the current working directory
    pub fn from_cwd() -> Option<Self> {
        let cwd = std::env::current_dir().ok()?;
        Self::from_directory(&cwd)
    }
}

impl SpecifierResolver for UrlSpecifierResolver {
    fn resolve(&self, specifier: &str, referrer: Option<&Url>) -> std::result::Result<Url, String> {
        if specifier.is_empty() {
            return Err("empty specifier".to_string());
        }

        // Single-letter schemes are Windows drive letters, not urls
        if let Ok(url) = Url::parse(specifier) {
            if url.scheme().len() > 1 {
                return Ok(url);
            }
        }

        let path = Path::new(specifier);
        if path.is_absolute() {
            return Url::from_file_path(path)
                .map_err(|_| format!("cannot convert '{}' to a file url", specifier));
        }

        referrer
            .or(self.base.as_ref())
            .ok_or_else(|| format!("cannot resolve '{}' without a referrer", specifier))?
            .join(specifier)
            .map_err(|e| format!("cannot resolve '{}': {}", specifier, e))
    }
}
