// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Handler contract and descriptors
//!
//! A handler turns the raw bytes of an asset into a module-like mapping:
//!
//! ```rust,ignore
//! use spacey_loader::{Handler, HandlerContext};
//! use serde_json::json;
//!
//! let upper = Handler::from_fn("upper", |bytes: &[u8], ctx: &HandlerContext| {
//!     let text = ctx.decode_text(bytes)?;
//!     Ok(json!({ "default": text.to_uppercase() }))
//! });
//! ```

use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static HANDLER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a handler, part of every cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Allocate a process-unique identity
    pub fn next() -> Self {
        Self(HANDLER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Derive an identity from where a handler came from.
    ///
    /// The same origin and key always produce the same id. Derived ids have
    /// the top bit set so they never collide with allocated ones.
    pub fn derive(origin: HandlerOrigin, key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(origin.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(raw) | (1 << 63))
    }

    /// Wrap a raw id
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:016x}", self.0)
    }
}

/// Where a handler descriptor came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerOrigin {
    /// Callable passed directly at the import site
    Inline,
    /// Default export of an external handler module
    ExternalModule,
    /// Default registered for the asserted type
    Registry,
    /// Host-provided handler chosen by the fallback policy
    Native,
}

impl HandlerOrigin {
    /// Origin tag as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerOrigin::Inline => "inline",
            HandlerOrigin::ExternalModule => "external-module",
            HandlerOrigin::Registry => "registry",
            HandlerOrigin::Native => "native",
        }
    }
}

impl fmt::Display for HandlerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the raw bytes of an asset should be interpreted
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Opaque binary data
    Blob,
    /// Text in the named encoding (lowercase label, e.g. `utf-8`)
    Text(String),
}

impl Encoding {
    /// Text encoding from a label, normalized to lowercase
    pub fn text(label: &str) -> Self {
        Encoding::Text(label.trim().to_ascii_lowercase())
    }

    /// Encoding name, `blob` for binary data
    pub fn as_str(&self) -> &str {
        match self {
            Encoding::Blob => "blob",
            Encoding::Text(label) => label,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context passed to every handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerContext {
    /// Resolved asset url
    pub url: String,
    /// Asserted import type
    pub asserted_type: String,
    /// Inferred mime type
    pub mime_type: String,
    /// Inferred or requested encoding
    pub encoding: Encoding,
    /// Whether the host could have handled this type itself
    pub native_handler_available: bool,
}

impl HandlerContext {
    /// Decode bytes as text according to the context encoding.
    ///
    /// Blobs are decoded as UTF-8.
    pub fn decode_text<'a>(&self, bytes: &'a [u8]) -> anyhow::Result<Cow<'a, str>> {
        match self.encoding.as_str() {
            "blob" | "utf-8" | "utf8" | "us-ascii" | "ascii" => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| anyhow::anyhow!("{} is not valid UTF-8: {}", self.url, e))?;
                Ok(Cow::Borrowed(text.strip_prefix('\u{feff}').unwrap_or(text)))
            }
            "iso-8859-1" | "latin1" | "latin-1" => {
                Ok(Cow::Owned(bytes.iter().map(|&b| b as char).collect()))
            }
            other => anyhow::bail!("unsupported text encoding '{}'", other),
        }
    }
}

/// Code that converts raw asset bytes into a module mapping
pub trait ImportHandler: Send + Sync + 'static {
    /// Decode `bytes`; the returned value must be a plain mapping
    fn call(&self, bytes: Bytes, ctx: HandlerContext) -> BoxFuture<'static, anyhow::Result<Value>>;
}

impl<F, Fut> ImportHandler for F
where
    F: Fn(Bytes, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn call(&self, bytes: Bytes, ctx: HandlerContext) -> BoxFuture<'static, anyhow::Result<Value>> {
        Box::pin((self)(bytes, ctx))
    }
}

/// A callable handler with an identity.
///
/// Clones share the same identity, so reusing one `Handler` across imports
/// lets them share cache entries.
#[derive(Clone)]
pub struct Handler {
    id: HandlerId,
    name: Arc<str>,
    supported_types: BTreeSet<String>,
    inner: Arc<dyn ImportHandler>,
}

impl Handler {
    /// Wrap an async handler
    pub fn new(name: impl Into<String>, handler: impl ImportHandler) -> Self {
        Self {
            id: HandlerId::next(),
            name: Arc::from(name.into()),
            supported_types: BTreeSet::new(),
            inner: Arc::new(handler),
        }
    }

    /// Wrap a synchronous handler function
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[u8], &HandlerContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, move |bytes: Bytes, ctx: HandlerContext| {
            let f = Arc::clone(&f);
            async move { f(&bytes, &ctx) }
        })
    }

    /// Restrict the handler to the given types (empty means any type)
    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Handler identity
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Types the handler declares support for
    pub fn supported_types(&self) -> &BTreeSet<String> {
        &self.supported_types
    }

    /// Whether the handler accepts `asserted_type`
    pub fn supports(&self, asserted_type: &str) -> bool {
        self.supported_types.is_empty() || self.supported_types.contains(asserted_type)
    }

    /// Run the handler
    pub fn call(&self, bytes: Bytes, ctx: HandlerContext) -> BoxFuture<'static, anyhow::Result<Value>> {
        self.inner.call(bytes, ctx)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("supported_types", &self.supported_types)
            .finish_non_exhaustive()
    }
}

/// A resolved handler, ready to invoke
#[derive(Debug, Clone)]
pub struct HandlerDescriptor {
    id: HandlerId,
    origin: HandlerOrigin,
    supported_types: BTreeSet<String>,
    handler: Handler,
    module_path: Option<String>,
}

impl HandlerDescriptor {
    /// Descriptor for a callable given at the import site
    pub fn inline(handler: Handler) -> Self {
        Self {
            id: handler.id(),
            origin: HandlerOrigin::Inline,
            supported_types: handler.supported_types().clone(),
            handler,
            module_path: None,
        }
    }

    /// Descriptor for a registry default covering `types`
    pub fn registry(handler: Handler, types: &[String]) -> Self {
        let mut supported_types = handler.supported_types().clone();
        supported_types.extend(types.iter().cloned());
        Self {
            id: handler.id(),
            origin: HandlerOrigin::Registry,
            supported_types,
            handler,
            module_path: None,
        }
    }

    /// Descriptor for the default export of the handler module at `path`
    pub fn external(path: &str, handler: Handler, supported_types: BTreeSet<String>) -> Self {
        Self {
            id: HandlerId::derive(HandlerOrigin::ExternalModule, path),
            origin: HandlerOrigin::ExternalModule,
            supported_types,
            handler,
            module_path: Some(path.to_string()),
        }
    }

    /// Descriptor for a host-provided handler
    pub fn native(handler: Handler) -> Self {
        Self {
            id: handler.id(),
            origin: HandlerOrigin::Native,
            supported_types: handler.supported_types().clone(),
            handler,
            module_path: None,
        }
    }

    /// Identity used in cache keys
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Origin tag
    pub fn origin(&self) -> HandlerOrigin {
        self.origin
    }

    /// Types this descriptor accepts (empty means any)
    pub fn supported_types(&self) -> &BTreeSet<String> {
        &self.supported_types
    }

    /// Whether the descriptor accepts `asserted_type`
    pub fn supports(&self, asserted_type: &str) -> bool {
        self.supported_types.is_empty() || self.supported_types.contains(asserted_type)
    }

    /// Underlying callable
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Handler module path for external-module descriptors
    pub fn module_path(&self) -> Option<&str> {
        self.module_path.as_deref()
    }
}
