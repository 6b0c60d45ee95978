// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Byte fetch primitives

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Raw response from a [`Fetcher`]
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Complete asset bytes
    pub bytes: Bytes,
    /// Transport `Content-Type`, if the transport has one
    pub content_type: Option<String>,
}

impl Fetched {
    /// Response without transport metadata
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: None,
        }
    }

    /// Attach a content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Classification of a fetch failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Worth retrying
    Transient,
    /// The asset does not exist
    NotFound,
    /// The asset exists but may not be read
    PermissionDenied,
    /// Any other definitive failure
    Fatal,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchErrorKind::Transient => "transient error",
            FetchErrorKind::NotFound => "not found",
            FetchErrorKind::PermissionDenied => "permission denied",
            FetchErrorKind::Fatal => "fetch failed",
        };
        f.write_str(s)
    }
}

/// A failed fetch
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct FetchError {
    /// Failure class
    pub kind: FetchErrorKind,
    /// Transport message
    pub message: String,
}

impl FetchError {
    /// Create a fetch error
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A retryable failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Transient, message)
    }

    /// A missing asset
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::NotFound, message)
    }

    /// Whether retrying could help
    pub fn is_transient(&self) -> bool {
        self.kind == FetchErrorKind::Transient
    }
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => FetchErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => FetchErrorKind::PermissionDenied,
            io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => FetchErrorKind::Transient,
            _ => FetchErrorKind::Fatal,
        };
        Self::new(kind, err.to_string())
    }
}

/// Host byte-fetch primitive
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch the complete contents of `url`
    async fn fetch(&self, url: &Url) -> Result<Fetched, FetchError>;
}

/// Reads `file:` urls from the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FileFetcher;

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, url: &Url) -> Result<Fetched, FetchError> {
        if url.scheme() != "file" {
            return Err(FetchError::new(
                FetchErrorKind::Fatal,
                format!("unsupported url scheme '{}'", url.scheme()),
            ));
        }
        let path = url
            .to_file_path()
            .map_err(|_| FetchError::new(FetchErrorKind::Fatal, format!("not a local path: {}", url)))?;

        debug!("Reading {}", path.display());
        let bytes = tokio::fs::read(&path).await?;
        Ok(Fetched::new(bytes))
    }
}

/// In-memory url table, useful for embedded assets
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    assets: DashMap<String, Fetched>,
    fetches: AtomicUsize,
}

impl MemoryFetcher {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the asset at `url`
    pub fn insert(&self, url: &Url, bytes: impl Into<Bytes>, content_type: Option<&str>) {
        let mut fetched = Fetched::new(bytes);
        if let Some(ct) = content_type {
            fetched = fetched.with_content_type(ct);
        }
        self.assets.insert(url.as_str().to_string(), fetched);
    }

    /// Remove the asset at `url`
    pub fn remove(&self, url: &Url) -> bool {
        self.assets.remove(url.as_str()).is_some()
    }

    /// Number of fetches served or refused so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, url: &Url) -> Result<Fetched, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.assets
            .get(url.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FetchError::not_found(url.as_str()))
    }
}
