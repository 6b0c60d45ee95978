// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for the import pipeline
//!
//! Every failure rejects the import that caused it. Errors carry the url,
//! the asserted type and (once resolved) the handler identity so a failed
//! import can be traced back to the code that produced it.

use crate::handler::HandlerId;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for import operations
pub type Result<T> = std::result::Result<T, ImportError>;

/// How a handler invocation went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// The handler returned an error
    Failed,
    /// The handler panicked
    Panicked,
    /// The handler did not finish within the configured timeout
    TimedOut,
    /// The handler returned something that is not a module mapping
    InvalidShape,
    /// The task running the handler was cancelled by the runtime
    Cancelled,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionFailure::Failed => "failed",
            ExecutionFailure::Panicked => "panicked",
            ExecutionFailure::TimedOut => "timed out",
            ExecutionFailure::InvalidShape => "returned an invalid module shape",
            ExecutionFailure::Cancelled => "was cancelled",
        };
        f.write_str(s)
    }
}

/// Errors that can reject an import
#[derive(Debug, Clone, Error)]
pub enum ImportError {
    /// Malformed or disallowed import assertion
    #[error("AssertionError: {reason} (import '{specifier}', url: {url}, type: '{asserted_type}')")]
    Assertion {
        /// Specifier as written at the import site
        specifier: String,
        /// Resolved asset url, or the specifier when it is not resolvable
        url: String,
        /// Asserted import type as written, empty when missing
        asserted_type: String,
        /// What is wrong with the assertion
        reason: String,
    },

    /// No usable handler, or a malformed handler module
    #[error("HandlerResolutionError: {reason} (url: {url}, type: '{asserted_type}')")]
    HandlerResolution {
        /// Resolved asset url
        url: String,
        /// Asserted import type
        asserted_type: String,
        /// Handler identity, when one was found but rejected
        handler: Option<HandlerId>,
        /// Why resolution failed
        reason: String,
    },

    /// Asset unreachable or unreadable
    #[error("LoadError: could not load {url} after {attempts} attempt(s): {reason}")]
    Load {
        /// Resolved asset url
        url: String,
        /// Asserted import type
        asserted_type: String,
        /// Handler identity, when resolution already succeeded
        handler: Option<HandlerId>,
        /// Number of fetch attempts made
        attempts: u32,
        /// Last transport error
        reason: String,
    },

    /// Handler failed, panicked, timed out or returned a non-module value
    #[error("HandlerExecutionError: handler {handler} {kind} for {url} (type: '{asserted_type}'): {message}")]
    HandlerExecution {
        /// Resolved asset url
        url: String,
        /// Asserted import type
        asserted_type: String,
        /// Identity of the handler that was invoked
        handler: HandlerId,
        /// Failure category
        kind: ExecutionFailure,
        /// Original error message
        message: String,
        /// Full error chain / panic payload when available
        detail: Option<String>,
    },

    /// The asset changed while a cached or in-flight record was being shared
    #[error(
        "CacheConsistencyError: {url} (type: '{asserted_type}', handler {handler}) changed from {expected} to {actual}"
    )]
    CacheConsistency {
        /// Resolved asset url
        url: String,
        /// Asserted import type
        asserted_type: String,
        /// Handler identity of the cache entry
        handler: HandlerId,
        /// Fingerprint the cache entry was built from
        expected: String,
        /// Fingerprint observed by the requester
        actual: String,
    },

    /// Invalid registry definition
    #[error("RegistryError: {0}")]
    Registry(String),
}

impl ImportError {
    /// Create an assertion error
    pub fn assertion(
        specifier: impl Into<String>,
        url: impl Into<String>,
        asserted_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Assertion {
            specifier: specifier.into(),
            url: url.into(),
            asserted_type: asserted_type.into(),
            reason: reason.into(),
        }
    }

    /// Create a handler resolution error
    pub fn resolution(
        url: impl Into<String>,
        asserted_type: impl Into<String>,
        handler: Option<HandlerId>,
        reason: impl Into<String>,
    ) -> Self {
        Self::HandlerResolution {
            url: url.into(),
            asserted_type: asserted_type.into(),
            handler,
            reason: reason.into(),
        }
    }

    /// Create a registry error
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Attach a handler identity to errors raised before the handler was known
    pub fn with_handler(self, id: HandlerId) -> Self {
        match self {
            Self::Load {
                url,
                asserted_type,
                handler: None,
                attempts,
                reason,
            } => Self::Load {
                url,
                asserted_type,
                handler: Some(id),
                attempts,
                reason,
            },
            other => other,
        }
    }

    /// Url of the failed import, if the error is tied to one
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Assertion { url, .. }
            | Self::HandlerResolution { url, .. }
            | Self::Load { url, .. }
            | Self::HandlerExecution { url, .. }
            | Self::CacheConsistency { url, .. } => Some(url),
            Self::Registry(_) => None,
        }
    }

    /// Asserted type of the failed import, if known
    pub fn asserted_type(&self) -> Option<&str> {
        match self {
            Self::Assertion { asserted_type, .. }
            | Self::HandlerResolution { asserted_type, .. }
            | Self::Load { asserted_type, .. }
            | Self::HandlerExecution { asserted_type, .. }
            | Self::CacheConsistency { asserted_type, .. } => Some(asserted_type),
            Self::Registry(_) => None,
        }
    }

    /// Identity of the handler involved, if resolution got that far
    pub fn handler(&self) -> Option<HandlerId> {
        match self {
            Self::HandlerResolution { handler, .. } | Self::Load { handler, .. } => *handler,
            Self::HandlerExecution { handler, .. } | Self::CacheConsistency { handler, .. } => {
                Some(*handler)
            }
            Self::Assertion { .. } | Self::Registry(_) => None,
        }
    }
}

/// Errors raised while loading [`LoaderConfig`](crate::config::LoaderConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Cannot read config file {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML or has unknown keys
    #[error("Invalid config file {path}: {source}")]
    Parse {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },

    /// A key was given a value it cannot hold
    #[error("Invalid value for '{key}': {value}")]
    InvalidValue {
        /// Config key
        key: String,
        /// Rejected value
        value: String,
    },

    /// Unknown configuration key
    #[error("Unknown config key '{0}'")]
    UnknownKey(String),

    /// No layer chose a fallback policy
    #[error("No fallback policy configured: set 'fallback_policy' to one of registry-only, native-on-registry-miss, prefer-native")]
    MissingPolicy,
}
