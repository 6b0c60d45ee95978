// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Loader counters

use crate::cache::CacheStatus;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Import statistics
#[derive(Debug, Default)]
pub struct LoaderStats {
    /// Imports requested
    pub imports: AtomicUsize,
    /// Imports answered from a stored record
    pub cache_hits: AtomicUsize,
    /// Imports that joined an in-flight computation
    pub joined: AtomicUsize,
    /// Handler invocations started
    pub invocations: AtomicUsize,
    /// Imports that were rejected
    pub failures: AtomicUsize,
    /// Source bytes loaded
    pub bytes_loaded: AtomicU64,
}

impl LoaderStats {
    /// Zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_imports(&self) {
        self.imports.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_invocations(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes(&self, bytes: u64) {
        self.bytes_loaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_status(&self, status: CacheStatus) {
        match status {
            CacheStatus::Hit => self.cache_hits.fetch_add(1, Ordering::Relaxed),
            CacheStatus::Joined => self.joined.fetch_add(1, Ordering::Relaxed),
            CacheStatus::Computed => 0,
        };
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        format!(
            "Imports: {}, Cache hits: {}, Joined: {}, Invocations: {}, Failed: {}, Bytes loaded: {}",
            self.imports.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.joined.load(Ordering::Relaxed),
            self.invocations.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
            format_bytes(self.bytes_loaded.load(Ordering::Relaxed)),
        )
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
