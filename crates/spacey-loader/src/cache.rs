// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module record cache with single-flight computation
//!
//! Records are keyed by (url, handler identity, asserted type). While a
//! record is being computed, every other request for the same key joins the
//! same computation instead of starting its own. Computations run on their
//! own task, so a requester that goes away does not cancel the work for the
//! others; the finished record is still stored.
//!
//! Failed computations are never stored: the next request starts over.

use crate::error::{ExecutionFailure, ImportError, Result};
use crate::record::{CacheKey, ModuleRecord};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type SharedRecord = Shared<BoxFuture<'static, Result<Arc<ModuleRecord>>>>;

enum CacheEntry {
    Ready(Arc<ModuleRecord>),
    InFlight {
        generation: u64,
        fingerprint: String,
        future: SharedRecord,
    },
}

/// How a cached lookup was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// A finished record was already stored
    Hit,
    /// Joined a computation started by another request
    Joined,
    /// This request started the computation
    Computed,
}

impl CacheStatus {
    /// Status name
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Joined => "joined",
            CacheStatus::Computed => "computed",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Lookup {
    Hit(Arc<ModuleRecord>),
    Join(SharedRecord),
    Conflict(String),
    Start,
}

struct CacheInner {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    generation: AtomicU64,
}

impl CacheInner {
    /// Publish the outcome of computation `generation`, unless the entry was
    /// cleared or replaced in the meantime
    fn complete(&self, key: &CacheKey, generation: u64, outcome: &Result<Arc<ModuleRecord>>) {
        let mut entries = self.entries.lock();
        let current = matches!(
            entries.get(key),
            Some(CacheEntry::InFlight { generation: g, .. }) if *g == generation
        );
        if !current {
            debug!("Dropping outcome of superseded computation for {}", key);
            return;
        }

        match outcome {
            Ok(record) => {
                // A new handler identity for the same url and type replaces the old records
                entries.retain(|k, entry| {
                    !(matches!(entry, CacheEntry::Ready(_))
                        && k.url == key.url
                        && k.asserted_type == key.asserted_type
                        && k.handler != key.handler)
                });
                entries.insert(key.clone(), CacheEntry::Ready(Arc::clone(record)));
                debug!("Cached {}", key);
            }
            Err(_) => {
                entries.remove(key);
                debug!("Discarded failed computation for {}", key);
            }
        }
    }
}

/// Shared cache of module records
#[derive(Clone)]
pub struct ModuleRecordCache {
    inner: Arc<CacheInner>,
}

impl ModuleRecordCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Return the record for `key`, computing it at most once.
    ///
    /// `fingerprint` identifies the bytes the requester loaded. A stored
    /// record built from other bytes is recomputed; a computation in flight
    /// for other bytes is a [`ImportError::CacheConsistency`] error.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        fingerprint: &str,
        compute: F,
    ) -> Result<(Arc<ModuleRecord>, CacheStatus)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ModuleRecord>> + Send + 'static,
    {
        let (future, status) = {
            let mut entries = self.inner.entries.lock();
            let lookup = match entries.get(&key) {
                Some(CacheEntry::Ready(record)) if record.fingerprint() == fingerprint => {
                    Lookup::Hit(Arc::clone(record))
                }
                Some(CacheEntry::Ready(_)) => {
                    debug!("Source of {} changed, recomputing", key);
                    Lookup::Start
                }
                Some(CacheEntry::InFlight {
                    fingerprint: expected,
                    future,
                    ..
                }) => {
                    if expected == fingerprint {
                        Lookup::Join(future.clone())
                    } else {
                        Lookup::Conflict(expected.clone())
                    }
                }
                None => Lookup::Start,
            };

            match lookup {
                Lookup::Hit(record) => return Ok((record, CacheStatus::Hit)),
                Lookup::Conflict(expected) => {
                    return Err(ImportError::CacheConsistency {
                        url: key.url.clone(),
                        asserted_type: key.asserted_type.clone(),
                        handler: key.handler,
                        expected,
                        actual: fingerprint.to_string(),
                    });
                }
                Lookup::Join(future) => (future, CacheStatus::Joined),
                Lookup::Start => {
                    let (generation, future) = self.start(&key, compute());
                    entries.insert(
                        key.clone(),
                        CacheEntry::InFlight {
                            generation,
                            fingerprint: fingerprint.to_string(),
                            future: future.clone(),
                        },
                    );
                    (future, CacheStatus::Computed)
                }
            }
        };

        debug!(status = %status, "Awaiting record for {}", key);
        future.await.map(|record| (record, status))
    }

    /// Spawn the computation. Must be called with the entry lock held so the
    /// task cannot publish before its in-flight marker exists.
    fn start<Fut>(&self, key: &CacheKey, compute: Fut) -> (u64, SharedRecord)
    where
        Fut: Future<Output = Result<ModuleRecord>> + Send + 'static,
    {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let outcome = compute.await.map(Arc::new);
            inner.complete(&task_key, generation, &outcome);
            outcome
        });

        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        let future = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    let kind = if join_err.is_panic() {
                        ExecutionFailure::Panicked
                    } else {
                        ExecutionFailure::Cancelled
                    };
                    let err = ImportError::HandlerExecution {
                        url: key.url.clone(),
                        asserted_type: key.asserted_type.clone(),
                        handler: key.handler,
                        kind,
                        message: join_err.to_string(),
                        detail: None,
                    };
                    inner.complete(&key, generation, &Err(err.clone()));
                    Err(err)
                }
            }
        }
        .boxed()
        .shared();

        (generation, future)
    }

    /// Finished record for `key`, if stored
    pub fn get(&self, key: &CacheKey) -> Option<Arc<ModuleRecord>> {
        match self.inner.entries.lock().get(key) {
            Some(CacheEntry::Ready(record)) => Some(Arc::clone(record)),
            _ => None,
        }
    }

    /// Drop every stored record. Computations in flight finish for their
    /// requesters but are not stored.
    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    /// Drop all entries for `url`, returning how many were removed
    pub fn invalidate_url(&self, url: &str) -> usize {
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| key.url != url);
        before - entries.len()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .filter(|entry| matches!(entry, CacheEntry::Ready(_)))
            .count()
    }

    /// Whether no records are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of computations currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .filter(|entry| matches!(entry, CacheEntry::InFlight { .. }))
            .count()
    }
}

impl Default for ModuleRecordCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModuleRecordCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecordCache")
            .field("records", &self.len())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}
