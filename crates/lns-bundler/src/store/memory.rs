// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process keyed store.
//!
//! Backed by a sharded `DashMap`: a compare-and-set holds the write lock of
//! one shard only, so unrelated devices never serialize behind each other.
//! Expired entries are dropped lazily on access and by [`InMemoryStore::remove_expired`].

use super::{KeyedStore, StoreResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn new(bytes: Vec<u8>, ttl: Duration) -> Self {
        Self {
            bytes,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Sharded in-memory [`KeyedStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of stored entries (expired entries not yet swept included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries and return how many were removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Spawn a task sweeping expired entries every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let removed = store.remove_expired();
                        if removed > 0 {
                            debug!("Swept {} expired store entries", removed);
                        }
                    }
                    _ = shutdown.notified() => {
                        debug!("Store sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn get_now(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return None,
            Some(v) if !v.is_expired(now) => return Some(v.bytes.clone()),
            Some(_) => {}
        }
        self.entries.remove_if(key, |_, v| v.is_expired(now));
        None
    }

    fn compare_and_set_now(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> bool {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let live = (!current.is_expired(now)).then_some(current.bytes.as_slice());
                if live != expected {
                    return false;
                }
                occupied.insert(StoredValue::new(value, ttl));
                true
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return false;
                }
                vacant.insert(StoredValue::new(value, ttl));
                true
            }
        }
    }
}

impl KeyedStore for InMemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>> {
        future::ready(Ok(self.get_now(key))).boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, StoreResult<()>> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        future::ready(Ok(())).boxed()
    }

    fn compare_and_set<'a>(
        &'a self,
        key: &'a str,
        expected: Option<&'a [u8]>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        future::ready(Ok(self.compare_and_set_now(key, expected, value, ttl))).boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        self.entries.remove(key);
        future::ready(Ok(())).boxed()
    }
}
