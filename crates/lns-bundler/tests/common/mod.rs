// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared fixtures for bundler integration tests.

#![allow(dead_code)] // Not every test binary uses every fixture

use futures::future::{BoxFuture, FutureExt};
use lns_bundler::store::StoreResult;
use lns_bundler::{
    BundlerConfig, CloseConnectionRequest, CloseError, ConnectionCloser, FunctionBundler,
    GatewayId, InMemoryStore, KeyedStore, StoreError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn gw(id: &str) -> GatewayId {
    GatewayId::new(id).unwrap()
}

/// Close requests seen by [`RecordingCloser`].
pub type CloseLog = mpsc::UnboundedReceiver<(GatewayId, CloseConnectionRequest)>;

/// Records every close request.
pub struct RecordingCloser {
    tx: mpsc::UnboundedSender<(GatewayId, CloseConnectionRequest)>,
}

impl RecordingCloser {
    pub fn new() -> (Arc<Self>, CloseLog) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ConnectionCloser for RecordingCloser {
    fn close_device_connection<'a>(
        &'a self,
        gateway: &'a GatewayId,
        request: CloseConnectionRequest,
    ) -> BoxFuture<'a, Result<(), CloseError>> {
        let _ = self.tx.send((gateway.clone(), request));
        futures::future::ready(Ok(())).boxed()
    }
}

/// Fails every operation on keys ending with `suffix`.
pub struct FlakyStore {
    inner: InMemoryStore,
    suffix: &'static str,
}

impl FlakyStore {
    pub fn new(suffix: &'static str) -> Self {
        Self {
            inner: InMemoryStore::new(),
            suffix,
        }
    }

    fn check(&self, key: &str) -> StoreResult<()> {
        if key.ends_with(self.suffix) {
            Err(StoreError::Unavailable(format!("{} is down", self.suffix)))
        } else {
            Ok(())
        }
    }
}

impl KeyedStore for FlakyStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>> {
        async move {
            self.check(key)?;
            self.inner.get(key).await
        }
        .boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, StoreResult<()>> {
        async move {
            self.check(key)?;
            self.inner.set(key, value, ttl).await
        }
        .boxed()
    }

    fn compare_and_set<'a>(
        &'a self,
        key: &'a str,
        expected: Option<&'a [u8]>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        async move {
            self.check(key)?;
            self.inner.compare_and_set(key, expected, value, ttl).await
        }
        .boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        async move {
            self.check(key)?;
            self.inner.delete(key).await
        }
        .boxed()
    }
}

/// Delays every read of keys ending with `suffix`.
pub struct SlowStore {
    pub inner: InMemoryStore,
    suffix: &'static str,
    delay: Duration,
}

impl SlowStore {
    pub fn new(suffix: &'static str, delay: Duration) -> Self {
        Self {
            inner: InMemoryStore::new(),
            suffix,
            delay,
        }
    }
}

impl KeyedStore for SlowStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>> {
        async move {
            if key.ends_with(self.suffix) {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.get(key).await
        }
        .boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.set(key, value, ttl)
    }

    fn compare_and_set<'a>(
        &'a self,
        key: &'a str,
        expected: Option<&'a [u8]>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        self.inner.compare_and_set(key, expected, value, ttl)
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.delete(key)
    }
}

/// Bundler with default configuration over `store`.
pub fn bundler_over(
    store: Arc<dyn KeyedStore>,
    closer: Arc<dyn ConnectionCloser>,
) -> FunctionBundler {
    FunctionBundler::with_standard_strategy(&BundlerConfig::default(), store, closer)
}

/// Bundler over a fresh in-memory store, plus the store and a close log.
pub fn bundler() -> (FunctionBundler, Arc<InMemoryStore>, CloseLog) {
    let store = Arc::new(InMemoryStore::new());
    let (closer, log) = RecordingCloser::new();
    (bundler_over(store.clone(), closer), store, log)
}
