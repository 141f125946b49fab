// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared keyed store abstraction
//!
//! Every network-server instance sees the same store (conceptually a
//! distributed cache). Per-device records are linearized through
//! [`KeyedStore::compare_and_set`]; there is no cross-key locking.
//!
//! # Implementations
//!
//! - [`InMemoryStore`] -- sharded in-process map with TTL eviction

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub mod memory;

pub use memory::InMemoryStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store operation timed out")]
    Timeout,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("codec error: {0}")]
    Codec(String),

    /// Compare-and-set lost the race on every attempt.
    #[error("contention on key '{key}' after {attempts} attempts")]
    Contention { key: String, attempts: u32 },
}

/// TTL-capable key/value store with atomic compare-and-set per key.
///
/// Absent and expired keys are indistinguishable.
pub trait KeyedStore: Send + Sync {
    /// Read the current value of `key`.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Vec<u8>>>>;

    /// Unconditionally write `value`, expiring after `ttl`.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, StoreResult<()>>;

    /// Write `value` only if the current value equals `expected`
    /// (`None` = key absent). Returns `false` when the comparison failed.
    fn compare_and_set<'a>(
        &'a self,
        key: &'a str,
        expected: Option<&'a [u8]>,
        value: Vec<u8>,
        ttl: Duration,
    ) -> BoxFuture<'a, StoreResult<bool>>;

    /// Remove `key` (no-op when absent).
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<()>>;
}

/// What an [`update_json`] closure decided to do with the record.
#[derive(Debug)]
pub enum Mutation<T> {
    /// Leave the stored record untouched.
    Keep,
    /// Replace the stored record.
    Write(T),
}

/// Encode a record for the store.
pub fn encode_json<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Decode a record read from the store.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Read-modify-write a JSON record with optimistic concurrency.
///
/// `apply` sees the current record (or `None`) and returns the mutation plus
/// an output value. It may run several times when other writers win the
/// race, so it must not have side effects; act on the returned output once
/// the update has committed.
pub async fn update_json<T, R, F>(
    store: &dyn KeyedStore,
    key: &str,
    ttl: Duration,
    max_attempts: u32,
    apply: F,
) -> StoreResult<R>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> (Mutation<T>, R),
{
    update_encoded(
        store,
        key,
        ttl,
        max_attempts,
        decode_json::<T>,
        encode_json::<T>,
        apply,
    )
    .await
}

/// [`update_json`] with a caller-supplied record codec.
pub async fn update_encoded<T, R, F>(
    store: &dyn KeyedStore,
    key: &str,
    ttl: Duration,
    max_attempts: u32,
    decode: fn(&[u8]) -> StoreResult<T>,
    encode: fn(&T) -> StoreResult<Vec<u8>>,
    mut apply: F,
) -> StoreResult<R>
where
    F: FnMut(Option<T>) -> (Mutation<T>, R),
{
    for attempt in 1..=max_attempts {
        let current = store.get(key).await?;
        let record = current.as_deref().map(decode).transpose()?;

        let (mutation, output) = apply(record);
        let value = match mutation {
            Mutation::Keep => return Ok(output),
            Mutation::Write(value) => encode(&value)?,
        };

        if store
            .compare_and_set(key, current.as_deref(), value, ttl)
            .await?
        {
            return Ok(output);
        }

        tracing::trace!("CAS conflict on {} (attempt {})", key, attempt);
        tokio::task::yield_now().await;
    }

    Err(StoreError::Contention {
        key: key.to_string(),
        attempts: max_attempts,
    })
}
