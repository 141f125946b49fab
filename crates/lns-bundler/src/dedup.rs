// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Uplink deduplication.
//!
//! Every gateway in range forwards the same uplink. Exactly one of them owns
//! the frame and may reply; the others are told they are duplicates.

use crate::connection::{CloseConnectionRequest, CloseError, ConnectionCloser};
use crate::device::{DevEui, GatewayId};
use crate::store::{self, KeyedStore, Mutation, StoreResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const KEY_SUFFIX: &str = "dedup";

/// Current owner of a device's uplink stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub owner: GatewayId,
    pub fcnt_up: u32,
    /// Unix milliseconds at which the record expires from the store.
    pub expires_at_ms: u64,
}

/// Outcome of [`DeduplicationEngine::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationResult {
    pub is_duplicate: bool,
    /// Gateway entitled to reply for this frame.
    pub owner: GatewayId,
}

/// How a resolve call changed ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Decision {
    Claimed,
    Renewed,
    Duplicate(GatewayId),
    Transferred(GatewayId),
}

/// Per-device ownership arbitration.
pub struct DeduplicationEngine {
    store: Arc<dyn KeyedStore>,
    closer: Arc<dyn ConnectionCloser>,
    ttl: Duration,
    close_timeout: Duration,
    max_cas_attempts: u32,
    transfers: AtomicU64,
}

impl DeduplicationEngine {
    /// Create an engine over `store`, notifying previous owners through `closer`.
    pub fn new(
        store: Arc<dyn KeyedStore>,
        closer: Arc<dyn ConnectionCloser>,
        ttl: Duration,
        close_timeout: Duration,
        max_cas_attempts: u32,
    ) -> Self {
        Self {
            store,
            closer,
            ttl,
            close_timeout,
            max_cas_attempts,
            transfers: AtomicU64::new(0),
        }
    }

    /// Decide whether `gateway` owns uplink `fcnt_up` of `dev_eui`.
    ///
    /// A resubmission by the current owner is never a duplicate. When
    /// ownership moves, the previous owner is asked to close its device
    /// connection from a detached task; that request cannot fail this call.
    pub async fn resolve(
        &self,
        dev_eui: DevEui,
        gateway: &GatewayId,
        fcnt_up: u32,
    ) -> StoreResult<DeduplicationResult> {
        let key = dev_eui.store_key(KEY_SUFFIX);
        let expires_at_ms = unix_millis().saturating_add(self.ttl.as_millis() as u64);

        let decision = store::update_json(
            self.store.as_ref(),
            &key,
            self.ttl,
            self.max_cas_attempts,
            |current: Option<OwnershipRecord>| {
                let claim = OwnershipRecord {
                    owner: gateway.clone(),
                    fcnt_up,
                    expires_at_ms,
                };
                match current {
                    None => (Mutation::Write(claim), Decision::Claimed),
                    Some(record) if record.owner == *gateway => {
                        (Mutation::Write(claim), Decision::Renewed)
                    }
                    Some(record) if record.fcnt_up == fcnt_up => {
                        (Mutation::Keep, Decision::Duplicate(record.owner))
                    }
                    Some(record) => (Mutation::Write(claim), Decision::Transferred(record.owner)),
                }
            },
        )
        .await?;

        let result = match decision {
            Decision::Claimed | Decision::Renewed => DeduplicationResult {
                is_duplicate: false,
                owner: gateway.clone(),
            },
            Decision::Duplicate(owner) => {
                debug!(
                    "{} fcnt {} from {} is a duplicate (owner {})",
                    dev_eui, fcnt_up, gateway, owner
                );
                DeduplicationResult {
                    is_duplicate: true,
                    owner,
                }
            }
            Decision::Transferred(previous) => {
                self.transfers.fetch_add(1, Ordering::Relaxed);
                info!(
                    "{} ownership moved {} -> {} at fcnt {}",
                    dev_eui, previous, gateway, fcnt_up
                );
                spawn_close_notification(
                    self.closer.clone(),
                    previous,
                    CloseConnectionRequest { dev_eui, fcnt_up },
                    self.close_timeout,
                );
                DeduplicationResult {
                    is_duplicate: false,
                    owner: gateway.clone(),
                }
            }
        };

        Ok(result)
    }

    /// Committed ownership transfers since creation.
    pub fn transfer_count(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    /// Read the ownership record without modifying it.
    pub async fn current_owner(&self, dev_eui: DevEui) -> StoreResult<Option<OwnershipRecord>> {
        let key = dev_eui.store_key(KEY_SUFFIX);
        self.store
            .get(&key)
            .await?
            .as_deref()
            .map(store::decode_json)
            .transpose()
    }
}

/// Dispatch a close-connection request on a detached task.
///
/// Failures are logged and dropped.
fn spawn_close_notification(
    closer: Arc<dyn ConnectionCloser>,
    gateway: GatewayId,
    request: CloseConnectionRequest,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let dev_eui = request.dev_eui;
        let outcome =
            match tokio::time::timeout(timeout, closer.close_device_connection(&gateway, request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(CloseError::Timeout(timeout)),
            };

        match outcome {
            Ok(()) => debug!("Closed {} connection on previous owner {}", dev_eui, gateway),
            Err(e) => warn!(
                "Failed to close {} connection on previous owner {}: {}",
                dev_eui, gateway, e
            ),
        }
    })
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
