// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Downlink frame counter arbitration.
//!
//! Hands out strictly increasing `FCntDown` values per device. A value is a
//! reservation: two calls always return two different counters, so only a
//! gateway that owns the current uplink should ask for one.

use crate::device::{DevEui, GatewayId};
use crate::error::BundlerError;
use crate::store::{self, KeyedStore, Mutation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const KEY_SUFFIX: &str = "fcntdown";

/// Last reserved downlink counter of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FcntDownRecord {
    pub server_fcnt_down: u32,
    /// Uplink counter of the request that made the reservation.
    pub fcnt_up: u32,
    /// Gateway that made the reservation.
    pub gateway_id: GatewayId,
}

/// Per-device downlink counter reservations.
pub struct FcntDownArbiter {
    store: Arc<dyn KeyedStore>,
    ttl: Duration,
    max_cas_attempts: u32,
}

impl FcntDownArbiter {
    /// Create an arbiter whose reservations expire `ttl` after the last one.
    pub fn new(store: Arc<dyn KeyedStore>, ttl: Duration, max_cas_attempts: u32) -> Self {
        Self {
            store,
            ttl,
            max_cas_attempts,
        }
    }

    /// Reserve the next downlink counter:
    /// `max(server_fcnt_down, client_fcnt_down) + 1`.
    ///
    /// A stale `client_fcnt_down` never moves the counter backwards.
    pub async fn next_down(
        &self,
        dev_eui: DevEui,
        gateway: &GatewayId,
        client_fcnt_up: u32,
        client_fcnt_down: u32,
    ) -> Result<u32, BundlerError> {
        let key = dev_eui.store_key(KEY_SUFFIX);

        let next = store::update_json(
            self.store.as_ref(),
            &key,
            self.ttl,
            self.max_cas_attempts,
            |current: Option<FcntDownRecord>| {
                let base = current
                    .map_or(client_fcnt_down, |r| r.server_fcnt_down.max(client_fcnt_down));
                match base.checked_add(1) {
                    Some(next) => (
                        Mutation::Write(FcntDownRecord {
                            server_fcnt_down: next,
                            fcnt_up: client_fcnt_up,
                            gateway_id: gateway.clone(),
                        }),
                        Some(next),
                    ),
                    None => (Mutation::Keep, None),
                }
            },
        )
        .await?
        .ok_or(BundlerError::CounterExhausted(dev_eui))?;

        debug!(
            "{} reserved fcnt down {} for {} (fcnt up {})",
            dev_eui, next, gateway, client_fcnt_up
        );
        Ok(next)
    }

    /// Last reserved counter, if the record has not expired.
    pub async fn last_reserved(&self, dev_eui: DevEui) -> Result<Option<FcntDownRecord>, BundlerError> {
        let key = dev_eui.store_key(KEY_SUFFIX);
        let record = self
            .store
            .get(&key)
            .await?
            .as_deref()
            .map(store::decode_json)
            .transpose()?;
        Ok(record)
    }
}
