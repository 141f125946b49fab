// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Preferred gateway for unsolicited (Class C) downlinks.
//!
//! The record is kept in its compact cache form `GatewayId|Rssi`, optionally
//! followed by `|FcntUp` and `|RecordedAtMs`.
//!
//! A report for a newer uplink replaces the record. Reports for the uplink
//! already recorded replace it only with a strictly stronger RSSI, so the
//! outcome does not depend on the order the gateways' calls land in.

use crate::device::{DevEui, GatewayId};
use crate::error::BundlerError;
use crate::store::{self, KeyedStore, Mutation, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

const KEY_SUFFIX: &str = "pgw";
const SEPARATOR: char = '|';

/// Latest best-link gateway of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferredGatewayRecord {
    pub gateway_id: GatewayId,
    /// RSSI (dBm) reported by `gateway_id`.
    pub rssi: f64,
    /// Uplink frame counter the report belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcnt_up: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at_ms: Option<u64>,
}

impl PreferredGatewayRecord {
    /// Cache string form.
    pub fn to_cache_string(&self) -> String {
        self.to_string()
    }

    /// Whether `candidate` should replace this record.
    ///
    /// Records without a frame counter are always replaced.
    pub fn is_superseded_by(&self, candidate: &PreferredGatewayRecord) -> bool {
        match (self.fcnt_up, candidate.fcnt_up) {
            (Some(current), Some(next)) if next == current => candidate.rssi > self.rssi,
            (Some(current), Some(next)) => next > current,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

impl fmt::Display for PreferredGatewayRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // f64 Display is the shortest form that parses back to the same value
        write!(f, "{}{}{}", self.gateway_id, SEPARATOR, self.rssi)?;
        match (self.fcnt_up, self.recorded_at_ms) {
            (Some(fcnt), Some(at)) => write!(f, "{}{}{}{}", SEPARATOR, fcnt, SEPARATOR, at),
            (Some(fcnt), None) => write!(f, "{}{}", SEPARATOR, fcnt),
            // Timestamp without a frame counter keeps an empty slot
            (None, Some(at)) => write!(f, "{}{}{}", SEPARATOR, SEPARATOR, at),
            (None, None) => Ok(()),
        }
    }
}

impl FromStr for PreferredGatewayRecord {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| StoreError::Codec(format!("preferred gateway '{}': {}", s, why));

        let mut parts = s.split(SEPARATOR);
        let gateway = parts.next().ok_or_else(|| invalid("empty"))?;
        let rssi = parts.next().ok_or_else(|| invalid("missing rssi"))?;
        let fcnt_up = parts
            .next()
            .filter(|fcnt| !fcnt.is_empty())
            .map(|fcnt| fcnt.parse::<u32>().map_err(|_| invalid("bad frame counter")))
            .transpose()?;
        let recorded_at_ms = parts
            .next()
            .map(|at| at.parse::<u64>().map_err(|_| invalid("bad timestamp")))
            .transpose()?;
        if parts.next().is_some() {
            return Err(invalid("too many fields"));
        }

        let gateway_id = GatewayId::new(gateway).map_err(|e| invalid(&e.to_string()))?;
        let rssi: f64 = rssi.parse().map_err(|_| invalid("bad rssi"))?;
        if !rssi.is_finite() {
            return Err(invalid("rssi not finite"));
        }

        Ok(Self {
            gateway_id,
            rssi,
            fcnt_up,
            recorded_at_ms,
        })
    }
}

fn decode_record(bytes: &[u8]) -> StoreResult<PreferredGatewayRecord> {
    std::str::from_utf8(bytes)
        .map_err(|e| StoreError::Codec(format!("preferred gateway not UTF-8: {}", e)))?
        .parse()
}

fn encode_record(record: &PreferredGatewayRecord) -> StoreResult<Vec<u8>> {
    Ok(record.to_cache_string().into_bytes())
}

/// Per-device preferred gateway.
pub struct PreferredGatewayTracker {
    store: Arc<dyn KeyedStore>,
    ttl: Duration,
    max_cas_attempts: u32,
}

impl PreferredGatewayTracker {
    /// Create a tracker keeping records for `ttl` after their last update.
    pub fn new(store: Arc<dyn KeyedStore>, ttl: Duration, max_cas_attempts: u32) -> Self {
        Self {
            store,
            ttl,
            max_cas_attempts,
        }
    }

    /// Report that `gateway` heard uplink `fcnt_up` of `dev_eui` at `rssi`.
    ///
    /// Returns the preferred gateway after the report, which is another
    /// gateway when that one heard the same uplink more strongly.
    pub async fn update(
        &self,
        dev_eui: DevEui,
        gateway: &GatewayId,
        fcnt_up: u32,
        rssi: f64,
    ) -> Result<PreferredGatewayRecord, BundlerError> {
        if !rssi.is_finite() {
            return Err(BundlerError::InvalidRequest("rssi must be finite".into()));
        }

        let candidate = PreferredGatewayRecord {
            gateway_id: gateway.clone(),
            rssi,
            fcnt_up: Some(fcnt_up),
            recorded_at_ms: Some(unix_millis()),
        };
        let (record, replaced) = store::update_encoded(
            self.store.as_ref(),
            &dev_eui.store_key(KEY_SUFFIX),
            self.ttl,
            self.max_cas_attempts,
            decode_record,
            encode_record,
            |current: Option<PreferredGatewayRecord>| match current {
                Some(current) if !current.is_superseded_by(&candidate) => {
                    (Mutation::Keep, (current, false))
                }
                _ => (Mutation::Write(candidate.clone()), (candidate.clone(), true)),
            },
        )
        .await?;

        if replaced {
            debug!("{} preferred gateway {} ({} dBm)", dev_eui, gateway, rssi);
        } else {
            debug!(
                "{} preferred gateway stays {} ({} dBm), {} reported {} dBm",
                dev_eui, record.gateway_id, record.rssi, gateway, rssi
            );
        }
        Ok(record)
    }

    /// Current preferred gateway, if any.
    pub async fn get(&self, dev_eui: DevEui) -> Result<Option<PreferredGatewayRecord>, BundlerError> {
        let record = self
            .store
            .get(&dev_eui.store_key(KEY_SUFFIX))
            .await?
            .as_deref()
            .map(decode_record)
            .transpose()?;
        Ok(record)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
