// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Adaptive data rate.
//!
//! Keeps a bounded per-device history of recent uplinks and turns it into
//! transmission parameter recommendations.
//!
//! # History
//!
//! The table is a ring buffer of at most `capture_count` slots, one slot per
//! uplink frame counter. Several gateways reporting the same frame coalesce
//! into the last slot: the gateway with the highest SNR wins the slot and
//! `gateway_count` counts every report.
//!
//! # Confirmation
//!
//! Every gateway gets the recommendation, but only the deduplication winner
//! may confirm it to the device. A confirmable result carries a freshly
//! reserved downlink frame counter.

use crate::device::{DevEui, GatewayId};
use crate::error::BundlerError;
use crate::fcnt::FcntDownArbiter;
use crate::store::{self, KeyedStore, Mutation};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub mod strategy;

pub use strategy::{RateStrategy, Recommendation, StandardRateStrategy, StrategyError};

/// Default history length.
pub const FRAME_COUNT_CAPTURE_COUNT: usize = 20;

const KEY_SUFFIX: &str = "adr";

/// One history slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdrEntry {
    /// Gateway with the best SNR for this frame.
    pub gateway_id: GatewayId,
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    pub snr: f64,
    pub data_rate: u8,
    /// Number of reports received for this frame (repeats included).
    pub gateway_count: u32,
}

/// A single gateway's view of an uplink.
#[derive(Debug, Clone, PartialEq)]
pub struct AdrReport {
    pub gateway_id: GatewayId,
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    pub snr: f64,
    pub data_rate: u8,
}

/// Per-device uplink history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdrTable {
    entries: VecDeque<AdrEntry>,
    /// TX power index last confirmed to the device.
    #[serde(default)]
    pub current_tx_power: Option<u8>,
    /// Repetitions last confirmed to the device.
    #[serde(default)]
    pub current_nb_rep: Option<u8>,
}

impl AdrTable {
    /// Slots, oldest first.
    pub fn entries(&self) -> &VecDeque<AdrEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a report, coalescing with the last slot when the frame counter matches.
    pub fn add_report(&mut self, report: &AdrReport, capacity: usize) {
        if let Some(last) = self.entries.back_mut() {
            if last.fcnt_up == report.fcnt_up {
                last.gateway_count = last.gateway_count.saturating_add(1);
                if report.snr > last.snr {
                    last.gateway_id = report.gateway_id.clone();
                    last.snr = report.snr;
                }
                return;
            }
        }

        while self.entries.len() >= capacity.max(1) {
            self.entries.pop_front();
        }
        self.entries.push_back(AdrEntry {
            gateway_id: report.gateway_id.clone(),
            fcnt_up: report.fcnt_up,
            fcnt_down: report.fcnt_down,
            snr: report.snr,
            data_rate: report.data_rate,
            gateway_count: 1,
        });
    }
}

fn default_required_snr() -> f64 {
    -20.0
}

fn default_min_tx_power_index() -> u8 {
    7
}

fn default_max_data_rate() -> u8 {
    5
}

fn default_true() -> bool {
    true
}

/// ADR part of a bundler request.
///
/// Region limits travel with the request; defaults are EU868 DR0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdrRequest {
    /// Data rate of the uplink.
    pub data_rate: u8,
    /// SNR measured by the calling gateway (dB).
    pub snr: f64,
    /// Downlink counter reported by the calling gateway.
    ///
    /// The bundler raises it to the request's `client_fcnt_down` when that is higher.
    #[serde(default)]
    pub fcnt_down: u32,
    /// Demodulation floor of `data_rate` (dB).
    #[serde(default = "default_required_snr")]
    pub required_snr: f64,
    #[serde(default = "default_min_tx_power_index")]
    pub min_tx_power_index: u8,
    #[serde(default = "default_max_data_rate")]
    pub max_data_rate: u8,
    /// `false` records the frame without computing a recommendation.
    #[serde(default = "default_true")]
    pub perform_calculation: bool,
    /// Drop the device history (e.g. after a rejoin).
    #[serde(default)]
    pub clear_cache: bool,
}

impl AdrRequest {
    /// Request with EU868 limits for an uplink at `data_rate` measured at `snr`.
    pub fn new(data_rate: u8, snr: f64) -> Self {
        Self {
            data_rate,
            snr,
            fcnt_down: 0,
            required_snr: default_required_snr(),
            min_tx_power_index: default_min_tx_power_index(),
            max_data_rate: default_max_data_rate(),
            perform_calculation: true,
            clear_cache: false,
        }
    }

    /// Validate ranges.
    pub fn validate(&self) -> Result<(), BundlerError> {
        if !self.snr.is_finite() {
            return Err(BundlerError::InvalidRequest("ADR snr must be finite".into()));
        }
        if !self.required_snr.is_finite() {
            return Err(BundlerError::InvalidRequest(
                "ADR required_snr must be finite".into(),
            ));
        }
        if self.data_rate > strategy::MAX_DATA_RATE_INDEX {
            return Err(BundlerError::InvalidRequest(format!(
                "data rate {} out of range",
                self.data_rate
            )));
        }
        if self.max_data_rate > strategy::MAX_DATA_RATE_INDEX {
            return Err(BundlerError::InvalidRequest(format!(
                "max data rate {} out of range",
                self.max_data_rate
            )));
        }
        Ok(())
    }
}

/// ADR outcome for one gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdrResult {
    /// The caller may send the recommendation to the device.
    pub can_confirm_to_device: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_rate: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_power: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nb_repetition: Option<u8>,
    /// Slots currently in the device history.
    pub number_of_frames: usize,
    /// Downlink counter reserved for the confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcnt_down: Option<u32>,
}

impl AdrResult {
    fn frames_only(number_of_frames: usize) -> Self {
        Self {
            number_of_frames,
            ..Self::default()
        }
    }

    /// Recommended parameters, when one was computed.
    pub fn recommendation(&self) -> Option<Recommendation> {
        Some(Recommendation {
            data_rate: self.data_rate?,
            tx_power: self.tx_power?,
            nb_repetition: self.nb_repetition?,
        })
    }
}

/// ADR engine settings.
#[derive(Debug, Clone)]
pub struct AdrSettings {
    pub capture_count: usize,
    pub ttl: Duration,
    pub max_cas_attempts: u32,
}

/// Per-device ADR history and recommendations.
pub struct AdrEngine {
    store: Arc<dyn KeyedStore>,
    strategy: Arc<dyn RateStrategy>,
    fcnt: Arc<FcntDownArbiter>,
    settings: AdrSettings,
}

impl AdrEngine {
    /// Create an engine reserving confirmation counters through `fcnt`.
    pub fn new(
        store: Arc<dyn KeyedStore>,
        strategy: Arc<dyn RateStrategy>,
        fcnt: Arc<FcntDownArbiter>,
        settings: AdrSettings,
    ) -> Self {
        Self {
            store,
            strategy,
            fcnt,
            settings,
        }
    }

    /// Record the uplink and compute a recommendation.
    ///
    /// `is_owner` must only be true for the deduplication winner of `fcnt_up`.
    pub async fn handle_uplink(
        &self,
        dev_eui: DevEui,
        gateway: &GatewayId,
        fcnt_up: u32,
        request: &AdrRequest,
        is_owner: bool,
    ) -> Result<AdrResult, BundlerError> {
        let key = dev_eui.store_key(KEY_SUFFIX);

        if request.clear_cache {
            self.store.delete(&key).await?;
            debug!("{} ADR history cleared by {}", dev_eui, gateway);
            return Ok(AdrResult::default());
        }

        let report = AdrReport {
            gateway_id: gateway.clone(),
            fcnt_up,
            fcnt_down: request.fcnt_down,
            snr: request.snr,
            data_rate: request.data_rate,
        };
        let capacity = self.settings.capture_count;

        let table = store::update_json(
            self.store.as_ref(),
            &key,
            self.settings.ttl,
            self.settings.max_cas_attempts,
            |current: Option<AdrTable>| {
                let mut table = current.unwrap_or_default();
                table.add_report(&report, capacity);
                (Mutation::Write(table.clone()), table)
            },
        )
        .await?;

        if !request.perform_calculation || table.len() < capacity {
            return Ok(AdrResult::frames_only(table.len()));
        }

        let recommendation = match self.strategy.compute_recommendation(
            &table,
            request.required_snr,
            request.data_rate,
            request.min_tx_power_index,
            request.max_data_rate,
        ) {
            Ok(Some(rec)) => rec,
            Ok(None) => return Ok(AdrResult::frames_only(table.len())),
            Err(e) => {
                warn!("{} ADR strategy error, no recommendation: {}", dev_eui, e);
                return Ok(AdrResult::frames_only(table.len()));
            }
        };

        let changed = recommendation.data_rate != request.data_rate
            || table.current_tx_power != Some(recommendation.tx_power)
            || table.current_nb_rep != Some(recommendation.nb_repetition);

        let mut result = AdrResult {
            can_confirm_to_device: false,
            data_rate: Some(recommendation.data_rate),
            tx_power: Some(recommendation.tx_power),
            nb_repetition: Some(recommendation.nb_repetition),
            number_of_frames: table.len(),
            fcnt_down: None,
        };

        if is_owner && changed {
            let fcnt_down = self
                .fcnt
                .next_down(dev_eui, gateway, fcnt_up, request.fcnt_down)
                .await?;
            self.commit_settings(&key, recommendation).await?;

            debug!(
                "{} ADR confirmable via {}: dr {} txpower {} nbrep {} (fcnt down {})",
                dev_eui,
                gateway,
                recommendation.data_rate,
                recommendation.tx_power,
                recommendation.nb_repetition,
                fcnt_down
            );
            result.can_confirm_to_device = true;
            result.fcnt_down = Some(fcnt_down);
        }

        Ok(result)
    }

    /// Current history of a device.
    pub async fn table(&self, dev_eui: DevEui) -> Result<Option<AdrTable>, BundlerError> {
        let key = dev_eui.store_key(KEY_SUFFIX);
        let table = self
            .store
            .get(&key)
            .await?
            .as_deref()
            .map(store::decode_json)
            .transpose()?;
        Ok(table)
    }

    async fn commit_settings(&self, key: &str, rec: Recommendation) -> Result<(), BundlerError> {
        store::update_json(
            self.store.as_ref(),
            key,
            self.settings.ttl,
            self.settings.max_cas_attempts,
            |current: Option<AdrTable>| match current {
                Some(mut table) => {
                    table.current_tx_power = Some(rec.tx_power);
                    table.current_nb_rep = Some(rec.nb_repetition);
                    (Mutation::Write(table), ())
                }
                // History vanished (cleared or expired): nothing to confirm against
                None => (Mutation::Keep, ()),
            },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    struct FailingStrategy;

    impl RateStrategy for FailingStrategy {
        fn compute_recommendation(
            &self,
            _table: &AdrTable,
            _required_snr: f64,
            _data_rate: u8,
            _min_tx_power_index: u8,
            _max_data_rate: u8,
        ) -> Result<Option<Recommendation>, StrategyError> {
            Err(StrategyError("boom".into()))
        }
    }

    fn gw(id: &str) -> GatewayId {
        GatewayId::new(id).unwrap()
    }

    fn report(gateway: &str, fcnt_up: u32, snr: f64) -> AdrReport {
        AdrReport {
            gateway_id: gw(gateway),
            fcnt_up,
            fcnt_down: 0,
            snr,
            data_rate: 0,
        }
    }

    fn engine_with(strategy: Arc<dyn RateStrategy>) -> (AdrEngine, Arc<FcntDownArbiter>) {
        let store: Arc<dyn KeyedStore> = Arc::new(InMemoryStore::new());
        let fcnt = Arc::new(FcntDownArbiter::new(
            store.clone(),
            Duration::from_secs(60),
            8,
        ));
        let engine = AdrEngine::new(
            store,
            strategy,
            fcnt.clone(),
            AdrSettings {
                capture_count: FRAME_COUNT_CAPTURE_COUNT,
                ttl: Duration::from_secs(60),
                max_cas_attempts: 8,
            },
        );
        (engine, fcnt)
    }

    fn engine() -> AdrEngine {
        engine_with(Arc::new(StandardRateStrategy::default())).0
    }

    #[test]
    fn test_table_coalesces_same_frame() {
        let mut table = AdrTable::default();
        table.add_report(&report("a", 1, 2.0), 20);
        table.add_report(&report("b", 1, 5.0), 20);
        table.add_report(&report("c", 1, 3.0), 20);
        table.add_report(&report("b", 1, 5.0), 20);

        assert_eq!(table.len(), 1);
        let slot = &table.entries()[0];
        assert_eq!(slot.gateway_id, gw("b"));
        assert_eq!(slot.snr, 5.0);
        assert_eq!(slot.gateway_count, 4);
    }

    #[test]
    fn test_table_equal_snr_keeps_first_reporter() {
        let mut table = AdrTable::default();
        table.add_report(&report("a", 1, 4.0), 20);
        table.add_report(&report("b", 1, 4.0), 20);
        assert_eq!(table.entries()[0].gateway_id, gw("a"));
    }

    #[test]
    fn test_table_new_frame_starts_new_slot() {
        let mut table = AdrTable::default();
        table.add_report(&report("a", 1, 1.0), 20);
        table.add_report(&report("a", 2, 1.0), 20);
        assert_eq!(table.len(), 2);
        assert_eq!(table.entries()[1].gateway_count, 1);
    }

    #[test]
    fn test_table_evicts_oldest() {
        let mut table = AdrTable::default();
        for fcnt in 1..=50 {
            table.add_report(&report("a", fcnt, 1.0), 20);
            assert!(table.len() <= 20);
        }
        assert_eq!(table.len(), 20);
        assert_eq!(table.entries().front().unwrap().fcnt_up, 31);
        assert_eq!(table.entries().back().unwrap().fcnt_up, 50);
    }

    #[tokio::test]
    async fn test_recommendation_after_capture_count() {
        let engine = engine();
        let dev = DevEui::new(1);

        for fcnt in 1..=19u32 {
            let request = AdrRequest::new(0, (fcnt % 7) as f64);
            let result = engine
                .handle_uplink(dev, &gw("a"), fcnt, &request, true)
                .await
                .unwrap();
            assert_eq!(result.number_of_frames, fcnt as usize);
            assert!(!result.can_confirm_to_device);
            assert!(result.recommendation().is_none());
        }

        let result = engine
            .handle_uplink(dev, &gw("a"), 20, &AdrRequest::new(0, 3.0), true)
            .await
            .unwrap();
        assert_eq!(result.number_of_frames, 20);
        assert!(result.recommendation().is_some());
        assert!(result.can_confirm_to_device);
        assert_eq!(result.fcnt_down, Some(1));
    }

    #[tokio::test]
    async fn test_non_owner_gets_recommendation_but_cannot_confirm() {
        let (engine, fcnt) = engine_with(Arc::new(StandardRateStrategy::default()));
        let dev = DevEui::new(1);
        for fcnt_up in 1..=19 {
            engine
                .handle_uplink(dev, &gw("a"), fcnt_up, &AdrRequest::new(0, 1.0), true)
                .await
                .unwrap();
        }

        let result = engine
            .handle_uplink(dev, &gw("b"), 20, &AdrRequest::new(0, 1.0), false)
            .await
            .unwrap();
        assert!(result.recommendation().is_some());
        assert!(!result.can_confirm_to_device);
        assert_eq!(result.fcnt_down, None);
        assert!(fcnt.last_reserved(dev).await.unwrap().is_none());

        // Nothing was committed by the non-owner
        let table = engine.table(dev).await.unwrap().unwrap();
        assert_eq!(table.current_tx_power, None);
    }

    #[tokio::test]
    async fn test_unchanged_recommendation_is_not_confirmed_again() {
        let engine = engine();
        let dev = DevEui::new(1);
        for fcnt_up in 1..=20 {
            engine
                .handle_uplink(dev, &gw("a"), fcnt_up, &AdrRequest::new(0, -25.0), true)
                .await
                .unwrap();
        }
        let table = engine.table(dev).await.unwrap().unwrap();
        assert_eq!(table.current_tx_power, Some(0));
        assert_eq!(table.current_nb_rep, Some(1));

        // Weak link at max power: same settings as confirmed
        let result = engine
            .handle_uplink(dev, &gw("a"), 21, &AdrRequest::new(0, -25.0), true)
            .await
            .unwrap();
        assert_eq!(
            result.recommendation(),
            Some(Recommendation {
                data_rate: 0,
                tx_power: 0,
                nb_repetition: 1
            })
        );
        assert!(!result.can_confirm_to_device);
    }

    #[tokio::test]
    async fn test_strategy_error_is_no_recommendation() {
        let (engine, _) = engine_with(Arc::new(FailingStrategy));
        let dev = DevEui::new(1);
        let mut last = AdrResult::default();
        for fcnt_up in 1..=20 {
            last = engine
                .handle_uplink(dev, &gw("a"), fcnt_up, &AdrRequest::new(0, 1.0), true)
                .await
                .unwrap();
        }
        assert_eq!(last.number_of_frames, 20);
        assert!(last.recommendation().is_none());
        assert!(!last.can_confirm_to_device);
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let engine = engine();
        let dev = DevEui::new(1);
        engine
            .handle_uplink(dev, &gw("a"), 1, &AdrRequest::new(0, 1.0), true)
            .await
            .unwrap();

        let mut request = AdrRequest::new(0, 1.0);
        request.clear_cache = true;
        let result = engine
            .handle_uplink(dev, &gw("a"), 2, &request, true)
            .await
            .unwrap();
        assert_eq!(result, AdrResult::default());
        assert!(engine.table(dev).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_perform_calculation_disabled() {
        let engine = engine();
        let dev = DevEui::new(1);
        let mut request = AdrRequest::new(0, 1.0);
        request.perform_calculation = false;

        let mut last = AdrResult::default();
        for fcnt_up in 1..=25 {
            last = engine
                .handle_uplink(dev, &gw("a"), fcnt_up, &request, true)
                .await
                .unwrap();
        }
        assert_eq!(last.number_of_frames, 20);
        assert!(last.recommendation().is_none());
    }

    #[test]
    fn test_request_validation() {
        assert!(AdrRequest::new(0, 1.0).validate().is_ok());
        assert!(AdrRequest::new(16, 1.0).validate().is_err());
        assert!(AdrRequest::new(0, f64::NAN).validate().is_err());
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: AdrRequest = serde_json::from_str(r#"{"data_rate":3,"snr":-4.5}"#).unwrap();
        assert_eq!(request, AdrRequest::new(3, -4.5));
    }
}
