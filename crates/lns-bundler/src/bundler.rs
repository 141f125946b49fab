// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Function bundler.
//!
//! Runs the requested stages of one gateway's call in a fixed priority order
//! and merges their outcomes into a single [`BundlerResult`].
//!
//! # Pipeline
//!
//! | Priority | Stage | Depends on |
//! |---|---|---|
//! | 0 | [`Stage::Deduplication`] | |
//! | 1 | [`Stage::Adr`] | ownership decision |
//! | 2 | [`Stage::FCntDown`] | ownership decision, ADR reservation |
//! | 3 | [`Stage::PreferredGateway`] | |
//!
//! A failing stage is recorded in [`BundlerResult::failures`] and the
//! pipeline moves on. When the deadline elapses, whatever completed so far is
//! returned with `deadline_exceeded` set.

use crate::adr::{AdrEngine, AdrRequest, AdrResult, AdrSettings, RateStrategy, StandardRateStrategy};
use crate::config::BundlerConfig;
use crate::connection::ConnectionCloser;
use crate::dedup::{DeduplicationEngine, DeduplicationResult};
use crate::device::{DevEui, GatewayId};
use crate::error::BundlerError;
use crate::fcnt::FcntDownArbiter;
use crate::preferred::PreferredGatewayTracker;
use crate::store::KeyedStore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "deduplication")]
    Deduplication,
    #[serde(rename = "adr")]
    Adr,
    #[serde(rename = "fcnt_down")]
    FCntDown,
    #[serde(rename = "preferred_gateway")]
    PreferredGateway,
}

impl Stage {
    /// Execution order; lower runs first.
    pub const fn priority(self) -> u8 {
        match self {
            Self::Deduplication => 0,
            Self::Adr => 1,
            Self::FCntDown => 2,
            Self::PreferredGateway => 3,
        }
    }

    const fn flag(self) -> u8 {
        1 << self.priority()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Deduplication => "deduplication",
            Self::Adr => "adr",
            Self::FCntDown => "fcnt_down",
            Self::PreferredGateway => "preferred_gateway",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stages in execution order.
pub const PIPELINE: [Stage; 4] = [
    Stage::Deduplication,
    Stage::Adr,
    Stage::FCntDown,
    Stage::PreferredGateway,
];

const _: () = {
    let mut i = 1;
    while i < PIPELINE.len() {
        assert!(
            PIPELINE[i - 1].priority() < PIPELINE[i].priority(),
            "pipeline priorities must be unique and ascending"
        );
        i += 1;
    }
};

/// Set of requested stages.
///
/// Serialized as a list of stage names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StageSet(u8);

impl StageSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < PIPELINE.len() {
            bits |= PIPELINE[i].flag();
            i += 1;
        }
        Self(bits)
    }

    /// Add `stage` (builder form).
    pub const fn with(self, stage: Stage) -> Self {
        Self(self.0 | stage.flag())
    }

    pub fn insert(&mut self, stage: Stage) {
        self.0 |= stage.flag();
    }

    pub const fn contains(self, stage: Stage) -> bool {
        self.0 & stage.flag() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Requested stages in execution order.
    pub fn iter(self) -> impl Iterator<Item = Stage> {
        PIPELINE.into_iter().filter(move |s| self.contains(*s))
    }
}

impl FromIterator<Stage> for StageSet {
    fn from_iter<I: IntoIterator<Item = Stage>>(iter: I) -> Self {
        let mut set = Self::empty();
        for stage in iter {
            set.insert(stage);
        }
        set
    }
}

impl Serialize for StageSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for StageSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stages = Vec::<Stage>::deserialize(deserializer)?;
        Ok(stages.into_iter().collect())
    }
}

/// Radio measurements of the calling gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioMetadata {
    /// dBm.
    pub rssi: f64,
    /// dB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
}

/// One gateway's call for one uplink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundlerRequest {
    pub gateway_id: GatewayId,
    pub client_fcnt_up: u32,
    #[serde(default)]
    pub client_fcnt_down: u32,
    pub stages: StageSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adr: Option<AdrRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radio: Option<RadioMetadata>,
}

impl BundlerRequest {
    pub fn new(gateway_id: GatewayId, client_fcnt_up: u32, stages: StageSet) -> Self {
        Self {
            gateway_id,
            client_fcnt_up,
            client_fcnt_down: 0,
            stages,
            adr: None,
            radio: None,
        }
    }

    pub fn with_fcnt_down(mut self, client_fcnt_down: u32) -> Self {
        self.client_fcnt_down = client_fcnt_down;
        self
    }

    pub fn with_adr(mut self, adr: AdrRequest) -> Self {
        self.adr = Some(adr);
        self
    }

    pub fn with_radio(mut self, rssi: f64, snr: Option<f64>) -> Self {
        self.radio = Some(RadioMetadata { rssi, snr });
        self
    }

    /// Check the request before any stage runs.
    pub fn validate(&self) -> Result<(), BundlerError> {
        if self.stages.is_empty() {
            return Err(BundlerError::InvalidRequest("no stage requested".into()));
        }

        match (&self.adr, self.stages.contains(Stage::Adr)) {
            (Some(adr), _) => adr.validate()?,
            (None, true) => {
                return Err(BundlerError::InvalidRequest(
                    "adr stage requested without adr data".into(),
                ))
            }
            (None, false) => {}
        }

        match (&self.radio, self.stages.contains(Stage::PreferredGateway)) {
            (Some(radio), _) => {
                if !radio.rssi.is_finite() {
                    return Err(BundlerError::InvalidRequest("rssi must be finite".into()));
                }
                if radio.snr.is_some_and(|snr| !snr.is_finite()) {
                    return Err(BundlerError::InvalidRequest("snr must be finite".into()));
                }
            }
            (None, true) => {
                return Err(BundlerError::InvalidRequest(
                    "preferred_gateway stage requested without radio data".into(),
                ))
            }
            (None, false) => {}
        }

        Ok(())
    }
}

/// Preferred-gateway stage output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferredGatewayResult {
    pub preferred_gateway_id: GatewayId,
    pub rssi: f64,
    /// Uplink counter of the request that recorded the preference.
    pub request_fcnt_up: u32,
}

/// A stage that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: String,
}

/// Merged outcome of one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundlerResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication: Option<DeduplicationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adr: Option<AdrResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fcnt_down: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_gateway: Option<PreferredGatewayResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<StageFailure>,
    #[serde(default)]
    pub deadline_exceeded: bool,
}

impl BundlerResult {
    /// True when the deduplication stage ran and flagged the caller.
    pub fn is_duplicate(&self) -> bool {
        self.deduplication.as_ref().is_some_and(|d| d.is_duplicate)
    }

    /// Failure recorded for `stage`, if any.
    pub fn failure(&self, stage: Stage) -> Option<&StageFailure> {
        self.failures.iter().find(|f| f.stage == stage)
    }
}

/// Bundler statistics.
#[derive(Debug, Default)]
pub struct BundlerStats {
    /// Calls received, rejected ones included.
    pub requests: AtomicU64,
    /// Calls flagged as duplicates.
    pub duplicates: AtomicU64,
    /// Stage failures recorded in results.
    pub stage_failures: AtomicU64,
    /// Calls cut short by their deadline.
    pub deadline_exceeded: AtomicU64,
    /// Calls rejected before any stage ran.
    pub rejected: AtomicU64,
}

/// Snapshot of bundler statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BundlerStatsSnapshot {
    pub requests: u64,
    pub duplicates: u64,
    pub ownership_transfers: u64,
    pub stage_failures: u64,
    pub deadline_exceeded: u64,
    pub rejected: u64,
}

/// Ownership decision as seen by later stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    NotRequested,
    Owner,
    Duplicate,
    Failed,
}

/// ADR request whose downlink counter is at least the request's `client_fcnt_down`.
///
/// A counter reserved for an ADR confirmation must be above every counter
/// the device already used, whichever field reported it.
fn with_client_fcnt_down(adr: &AdrRequest, client_fcnt_down: u32) -> Cow<'_, AdrRequest> {
    if client_fcnt_down <= adr.fcnt_down {
        Cow::Borrowed(adr)
    } else {
        Cow::Owned(AdrRequest {
            fcnt_down: client_fcnt_down,
            ..adr.clone()
        })
    }
}

/// Orchestrates the per-uplink functions for every calling gateway.
pub struct FunctionBundler {
    dedup: DeduplicationEngine,
    adr: AdrEngine,
    fcnt: Arc<FcntDownArbiter>,
    preferred: PreferredGatewayTracker,
    request_timeout: Duration,
    stats: BundlerStats,
}

impl FunctionBundler {
    /// Create a bundler over a shared store.
    pub fn new(
        config: &BundlerConfig,
        store: Arc<dyn KeyedStore>,
        closer: Arc<dyn ConnectionCloser>,
        strategy: Arc<dyn RateStrategy>,
    ) -> Self {
        let cas = config.store.max_cas_attempts;
        let fcnt = Arc::new(FcntDownArbiter::new(
            store.clone(),
            config.store.fcnt_down_ttl(),
            cas,
        ));

        Self {
            dedup: DeduplicationEngine::new(
                store.clone(),
                closer,
                config.store.ownership_ttl(),
                config.deduplication.close_connection_timeout(),
                cas,
            ),
            adr: AdrEngine::new(
                store.clone(),
                strategy,
                fcnt.clone(),
                AdrSettings {
                    capture_count: config.adr.frame_count_capture_count,
                    ttl: config.store.adr_ttl(),
                    max_cas_attempts: cas,
                },
            ),
            fcnt,
            preferred: PreferredGatewayTracker::new(
                store,
                config.store.preferred_gateway_ttl(),
                cas,
            ),
            request_timeout: config.request_timeout(),
            stats: BundlerStats::default(),
        }
    }

    /// Create a bundler using [`StandardRateStrategy`] tuned from `config.adr`.
    pub fn with_standard_strategy(
        config: &BundlerConfig,
        store: Arc<dyn KeyedStore>,
        closer: Arc<dyn ConnectionCloser>,
    ) -> Self {
        let strategy = StandardRateStrategy {
            margin_db: config.adr.margin_db,
            default_nb_rep: config.adr.default_nb_rep,
        };
        Self::new(config, store, closer, Arc::new(strategy))
    }

    /// Run `request` with the configured deadline.
    pub async fn execute(
        &self,
        dev_eui: DevEui,
        request: &BundlerRequest,
    ) -> Result<BundlerResult, BundlerError> {
        self.execute_with_deadline(dev_eui, request, Instant::now() + self.request_timeout)
            .await
    }

    /// Run `request` for a textual DevEUI.
    pub async fn execute_raw(
        &self,
        dev_eui: &str,
        request: &BundlerRequest,
    ) -> Result<BundlerResult, BundlerError> {
        let dev_eui = match dev_eui.parse::<DevEui>() {
            Ok(dev_eui) => dev_eui,
            Err(e) => {
                self.stats.requests.fetch_add(1, Ordering::Relaxed);
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        self.execute(dev_eui, request).await
    }

    /// Run `request`, returning partial results once `deadline` elapses.
    ///
    /// Only an invalid request is an error; stage failures and the deadline
    /// are reported inside the result.
    pub async fn execute_with_deadline(
        &self,
        dev_eui: DevEui,
        request: &BundlerRequest,
        deadline: Instant,
    ) -> Result<BundlerResult, BundlerError> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = request.validate() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("{} rejected request from {}: {}", dev_eui, request.gateway_id, e);
            return Err(e);
        }

        let mut result = BundlerResult::default();
        let completed =
            tokio::time::timeout_at(deadline, self.run_pipeline(dev_eui, request, &mut result))
                .await;

        if completed.is_err() {
            self.stats.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{} deadline exceeded for {} (fcnt up {})",
                dev_eui, request.gateway_id, request.client_fcnt_up
            );
            result.deadline_exceeded = true;
        }
        if result.is_duplicate() {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .stage_failures
            .fetch_add(result.failures.len() as u64, Ordering::Relaxed);

        Ok(result)
    }

    async fn run_pipeline(&self, dev_eui: DevEui, request: &BundlerRequest, result: &mut BundlerResult) {
        let gateway = &request.gateway_id;
        let fcnt_up = request.client_fcnt_up;
        let mut ownership = Ownership::NotRequested;
        let mut reserved_fcnt_down = None;

        for stage in request.stages.iter() {
            debug!("{} {} stage for {} (fcnt up {})", dev_eui, stage, gateway, fcnt_up);

            let outcome: Result<(), BundlerError> = match stage {
                Stage::Deduplication => match self.dedup.resolve(dev_eui, gateway, fcnt_up).await {
                    Ok(dedup) => {
                        ownership = if dedup.is_duplicate {
                            Ownership::Duplicate
                        } else {
                            Ownership::Owner
                        };
                        result.deduplication = Some(dedup);
                        Ok(())
                    }
                    Err(e) => {
                        ownership = Ownership::Failed;
                        Err(e.into())
                    }
                },

                Stage::Adr => match &request.adr {
                    Some(adr) => self
                        .adr
                        .handle_uplink(
                            dev_eui,
                            gateway,
                            fcnt_up,
                            &with_client_fcnt_down(adr, request.client_fcnt_down),
                            ownership == Ownership::Owner,
                        )
                        .await
                        .map(|adr| {
                            reserved_fcnt_down = adr.fcnt_down;
                            result.adr = Some(adr);
                        }),
                    None => Err(BundlerError::InvalidRequest("missing adr data".into())),
                },

                Stage::FCntDown => match (ownership, reserved_fcnt_down) {
                    (Ownership::Duplicate | Ownership::Failed, _) => {
                        debug!("{} no downlink counter for {}: not the owner", dev_eui, gateway);
                        Ok(())
                    }
                    (_, Some(reserved)) => {
                        result.next_fcnt_down = Some(reserved);
                        Ok(())
                    }
                    (_, None) => self
                        .fcnt
                        .next_down(dev_eui, gateway, fcnt_up, request.client_fcnt_down)
                        .await
                        .map(|next| result.next_fcnt_down = Some(next)),
                },

                Stage::PreferredGateway => match &request.radio {
                    Some(radio) => self
                        .preferred
                        .update(dev_eui, gateway, fcnt_up, radio.rssi)
                        .await
                        .map(|record| {
                            result.preferred_gateway = Some(PreferredGatewayResult {
                                preferred_gateway_id: record.gateway_id,
                                rssi: record.rssi,
                                request_fcnt_up: fcnt_up,
                            });
                        }),
                    None => Err(BundlerError::InvalidRequest("missing radio data".into())),
                },
            };

            if let Err(e) = outcome {
                warn!("{} {} stage failed for {}: {}", dev_eui, stage, gateway, e);
                result.failures.push(StageFailure {
                    stage,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Deduplication engine.
    pub fn deduplication(&self) -> &DeduplicationEngine {
        &self.dedup
    }

    /// ADR engine.
    pub fn adr(&self) -> &AdrEngine {
        &self.adr
    }

    /// Downlink counter arbiter.
    pub fn fcnt_down(&self) -> &FcntDownArbiter {
        &self.fcnt
    }

    /// Preferred-gateway tracker.
    pub fn preferred_gateway(&self) -> &PreferredGatewayTracker {
        &self.preferred
    }

    /// Get snapshot of current stats.
    pub fn stats(&self) -> BundlerStatsSnapshot {
        BundlerStatsSnapshot {
            requests: self.stats.requests.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            ownership_transfers: self.dedup.transfer_count(),
            stage_failures: self.stats.stage_failures.load(Ordering::Relaxed),
            deadline_exceeded: self.stats.deadline_exceeded.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::GatewayConnectionRegistry;
    use crate::store::InMemoryStore;

    fn gw(id: &str) -> GatewayId {
        GatewayId::new(id).unwrap()
    }

    fn bundler() -> FunctionBundler {
        FunctionBundler::with_standard_strategy(
            &BundlerConfig::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(GatewayConnectionRegistry::new()),
        )
    }

    #[test]
    fn test_pipeline_priorities() {
        let priorities: Vec<u8> = PIPELINE.iter().map(|s| s.priority()).collect();
        assert_eq!(priorities, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_stage_set_iterates_in_priority_order() {
        let set: StageSet = [Stage::PreferredGateway, Stage::Deduplication, Stage::FCntDown]
            .into_iter()
            .collect();
        let order: Vec<Stage> = set.iter().collect();
        assert_eq!(
            order,
            vec![Stage::Deduplication, Stage::FCntDown, Stage::PreferredGateway]
        );
        assert!(!set.contains(Stage::Adr));
        assert_eq!(StageSet::all().iter().count(), 4);
    }

    #[test]
    fn test_stage_set_serde() {
        let set = StageSet::empty().with(Stage::Adr).with(Stage::Deduplication);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["deduplication","adr"]"#);

        let parsed: StageSet = serde_json::from_str(r#"["fcnt_down","adr","adr"]"#).unwrap();
        assert_eq!(parsed, StageSet::empty().with(Stage::Adr).with(Stage::FCntDown));
        assert!(serde_json::from_str::<StageSet>(r#"["mac"]"#).is_err());
    }

    #[test]
    fn test_request_from_json() {
        let request: BundlerRequest = serde_json::from_str(
            r#"{
                "gateway_id": "gw-1",
                "client_fcnt_up": 12,
                "stages": ["deduplication", "preferred_gateway"],
                "radio": { "rssi": -87.5 }
            }"#,
        )
        .unwrap();
        assert_eq!(request.client_fcnt_down, 0);
        assert_eq!(request.radio.as_ref().unwrap().rssi, -87.5);
        request.validate().unwrap();

        let negative = r#"{"gateway_id":"gw-1","client_fcnt_up":-1,"stages":["deduplication"]}"#;
        assert!(serde_json::from_str::<BundlerRequest>(negative).is_err());
    }

    #[test]
    fn test_validate() {
        let dedup = StageSet::empty().with(Stage::Deduplication);
        assert!(BundlerRequest::new(gw("a"), 1, dedup).validate().is_ok());
        assert!(BundlerRequest::new(gw("a"), 1, StageSet::empty())
            .validate()
            .is_err());

        let adr = StageSet::empty().with(Stage::Adr);
        assert!(BundlerRequest::new(gw("a"), 1, adr).validate().is_err());
        assert!(BundlerRequest::new(gw("a"), 1, adr)
            .with_adr(AdrRequest::new(16, 0.0))
            .validate()
            .is_err());

        let pgw = StageSet::empty().with(Stage::PreferredGateway);
        assert!(BundlerRequest::new(gw("a"), 1, pgw).validate().is_err());
        assert!(BundlerRequest::new(gw("a"), 1, pgw)
            .with_radio(f64::NAN, None)
            .validate()
            .is_err());
        assert!(BundlerRequest::new(gw("a"), 1, pgw)
            .with_radio(-80.0, Some(f64::INFINITY))
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_unrequested_stages_stay_empty() {
        let bundler = bundler();
        let request =
            BundlerRequest::new(gw("a"), 1, StageSet::empty().with(Stage::Deduplication));
        let result = bundler.execute(DevEui::new(1), &request).await.unwrap();

        assert!(result.deduplication.is_some());
        assert!(result.adr.is_none());
        assert!(result.next_fcnt_down.is_none());
        assert!(result.preferred_gateway.is_none());
        assert!(result.failures.is_empty());
        assert!(!result.deadline_exceeded);
    }

    #[tokio::test]
    async fn test_duplicate_gets_no_downlink_counter() {
        let bundler = bundler();
        let dev = DevEui::new(1);
        let stages = StageSet::empty()
            .with(Stage::Deduplication)
            .with(Stage::FCntDown);

        let first = bundler
            .execute(dev, &BundlerRequest::new(gw("a"), 1, stages))
            .await
            .unwrap();
        assert_eq!(first.next_fcnt_down, Some(1));

        let second = bundler
            .execute(dev, &BundlerRequest::new(gw("b"), 1, stages))
            .await
            .unwrap();
        assert!(second.is_duplicate());
        assert_eq!(second.next_fcnt_down, None);
        assert!(second.failures.is_empty());

        let stats = bundler.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn test_fcnt_down_without_dedup_runs() {
        let bundler = bundler();
        let request = BundlerRequest::new(gw("a"), 1, StageSet::empty().with(Stage::FCntDown))
            .with_fcnt_down(9);
        let result = bundler.execute(DevEui::new(1), &request).await.unwrap();
        assert_eq!(result.next_fcnt_down, Some(10));
    }

    #[tokio::test]
    async fn test_preferred_gateway_stage() {
        let bundler = bundler();
        let request =
            BundlerRequest::new(gw("a"), 4, StageSet::empty().with(Stage::PreferredGateway))
                .with_radio(-1.2, Some(7.0));
        let result = bundler.execute(DevEui::new(1), &request).await.unwrap();

        assert_eq!(
            result.preferred_gateway,
            Some(PreferredGatewayResult {
                preferred_gateway_id: gw("a"),
                rssi: -1.2,
                request_fcnt_up: 4,
            })
        );
    }

    #[tokio::test]
    async fn test_weaker_duplicate_keeps_preferred_gateway() {
        let bundler = bundler();
        let dev = DevEui::new(1);
        let stages = StageSet::empty()
            .with(Stage::Deduplication)
            .with(Stage::PreferredGateway);

        let owner = BundlerRequest::new(gw("a"), 4, stages).with_radio(-40.0, None);
        let late = BundlerRequest::new(gw("b"), 4, stages).with_radio(-110.0, None);
        bundler.execute(dev, &owner).await.unwrap();
        let result = bundler.execute(dev, &late).await.unwrap();

        let preferred = result.preferred_gateway.unwrap();
        assert_eq!(preferred.preferred_gateway_id, gw("a"));
        assert_eq!(preferred.rssi, -40.0);
        assert_eq!(preferred.request_fcnt_up, 4);
    }

    #[test]
    fn test_client_fcnt_down_raises_adr_counter() {
        let mut adr = AdrRequest::new(0, 1.0);
        adr.fcnt_down = 20;
        assert!(matches!(with_client_fcnt_down(&adr, 7), Cow::Borrowed(_)));
        assert_eq!(with_client_fcnt_down(&adr, 7).fcnt_down, 20);
        assert_eq!(with_client_fcnt_down(&adr, 100).fcnt_down, 100);
    }

    #[tokio::test]
    async fn test_default_strategy_follows_configured_capture_count() {
        let mut config = BundlerConfig::default();
        config.adr.frame_count_capture_count = 10;
        let bundler = FunctionBundler::new(
            &config,
            Arc::new(InMemoryStore::new()),
            Arc::new(GatewayConnectionRegistry::new()),
            Arc::new(StandardRateStrategy::default()),
        );
        let dev = DevEui::new(1);
        let stages = StageSet::empty().with(Stage::Deduplication).with(Stage::Adr);

        let mut last = None;
        for fcnt in 1..=10 {
            let request =
                BundlerRequest::new(gw("a"), fcnt, stages).with_adr(AdrRequest::new(0, 1.0));
            last = bundler.execute(dev, &request).await.unwrap().adr;
        }
        let adr = last.unwrap();
        assert_eq!(adr.number_of_frames, 10);
        assert!(adr.recommendation().is_some());
        assert!(adr.can_confirm_to_device);
    }

    #[tokio::test]
    async fn test_rejected_request_counts() {
        let bundler = bundler();
        let request = BundlerRequest::new(gw("a"), 1, StageSet::empty());
        assert!(bundler.execute(DevEui::new(1), &request).await.is_err());

        let valid = BundlerRequest::new(gw("a"), 1, StageSet::all());
        let err = bundler.execute_raw("not-an-eui", &valid).await.unwrap_err();
        assert!(err.is_client_error());

        let stats = bundler.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.rejected, 2);
    }
}
