// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LoRaWAN Network Server Function Bundler
//!
//! Arbitrates the per-uplink decisions that every gateway hearing a device
//! asks for concurrently.
//!
//! # Features
//!
//! - **Deduplication**: exactly one gateway owns each uplink
//! - **ADR**: bounded signal history and data rate / power recommendations
//! - **Downlink frame counters**: strictly increasing, never reused
//! - **Preferred gateway**: best recent link for Class C downlinks
//!
//! All per-device state lives in a [`KeyedStore`] and is mutated through
//! compare-and-set, so any number of bundler instances can share one store.
//!
//! # Quick Start
//!
//! ```no_run
//! use lns_bundler::{
//!     BundlerConfig, BundlerRequest, DevEui, FunctionBundler, GatewayConnectionRegistry,
//!     GatewayId, InMemoryStore, Stage, StageSet,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let bundler = FunctionBundler::with_standard_strategy(
//!     &BundlerConfig::default(),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(GatewayConnectionRegistry::new()),
//! );
//!
//! let dev_eui: DevEui = "70B3D57ED0000001".parse()?;
//! let stages = StageSet::empty()
//!     .with(Stage::Deduplication)
//!     .with(Stage::FCntDown);
//! let request = BundlerRequest::new(GatewayId::new("gw-1")?, 12, stages);
//!
//! let result = bundler.execute(dev_eui, &request).await?;
//! if !result.is_duplicate() {
//!     println!("reply with fcnt down {:?}", result.next_fcnt_down);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! name = "lns-bundler"
//! request_timeout_ms = 2000
//!
//! [store]
//! ownership_ttl_secs = 60
//! max_cas_attempts = 64
//!
//! [deduplication]
//! close_connection_timeout_ms = 5000
//!
//! [adr]
//! frame_count_capture_count = 20
//! ```

pub mod adr;
pub mod bundler;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod device;
pub mod error;
pub mod fcnt;
pub mod preferred;
pub mod store;

pub use adr::{AdrEngine, AdrRequest, AdrResult, RateStrategy, Recommendation, StandardRateStrategy};
pub use bundler::{
    BundlerRequest, BundlerResult, BundlerStatsSnapshot, FunctionBundler, PreferredGatewayResult,
    RadioMetadata, Stage, StageFailure, StageSet, PIPELINE,
};
pub use config::{BundlerConfig, ConfigError};
pub use connection::{
    CloseConnectionRequest, CloseError, ConnectionCloser, GatewayCommand, GatewayConnectionRegistry,
};
pub use dedup::{DeduplicationEngine, DeduplicationResult, OwnershipRecord};
pub use device::{DevEui, GatewayId};
pub use error::BundlerError;
pub use fcnt::FcntDownArbiter;
pub use preferred::{PreferredGatewayRecord, PreferredGatewayTracker};
pub use store::{InMemoryStore, KeyedStore, StoreError};
