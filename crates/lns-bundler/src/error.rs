// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bundler error types.

use crate::device::{DevEui, IdentityError};
use crate::store::StoreError;
use thiserror::Error;

/// Errors returned by bundler stages and the orchestrator.
///
/// Every variant is scoped to a single request for a single device.
#[derive(Debug, Error)]
pub enum BundlerError {
    /// Rejected before any stage executed; no state was mutated.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The downlink frame counter reached `u32::MAX`.
    #[error("Downlink frame counter exhausted for {0}")]
    CounterExhausted(DevEui),
}

impl From<IdentityError> for BundlerError {
    fn from(e: IdentityError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

impl BundlerError {
    /// True for errors caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}
