// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway connection management.
//!
//! The transport layer keeps an exclusive downstream connection per device.
//! When deduplication moves ownership to another gateway, the previous
//! owner is asked to drop its connection so the new owner can take it.
//!
//! # How it works
//!
//! 1. Each gateway connection task registers a command channel
//! 2. On ownership transfer the bundler looks up the previous owner
//! 3. A [`GatewayCommand::CloseConnection`] is queued to that task
//!
//! Delivery is best-effort: the bundler logs failures and moves on.

use crate::device::{DevEui, GatewayId};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Payload of a close-connection request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseConnectionRequest {
    /// Device whose connection must be released.
    pub dev_eui: DevEui,
    /// Uplink frame counter that triggered the ownership transfer.
    pub fcnt_up: u32,
}

/// Close-connection failures. Never surfaced to bundler callers.
#[derive(Debug, Clone, Error)]
pub enum CloseError {
    #[error("gateway {0} not connected")]
    NotFound(GatewayId),

    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    #[error("close-connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Remote invocation against a gateway's runtime.
pub trait ConnectionCloser: Send + Sync {
    /// Ask `gateway` to close its connection for `request.dev_eui`.
    fn close_device_connection<'a>(
        &'a self,
        gateway: &'a GatewayId,
        request: CloseConnectionRequest,
    ) -> BoxFuture<'a, Result<(), CloseError>>;
}

/// Command delivered to a gateway connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCommand {
    CloseConnection(CloseConnectionRequest),
}

/// Connection registry statistics.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Close commands handed to a gateway task.
    pub commands_sent: AtomicU64,
    /// Commands for gateways that were not registered.
    pub not_found: AtomicU64,
    /// Commands whose channel was closed or full.
    pub send_errors: AtomicU64,
}

/// Gateway connection tasks indexed by gateway id.
///
/// Uses a channel per gateway to reach the connection handler task.
#[derive(Debug, Default)]
pub struct GatewayConnectionRegistry {
    connections: DashMap<GatewayId, mpsc::Sender<GatewayCommand>>,
    stats: ConnectionStats,
}

impl GatewayConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gateway connection task.
    pub fn register(&self, gateway: GatewayId, tx: mpsc::Sender<GatewayCommand>) {
        self.connections.insert(gateway, tx);
    }

    /// Unregister a gateway connection task.
    pub fn unregister(&self, gateway: &GatewayId) {
        self.connections.remove(gateway);
    }

    /// Check if a gateway is connected.
    pub fn is_connected(&self, gateway: &GatewayId) -> bool {
        self.connections.contains_key(gateway)
    }

    /// Number of registered gateways.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Registry statistics.
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

impl ConnectionCloser for GatewayConnectionRegistry {
    fn close_device_connection<'a>(
        &'a self,
        gateway: &'a GatewayId,
        request: CloseConnectionRequest,
    ) -> BoxFuture<'a, Result<(), CloseError>> {
        async move {
            // Clone the sender so no shard lock is held across the send
            let tx = match self.connections.get(gateway) {
                Some(entry) => entry.value().clone(),
                None => {
                    self.stats.not_found.fetch_add(1, Ordering::Relaxed);
                    return Err(CloseError::NotFound(gateway.clone()));
                }
            };

            match tx.send(GatewayCommand::CloseConnection(request)).await {
                Ok(()) => {
                    self.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(_) => {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    Err(CloseError::Transport(format!(
                        "connection task for {} has stopped",
                        gateway
                    )))
                }
            }
        }
        .boxed()
    }
}
