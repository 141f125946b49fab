// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rate-adaptation strategies.

use super::AdrTable;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest LoRaWAN data rate index.
pub const MAX_DATA_RATE_INDEX: u8 = 15;

/// Packet-loss bucket x current repetitions -> next repetitions.
const PKT_LOSS_TO_NB_REP: [[u8; 3]; 4] = [[1, 1, 2], [1, 2, 3], [2, 3, 3], [3, 3, 3]];

/// Transmission parameters recommended to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub data_rate: u8,
    /// TX power index (0 = maximum power).
    pub tx_power: u8,
    pub nb_repetition: u8,
}

/// Strategy failure. The engine treats it as "no recommendation".
#[derive(Debug, Clone, Error)]
#[error("rate strategy failed: {0}")]
pub struct StrategyError(pub String);

/// Region-specific rate-adaptation policy.
///
/// Implementations must be pure: the engine may call them for every
/// gateway reporting the same frame.
pub trait RateStrategy: Send + Sync {
    /// Recommend parameters from the device history.
    ///
    /// # Arguments
    ///
    /// - `required_snr` -- demodulation floor of `data_rate` in the device's region
    /// - `data_rate` -- data rate of the current uplink
    /// - `min_tx_power_index` -- highest TX power index (lowest power) allowed
    /// - `max_data_rate` -- highest data rate allowed
    fn compute_recommendation(
        &self,
        table: &AdrTable,
        required_snr: f64,
        data_rate: u8,
        min_tx_power_index: u8,
        max_data_rate: u8,
    ) -> Result<Option<Recommendation>, StrategyError>;
}

/// Semtech-style ADR: SNR margin steps plus loss-driven repetitions.
#[derive(Debug, Clone)]
pub struct StandardRateStrategy {
    /// Installation margin subtracted from the measured SNR (dB).
    pub margin_db: f64,
    /// Repetitions used before the device confirmed any setting.
    pub default_nb_rep: u8,
}

impl Default for StandardRateStrategy {
    fn default() -> Self {
        Self {
            margin_db: 5.0,
            default_nb_rep: 1,
        }
    }
}

impl StandardRateStrategy {
    fn nb_repetition(&self, table: &AdrTable, current_nb_rep: u8) -> u8 {
        let (Some(first), Some(last)) = (table.entries().front(), table.entries().back()) else {
            return current_nb_rep;
        };

        let expected = u64::from(last.fcnt_up.saturating_sub(first.fcnt_up)) + 1;
        let received = table.len() as u64;
        let loss = 1.0 - (received.min(expected) as f64 / expected as f64);

        let row = if loss < 0.05 {
            0
        } else if loss < 0.10 {
            1
        } else if loss < 0.30 {
            2
        } else {
            3
        };
        let column = usize::from(current_nb_rep.clamp(1, 3) - 1);
        PKT_LOSS_TO_NB_REP[row][column]
    }

    fn power_and_data_rate(
        &self,
        max_snr: f64,
        required_snr: f64,
        data_rate: u8,
        tx_power: u8,
        min_tx_power_index: u8,
        max_data_rate: u8,
    ) -> (u8, u8) {
        let margin = max_snr - required_snr - self.margin_db;
        let mut n_step = (margin / 3.0).floor() as i32;
        let mut data_rate = data_rate;
        let mut tx_power = tx_power.min(min_tx_power_index);

        while n_step > 0 {
            if data_rate < max_data_rate {
                data_rate += 1;
            } else if tx_power < min_tx_power_index {
                tx_power += 1;
            } else {
                break;
            }
            n_step -= 1;
        }

        while n_step < 0 && tx_power > 0 {
            tx_power -= 1;
            n_step += 1;
        }

        (tx_power, data_rate)
    }
}

impl RateStrategy for StandardRateStrategy {
    fn compute_recommendation(
        &self,
        table: &AdrTable,
        required_snr: f64,
        data_rate: u8,
        min_tx_power_index: u8,
        max_data_rate: u8,
    ) -> Result<Option<Recommendation>, StrategyError> {
        // History length is gated by the engine
        if table.is_empty() {
            return Ok(None);
        }
        if max_data_rate > MAX_DATA_RATE_INDEX {
            return Err(StrategyError(format!(
                "max data rate {} out of range",
                max_data_rate
            )));
        }

        // First contact (or lost state): resynchronise the device on defaults
        let (Some(tx_power), Some(nb_rep)) = (table.current_tx_power, table.current_nb_rep) else {
            return Ok(Some(Recommendation {
                data_rate: data_rate.min(max_data_rate),
                tx_power: 0,
                nb_repetition: self.default_nb_rep,
            }));
        };

        let max_snr = table
            .entries()
            .iter()
            .map(|e| e.snr)
            .fold(f64::NEG_INFINITY, f64::max);

        let nb_repetition = self.nb_repetition(table, nb_rep);
        let (tx_power, data_rate) = self.power_and_data_rate(
            max_snr,
            required_snr,
            data_rate.min(max_data_rate),
            tx_power,
            min_tx_power_index,
            max_data_rate,
        );

        Ok(Some(Recommendation {
            data_rate,
            tx_power,
            nb_repetition,
        }))
    }
}
