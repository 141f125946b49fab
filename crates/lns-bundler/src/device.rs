// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device and gateway identities.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum gateway identifier length (bytes).
pub const MAX_GATEWAY_ID_LEN: usize = 128;

/// Identity parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("malformed DevEUI '{0}': expected 16 hexadecimal digits")]
    MalformedDevEui(String),

    #[error("invalid gateway id '{0}': {1}")]
    InvalidGatewayId(String, &'static str),
}

/// 64-bit LoRaWAN device EUI.
///
/// Displayed as 16 upper-case hex digits. Parsing is case-insensitive and
/// accepts `-` or `:` between byte pairs (`70-B3-D5-7E-D0-00-00-01`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevEui(u64);

impl DevEui {
    /// Create from the raw 64-bit value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw 64-bit value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Store key for a per-device record.
    pub fn store_key(&self, suffix: &str) -> String {
        format!("{}:{}", self, suffix)
    }
}

impl fmt::Display for DevEui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl FromStr for DevEui {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || IdentityError::MalformedDevEui(s.to_string());

        let digits: String = if s.contains(['-', ':']) {
            let groups: Vec<&str> = s.split(['-', ':']).collect();
            if groups.len() != 8 || groups.iter().any(|g| g.len() != 2) {
                return Err(malformed());
            }
            groups.concat()
        } else {
            s.to_string()
        };

        if digits.len() != 16 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed());
        }

        u64::from_str_radix(&digits, 16)
            .map(Self)
            .map_err(|_| malformed())
    }
}

impl Serialize for DevEui {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DevEui {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Gateway (LoRaWAN station) identifier.
///
/// Non-empty, at most [`MAX_GATEWAY_ID_LEN`] bytes, no whitespace and no `|`
/// (the separator of the preferred-gateway cache string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct GatewayId(String);

impl GatewayId {
    /// Validate and wrap a gateway identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdentityError::InvalidGatewayId(id, "empty"));
        }
        if id.len() > MAX_GATEWAY_ID_LEN {
            return Err(IdentityError::InvalidGatewayId(id, "too long"));
        }
        if id.contains('|') {
            return Err(IdentityError::InvalidGatewayId(id, "contains '|'"));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(IdentityError::InvalidGatewayId(id, "contains whitespace"));
        }
        Ok(Self(id))
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GatewayId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for GatewayId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}
