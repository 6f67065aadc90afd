// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::types::U256;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `value * bps / 10_000`, saturating.
pub fn apply_bps(value: U256, bps: u64) -> U256 {
    value.saturating_mul(U256::from(bps)) / U256::from(10_000u64)
}

/// Whether `part` is at least `percent`% of `whole`.
pub fn reaches_percent(part: U256, whole: U256, percent: u64) -> bool {
    if whole.is_zero() {
        return false;
    }
    part.saturating_mul(U256::from(100u64)) >= whole.saturating_mul(U256::from(percent))
}

/// Shorten a hex identifier for log lines.
pub fn short_hex(value: &impl std::fmt::LowerHex) -> String {
    let full = format!("{:#x}", value);
    if full.len() > 14 {
        format!("{}..{}", &full[..8], &full[full.len() - 4..])
    } else {
        full
    }
}
