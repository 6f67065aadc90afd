// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::time::Duration;

/// How a chain's event syncer walks blocks.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FetchConfig {
    /// Maximum number of blocks to query in a single log request
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,

    /// Interval between syncs once caught up with the head
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Maximum retry duration for a failed log query
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_max_retry_duration")]
    pub max_retry_duration: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_block_range: default_max_block_range(),
            poll_interval: default_poll_interval(),
            max_retry_duration: default_max_retry_duration(),
        }
    }
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_max_retry_duration() -> Duration {
    Duration::from_secs(600)
}

impl FetchConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_block_range == 0 {
            return Err("max-block-range must be positive".to_string());
        }
        if self.poll_interval.is_zero() {
            return Err("poll-interval must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_config_default() {
        let config = FetchConfig::default();
        assert_eq!(config.max_block_range, 1000);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fetch_config_from_yaml() {
        let config: FetchConfig =
            serde_yaml::from_str("max-block-range: 50\npoll-interval: 7\n").unwrap();
        assert_eq!(config.max_block_range, 50);
        assert_eq!(config.poll_interval, Duration::from_secs(7));
        assert_eq!(config.max_retry_duration, Duration::from_secs(600));

        let zero = FetchConfig {
            max_block_range: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }
}
