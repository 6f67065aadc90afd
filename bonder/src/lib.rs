// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::too_many_arguments, clippy::new_without_default)]

pub mod abi;
pub mod chain_syncer;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod merkle;
pub mod metrics;
pub mod node;
pub mod notifier;
pub mod ordering;
pub mod retry;
pub mod server;
pub mod store;
pub mod submitter;
pub mod ttl_cache;
pub mod types;
pub mod utils;
pub mod watchers;

#[cfg(test)]
pub(crate) mod test_utils;

#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // The following delay sequence (in secs) will be used, applied with jitter
        // 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 51.2, 102.4, 120, 120 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => {
                        return Ok(result);
                    }
                    Err(e) => {
                        // Every error is treated as transient until max_elapsed_time runs out
                        tracing::debug!("Retrying due to error: {:?}", e);
                        return Err(backoff::Error::transient(e));
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
