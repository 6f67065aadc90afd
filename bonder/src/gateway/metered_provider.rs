// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::metrics::BonderMetrics;
use ethers::providers::{Http, HttpClientError, JsonRpcClient, Provider};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use url::{ParseError, Url};

/// Concurrent requests allowed against one provider
const MAX_CONCURRENT_REQUESTS: usize = 4;

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

fn is_rate_limit_error(e: &HttpClientError) -> bool {
    // Some providers answer with non standard bodies such as
    // {"code":-32005,"message":"Too Many Requests"} which fail to deserialize
    let error_str = format!("{:?}", e).to_lowercase();
    error_str.contains("rate limit")
        || error_str.contains("429")
        || error_str.contains("too many requests")
        || error_str.contains("quota exceeded")
        || error_str.contains("-32005")
}

/// HTTP transport that records per-method metrics, bounds concurrency and
/// backs off on rate limiting.
#[derive(Debug, Clone)]
pub struct MeteredEthHttpProvider {
    inner: Http,
    chain: String,
    metrics: Arc<BonderMetrics>,
    semaphore: Arc<tokio::sync::Semaphore>,
}

#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
impl JsonRpcClient for MeteredEthHttpProvider {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        // The semaphore is never closed, a failed acquire just skips the limit
        let _permit = self.semaphore.acquire().await.ok();

        self.metrics
            .rpc_queries
            .with_label_values(&[self.chain.as_str(), method])
            .inc();
        let _guard = self
            .metrics
            .rpc_queries_latency
            .with_label_values(&[self.chain.as_str(), method])
            .start_timer();

        let mut result = self.inner.request(method, &params).await;
        let mut retry_count = 0;
        while retry_count < MAX_RATE_LIMIT_RETRIES {
            match &result {
                Err(e) if is_rate_limit_error(e) => {}
                _ => break,
            }
            self.metrics
                .rpc_rate_limited
                .with_label_values(&[self.chain.as_str()])
                .inc();
            // 1s, 2s, 4s
            let backoff_duration = Duration::from_secs(1 << retry_count);
            tracing::warn!(
                "[{}] Rate limited on {}, retrying after {:?} (attempt {}/{})",
                self.chain,
                method,
                backoff_duration,
                retry_count + 1,
                MAX_RATE_LIMIT_RETRIES
            );
            tokio::time::sleep(backoff_duration).await;
            result = self.inner.request(method, &params).await;
            retry_count += 1;
        }

        let connected = if result.is_ok() { 1 } else { 0 };
        self.metrics
            .rpc_node_connected
            .with_label_values(&[self.chain.as_str()])
            .set(connected);
        result
    }
}

impl MeteredEthHttpProvider {
    pub fn new(url: impl Into<Url>, chain: &str, metrics: Arc<BonderMetrics>) -> Self {
        Self {
            inner: Http::new(url),
            chain: chain.to_string(),
            metrics,
            semaphore: Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_REQUESTS)),
        }
    }
}

pub fn new_metered_eth_provider(
    url: &str,
    chain: &str,
    metrics: Arc<BonderMetrics>,
) -> Result<Provider<MeteredEthHttpProvider>, ParseError> {
    let http_provider = MeteredEthHttpProvider::new(Url::parse(url)?, chain, metrics);
    Ok(Provider::new(http_provider))
}
