// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Single-value cache with expiry, used to avoid hammering providers for data
//! that changes slowly (chain head, contract constants).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug)]
pub struct TtlCache<T: Clone> {
    slot: RwLock<Option<(T, Instant)>>,
    cache_duration: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(cache_duration: Duration) -> Self {
        Self {
            slot: RwLock::new(None),
            cache_duration,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get_if_valid(&self) -> Option<T> {
        let slot = self.slot.read().await;
        match slot.as_ref() {
            Some((value, updated_at)) if updated_at.elapsed() < self.cache_duration => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn update(&self, value: T) {
        let mut slot = self.slot.write().await;
        *slot = Some((value, Instant::now()));
    }

    pub async fn invalidate(&self) {
        let mut slot = self.slot.write().await;
        *slot = None;
    }

    /// Return the cached value or fetch and cache a fresh one.
    pub async fn get_or_fetch<E, F, Fut>(&self, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get_if_valid().await {
            return Ok(value);
        }
        let value = fetch().await?;
        self.update(value.clone()).await;
        Ok(value)
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_value_expires() {
        let cache = TtlCache::<u64>::new(Duration::from_millis(50));
        assert_eq!(cache.get_if_valid().await, None);
        cache.update(12345).await;
        assert_eq!(cache.get_if_valid().await, Some(12345));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get_if_valid().await, None);
        assert_eq!(cache.stats(), (1, 2));
    }

    #[tokio::test]
    async fn test_get_or_fetch_only_fetches_when_stale() {
        let cache = TtlCache::<u64>::new(Duration::from_secs(60));
        let first: Result<u64, ()> = cache.get_or_fetch(|| async { Ok(1) }).await;
        let second: Result<u64, ()> = cache.get_or_fetch(|| async { Ok(2) }).await;
        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(1));
        cache.invalidate().await;
        let third: Result<u64, ()> = cache.get_or_fetch(|| async { Ok(3) }).await;
        assert_eq!(third, Ok(3));
    }
}
