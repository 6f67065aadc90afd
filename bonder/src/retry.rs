// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Explicit call-site wrappers: bounded retry and per-key serialisation.

use crate::error::{BonderError, BonderResult};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Backoff for generic transient errors.
    pub fixed_delay: Duration,
    /// First backoff for rate limit errors, doubled per attempt.
    pub rate_limit_base: Duration,
    pub rate_limit_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            fixed_delay: Duration::from_secs(1),
            rate_limit_base: Duration::from_secs(1),
            rate_limit_cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, err: &BonderError, attempt: u32) -> Duration {
        if err.is_rate_limit() {
            let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
            self.rate_limit_base
                .saturating_mul(factor)
                .min(self.rate_limit_cap)
        } else {
            self.fixed_delay
        }
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            fixed_delay: Duration::from_millis(1),
            rate_limit_base: Duration::from_millis(1),
            rate_limit_cap: Duration::from_millis(4),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget runs out.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> BonderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BonderResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(&e, attempt);
                debug!(
                    "[{}] attempt {}/{} failed: {}, retrying in {:?}",
                    label,
                    attempt + 1,
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(
                        "[{}] giving up after {} attempts: {}",
                        label, policy.max_attempts, e
                    );
                }
                return Err(e);
            }
        }
    }
}

/// One async lock per key, created on demand.
pub struct KeyedQueue<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedQueue<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // drop slots nobody holds or waits on
        locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.slot(key).lock_owned().await
    }

    /// Exclusive access to `key` if nobody else holds it.
    pub fn try_lock(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        self.slot(key).try_lock_owned().ok()
    }

    /// Run `fut` while holding the lock for `key`.
    pub async fn run<T, Fut>(&self, key: &K, fut: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        fut.await
    }

    pub fn len(&self) -> usize {
        match self.locks.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::for_testing(), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BonderError::TransientProviderError("timeout".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: BonderResult<()> = with_retry(&RetryPolicy::for_testing(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BonderError::ProviderError("execution reverted".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: BonderResult<()> = with_retry(&RetryPolicy::for_testing(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BonderError::RateLimited("429".into()))
        })
        .await;
        assert!(result.unwrap_err().is_rate_limit());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_rate_limit_backoff_is_capped() {
        let policy = RetryPolicy::default();
        let err = BonderError::RateLimited("429".into());
        assert_eq!(policy.delay_for(&err, 0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(&err, 3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(&err, 10), Duration::from_secs(30));
        let other = BonderError::TransientProviderError("x".into());
        assert_eq!(policy.delay_for(&other, 10), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_keyed_queue_excludes_per_key() {
        let queue = KeyedQueue::<u32>::new();
        let guard = queue.try_lock(&1).unwrap();
        assert!(queue.try_lock(&1).is_none());
        assert!(queue.try_lock(&2).is_some());
        drop(guard);
        assert!(queue.try_lock(&1).is_some());
    }

    #[tokio::test]
    async fn test_keyed_queue_serialises_runs() {
        let queue = Arc::new(KeyedQueue::<u32>::new());
        let active = Arc::new(AtomicU32::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let queue = queue.clone();
            let active = active.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(&1, async {
                        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}
