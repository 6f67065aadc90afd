// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Staggers cooperating bonder instances so the lowest ranked live instance
//! acts first. This only avoids races. The read-before-write check in each
//! watcher is what prevents double actions.

mod liveness;
mod transport;

pub use liveness::*;
pub use transport::*;

use crate::config::OrderingConfig;
use crate::error::{BonderError, BonderResult};
use crate::metrics::BonderMetrics;
use crate::utils::now_millis;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    pub hostname: String,
    pub declared_order: u32,
    pub sent_at_ms: u64,
}

pub struct OrderingCoordinator {
    config: OrderingConfig,
    liveness: RwLock<LivenessTable>,
    metrics: Arc<BonderMetrics>,
}

impl OrderingCoordinator {
    pub fn new(config: OrderingConfig, metrics: Arc<BonderMetrics>) -> Self {
        let liveness = LivenessTable::new(
            &config.hostname,
            config.declared_order,
            config.liveness_timeout,
        );
        Self {
            config,
            liveness: RwLock::new(liveness),
            metrics,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn declared_order(&self) -> u32 {
        self.config.declared_order
    }

    pub fn effective_order(&self) -> u32 {
        match self.liveness.read() {
            Ok(table) => table.effective_order(Instant::now()),
            Err(poisoned) => poisoned.into_inner().effective_order(Instant::now()),
        }
    }

    pub fn live_peers(&self) -> usize {
        match self.liveness.read() {
            Ok(table) => table.live_peers(Instant::now()),
            Err(poisoned) => poisoned.into_inner().live_peers(Instant::now()),
        }
    }

    pub fn observe(&self, message: &HeartbeatMessage) {
        let mut table = match self.liveness.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.observe(message, Instant::now());
    }

    fn heartbeat(&self) -> HeartbeatMessage {
        HeartbeatMessage {
            hostname: self.config.hostname.clone(),
            declared_order: self.config.declared_order,
            sent_at_ms: now_millis(),
        }
    }

    /// Start the publish and subscribe loops.
    pub fn spawn(
        self: &Arc<Self>,
        transport: Arc<dyn HeartbeatTransport>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let publisher = {
            let this = self.clone();
            let transport = transport.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { this.publish_loop(transport, cancel).await })
        };
        let subscriber = {
            let this = self.clone();
            tokio::spawn(async move { this.subscribe_loop(transport, cancel).await })
        };
        vec![publisher, subscriber]
    }

    async fn publish_loop(&self, transport: Arc<dyn HeartbeatTransport>, cancel: CancellationToken) {
        let mut interval = time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Heartbeat publisher cancelled");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = transport.publish(&self.heartbeat()).await {
                        warn!("Failed to publish heartbeat: {}", e);
                    }
                    self.metrics
                        .effective_order
                        .set(self.effective_order() as i64);
                    self.metrics.live_peers.set(self.live_peers() as i64);
                }
            }
        }
    }

    async fn subscribe_loop(&self, transport: Arc<dyn HeartbeatTransport>, cancel: CancellationToken) {
        loop {
            let mut stream = match transport.subscribe().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Heartbeat subscription failed: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = time::sleep(RESUBSCRIBE_DELAY) => continue,
                    }
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Heartbeat subscriber cancelled");
                        return;
                    }
                    message = stream.next() => match message {
                        Some(message) => self.observe(&message),
                        None => {
                            warn!("Heartbeat stream ended, resubscribing");
                            break;
                        }
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
    }

    /// Hold back for `wait_delay` per unit of effective order, polling
    /// `already_handled` while waiting. Returns `AlreadyHandled` as soon as
    /// it reports true.
    pub async fn wait_turn<F, Fut>(
        &self,
        label: &str,
        mut already_handled: F,
        cancel: &CancellationToken,
    ) -> BonderResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BonderResult<bool>>,
    {
        let order = self.effective_order();
        if order == 0 {
            return Ok(());
        }
        let budget = self.config.wait_delay.saturating_mul(order);
        debug!("[{}] effective order {}, waiting {:?}", label, order, budget);
        let deadline = time::Instant::now() + budget;
        loop {
            let now = time::Instant::now();
            if now >= deadline {
                break;
            }
            let step = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(BonderError::Cancelled),
                _ = time::sleep(step) => {}
            }
            if already_handled().await? {
                info!("[{}] handled by another bonder while waiting", label);
                return Err(BonderError::AlreadyHandled(label.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(hostname: &str, order: u32) -> OrderingConfig {
        OrderingConfig {
            heartbeat_interval: Duration::from_millis(10),
            liveness_timeout: Duration::from_millis(100),
            wait_delay: Duration::from_millis(40),
            poll_interval: Duration::from_millis(5),
            ..OrderingConfig::local(hostname, order)
        }
    }

    fn coordinator(hostname: &str, order: u32) -> Arc<OrderingCoordinator> {
        Arc::new(OrderingCoordinator::new(
            fast_config(hostname, order),
            Arc::new(BonderMetrics::new_for_testing()),
        ))
    }

    #[tokio::test]
    async fn test_first_in_line_does_not_wait() {
        let coordinator = coordinator("a", 0);
        let started = time::Instant::now();
        coordinator
            .wait_turn("t", || async { Ok(true) }, &CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_wait_turn_aborts_when_handled() {
        let coordinator = coordinator("b", 2);
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();
        let result = coordinator
            .wait_turn(
                "0xabc",
                move || {
                    let counter = counter.clone();
                    async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
                },
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result, Err(BonderError::AlreadyHandled("0xabc".into())));
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_turn_runs_full_budget() {
        let coordinator = coordinator("b", 1);
        let started = time::Instant::now();
        coordinator
            .wait_turn("t", || async { Ok(false) }, &CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_wait_turn_cancelled() {
        let coordinator = coordinator("b", 5);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = coordinator
            .wait_turn("t", || async { Ok(false) }, &cancel)
            .await;
        assert_eq!(result, Err(BonderError::Cancelled));
    }

    #[tokio::test]
    async fn test_promotion_over_local_transport() {
        let transport: Arc<dyn HeartbeatTransport> = Arc::new(LocalTransport::new());
        let first = coordinator("first", 0);
        let second = coordinator("second", 1);

        let first_cancel = CancellationToken::new();
        let second_cancel = CancellationToken::new();
        let mut handles = second.spawn(transport.clone(), second_cancel.clone());
        handles.extend(first.spawn(transport.clone(), first_cancel.clone()));

        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(second.effective_order(), 1);
        assert_eq!(second.live_peers(), 1);
        assert_eq!(first.effective_order(), 0);

        // first instance goes silent
        first_cancel.cancel();
        time::sleep(Duration::from_millis(250)).await;
        assert_eq!(second.effective_order(), 0);
        assert_eq!(second.live_peers(), 0);

        second_cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_heartbeat_wire_format() {
        let message = HeartbeatMessage {
            hostname: "bonder-1".into(),
            declared_order: 2,
            sent_at_ms: 5,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"hostname": "bonder-1", "declaredOrder": 2, "sentAtMs": 5})
        );
    }
}
