// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::config::FetchConfig;
use crate::error::BonderResult;
use crate::events::{BridgeLog, EventKind};
use crate::gateway::BridgeContract;
use crate::metrics::BonderMetrics;
use crate::retry_with_max_elapsed_time;
use crate::store::StateStore;
use crate::types::ChainId;
use crate::utils::now_secs;
use async_trait::async_trait;
use ethers::types::Address;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Passes in a row a handler may stop inside the same window before the
/// cursor skips past it.
const MAX_STOPPED_PASSES: u32 = 3;

pub type SyncResult<T> = Result<T, SyncError>;

/// Error type for sync operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Handler failed at block {block} log {log_index}: {error}")]
    Handler {
        block: u64,
        log_index: u64,
        error: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Whether the next tick may succeed without operator action
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::Rpc(_) | SyncError::Handler { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    Continue,
    /// End the scan after this event.
    Stop,
}

/// Consumer of decoded bridge events. Must tolerate seeing the same event
/// again after a failed window is retried.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, log: &BridgeLog) -> BonderResult<HandlerAction>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Cursor position after this pass, None when nothing was synced.
    pub synced_to: Option<u64>,
    pub events: usize,
    pub stopped: bool,
}

/// Walks one bridge deployment's blocks in bounded windows and feeds the
/// events to a handler in block/log order. The cursor is persisted after each
/// window the handler fully accepted, so a failed window is replayed as a
/// whole on the next pass.
pub struct EventSyncer {
    chain_name: String,
    bridge: Arc<dyn BridgeContract>,
    store: StateStore,
    config: FetchConfig,
    metrics: Arc<BonderMetrics>,
    start_block: u64,
    kinds: Vec<EventKind>,
    cursor_key: String,
    /// Start of the window the handler last stopped in, and how many passes
    /// in a row it did.
    stopped: Mutex<Option<(u64, u32)>>,
}

/// Cursor of a syncer that fetches every bridge event of a deployment.
pub fn full_cursor_key(chain_id: ChainId, bridge_address: Address) -> String {
    format!("{}:{:#x}:all", chain_id, bridge_address)
}

impl EventSyncer {
    pub fn new(
        chain_name: &str,
        bridge: Arc<dyn BridgeContract>,
        store: StateStore,
        config: FetchConfig,
        metrics: Arc<BonderMetrics>,
    ) -> Self {
        let cursor_key = full_cursor_key(bridge.chain_id(), bridge.bridge_address());
        Self {
            chain_name: chain_name.to_string(),
            bridge,
            store,
            config,
            metrics,
            start_block: 0,
            kinds: vec![],
            cursor_key,
            stopped: Mutex::new(None),
        }
    }

    /// First block scanned when no cursor has been stored yet.
    pub fn with_start_block(mut self, start_block: u64) -> Self {
        self.start_block = start_block;
        self
    }

    /// Only fetch `kinds`. Each kind set keeps a cursor of its own.
    pub fn with_kinds(mut self, kinds: &[EventKind]) -> Self {
        self.kinds = kinds.to_vec();
        let names = kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>();
        self.cursor_key = format!(
            "{}:{:#x}:{}",
            self.bridge.chain_id(),
            self.bridge.bridge_address(),
            names.join("+")
        );
        self
    }

    pub fn cursor_key(&self) -> &str {
        &self.cursor_key
    }

    /// Next block the syncer will look at.
    pub async fn next_block(&self) -> SyncResult<u64> {
        let cursor = self
            .store
            .sync_state
            .get(&self.cursor_key)
            .await
            .map_err(|e| SyncError::Store(e.to_string()))?;
        Ok(match cursor {
            Some(cursor) => (cursor.block_number + 1).max(self.start_block),
            None => self.start_block,
        })
    }

    async fn fetch_window(&self, from: u64, to: u64) -> SyncResult<Vec<BridgeLog>> {
        let start_time = Instant::now();
        let result = retry_with_max_elapsed_time!(
            self.bridge.get_logs(from, to, &self.kinds),
            self.config.max_retry_duration
        );
        match result {
            Ok(Ok(mut logs)) => {
                logs.sort_by_key(|l| l.position());
                debug!(
                    "[{}] Fetched {} logs in {:?} (blocks {}-{})",
                    self.chain_name,
                    logs.len(),
                    start_time.elapsed(),
                    from,
                    to
                );
                Ok(logs)
            }
            Ok(Err(e)) | Err(e) => {
                self.metrics
                    .sync_window_failures
                    .with_label_values(&[self.chain_name.as_str()])
                    .inc();
                Err(SyncError::Rpc(format!(
                    "log query for blocks {}-{} failed: {}",
                    from, to, e
                )))
            }
        }
    }

    /// Hand `logs` to the handler. Returns the number handled and whether the
    /// handler asked to stop.
    async fn dispatch(
        &self,
        logs: &[BridgeLog],
        handler: &dyn EventHandler,
    ) -> SyncResult<(usize, Option<(u64, u64)>)> {
        let mut handled = 0;
        for log in logs {
            let action = handler
                .handle(log)
                .await
                .map_err(|e| SyncError::Handler {
                    block: log.block_number,
                    log_index: log.log_index,
                    error: e.to_string(),
                })?;
            handled += 1;
            self.metrics
                .handled_events
                .with_label_values(&[self.chain_name.as_str(), log.event.kind().as_str()])
                .inc();
            if action == HandlerAction::Stop {
                return Ok((handled, Some(log.position())));
            }
        }
        Ok((handled, None))
    }

    /// Sync from the cursor up to the current head.
    pub async fn sync_once(&self, handler: &dyn EventHandler) -> SyncResult<SyncProgress> {
        let head = self
            .bridge
            .latest_block()
            .await
            .map_err(|e| SyncError::Rpc(e.to_string()))?;
        self.metrics
            .chain_head
            .with_label_values(&[self.chain_name.as_str()])
            .set(head as i64);

        let mut progress = SyncProgress::default();
        let mut from = self.next_block().await?;
        while from <= head {
            let to = head.min(from.saturating_add(self.config.max_block_range - 1));
            let logs = self.fetch_window(from, to).await?;
            let (handled, stopped_at) = self.dispatch(&logs, handler).await?;
            progress.events += handled;
            if let Some((block, log_index)) = stopped_at {
                progress.stopped = true;
                if !self.skip_stopped_window(from, to, block, log_index) {
                    // the rest of the window was not seen, keep the cursor
                    break;
                }
            } else {
                self.clear_stopped();
            }
            self.store
                .sync_state
                .advance(&self.cursor_key, to, now_secs())
                .await
                .map_err(|e| SyncError::Store(e.to_string()))?;
            self.metrics
                .last_synced_block
                .with_label_values(&[self.chain_name.as_str(), self.cursor_key.as_str()])
                .set(to as i64);
            progress.synced_to = Some(to);
            from = to + 1;
        }
        Ok(progress)
    }

    /// Count a handler stop inside `[from, to]`. True once the same window
    /// has been stopped in [`MAX_STOPPED_PASSES`] times in a row, after which
    /// the cursor moves past it.
    fn skip_stopped_window(&self, from: u64, to: u64, block: u64, log_index: u64) -> bool {
        self.metrics
            .sync_handler_stops
            .with_label_values(&[self.chain_name.as_str()])
            .inc();
        let mut stopped = match self.stopped.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let passes = match *stopped {
            Some((start, passes)) if start == from => passes + 1,
            _ => 1,
        };
        if passes >= MAX_STOPPED_PASSES {
            error!(
                "[{}] Handler stopped at block {} log {} in {} passes, skipping blocks {}-{}",
                self.chain_name, block, log_index, passes, from, to
            );
            *stopped = None;
            return true;
        }
        warn!(
            "[{}] Handler stopped at block {} log {} (pass {} of {}), blocks {}-{} will be replayed",
            self.chain_name, block, log_index, passes, MAX_STOPPED_PASSES, from, to
        );
        *stopped = Some((from, passes));
        false
    }

    fn clear_stopped(&self) {
        let mut stopped = match self.stopped.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *stopped = None;
    }

    /// Walk `[from, to]` without touching the cursor. Returns the position of
    /// the event the handler stopped at, if any.
    pub async fn scan(
        &self,
        from: u64,
        to: u64,
        handler: &dyn EventHandler,
    ) -> SyncResult<Option<(u64, u64)>> {
        let mut start = from;
        while start <= to {
            let end = to.min(start.saturating_add(self.config.max_block_range - 1));
            let logs = self.fetch_window(start, end).await?;
            let (_, stopped_at) = self.dispatch(&logs, handler).await?;
            if stopped_at.is_some() {
                return Ok(stopped_at);
            }
            start = end + 1;
        }
        Ok(None)
    }

    /// Sync until cancelled, pausing `poll_interval` between passes.
    pub async fn run(self, handler: Arc<dyn EventHandler>, cancel: CancellationToken) {
        let from = self.next_block().await.unwrap_or(self.start_block);
        info!(
            "[{}] Starting event sync for {} from block {}",
            self.chain_name, self.cursor_key, from
        );
        loop {
            match self.sync_once(handler.as_ref()).await {
                Ok(progress) => {
                    if progress.events > 0 {
                        debug!(
                            "[{}] Handled {} events, synced to {:?}",
                            self.chain_name, progress.events, progress.synced_to
                        );
                    }
                }
                Err(e) if e.is_recoverable() => {
                    warn!("[{}] Sync pass failed, retrying: {}", self.chain_name, e);
                }
                Err(e) => {
                    warn!("[{}] Sync pass failed: {}", self.chain_name, e);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{}] Event sync cancelled", self.chain_name);
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}
