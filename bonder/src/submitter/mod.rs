// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transaction submission for one signer on one chain.
//!
//! A single task owns the signer's nonce. Callers talk to it through a
//! [`SubmitterHandle`]; every send is handled to completion (nonce choice,
//! persistence, network round trip) before the next one is read from the
//! channel, so two callers can never be given the same nonce.

mod broadcaster;
mod gas_boost;
mod nonce;

pub use broadcaster::*;
pub use gas_boost::{clamp_fees, next_boost_fees};
pub use nonce::*;

use crate::config::GasConfig;
use crate::error::{BonderError, BonderResult, ErrorClass};
use crate::metrics::BonderMetrics;
use crate::notifier::{Severity, SharedNotifier};
use crate::store::{BoostAttempt, BoostState, GasBoostTransaction, StateStore};
use crate::types::{ChainId, ReceiptInfo, TxRequest};
use crate::utils::now_secs;
use ethers::types::{Address, H256};
use gas_boost::{status_to_result, BoostTracker};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMMAND_CHANNEL_SIZE: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Pending { tx_hash: H256, boost_count: u32 },
    Confirmed(ReceiptInfo),
    Reverted(ReceiptInfo),
    Abandoned(String),
}

/// A transaction accepted by the submitter.
#[derive(Debug)]
pub struct TransactionHandle {
    chain_id: ChainId,
    nonce: u64,
    tx_hash: H256,
    status: watch::Receiver<TxStatus>,
}

impl TransactionHandle {
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Hash of the first attempt. Fee bumps produce new hashes.
    pub fn tx_hash(&self) -> H256 {
        self.tx_hash
    }

    pub fn status(&self) -> TxStatus {
        self.status.borrow().clone()
    }

    /// Wait until the transaction is mined. A revert is returned as
    /// [`BonderError::TxReverted`].
    pub async fn wait(mut self) -> BonderResult<ReceiptInfo> {
        loop {
            let current = {
                let status = self.status.borrow();
                status_to_result(&status)
            };
            if let Some(result) = current {
                return result;
            }
            if self.status.changed().await.is_err() {
                let status = self.status.borrow();
                return status_to_result(&status).unwrap_or(Err(BonderError::Cancelled));
            }
        }
    }
}

enum SubmitterCommand {
    Send {
        request: TxRequest,
        respond: oneshot::Sender<BonderResult<TransactionHandle>>,
    },
    NextNonce {
        respond: oneshot::Sender<BonderResult<u64>>,
    },
}

#[derive(Clone)]
pub struct SubmitterHandle {
    chain_id: ChainId,
    signer: Address,
    sender: mpsc::Sender<SubmitterCommand>,
}

impl SubmitterHandle {
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn signer(&self) -> Address {
        self.signer
    }

    pub async fn send(&self, request: TxRequest) -> BonderResult<TransactionHandle> {
        let (respond, rx) = oneshot::channel();
        self.sender
            .send(SubmitterCommand::Send { request, respond })
            .await
            .map_err(|_| BonderError::InternalError("submitter stopped".into()))?;
        rx.await
            .map_err(|_| BonderError::InternalError("submitter dropped the request".into()))?
    }

    /// Nonce the next send will use.
    pub async fn next_nonce(&self) -> BonderResult<u64> {
        let (respond, rx) = oneshot::channel();
        self.sender
            .send(SubmitterCommand::NextNonce { respond })
            .await
            .map_err(|_| BonderError::InternalError("submitter stopped".into()))?;
        rx.await
            .map_err(|_| BonderError::InternalError("submitter dropped the request".into()))?
    }
}

pub struct Submitter {
    broadcaster: Arc<dyn TxBroadcaster>,
    store: StateStore,
    config: GasConfig,
    metrics: Arc<BonderMetrics>,
    notifier: SharedNotifier,
    token: String,
    nonce: NonceTracker,
    cancel: CancellationToken,
}

impl Submitter {
    pub fn new(
        broadcaster: Arc<dyn TxBroadcaster>,
        store: StateStore,
        config: GasConfig,
        metrics: Arc<BonderMetrics>,
        notifier: SharedNotifier,
        token: &str,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            broadcaster,
            store,
            config,
            metrics,
            notifier,
            token: token.to_string(),
            nonce: NonceTracker::new(),
            cancel,
        }
    }

    /// Start the owning task. Pending records left by a previous run are
    /// picked up before the first command is served.
    pub fn spawn(self) -> (SubmitterHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let handle = SubmitterHandle {
            chain_id: self.broadcaster.chain_id(),
            signer: self.broadcaster.signer_address(),
            sender,
        };
        let join = tokio::spawn(self.run(receiver));
        (handle, join)
    }

    fn chain(&self) -> String {
        self.broadcaster.chain_id().to_string()
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<SubmitterCommand>) {
        let chain = self.chain();
        info!(
            "[{}] Starting submitter for {:?}",
            chain,
            self.broadcaster.signer_address()
        );
        self.recover().await;

        let period = self.config.reconcile_interval;
        let mut reconcile = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("[{}] Submitter cancelled", chain);
                    break;
                }
                command = receiver.recv() => {
                    let Some(command) = command else {
                        info!("[{}] All submitter handles dropped", chain);
                        break;
                    };
                    match command {
                        SubmitterCommand::Send { request, respond } => {
                            let result = self.handle_send(request).await;
                            let _ = respond.send(result);
                        }
                        SubmitterCommand::NextNonce { respond } => {
                            let _ = respond.send(self.ensure_seeded().await);
                        }
                    }
                }
                _ = reconcile.tick() => {
                    self.reconcile().await;
                }
            }
        }
    }

    async fn ensure_seeded(&mut self) -> BonderResult<u64> {
        if let Some(next) = self.nonce.peek() {
            return Ok(next);
        }
        let chain_id = self.broadcaster.chain_id();
        let from = self.broadcaster.signer_address();
        let provider_pending = self.broadcaster.pending_nonce().await?;
        let highest_persisted = self
            .store
            .gas_boost
            .for_signer(chain_id, from)
            .await?
            .iter()
            // abandoned before any broadcast: the nonce was never used
            .filter(|r| !r.attempts.is_empty() || !r.is_terminal())
            .map(|r| r.nonce)
            .max();
        let next = self.nonce.seed(provider_pending, highest_persisted);
        info!(
            "[{}] Nonce seeded at {} (provider {}, persisted {:?})",
            chain_id, next, provider_pending, highest_persisted
        );
        self.metrics
            .tracked_nonce
            .with_label_values(&[self.chain().as_str()])
            .set(next as i64);
        Ok(next)
    }

    fn mark_consumed(&mut self, nonce: u64) {
        self.nonce.consumed(nonce);
        if let Some(next) = self.nonce.peek() {
            self.metrics
                .tracked_nonce
                .with_label_values(&[self.chain().as_str()])
                .set(next as i64);
        }
    }

    async fn handle_send(&mut self, mut request: TxRequest) -> BonderResult<TransactionHandle> {
        let chain_id = self.broadcaster.chain_id();
        let chain = self.chain();
        if request.chain_id != chain_id {
            return Err(BonderError::InvalidCall(format!(
                "request for chain {} sent to submitter of chain {}",
                request.chain_id, chain_id
            )));
        }
        let nonce = self.ensure_seeded().await?;
        if request.gas_limit.is_none() {
            request.gas_limit = Some(self.broadcaster.estimate_gas(&request).await?);
        }
        let suggested = self.broadcaster.suggest_fees().await?;
        let (fees, lowered) = clamp_fees(&suggested, self.config.max_gas_price);
        if lowered {
            warn!(
                "[{}] market fees {} above ceiling {}, sending {} at the ceiling",
                chain,
                suggested.max_price(),
                self.config.max_gas_price,
                request.label
            );
        }

        let mut record = GasBoostTransaction {
            chain_id,
            from: self.broadcaster.signer_address(),
            nonce,
            request: request.clone(),
            fees,
            boost_count: 0,
            attempts: vec![],
            state: BoostState::Pending,
            created_at: now_secs(),
            max_fee_reached: lowered,
        };
        // persisted before broadcast so a crash leaves a recoverable record
        self.store.gas_boost.put(&record).await?;

        match self.broadcaster.broadcast(&request, nonce, &fees).await {
            Ok(tx_hash) => {
                self.mark_consumed(nonce);
                record.attempts.push(BoostAttempt {
                    tx_hash,
                    fees,
                    sent_at: now_secs(),
                });
                if let Err(e) = self.store.gas_boost.put(&record).await {
                    error!(
                        "[{}] failed to persist attempt for nonce {}: {}",
                        chain, nonce, e
                    );
                }
                self.metrics
                    .tx_submitted
                    .with_label_values(&[chain.as_str(), request.label.as_str()])
                    .inc();
                info!(
                    "[{}] Sent {} with nonce {} at {} wei: {:?}",
                    chain,
                    request.label,
                    nonce,
                    fees.max_price(),
                    tx_hash
                );
                let status = self.spawn_tracker(record, tx_hash);
                Ok(TransactionHandle {
                    chain_id,
                    nonce,
                    tx_hash,
                    status,
                })
            }
            Err(e) if e.class() == ErrorClass::NonceTooLow => {
                // a transaction from this signer landed out of band
                self.mark_consumed(nonce);
                record.state = BoostState::Abandoned {
                    reason: "nonce too low".into(),
                };
                self.persist(&record).await;
                warn!(
                    "[{}] Nonce {} for {} already used, tracked nonce advanced",
                    chain, nonce, request.label
                );
                Err(BonderError::NonceTooLow { nonce })
            }
            Err(e) => {
                record.state = BoostState::Abandoned {
                    reason: e.to_string(),
                };
                self.persist(&record).await;
                error!(
                    "[{}] Failed to send {} with nonce {}: {}",
                    chain, request.label, nonce, e
                );
                if !e.is_transient() {
                    self.notifier
                        .notify(
                            Severity::Warning,
                            "submission failed",
                            &format!("chain {} {}: {}", chain, request.label, e),
                        )
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn persist(&self, record: &GasBoostTransaction) {
        if let Err(e) = self.store.gas_boost.put(record).await {
            error!(
                "[{}] failed to persist gas boost record {}: {}",
                self.chain(),
                record.key(),
                e
            );
        }
    }

    fn spawn_tracker(&self, record: GasBoostTransaction, tx_hash: H256) -> watch::Receiver<TxStatus> {
        let (status, receiver) = watch::channel(TxStatus::Pending {
            tx_hash,
            boost_count: record.boost_count,
        });
        let tracker = BoostTracker {
            broadcaster: self.broadcaster.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            notifier: self.notifier.clone(),
            token: self.token.clone(),
            status,
            cancel: self.cancel.child_token(),
        };
        tokio::spawn(tracker.run(record));
        receiver
    }

    /// Resume tracking of records a previous process left pending.
    async fn recover(&mut self) {
        let chain = self.chain();
        let records = match self
            .store
            .gas_boost
            .pending_for_signer(self.broadcaster.chain_id(), self.broadcaster.signer_address())
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!("[{}] failed to load pending transactions: {}", chain, e);
                return;
            }
        };
        for mut record in records {
            if record.attempts.is_empty() {
                match self
                    .broadcaster
                    .broadcast(&record.request, record.nonce, &record.fees)
                    .await
                {
                    Ok(tx_hash) => {
                        record.attempts.push(BoostAttempt {
                            tx_hash,
                            fees: record.fees,
                            sent_at: now_secs(),
                        });
                        self.persist(&record).await;
                    }
                    Err(e) if e.class() == ErrorClass::NonceTooLow => {
                        record.state = BoostState::Abandoned {
                            reason: "nonce consumed".into(),
                        };
                        self.persist(&record).await;
                        warn!(
                            "[{}] Recovered nonce {} ({}) was consumed before broadcast",
                            chain, record.nonce, record.request.label
                        );
                        continue;
                    }
                    Err(e) => {
                        // the tracker re-sends once the boost interval passes
                        warn!(
                            "[{}] Re-broadcast of recovered nonce {} failed: {}",
                            chain, record.nonce, e
                        );
                    }
                }
            }
            info!(
                "[{}] Resuming tracking of nonce {} ({}), {} attempts",
                chain,
                record.nonce,
                record.request.label,
                record.attempts.len()
            );
            let first = record.tx_hashes().first().copied().unwrap_or_default();
            self.spawn_tracker(record, first);
        }
    }

    async fn reconcile(&mut self) {
        if !self.nonce.is_seeded() {
            return;
        }
        let chain = self.chain();
        let provider_pending = match self.broadcaster.pending_nonce().await {
            Ok(n) => n,
            Err(e) => {
                debug!("[{}] nonce reconciliation skipped: {}", chain, e);
                return;
            }
        };
        match self.nonce.check_drift(provider_pending) {
            NonceDrift::InSync => debug!("[{}] nonce in sync at {}", chain, provider_pending),
            drift => {
                self.metrics
                    .nonce_drift
                    .with_label_values(&[chain.as_str()])
                    .inc();
                warn!("[{}] nonce drift detected: {:?}", chain, drift);
                self.notifier
                    .notify(
                        Severity::Warning,
                        "nonce drift",
                        &format!(
                            "chain {} signer {:?}: {:?}",
                            chain,
                            self.broadcaster.signer_address(),
                            drift
                        ),
                    )
                    .await;
            }
        }
    }
}
