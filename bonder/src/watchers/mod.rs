// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle watchers.
//!
//! Each watcher reads the state store, polls its chain for the facts it needs
//! and decides whether an action is due. Every action follows the same steps:
//! guard checks, wait for the ordering turn, re-read state, submit.
//!
//! ```text
//!  syncers ──▶ StateStore ◀── watchers ──▶ OrderingCoordinator
//!                                │
//!                                ▼
//!                      SubmitterHandle (per chain)
//! ```

mod bond_root;
mod bond_withdrawal;
mod challenge;
mod commit;
mod confirm_root;
mod event_handler;
mod settle;
mod supervisor;

pub use bond_root::BondRootWatcher;
pub use bond_withdrawal::BondWithdrawalWatcher;
pub use challenge::ChallengeWatcher;
pub use commit::CommitWatcher;
pub use confirm_root::{
    ConfirmRootWatcher, ExitProof, ExitProofProvider, HttpExitProofProvider, RelayStrategy,
};
pub use event_handler::StoreEventHandler;
pub use settle::SettleWatcher;
pub use supervisor::WatcherSupervisor;

use crate::config::BonderNodeConfig;
use crate::error::{BonderError, BonderResult, ErrorClass};
use crate::gateway::{BridgeContract, ContractCall};
use crate::merkle::check_root;
use crate::metrics::BonderMetrics;
use crate::notifier::{Severity, SharedNotifier};
use crate::ordering::OrderingCoordinator;
use crate::retry::KeyedQueue;
use crate::store::StateStore;
use crate::submitter::{SubmitterHandle, TransactionHandle};
use crate::types::{
    ChainFamily, ChainId, ChainRole, ReceiptInfo, RootHash, TransferId, TransferRoot, TxRequest,
};
use crate::utils::now_secs;
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Violations of the same root after which the alert is escalated.
const INVARIANT_ESCALATION_THRESHOLD: u32 = 3;

/// A sent bond counts against credit this long before it is reconsidered.
pub(crate) const BOND_IN_FLIGHT_TIMEOUT_SECS: u64 = 600;

const CREDIT_LOCK: &str = "credit";

/// One watcher acting on one subject of one chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ActionKey {
    pub watcher: &'static str,
    pub chain_id: ChainId,
    /// Transfer id, root hash, or any other id the watcher decides on.
    pub subject: H256,
}

pub struct ChainEntry {
    pub chain_id: ChainId,
    pub name: String,
    pub role: ChainRole,
    pub family: ChainFamily,
    pub bridge: Arc<dyn BridgeContract>,
    pub submitter: SubmitterHandle,
    pub messenger: Option<Address>,
}

/// Every configured chain, looked up by id. Watchers reach sibling chains
/// through here instead of holding references to each other.
pub struct ChainRegistry {
    entries: Vec<ChainEntry>,
    index: HashMap<ChainId, usize>,
    l1: usize,
}

impl ChainRegistry {
    pub fn new(entries: Vec<ChainEntry>) -> BonderResult<Self> {
        let mut index = HashMap::new();
        let mut l1 = None;
        for (i, entry) in entries.iter().enumerate() {
            if index.insert(entry.chain_id, i).is_some() {
                return Err(BonderError::ConfigError(format!(
                    "chain {} registered twice",
                    entry.chain_id
                )));
            }
            if entry.role == ChainRole::L1 {
                l1 = Some(i);
            }
        }
        let l1 = l1.ok_or_else(|| BonderError::ConfigError("no l1 chain registered".into()))?;
        Ok(Self { entries, index, l1 })
    }

    pub fn get(&self, chain_id: ChainId) -> BonderResult<&ChainEntry> {
        self.index
            .get(&chain_id)
            .map(|i| &self.entries[*i])
            .ok_or(BonderError::UnknownChain(chain_id.0))
    }

    pub fn contains(&self, chain_id: ChainId) -> bool {
        self.index.contains_key(&chain_id)
    }

    pub fn l1(&self) -> &ChainEntry {
        &self.entries[self.l1]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainEntry> {
        self.entries.iter()
    }

    pub fn l2s(&self) -> impl Iterator<Item = &ChainEntry> {
        self.entries.iter().filter(|e| e.role == ChainRole::L2)
    }
}

/// Everything a watcher needs, built once at startup.
#[derive(Clone)]
pub struct WatcherContext {
    pub store: StateStore,
    pub chains: Arc<ChainRegistry>,
    pub config: Arc<BonderNodeConfig>,
    pub bonder: Address,
    pub coordinator: Arc<OrderingCoordinator>,
    pub metrics: Arc<BonderMetrics>,
    pub notifier: SharedNotifier,
    /// One in-flight decision per [`ActionKey`].
    pub queue: Arc<KeyedQueue<ActionKey>>,
    pub cancel: CancellationToken,
}

impl WatcherContext {
    pub fn dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Held from the first guard to the send so decisions of `watcher` on
    /// `subject` never overlap. Other watchers on the same subject proceed.
    pub async fn lock_action(
        &self,
        watcher: &'static str,
        chain_id: ChainId,
        subject: H256,
    ) -> OwnedMutexGuard<()> {
        self.queue
            .lock(&ActionKey {
                watcher,
                chain_id,
                subject,
            })
            .await
    }

    /// Held from the credit check to the in-flight marker of any bond on
    /// `chain_id`, so concurrent bonds cannot spend the same credit.
    pub async fn lock_credit(&self, chain_id: ChainId) -> OwnedMutexGuard<()> {
        self.lock_action(CREDIT_LOCK, chain_id, H256::zero()).await
    }

    /// Amount held by bonds this process sent on `chain_id` that have not
    /// landed yet. Root bonds count against L1. `exclude` is the subject being
    /// decided.
    pub async fn reserved_credit(&self, chain_id: ChainId, exclude: H256) -> BonderResult<U256> {
        let mut bonds = self.store.transfers.in_flight_bonds(chain_id).await?;
        if self.chains.get(chain_id)?.role == ChainRole::L1 {
            bonds.extend(self.store.transfer_roots.in_flight_bonds().await?);
        }
        let now = now_secs();
        Ok(bonds
            .into_iter()
            .filter(|b| b.subject != exclude)
            .filter(|b| now.saturating_sub(b.sent_at) < BOND_IN_FLIGHT_TIMEOUT_SECS)
            .fold(U256::zero(), |acc, b| acc.saturating_add(b.amount)))
    }

    /// Credit left for a new bond on `chain_id`: credit minus debit minus
    /// [`Self::reserved_credit`]. Callers hold [`Self::lock_credit`].
    pub async fn spare_credit(&self, chain_id: ChainId, exclude: H256) -> BonderResult<U256> {
        let available = self
            .chains
            .get(chain_id)?
            .bridge
            .available_credit(self.bonder)
            .await?;
        Ok(available.saturating_sub(self.reserved_credit(chain_id, exclude).await?))
    }

    /// Flag `root_hash` as suspect and alert. Repeated violations escalate.
    pub async fn invariant_violation(&self, watcher: &str, root_hash: RootHash, err: &BonderError) {
        self.metrics
            .invariant_violations
            .with_label_values(&[err.error_type()])
            .inc();
        let count = match self
            .store
            .transfer_roots
            .flag_suspect(&root_hash, &err.to_string())
            .await
        {
            Ok(count) => count,
            Err(e) => {
                error!("[{}] failed to flag root {:?}: {}", watcher, root_hash, e);
                1
            }
        };
        error!(
            "[{}] invariant violation on root {:?} (#{}): {}",
            watcher, root_hash, count, err
        );
        let severity = if count >= INVARIANT_ESCALATION_THRESHOLD {
            Severity::Critical
        } else {
            Severity::Warning
        };
        self.notifier
            .notify(
                severity,
                "invariant violation",
                &format!("{} root {:?} (#{}): {}", watcher, root_hash, count, err),
            )
            .await;
    }

    /// Transfer ids of `root`, checked against its hash. A missing list or a
    /// mismatch flags the root and is returned as the error.
    pub async fn verified_transfer_ids(
        &self,
        watcher: &str,
        root: &TransferRoot,
    ) -> BonderResult<Vec<TransferId>> {
        let root_hash = root.transfer_root_hash;
        let result = match root.transfer_ids.as_ref().filter(|ids| !ids.is_empty()) {
            Some(ids) => check_root(&root_hash, ids).map(|_| ids.clone()),
            None => Err(BonderError::MissingLinkage(format!(
                "root {:?} has no transfer ids",
                root_hash
            ))),
        };
        if let Err(e) = &result {
            self.invariant_violation(watcher, root_hash, e).await;
        }
        result
    }

    /// Encode `call` for `chain_id` and hand it to that chain's submitter.
    pub async fn submit(&self, chain_id: ChainId, call: &ContractCall) -> BonderResult<TransactionHandle> {
        let chain = self.chains.get(chain_id)?;
        let request = chain.bridge.encode(call)?;
        chain.submitter.send(request).await
    }

    /// Like [`Self::submit`] for calls whose target is not the bridge itself.
    pub async fn submit_request(
        &self,
        chain_id: ChainId,
        request: TxRequest,
    ) -> BonderResult<TransactionHandle> {
        self.chains.get(chain_id)?.submitter.send(request).await
    }
}

/// What a watcher did with one candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Submitted(H256),
    DryRun,
    /// Conditions are not met yet.
    NotDue(String),
    /// Nothing to do for this candidate, ever.
    Skipped(String),
    NotApplicable,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Submitted(_) => "submitted",
            Outcome::DryRun => "dry_run",
            Outcome::NotDue(_) => "not_due",
            Outcome::Skipped(_) => "skipped",
            Outcome::NotApplicable => "not_applicable",
        }
    }
}

#[async_trait]
pub trait Watcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn chain_id(&self) -> ChainId;

    /// One pass over every candidate. Per-candidate failures are recorded,
    /// only failures that prevent the pass itself are returned.
    async fn poll(&self) -> BonderResult<()>;

    async fn check_transfer(&self, _transfer_id: TransferId) -> BonderResult<Outcome> {
        Ok(Outcome::NotApplicable)
    }

    async fn check_root(&self, _root_hash: RootHash) -> BonderResult<Outcome> {
        Ok(Outcome::NotApplicable)
    }
}

/// Log and count the result of one decision. The log level follows the
/// error class so expected outcomes stay quiet.
pub fn record_outcome(
    metrics: &BonderMetrics,
    watcher: &str,
    chain_id: ChainId,
    subject: &str,
    result: &BonderResult<Outcome>,
) {
    let chain = chain_id.to_string();
    match result {
        Ok(outcome) => {
            match outcome {
                Outcome::Submitted(tx_hash) => {
                    info!("[{}][{}] {} submitted in tx {:?}", watcher, chain, subject, tx_hash)
                }
                Outcome::DryRun => info!("[{}][{}] {} dry run, not submitted", watcher, chain, subject),
                Outcome::NotDue(reason) => {
                    debug!("[{}][{}] {} not due: {}", watcher, chain, subject, reason)
                }
                Outcome::Skipped(reason) => {
                    debug!("[{}][{}] {} skipped: {}", watcher, chain, subject, reason)
                }
                Outcome::NotApplicable => {}
            }
            metrics
                .watcher_outcomes
                .with_label_values(&[watcher, chain.as_str(), outcome.as_str()])
                .inc();
        }
        Err(e) => {
            let class = e.class();
            match class {
                ErrorClass::Transient => {
                    warn!("[{}][{}] {} transient failure, retrying next tick: {}", watcher, chain, subject, e)
                }
                ErrorClass::Cancellation => {
                    debug!("[{}][{}] {} cancelled: {}", watcher, chain, subject, e)
                }
                ErrorClass::DomainGuard => {
                    info!("[{}][{}] {} rejected: {}", watcher, chain, subject, e)
                }
                ErrorClass::NonceTooLow => {
                    warn!("[{}][{}] {} send hit a used nonce: {}", watcher, chain, subject, e)
                }
                ErrorClass::Invariant | ErrorClass::Fatal => {
                    error!("[{}][{}] {} failed: {}", watcher, chain, subject, e)
                }
                ErrorClass::Other => warn!("[{}][{}] {} failed: {}", watcher, chain, subject, e),
            }
            let outcome = match class {
                ErrorClass::Transient => "transient",
                ErrorClass::Cancellation => "cancelled",
                ErrorClass::DomainGuard => "rejected",
                ErrorClass::NonceTooLow => "nonce_too_low",
                ErrorClass::Invariant => "invariant",
                ErrorClass::Fatal | ErrorClass::Other => "error",
            };
            metrics
                .watcher_outcomes
                .with_label_values(&[watcher, chain.as_str(), outcome])
                .inc();
            metrics
                .watcher_errors
                .with_label_values(&[watcher, e.error_type()])
                .inc();
        }
    }
}

/// Poll `watcher` until cancelled. Only a fatal error ends the loop.
pub async fn run_watcher(
    watcher: Arc<dyn Watcher>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> BonderResult<()> {
    let name = watcher.name();
    let chain = watcher.chain_id();
    info!("[{}][{}] Starting watcher", name, chain);
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[{}][{}] Watcher stopped", name, chain);
                return Ok(());
            }
            _ = interval.tick() => {}
        }
        if let Err(e) = watcher.poll().await {
            if e.class() == ErrorClass::Fatal {
                error!("[{}][{}] Fatal error, stopping watcher: {}", name, chain, e);
                return Err(e);
            }
            warn!("[{}][{}] Poll failed: {}", name, chain, e);
        }
    }
}

/// Wait for `tx` in the background and run `on_revert` if it reverts or is
/// abandoned, so the next tick reconsiders the entity.
pub(crate) fn on_failure<F, Fut>(label: String, tx: TransactionHandle, on_revert: F)
where
    F: FnOnce(BonderError) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let result: BonderResult<ReceiptInfo> = tx.wait().await;
        match result {
            Ok(receipt) => debug!("[{}] confirmed in block {}", label, receipt.block_number),
            // shutting down, the record is resumed on restart
            Err(BonderError::Cancelled) => {}
            Err(e) => {
                warn!("[{}] transaction failed, rolling back: {}", label, e);
                on_revert(e).await;
            }
        }
    });
}
