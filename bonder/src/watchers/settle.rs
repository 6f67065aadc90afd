// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{on_failure, record_outcome, Outcome, Watcher, WatcherContext};
use crate::error::{BonderError, BonderResult};
use crate::gateway::ContractCall;
use crate::store::StateStore;
use crate::types::{ChainId, ChainRole, RootHash, TransferId, TransferRoot};
use crate::utils::{now_secs, reaches_percent, short_hex};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use tracing::{debug, info, warn};

const NAME: &str = "settle";

const IN_FLIGHT_TIMEOUT_SECS: u64 = 600;

/// Releases this bonder's collateral on one destination chain once the
/// roots covering its bonded withdrawals are available there.
pub struct SettleWatcher {
    ctx: WatcherContext,
    chain_id: ChainId,
    role: ChainRole,
}

impl SettleWatcher {
    pub fn new(ctx: WatcherContext, chain_id: ChainId) -> BonderResult<Self> {
        let role = ctx.chains.get(chain_id)?.role;
        Ok(Self { ctx, chain_id, role })
    }

    fn settleable_here(&self, root: &TransferRoot) -> bool {
        if root.root_set_on_destination.unwrap_or(false) {
            return true;
        }
        // L1 sets the root as part of bonding or confirming it
        self.role == ChainRole::L1 && (root.is_bonded() || root.is_confirmed())
    }

    async fn all_settled(store: &StateStore, bonder: Address, ids: &[TransferId]) -> BonderResult<bool> {
        Ok(store
            .transfers
            .bonded_by(bonder, ids)
            .await?
            .iter()
            .all(|t| t.is_settled()))
    }

    pub async fn check_settle(&self, root_hash: RootHash) -> BonderResult<Outcome> {
        let _guard = self.ctx.lock_action(NAME, self.chain_id, root_hash).await;
        let label = format!("settle {}", short_hex(&root_hash));
        let Some(root) = self.ctx.store.transfer_roots.get(&root_hash).await? else {
            return Ok(Outcome::NotApplicable);
        };
        if root.destination_chain_id != Some(self.chain_id) {
            return Ok(Outcome::NotApplicable);
        }
        if root.is_suspect() {
            return Ok(Outcome::Skipped("root flagged suspect".into()));
        }
        if root.is_all_settled() {
            return Ok(Outcome::Skipped("root fully settled".into()));
        }
        if !self.settleable_here(&root) {
            return Ok(Outcome::NotDue("root not available on destination".into()));
        }
        let sent_at = root.sent_settle_tx_at.unwrap_or(0);
        if sent_at > 0 && now_secs().saturating_sub(sent_at) < IN_FLIGHT_TIMEOUT_SECS {
            return Err(BonderError::AlreadyHandled(label));
        }
        let total = root.total_amount.ok_or_else(|| {
            BonderError::MissingLinkage(format!("root {:?} has no total", root_hash))
        })?;
        let ids = self.ctx.verified_transfer_ids(NAME, &root).await?;

        let bonder = self.ctx.bonder;
        let ours = self
            .ctx
            .store
            .transfers
            .bonded_by(bonder, &ids)
            .await?
            .into_iter()
            .filter(|t| !t.is_settled())
            .collect::<Vec<_>>();
        if ours.is_empty() {
            return Ok(Outcome::Skipped("no unsettled bonds of ours".into()));
        }
        let ours_total = ours.iter().fold(U256::zero(), |acc, t| {
            acc.saturating_add(t.amount.unwrap_or_default())
        });
        let threshold = self.ctx.config.settle.threshold_percent;
        if !reaches_percent(ours_total, total, threshold) {
            return Ok(Outcome::NotDue(format!(
                "our bonds {} are below {}% of {}",
                ours_total, threshold, total
            )));
        }
        let settled = root.total_settled();
        if settled.saturating_add(ours_total) > total {
            let err = BonderError::OverSettled {
                settled: settled.saturating_add(ours_total),
                total,
            };
            self.ctx.invariant_violation(NAME, root_hash, &err).await;
            return Err(err);
        }

        let bridge = self.ctx.chains.get(self.chain_id)?.bridge.clone();
        let on_chain = bridge.transfer_root(root_hash, total).await?;
        if on_chain.created_at == 0 {
            return Ok(Outcome::NotDue("root not set on chain yet".into()));
        }
        debug!(
            "[{}][{}] {} of our bonds worth {} in root {:?}",
            NAME,
            self.chain_id,
            ours.len(),
            ours_total,
            root_hash
        );

        let store = self.ctx.store.clone();
        let check_ids = ids.clone();
        self.ctx
            .coordinator
            .wait_turn(
                &label,
                || {
                    let store = store.clone();
                    let ids = check_ids.clone();
                    async move { Self::all_settled(&store, bonder, &ids).await }
                },
                &self.ctx.cancel,
            )
            .await?;
        if Self::all_settled(&self.ctx.store, bonder, &ids).await? {
            return Err(BonderError::AlreadyHandled(label));
        }
        if self.ctx.dry_run() {
            return Ok(Outcome::DryRun);
        }

        let call = ContractCall::SettleBondedWithdrawals {
            bonder,
            transfer_ids: ids,
            total_amount: total,
        };
        let patch = TransferRoot {
            sent_settle_tx_at: Some(now_secs()),
            ..TransferRoot::new(root_hash)
        };
        self.ctx.store.transfer_roots.update(&patch).await?;
        let rollback = TransferRoot {
            sent_settle_tx_at: Some(0),
            ..TransferRoot::new(root_hash)
        };
        let tx = match self.ctx.submit(self.chain_id, &call).await {
            Ok(tx) => tx,
            Err(e) => {
                self.ctx.store.transfer_roots.update(&rollback).await?;
                return Err(e);
            }
        };
        let tx_hash = tx.tx_hash();
        info!(
            "[{}][{}] settling {} for root {:?} in tx {:?}",
            NAME, self.chain_id, ours_total, root_hash, tx_hash
        );
        let store = self.ctx.store.clone();
        on_failure(label, tx, move |_| async move {
            if let Err(e) = store.transfer_roots.update(&rollback).await {
                warn!("Failed to roll back settle of {:?}: {}", root_hash, e);
            }
        });
        Ok(Outcome::Submitted(tx_hash))
    }
}

#[async_trait]
impl Watcher for SettleWatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn poll(&self) -> BonderResult<()> {
        let roots = self
            .ctx
            .store
            .transfer_roots
            .by_destination(self.chain_id)
            .await?;
        for root in roots {
            if root.is_all_settled() || root.is_suspect() || !self.settleable_here(&root) {
                continue;
            }
            if self.ctx.cancel.is_cancelled() {
                return Err(BonderError::Cancelled);
            }
            let result = self.check_settle(root.transfer_root_hash).await;
            record_outcome(
                &self.ctx.metrics,
                NAME,
                self.chain_id,
                &format!("root {:?}", root.transfer_root_hash),
                &result,
            );
        }
        Ok(())
    }

    async fn check_root(&self, root_hash: RootHash) -> BonderResult<Outcome> {
        self.check_settle(root_hash).await
    }

    async fn check_transfer(&self, transfer_id: TransferId) -> BonderResult<Outcome> {
        let root_hash = self
            .ctx
            .store
            .transfers
            .get(&transfer_id)
            .await?
            .and_then(|t| t.transfer_root_hash);
        match root_hash {
            Some(root_hash) => self.check_settle(root_hash).await,
            None => Ok(Outcome::NotApplicable),
        }
    }
}
