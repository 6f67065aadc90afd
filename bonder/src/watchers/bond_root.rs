// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{
    on_failure, record_outcome, Outcome, Watcher, WatcherContext, BOND_IN_FLIGHT_TIMEOUT_SECS,
};
use crate::error::{BonderError, BonderResult};
use crate::gateway::{BridgeContract, ContractCall};
use crate::types::{compute_transfer_root_id, ChainId, RootHash, TransferRoot};
use crate::utils::{now_secs, short_hex};
use async_trait::async_trait;
use ethers::types::H256;
use std::sync::Arc;
use tracing::{info, warn};

const NAME: &str = "bond_root";

/// Bonds committed transfer roots on L1 so destinations can settle before
/// the slow exit finishes.
pub struct BondRootWatcher {
    ctx: WatcherContext,
    chain_id: ChainId,
}

impl BondRootWatcher {
    pub fn new(ctx: WatcherContext) -> Self {
        let chain_id = ctx.chains.l1().chain_id;
        Self { ctx, chain_id }
    }

    fn l1(&self) -> Arc<dyn BridgeContract> {
        self.ctx.chains.l1().bridge.clone()
    }

    async fn bonded_on_chain(bridge: &Arc<dyn BridgeContract>, root_id: H256) -> BonderResult<bool> {
        Ok(bridge.transfer_bond(root_id).await?.is_some()
            || bridge.transfer_root_committed_at(root_id).await? > 0)
    }

    pub async fn check_bond_root(&self, root_hash: RootHash) -> BonderResult<Outcome> {
        let _guard = self.ctx.lock_action(NAME, self.chain_id, root_hash).await;
        let label = format!("bond root {}", short_hex(&root_hash));
        let Some(root) = self.ctx.store.transfer_roots.get(&root_hash).await? else {
            return Ok(Outcome::NotApplicable);
        };
        if !root.is_committed() {
            return Ok(Outcome::NotDue("root not committed".into()));
        }
        if root.is_suspect() {
            return Ok(Outcome::Skipped("root flagged suspect".into()));
        }
        if root.is_bonded() || root.is_confirmed() {
            return Err(BonderError::AlreadyHandled(label));
        }
        let sent_at = root.sent_bond_tx_at.unwrap_or(0);
        if sent_at > 0 && now_secs().saturating_sub(sent_at) < BOND_IN_FLIGHT_TIMEOUT_SECS {
            return Err(BonderError::AlreadyHandled(label));
        }
        let (Some(total), Some(destination)) = (root.total_amount, root.destination_chain_id) else {
            let err = BonderError::MissingLinkage(format!(
                "root {:?} has no total or destination",
                root_hash
            ));
            self.ctx.invariant_violation(NAME, root_hash, &err).await;
            return Err(err);
        };
        let ids = self.ctx.verified_transfer_ids(NAME, &root).await?;

        let bridge = self.l1();
        let root_id = root
            .transfer_root_id
            .unwrap_or_else(|| compute_transfer_root_id(root_hash, total));
        if Self::bonded_on_chain(&bridge, root_id).await? {
            return Err(BonderError::AlreadyHandled(label));
        }
        let _credit = self.ctx.lock_credit(self.chain_id).await;
        let available = self.ctx.spare_credit(self.chain_id, root_hash).await?;
        if available < total {
            return Err(BonderError::InsufficientCredit {
                available,
                required: total,
            });
        }

        let check_bridge = bridge.clone();
        self.ctx
            .coordinator
            .wait_turn(
                &label,
                || {
                    let bridge = check_bridge.clone();
                    async move { Self::bonded_on_chain(&bridge, root_id).await }
                },
                &self.ctx.cancel,
            )
            .await?;
        if Self::bonded_on_chain(&bridge, root_id).await? {
            return Err(BonderError::AlreadyHandled(label));
        }
        if self.ctx.dry_run() {
            return Ok(Outcome::DryRun);
        }

        info!(
            "[{}] bonding root {:?} of {} transfers, total {} for chain {}",
            NAME,
            root_hash,
            ids.len(),
            total,
            destination
        );
        let call = ContractCall::BondTransferRoot {
            root_hash,
            destination_chain_id: destination,
            total_amount: total,
        };
        let patch = TransferRoot {
            sent_bond_tx_at: Some(now_secs()),
            ..TransferRoot::new(root_hash)
        };
        self.ctx.store.transfer_roots.update(&patch).await?;
        let rollback = TransferRoot {
            sent_bond_tx_at: Some(0),
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
        let store = self.ctx.store.clone();
        on_failure(label, tx, move |_| async move {
            if let Err(e) = store.transfer_roots.update(&rollback).await {
                warn!("Failed to roll back root bond of {:?}: {}", root_hash, e);
            }
        });
        Ok(Outcome::Submitted(tx_hash))
    }
}

#[async_trait]
impl Watcher for BondRootWatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn poll(&self) -> BonderResult<()> {
        let roots = self.ctx.store.transfer_roots.all().await?;
        for root in roots {
            if root.is_bonded() || root.is_confirmed() || root.is_suspect() || !root.is_committed() {
                continue;
            }
            if self.ctx.cancel.is_cancelled() {
                return Err(BonderError::Cancelled);
            }
            let result = self.check_bond_root(root.transfer_root_hash).await;
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
        self.check_bond_root(root_hash).await
    }
}
