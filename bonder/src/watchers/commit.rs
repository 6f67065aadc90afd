// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{on_failure, record_outcome, Outcome, Watcher, WatcherContext};
use crate::error::{BonderError, BonderResult};
use crate::gateway::ContractCall;
use crate::merkle::build_root;
use crate::types::{ChainId, ChainRole, Transfer, TransferId};
use crate::utils::now_secs;
use async_trait::async_trait;
use ethers::types::{H256, U256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const NAME: &str = "commit";

/// A sent commit blocks new ones for the route this long, unless it fails.
const IN_FLIGHT_TIMEOUT_SECS: u64 = 600;

/// Commits pending transfers of one L2 source chain, per destination.
pub struct CommitWatcher {
    ctx: WatcherContext,
    chain_id: ChainId,
    in_flight: Arc<Mutex<HashMap<ChainId, u64>>>,
}

impl CommitWatcher {
    pub fn new(ctx: WatcherContext, chain_id: ChainId) -> BonderResult<Self> {
        let role = ctx.chains.get(chain_id)?.role;
        if role != ChainRole::L2 {
            return Err(BonderError::ConfigError(format!(
                "commit watcher needs an l2 chain, {} is {:?}",
                chain_id, role
            )));
        }
        Ok(Self {
            ctx,
            chain_id,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn route_in_flight(&self, destination: ChainId) -> bool {
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match in_flight.get(&destination) {
            Some(sent_at) if now_secs().saturating_sub(*sent_at) < IN_FLIGHT_TIMEOUT_SECS => true,
            Some(_) => {
                in_flight.remove(&destination);
                false
            }
            None => false,
        }
    }

    fn set_in_flight(&self, destination: ChainId, value: Option<u64>) {
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match value {
            Some(sent_at) => in_flight.insert(destination, sent_at),
            None => in_flight.remove(&destination),
        };
    }

    fn is_due(&self, destination: ChainId, pending: &[Transfer], amount: U256) -> Option<String> {
        let commit = &self.ctx.config.commit;
        let threshold = commit.threshold_for(destination);
        if amount >= threshold {
            return Some(format!("pending amount {} reached threshold {}", amount, threshold));
        }
        if pending.len() >= commit.max_pending_transfers {
            return Some(format!("{} transfers pending", pending.len()));
        }
        let oldest = pending
            .iter()
            .filter_map(|t| t.transfer_sent_timestamp)
            .min()?;
        let age = now_secs().saturating_sub(oldest);
        if age >= commit.force_commit_age.as_secs() {
            return Some(format!("oldest pending transfer is {}s old", age));
        }
        None
    }

    /// Mark transfers committed locally when the chain shows nothing pending.
    async fn mark_committed(&self, pending: &[Transfer]) -> BonderResult<()> {
        for transfer in pending {
            let patch = Transfer {
                committed: Some(true),
                ..Transfer::new(transfer.transfer_id)
            };
            self.ctx.store.transfers.update(&patch).await?;
        }
        Ok(())
    }

    /// Decide and, if due, commit the route to `destination`. Checks of one
    /// route never overlap within the process.
    pub async fn check_route(&self, destination: ChainId) -> BonderResult<Outcome> {
        let route = H256::from_low_u64_be(destination.0);
        let _guard = self.ctx.lock_action(NAME, self.chain_id, route).await;
        let store = &self.ctx.store;
        let pending = store
            .transfers
            .pending_for_route(self.chain_id, destination)
            .await?;
        if pending.is_empty() {
            return Ok(Outcome::NotDue("nothing pending".into()));
        }
        if self.route_in_flight(destination) {
            return Ok(Outcome::NotDue("commit in flight".into()));
        }

        let bridge = self.ctx.chains.get(self.chain_id)?.bridge.clone();
        let on_chain = bridge.pending_amount_for_chain(destination).await?;
        if on_chain.is_zero() {
            info!(
                "[{}][{}] nothing pending on chain for {}, marking {} transfers committed",
                NAME,
                self.chain_id,
                destination,
                pending.len()
            );
            self.mark_committed(&pending).await?;
            return Ok(Outcome::Skipped("already committed on chain".into()));
        }

        let local = pending.iter().fold(U256::zero(), |acc, t| {
            acc.saturating_add(t.amount.unwrap_or_default())
        });
        if local != on_chain {
            debug!(
                "[{}][{}] local pending {} differs from on-chain {} for {}",
                NAME, self.chain_id, local, on_chain, destination
            );
        }
        let Some(reason) = self.is_due(destination, &pending, on_chain) else {
            return Ok(Outcome::NotDue(format!(
                "pending {} below threshold {}",
                on_chain,
                self.ctx.config.commit.threshold_for(destination)
            )));
        };

        let ids = pending.iter().map(|t| t.transfer_id).collect::<Vec<TransferId>>();
        let expected_root = build_root(&ids)?;
        info!(
            "[{}][{}] committing {} transfers to {} ({}), expected root {:?}",
            NAME,
            self.chain_id,
            ids.len(),
            destination,
            reason,
            expected_root
        );

        let label = format!("commit {}->{}", self.chain_id, destination);
        let check_bridge = bridge.clone();
        self.ctx
            .coordinator
            .wait_turn(
                &label,
                || {
                    let bridge = check_bridge.clone();
                    async move { Ok(bridge.pending_amount_for_chain(destination).await?.is_zero()) }
                },
                &self.ctx.cancel,
            )
            .await?;

        if bridge.pending_amount_for_chain(destination).await?.is_zero() {
            return Err(BonderError::AlreadyHandled(label));
        }
        if self.ctx.dry_run() {
            return Ok(Outcome::DryRun);
        }

        let call = ContractCall::CommitTransfers {
            destination_chain_id: destination,
        };
        self.set_in_flight(destination, Some(now_secs()));
        let tx = match self.ctx.submit(self.chain_id, &call).await {
            Ok(tx) => tx,
            Err(e) => {
                self.set_in_flight(destination, None);
                return Err(e);
            }
        };
        let tx_hash = tx.tx_hash();
        let in_flight = self.in_flight.clone();
        on_failure(label, tx, move |_| async move {
            let mut in_flight = match in_flight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            in_flight.remove(&destination);
        });
        Ok(Outcome::Submitted(tx_hash))
    }
}

#[async_trait]
impl Watcher for CommitWatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn poll(&self) -> BonderResult<()> {
        let destinations = self
            .ctx
            .chains
            .iter()
            .map(|c| c.chain_id)
            .filter(|id| *id != self.chain_id)
            .collect::<Vec<_>>();
        for destination in destinations {
            let result = self.check_route(destination).await;
            record_outcome(
                &self.ctx.metrics,
                NAME,
                self.chain_id,
                &format!("route {}->{}", self.chain_id, destination),
                &result,
            );
        }
        Ok(())
    }

    async fn check_transfer(&self, transfer_id: TransferId) -> BonderResult<Outcome> {
        let transfer = self
            .ctx
            .store
            .transfers
            .get(&transfer_id)
            .await?
            .ok_or_else(|| BonderError::MissingLinkage(format!("transfer {:?} unknown", transfer_id)))?;
        match (transfer.source_chain_id, transfer.destination_chain_id) {
            (Some(source), Some(destination)) if source == self.chain_id => {
                self.check_route(destination).await
            }
            _ => Ok(Outcome::NotApplicable),
        }
    }
}
