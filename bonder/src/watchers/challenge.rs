// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{on_failure, record_outcome, Outcome, Watcher, WatcherContext};
use crate::chain_syncer::full_cursor_key;
use crate::error::{BonderError, BonderResult};
use crate::gateway::{BridgeContract, ContractCall, TransferBondInfo};
use crate::types::{compute_transfer_root_id, ChainId, RootHash, TransferRoot};
use crate::utils::{now_secs, short_hex};
use async_trait::async_trait;
use ethers::types::{H256, U256};
use std::sync::Arc;
use tracing::{info, warn};

const NAME: &str = "challenge";

const IN_FLIGHT_TIMEOUT_SECS: u64 = 600;

/// Challenges L1 root bonds that no source chain ever committed, and
/// resolves our challenges once their resolution period is over.
pub struct ChallengeWatcher {
    ctx: WatcherContext,
    chain_id: ChainId,
}

impl ChallengeWatcher {
    pub fn new(ctx: WatcherContext) -> Self {
        let chain_id = ctx.chains.l1().chain_id;
        Self { ctx, chain_id }
    }

    fn l1(&self) -> Arc<dyn BridgeContract> {
        self.ctx.chains.l1().bridge.clone()
    }

    /// Oldest point in time every L2 has been synced up to.
    async fn synced_until(&self) -> BonderResult<u64> {
        let mut oldest = u64::MAX;
        for chain in self.ctx.chains.l2s() {
            let key = full_cursor_key(chain.chain_id, chain.bridge.bridge_address());
            let Some(cursor) = self.ctx.store.sync_state.get(&key).await? else {
                return Ok(0);
            };
            let timestamp = chain.bridge.block_timestamp(cursor.block_number).await?;
            oldest = oldest.min(timestamp);
        }
        Ok(if oldest == u64::MAX { 0 } else { oldest })
    }

    async fn bond_of(&self, root: &TransferRoot) -> BonderResult<(H256, U256, Option<TransferBondInfo>)> {
        let root_hash = root.transfer_root_hash;
        let total = root.total_amount.ok_or_else(|| {
            BonderError::MissingLinkage(format!("root {:?} has no total", root_hash))
        })?;
        let root_id = root
            .transfer_root_id
            .unwrap_or_else(|| compute_transfer_root_id(root_hash, total));
        let bond = self.l1().transfer_bond(root_id).await?;
        Ok((root_id, total, bond))
    }

    /// Destination of an uncommitted root is unknown locally, the challenge
    /// call takes it as given by the bond.
    fn destination_of(&self, root: &TransferRoot) -> ChainId {
        root.destination_chain_id.unwrap_or(self.chain_id)
    }

    pub async fn check_challenge(&self, root_hash: RootHash) -> BonderResult<Outcome> {
        let _guard = self.ctx.lock_action(NAME, self.chain_id, root_hash).await;
        let label = format!("challenge {}", short_hex(&root_hash));
        let Some(root) = self.ctx.store.transfer_roots.get(&root_hash).await? else {
            return Ok(Outcome::NotApplicable);
        };
        if !root.is_bonded() {
            return Ok(Outcome::NotApplicable);
        }
        if root.challenged.unwrap_or(false) {
            return Err(BonderError::AlreadyHandled(label));
        }
        if root.is_committed() || root.is_confirmed() {
            return Ok(Outcome::Skipped("root committed on its source".into()));
        }
        if root.bonder == Some(self.ctx.bonder) {
            return Ok(Outcome::Skipped("bonded by us".into()));
        }
        let sent_at = root.sent_challenge_tx_at.unwrap_or(0);
        if sent_at > 0 && now_secs().saturating_sub(sent_at) < IN_FLIGHT_TIMEOUT_SECS {
            return Err(BonderError::AlreadyHandled(label));
        }
        let bonded_at = root.bonded_at.unwrap_or(0);
        let due_at = bonded_at.saturating_add(self.ctx.config.challenge.grace_period.as_secs());
        if now_secs() < due_at {
            return Ok(Outcome::NotDue("within grace period".into()));
        }
        let synced_until = self.synced_until().await?;
        if synced_until < due_at {
            return Ok(Outcome::NotDue(format!(
                "sources synced until {}, need {}",
                synced_until, due_at
            )));
        }

        let (root_id, total, bond) = self.bond_of(&root).await?;
        let Some(bond) = bond else {
            return Ok(Outcome::Skipped("no bond on l1".into()));
        };
        if bond.challenge_start_time > 0 {
            return Err(BonderError::AlreadyHandled(label));
        }
        let l1 = self.l1();
        if l1.transfer_root_committed_at(root_id).await? > 0 {
            return Ok(Outcome::Skipped("root confirmed on l1".into()));
        }
        let stake = l1.challenge_amount(total).await?;

        let check_bridge = l1.clone();
        self.ctx
            .coordinator
            .wait_turn(
                &label,
                || {
                    let bridge = check_bridge.clone();
                    async move {
                        Ok(bridge
                            .transfer_bond(root_id)
                            .await?
                            .map(|b| b.challenge_start_time > 0)
                            .unwrap_or(false))
                    }
                },
                &self.ctx.cancel,
            )
            .await?;
        let challenged = l1
            .transfer_bond(root_id)
            .await?
            .map(|b| b.challenge_start_time > 0)
            .unwrap_or(false);
        if challenged {
            return Err(BonderError::AlreadyHandled(label));
        }
        if self.ctx.dry_run() {
            return Ok(Outcome::DryRun);
        }

        warn!(
            "[{}] challenging bond of root {:?} by {:?}, total {}, stake {}",
            NAME, root_hash, bond.bonder, total, stake
        );
        let call = ContractCall::ChallengeTransferBond {
            root_hash,
            original_amount: total,
            destination_chain_id: self.destination_of(&root),
            stake,
        };
        let patch = TransferRoot {
            sent_challenge_tx_at: Some(now_secs()),
            ..TransferRoot::new(root_hash)
        };
        self.ctx.store.transfer_roots.update(&patch).await?;
        let rollback = TransferRoot {
            sent_challenge_tx_at: Some(0),
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
                warn!("Failed to roll back challenge of {:?}: {}", root_hash, e);
            }
        });
        Ok(Outcome::Submitted(tx_hash))
    }

    pub async fn check_resolve(&self, root_hash: RootHash) -> BonderResult<Outcome> {
        let _guard = self.ctx.lock_action(NAME, self.chain_id, root_hash).await;
        let label = format!("resolve {}", short_hex(&root_hash));
        let Some(root) = self.ctx.store.transfer_roots.get(&root_hash).await? else {
            return Ok(Outcome::NotApplicable);
        };
        if !root.challenged.unwrap_or(false) {
            return Ok(Outcome::NotApplicable);
        }
        let (_, total, bond) = self.bond_of(&root).await?;
        let Some(bond) = bond else {
            return Ok(Outcome::Skipped("no bond on l1".into()));
        };
        if bond.challenge_resolved {
            return Ok(Outcome::Skipped("challenge resolved".into()));
        }
        if bond.challenger != self.ctx.bonder {
            return Ok(Outcome::Skipped("challenged by someone else".into()));
        }
        let period = self.l1().challenge_resolution_period().await?;
        let resolvable_at = bond.challenge_start_time.saturating_add(period);
        if now_secs() < resolvable_at {
            return Ok(Outcome::NotDue(format!("resolvable at {}", resolvable_at)));
        }
        if self.ctx.dry_run() {
            return Ok(Outcome::DryRun);
        }
        info!("[{}] resolving challenge of root {:?}", NAME, root_hash);
        let call = ContractCall::ResolveChallenge {
            root_hash,
            original_amount: total,
            destination_chain_id: self.destination_of(&root),
        };
        let tx = self.ctx.submit(self.chain_id, &call).await?;
        let tx_hash = tx.tx_hash();
        on_failure(label, tx, |_| async {});
        Ok(Outcome::Submitted(tx_hash))
    }
}

#[async_trait]
impl Watcher for ChallengeWatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn poll(&self) -> BonderResult<()> {
        let roots = self.ctx.store.transfer_roots.all().await?;
        for root in roots {
            if !root.is_bonded() || root.is_confirmed() {
                continue;
            }
            if self.ctx.cancel.is_cancelled() {
                return Err(BonderError::Cancelled);
            }
            let root_hash = root.transfer_root_hash;
            let result = if root.challenged.unwrap_or(false) {
                self.check_resolve(root_hash).await
            } else if root.is_committed() {
                continue;
            } else {
                self.check_challenge(root_hash).await
            };
            record_outcome(
                &self.ctx.metrics,
                NAME,
                self.chain_id,
                &format!("root {:?}", root_hash),
                &result,
            );
        }
        Ok(())
    }

    async fn check_root(&self, root_hash: RootHash) -> BonderResult<Outcome> {
        let challenged = self
            .ctx
            .store
            .transfer_roots
            .get(&root_hash)
            .await?
            .and_then(|r| r.challenged)
            .unwrap_or(false);
        if challenged {
            self.check_resolve(root_hash).await
        } else {
            self.check_challenge(root_hash).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{bonder_address, WatcherFixture, BLOCK_TIME};
    use ethers::types::Address;

    const L1: ChainId = ChainId(1);
    const OPTIMISM: ChainId = ChainId(10);
    const ARBITRUM: ChainId = ChainId(42161);

    fn root_hash() -> RootHash {
        H256::repeat_byte(0x5e)
    }

    fn bond(challenger: Address, challenge_start_time: u64) -> TransferBondInfo {
        TransferBondInfo {
            bonder: Address::repeat_byte(0xbd),
            created_at: now_secs() - 7_200,
            total_amount: U256::from(1_000),
            challenge_start_time,
            challenger,
            challenge_resolved: false,
        }
    }

    /// A root bonded two hours ago by someone else, never committed.
    async fn bonded_root(fixture: &WatcherFixture) -> H256 {
        let root_id = compute_transfer_root_id(root_hash(), U256::from(1_000));
        let root = TransferRoot {
            transfer_root_id: Some(root_id),
            total_amount: Some(U256::from(1_000)),
            bonded: Some(true),
            bonder: Some(Address::repeat_byte(0xbd)),
            bonded_at: Some(now_secs() - 7_200),
            ..TransferRoot::new(root_hash())
        };
        fixture.store.transfer_roots.update(&root).await.unwrap();
        fixture.bridge(L1).set_bond(root_id, bond(Address::zero(), 0));
        root_id
    }

    async fn sync_sources_until(fixture: &WatcherFixture, timestamp: u64) {
        for chain in [OPTIMISM, ARBITRUM] {
            let key = full_cursor_key(chain, fixture.bridge(chain).bridge_address());
            fixture
                .store
                .sync_state
                .advance(&key, timestamp / BLOCK_TIME + 1, now_secs())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_challenges_uncommitted_bond_after_grace() {
        let fixture = WatcherFixture::new();
        let watcher = ChallengeWatcher::new(fixture.ctx.clone());
        bonded_root(&fixture).await;
        sync_sources_until(&fixture, now_secs()).await;

        let outcome = watcher.check_challenge(root_hash()).await.unwrap();
        assert!(matches!(outcome, Outcome::Submitted(_)));
        let sent = fixture.broadcaster(L1).sent_requests();
        assert_eq!(sent[0].label, "challenge_transfer_bond");
        assert_eq!(sent[0].value, U256::from(100));
    }

    #[tokio::test]
    async fn test_lagging_sources_hold_the_challenge() {
        let fixture = WatcherFixture::new();
        let watcher = ChallengeWatcher::new(fixture.ctx.clone());
        bonded_root(&fixture).await;
        sync_sources_until(&fixture, now_secs() - 6_000).await;

        assert!(matches!(
            watcher.check_challenge(root_hash()).await.unwrap(),
            Outcome::NotDue(_)
        ));
        assert!(fixture.sent_labels(L1).is_empty());
    }

    #[tokio::test]
    async fn test_committed_root_is_left_alone() {
        let fixture = WatcherFixture::new();
        let watcher = ChallengeWatcher::new(fixture.ctx.clone());
        bonded_root(&fixture).await;
        sync_sources_until(&fixture, now_secs()).await;
        fixture
            .store
            .transfer_roots
            .update(&TransferRoot {
                committed: Some(true),
                source_chain_id: Some(OPTIMISM),
                ..TransferRoot::new(root_hash())
            })
            .await
            .unwrap();

        assert_eq!(
            watcher.check_challenge(root_hash()).await,
            Ok(Outcome::Skipped("root committed on its source".into()))
        );
    }

    #[tokio::test]
    async fn test_resolves_our_challenge_after_period() {
        let fixture = WatcherFixture::new();
        let watcher = ChallengeWatcher::new(fixture.ctx.clone());
        let root_id = bonded_root(&fixture).await;
        fixture
            .store
            .transfer_roots
            .update(&TransferRoot {
                challenged: Some(true),
                ..TransferRoot::new(root_hash())
            })
            .await
            .unwrap();

        fixture
            .bridge(L1)
            .set_bond(root_id, bond(bonder_address(), now_secs() - 3_600));
        assert!(matches!(
            watcher.check_resolve(root_hash()).await.unwrap(),
            Outcome::NotDue(_)
        ));

        fixture
            .bridge(L1)
            .set_bond(root_id, bond(bonder_address(), now_secs() - 11 * 24 * 3_600));
        assert!(matches!(
            watcher.check_resolve(root_hash()).await.unwrap(),
            Outcome::Submitted(_)
        ));
        assert_eq!(fixture.sent_labels(L1), vec!["resolve_challenge"]);
    }
}
