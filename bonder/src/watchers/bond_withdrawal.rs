// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{
    on_failure, record_outcome, Outcome, Watcher, WatcherContext, BOND_IN_FLIGHT_TIMEOUT_SECS,
};
use crate::error::{BonderError, BonderResult};
use crate::gateway::{BridgeContract, ContractCall};
use crate::store::StateStore;
use crate::types::{ChainId, ChainRole, Transfer, TransferId};
use crate::utils::{now_secs, short_hex};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const NAME: &str = "bond_withdrawal";

/// Fronts liquidity on one destination chain for transfers heading there.
pub struct BondWithdrawalWatcher {
    ctx: WatcherContext,
    chain_id: ChainId,
}

impl BondWithdrawalWatcher {
    pub fn new(ctx: WatcherContext, chain_id: ChainId) -> BonderResult<Self> {
        ctx.chains.get(chain_id)?;
        Ok(Self { ctx, chain_id })
    }

    fn bridge(&self) -> BonderResult<Arc<dyn BridgeContract>> {
        Ok(self.ctx.chains.get(self.chain_id)?.bridge.clone())
    }

    /// Bonded or withdrawn per the store or the destination bridge.
    async fn already_bonded(
        store: &StateStore,
        bridge: &Arc<dyn BridgeContract>,
        bonder: Address,
        transfer_id: TransferId,
    ) -> BonderResult<bool> {
        if let Some(transfer) = store.transfers.get(&transfer_id).await? {
            if transfer.is_bonded() || transfer.is_spent() {
                return Ok(true);
            }
        }
        if bridge.is_transfer_spent(transfer_id).await? {
            return Ok(true);
        }
        Ok(!bridge
            .bonded_withdrawal_amount(bonder, transfer_id)
            .await?
            .is_zero())
    }

    /// Keep the stored verdict in line with the current limits. The verdict
    /// is informational, every pass checks the limits again.
    async fn record_bondable(&self, transfer: &Transfer, verdict: &BonderResult<()>) -> BonderResult<()> {
        let patch = match verdict {
            Ok(()) if transfer.is_bondable == Some(false) => Transfer {
                is_bondable: Some(true),
                ..Transfer::new(transfer.transfer_id)
            },
            Err(e) if transfer.is_bondable != Some(false)
                || transfer.unbondable_reason.as_deref() != Some(e.to_string().as_str()) =>
            {
                Transfer {
                    is_bondable: Some(false),
                    unbondable_reason: Some(e.to_string()),
                    ..Transfer::new(transfer.transfer_id)
                }
            }
            _ => return Ok(()),
        };
        self.ctx.store.transfers.update(&patch).await?;
        Ok(())
    }

    fn check_bounds(&self, transfer: &Transfer, amount: U256) -> BonderResult<()> {
        let bond = &self.ctx.config.bond;
        if amount < bond.min_amount {
            return Err(BonderError::AmountOutOfBounds(format!(
                "amount {} below minimum {}",
                amount, bond.min_amount
            )));
        }
        if let Some(max) = bond.max_amount {
            if amount > max {
                return Err(BonderError::AmountOutOfBounds(format!(
                    "amount {} above maximum {}",
                    amount, max
                )));
            }
        }
        let fee = transfer.bonder_fee.unwrap_or_default();
        if fee < bond.min_bonder_fee {
            return Err(BonderError::BonderFeeTooLow(format!(
                "fee {} below minimum {}",
                fee, bond.min_bonder_fee
            )));
        }
        Ok(())
    }

    /// Bonding is pointless once the root carrying the transfer is confirmed.
    async fn check_root_not_confirmed(&self, transfer: &Transfer) -> BonderResult<()> {
        let Some(root_hash) = transfer.transfer_root_hash else {
            return Ok(());
        };
        let Some(root) = self.ctx.store.transfer_roots.get(&root_hash).await? else {
            return Ok(());
        };
        if root.is_confirmed() {
            return Err(BonderError::RootAlreadyConfirmed(root_hash));
        }
        if let Some(root_id) = root.transfer_root_id {
            let committed_at = self
                .ctx
                .chains
                .l1()
                .bridge
                .transfer_root_committed_at(root_id)
                .await?;
            if committed_at > 0 {
                return Err(BonderError::RootAlreadyConfirmed(root_hash));
            }
        }
        Ok(())
    }

    fn backoff_remaining(&self, transfer: &Transfer) -> Option<u64> {
        let delay = backoff_delay(
            self.ctx.config.bond.retry_backoff,
            transfer.withdrawal_bond_backoff.unwrap_or(0),
        )
        .as_secs();
        let elapsed = now_secs().saturating_sub(transfer.withdrawal_bond_attempted_at.unwrap_or(0));
        (elapsed < delay).then(|| delay - elapsed)
    }

    fn call_for(&self, transfer: &Transfer, amount: U256) -> BonderResult<ContractCall> {
        let missing = |field: &str| {
            BonderError::MissingLinkage(format!(
                "transfer {:?} has no {}",
                transfer.transfer_id, field
            ))
        };
        let recipient = transfer.recipient.ok_or_else(|| missing("recipient"))?;
        let transfer_nonce = transfer.transfer_nonce.ok_or_else(|| missing("transfer nonce"))?;
        let bonder_fee = transfer.bonder_fee.unwrap_or_default();
        let amount_out_min = transfer.amount_out_min.unwrap_or_default();
        let deadline = transfer.deadline.unwrap_or_default();
        let role = self.ctx.chains.get(self.chain_id)?.role;
        if role == ChainRole::L2 && !(amount_out_min.is_zero() && deadline.is_zero()) {
            return Ok(ContractCall::BondWithdrawalAndDistribute {
                recipient,
                amount,
                transfer_nonce,
                bonder_fee,
                amount_out_min,
                deadline,
            });
        }
        Ok(ContractCall::BondWithdrawal {
            recipient,
            amount,
            transfer_nonce,
            bonder_fee,
        })
    }

    /// Decide and, if due, bond `transfer_id`. Decisions for one transfer
    /// never overlap within the process.
    pub async fn check_bond(&self, transfer_id: TransferId) -> BonderResult<Outcome> {
        let _guard = self.ctx.lock_action(NAME, self.chain_id, transfer_id).await;
        let label = format!("bond {}", short_hex(&transfer_id));

        let transfer = self
            .ctx
            .store
            .transfers
            .get(&transfer_id)
            .await?
            .ok_or_else(|| BonderError::MissingLinkage(format!("transfer {:?} unknown", transfer_id)))?;
        if transfer.destination_chain_id != Some(self.chain_id) {
            return Ok(Outcome::NotApplicable);
        }
        if transfer.is_bonded() || transfer.is_spent() {
            return Err(BonderError::AlreadyHandled(label));
        }
        if transfer.is_not_found.unwrap_or(false) {
            return Ok(Outcome::Skipped("transfer not found on source".into()));
        }
        let attempted_at = transfer.withdrawal_bond_attempted_at.unwrap_or(0);
        if transfer.is_in_flight() && now_secs().saturating_sub(attempted_at) < BOND_IN_FLIGHT_TIMEOUT_SECS {
            return Err(BonderError::AlreadyHandled(label));
        }
        if let Some(remaining) = self.backoff_remaining(&transfer) {
            return Ok(Outcome::NotDue(format!("backing off for {}s", remaining)));
        }
        let amount = transfer
            .amount
            .ok_or_else(|| BonderError::MissingLinkage(format!("transfer {:?} has no amount", transfer_id)))?;

        let verdict = self.check_bounds(&transfer, amount);
        self.record_bondable(&transfer, &verdict).await?;
        verdict?;
        self.check_root_not_confirmed(&transfer).await?;

        let bridge = self.bridge()?;
        let _credit = self.ctx.lock_credit(self.chain_id).await;
        let spare = self.ctx.spare_credit(self.chain_id, transfer_id).await?;
        if spare < amount {
            return Err(BonderError::InsufficientCredit {
                available: spare,
                required: amount,
            });
        }

        let store = self.ctx.store.clone();
        let check_bridge = bridge.clone();
        let bonder = self.ctx.bonder;
        self.ctx
            .coordinator
            .wait_turn(
                &label,
                || {
                    let store = store.clone();
                    let bridge = check_bridge.clone();
                    async move { Self::already_bonded(&store, &bridge, bonder, transfer_id).await }
                },
                &self.ctx.cancel,
            )
            .await?;

        if Self::already_bonded(&self.ctx.store, &bridge, bonder, transfer_id).await? {
            return Err(BonderError::AlreadyHandled(label));
        }
        let call = self.call_for(&transfer, amount)?;
        if self.ctx.dry_run() {
            return Ok(Outcome::DryRun);
        }

        let attempt = Transfer {
            withdrawal_bond_in_flight: Some(true),
            withdrawal_bond_attempted_at: Some(now_secs()),
            ..Transfer::new(transfer_id)
        };
        self.ctx.store.transfers.update(&attempt).await?;
        let tx = match self.ctx.submit(self.chain_id, &call).await {
            Ok(tx) => tx,
            Err(e) => {
                let rollback = Transfer {
                    withdrawal_bond_in_flight: Some(false),
                    ..Transfer::new(transfer_id)
                };
                self.ctx.store.transfers.update(&rollback).await?;
                return Err(e);
            }
        };
        let tx_hash = tx.tx_hash();
        info!(
            "[{}][{}] bonding {} for {} in tx {:?}",
            NAME, self.chain_id, amount, label, tx_hash
        );
        let patch = Transfer {
            withdrawal_bond_tx_hash: Some(tx_hash),
            ..Transfer::new(transfer_id)
        };
        self.ctx.store.transfers.update(&patch).await?;

        let store = self.ctx.store.clone();
        let backoff = transfer.withdrawal_bond_backoff.unwrap_or(0);
        on_failure(label, tx, move |_| async move {
            let rollback = Transfer {
                withdrawal_bond_in_flight: Some(false),
                withdrawal_bond_backoff: Some(backoff.saturating_add(1)),
                ..Transfer::new(transfer_id)
            };
            if let Err(e) = store.transfers.update(&rollback).await {
                warn!("Failed to roll back bond of {:?}: {}", transfer_id, e);
            }
        });
        Ok(Outcome::Submitted(tx_hash))
    }
}

#[async_trait]
impl Watcher for BondWithdrawalWatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn poll(&self) -> BonderResult<()> {
        let candidates = self
            .ctx
            .store
            .transfers
            .unbonded_for_destination(self.chain_id)
            .await?;
        debug!(
            "[{}][{}] {} unbonded transfers",
            NAME,
            self.chain_id,
            candidates.len()
        );
        for transfer in candidates {
            if self.ctx.cancel.is_cancelled() {
                return Err(BonderError::Cancelled);
            }
            let result = self.check_bond(transfer.transfer_id).await;
            record_outcome(
                &self.ctx.metrics,
                NAME,
                self.chain_id,
                &format!("transfer {:?}", transfer.transfer_id),
                &result,
            );
        }
        Ok(())
    }

    async fn check_transfer(&self, transfer_id: TransferId) -> BonderResult<Outcome> {
        self.check_bond(transfer_id).await
    }
}

/// Delay before the next attempt after `backoff` reverts, doubling each time.
fn backoff_delay(base: Duration, backoff: u32) -> Duration {
    if backoff == 0 {
        return Duration::ZERO;
    }
    base.saturating_mul(1u32 << (backoff - 1).min(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{bonder_address, sent_transfer, test_node_config, WatcherFixture};
    use crate::types::TransferRoot;
    use ethers::types::H256;

    const OPTIMISM: ChainId = ChainId(10);
    const ARBITRUM: ChainId = ChainId(42161);

    async fn seed(fixture: &WatcherFixture, amount: u64) -> TransferId {
        let t = sent_transfer(1, OPTIMISM, ARBITRUM, amount, 100);
        fixture.store.transfers.update(&t).await.unwrap();
        t.transfer_id
    }

    #[tokio::test]
    async fn test_bonds_when_credit_suffices() {
        let fixture = WatcherFixture::new();
        let watcher = BondWithdrawalWatcher::new(fixture.ctx.clone(), ARBITRUM).unwrap();
        let id = seed(&fixture, 10).await;
        fixture.bridge(ARBITRUM).set_credit(bonder_address(), U256::from(100));

        let outcome = watcher.check_bond(id).await.unwrap();
        assert!(matches!(outcome, Outcome::Submitted(_)));
        assert_eq!(fixture.sent_labels(ARBITRUM), vec!["bond_withdrawal"]);
        let stored = fixture.store.transfers.get(&id).await.unwrap().unwrap();
        assert!(stored.is_in_flight());
        assert!(stored.withdrawal_bond_tx_hash.is_some());
        // bonded flag is only set by the synced event
        assert!(!stored.is_bonded());
    }

    #[tokio::test]
    async fn test_insufficient_credit_skips() {
        let fixture = WatcherFixture::new();
        let watcher = BondWithdrawalWatcher::new(fixture.ctx.clone(), ARBITRUM).unwrap();
        let id = seed(&fixture, 10).await;
        fixture.bridge(ARBITRUM).set_credit(bonder_address(), U256::from(5));

        let result = watcher.check_bond(id).await;
        assert_eq!(
            result,
            Err(BonderError::InsufficientCredit {
                available: U256::from(5),
                required: U256::from(10),
            })
        );
        let stored = fixture.store.transfers.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.withdrawal_bonded, None);
        assert!(fixture.sent_labels(ARBITRUM).is_empty());
    }

    #[tokio::test]
    async fn test_debit_and_in_flight_bonds_reduce_credit() {
        let fixture = WatcherFixture::new();
        let watcher = BondWithdrawalWatcher::new(fixture.ctx.clone(), ARBITRUM).unwrap();
        let bridge = fixture.bridge(ARBITRUM);
        bridge.set_credit(bonder_address(), U256::from(30));
        bridge.set_debit(bonder_address(), U256::from(5));

        let first = sent_transfer(1, OPTIMISM, ARBITRUM, 15, 100);
        let second = sent_transfer(2, OPTIMISM, ARBITRUM, 15, 101);
        fixture.store.transfers.update(&first).await.unwrap();
        fixture.store.transfers.update(&second).await.unwrap();

        assert!(watcher.check_bond(first.transfer_id).await.is_ok());
        assert!(matches!(
            watcher.check_bond(second.transfer_id).await,
            Err(BonderError::InsufficientCredit { .. })
        ));
    }

    #[tokio::test]
    async fn test_amount_bounds_and_fee() {
        let mut config = test_node_config();
        config.bond.max_amount = Some(U256::from(50));
        config.bond.min_bonder_fee = U256::from(20);
        let fixture = WatcherFixture::with_config(config);
        let watcher = BondWithdrawalWatcher::new(fixture.ctx.clone(), ARBITRUM).unwrap();
        fixture.bridge(ARBITRUM).set_credit(bonder_address(), U256::from(1000));

        let large = sent_transfer(1, OPTIMISM, ARBITRUM, 60, 100);
        fixture.store.transfers.update(&large).await.unwrap();
        assert!(matches!(
            watcher.check_bond(large.transfer_id).await,
            Err(BonderError::AmountOutOfBounds(_))
        ));
        let stored = fixture.store.transfers.get(&large.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.is_bondable, Some(false));

        // fee of 10 is below the minimum of 20
        let cheap = sent_transfer(2, OPTIMISM, ARBITRUM, 40, 101);
        fixture.store.transfers.update(&cheap).await.unwrap();
        assert!(matches!(
            watcher.check_bond(cheap.transfer_id).await,
            Err(BonderError::BonderFeeTooLow(_))
        ));
        assert!(fixture.sent_labels(ARBITRUM).is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_root_is_rejected() {
        let fixture = WatcherFixture::new();
        let watcher = BondWithdrawalWatcher::new(fixture.ctx.clone(), ARBITRUM).unwrap();
        fixture.bridge(ARBITRUM).set_credit(bonder_address(), U256::from(1000));
        let root_hash = H256::repeat_byte(0x77);
        let mut t = sent_transfer(1, OPTIMISM, ARBITRUM, 10, 100);
        t.transfer_root_hash = Some(root_hash);
        fixture.store.transfers.update(&t).await.unwrap();
        fixture
            .store
            .transfer_roots
            .update(&TransferRoot {
                confirmed: Some(true),
                ..TransferRoot::new(root_hash)
            })
            .await
            .unwrap();

        assert_eq!(
            watcher.check_bond(t.transfer_id).await,
            Err(BonderError::RootAlreadyConfirmed(root_hash))
        );
    }

    #[tokio::test]
    async fn test_peer_aborts_when_bonded_during_wait() {
        let first = WatcherFixture::new();
        let mut config = test_node_config();
        config.ordering.hostname = "bonder-second".into();
        config.ordering.declared_order = 1;
        config.ordering.wait_delay = Duration::from_millis(500);
        let second = WatcherFixture::peer_of(&first, config);
        let watcher = BondWithdrawalWatcher::new(second.ctx.clone(), ARBITRUM).unwrap();
        let id = seed(&first, 10).await;
        first.bridge(ARBITRUM).set_credit(bonder_address(), U256::from(100));

        let store = first.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let bonded = Transfer {
                withdrawal_bonded: Some(true),
                withdrawal_bonder: Some(Address::repeat_byte(0xaa)),
                ..Transfer::new(id)
            };
            store.transfers.update(&bonded).await.unwrap();
        });

        let result = watcher.check_bond(id).await;
        assert!(matches!(result, Err(BonderError::AlreadyHandled(_))));
        assert!(second.sent_labels(ARBITRUM).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_checks_bond_at_most_once() {
        let fixture = WatcherFixture::new();
        let watcher = Arc::new(BondWithdrawalWatcher::new(fixture.ctx.clone(), ARBITRUM).unwrap());
        let id = seed(&fixture, 10).await;
        fixture.bridge(ARBITRUM).set_credit(bonder_address(), U256::from(100));

        let mut handles = vec![];
        for _ in 0..4 {
            let watcher = watcher.clone();
            handles.push(tokio::spawn(async move { watcher.check_bond(id).await }));
        }
        let mut submitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(Outcome::Submitted(_)) => submitted += 1,
                Err(BonderError::AlreadyHandled(_)) => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(submitted, 1);
        assert_eq!(fixture.sent_labels(ARBITRUM).len(), 1);
    }

    #[tokio::test]
    async fn test_swap_params_use_distribute_on_l2() {
        let fixture = WatcherFixture::new();
        let watcher = BondWithdrawalWatcher::new(fixture.ctx.clone(), ARBITRUM).unwrap();
        fixture.bridge(ARBITRUM).set_credit(bonder_address(), U256::from(100));
        let mut t = sent_transfer(1, OPTIMISM, ARBITRUM, 10, 100);
        t.amount_out_min = Some(U256::from(9));
        t.deadline = Some(U256::from(now_secs() + 3600));
        fixture.store.transfers.update(&t).await.unwrap();

        watcher.check_bond(t.transfer_id).await.unwrap();
        assert_eq!(
            fixture.sent_labels(ARBITRUM),
            vec!["bond_withdrawal_and_distribute"]
        );
    }

    #[tokio::test]
    async fn test_revert_clears_in_flight_and_backs_off() {
        let fixture = WatcherFixture::new();
        let watcher = BondWithdrawalWatcher::new(fixture.ctx.clone(), ARBITRUM).unwrap();
        let id = seed(&fixture, 10).await;
        fixture.bridge(ARBITRUM).set_credit(bonder_address(), U256::from(100));
        let broadcaster = fixture.broadcaster(ARBITRUM);
        broadcaster.set_auto_confirm(false);

        let Outcome::Submitted(tx_hash) = watcher.check_bond(id).await.unwrap() else {
            panic!("expected a submission");
        };
        broadcaster.mine(tx_hash, false);

        let store = fixture.store.clone();
        let mut reverted = false;
        for _ in 0..200 {
            let t = store.transfers.get(&id).await.unwrap().unwrap();
            if t.withdrawal_bond_backoff == Some(1) {
                assert!(!t.is_in_flight());
                reverted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(reverted);
        assert!(matches!(
            watcher.check_bond(id).await.unwrap(),
            Outcome::NotDue(_)
        ));
        assert_eq!(backoff_delay(Duration::from_secs(60), 3), Duration::from_secs(240));
    }

    #[tokio::test]
    async fn test_in_flight_root_bond_reduces_l1_credit() {
        const L1: ChainId = ChainId(1);
        let fixture = WatcherFixture::new();
        let watcher = BondWithdrawalWatcher::new(fixture.ctx.clone(), L1).unwrap();
        fixture.bridge(L1).set_credit(bonder_address(), U256::from(100));
        // a root bond of 60 sent by this process and not landed yet
        fixture
            .store
            .transfer_roots
            .update(&TransferRoot {
                total_amount: Some(U256::from(60)),
                sent_bond_tx_at: Some(now_secs()),
                ..TransferRoot::new(H256::repeat_byte(0x60))
            })
            .await
            .unwrap();

        let t = sent_transfer(1, OPTIMISM, L1, 50, 100);
        fixture.store.transfers.update(&t).await.unwrap();
        assert_eq!(
            watcher.check_bond(t.transfer_id).await,
            Err(BonderError::InsufficientCredit {
                available: U256::from(40),
                required: U256::from(50),
            })
        );

        let small = sent_transfer(2, OPTIMISM, L1, 40, 101);
        fixture.store.transfers.update(&small).await.unwrap();
        assert!(matches!(
            watcher.check_bond(small.transfer_id).await,
            Ok(Outcome::Submitted(_))
        ));
        assert_eq!(fixture.sent_labels(L1), vec!["bond_withdrawal"]);
    }

    #[tokio::test]
    async fn test_rejected_transfer_bonds_after_limits_change() {
        let mut config = test_node_config();
        config.bond.max_amount = Some(U256::from(50));
        let strict = WatcherFixture::with_config(config);
        strict.bridge(ARBITRUM).set_credit(bonder_address(), U256::from(1000));
        let id = seed(&strict, 60).await;

        let watcher = BondWithdrawalWatcher::new(strict.ctx.clone(), ARBITRUM).unwrap();
        watcher.poll().await.unwrap();
        watcher.poll().await.unwrap();
        assert!(strict.sent_labels(ARBITRUM).is_empty());
        let stored = strict.store.transfers.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.is_bondable, Some(false));

        // restarted without the maximum, same store
        let relaxed = WatcherFixture::peer_of(&strict, test_node_config());
        let watcher = BondWithdrawalWatcher::new(relaxed.ctx.clone(), ARBITRUM).unwrap();
        watcher.poll().await.unwrap();
        assert_eq!(relaxed.sent_labels(ARBITRUM), vec!["bond_withdrawal"]);
        let stored = relaxed.store.transfers.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.is_bondable, Some(true));
        assert!(stored.is_in_flight());
    }

    #[tokio::test]
    async fn test_poll_reserves_credit_for_each_bond_sent() {
        let fixture = WatcherFixture::new();
        let watcher = BondWithdrawalWatcher::new(fixture.ctx.clone(), ARBITRUM).unwrap();
        fixture.bridge(ARBITRUM).set_credit(bonder_address(), U256::from(50));
        for seed in 1..=4 {
            let t = sent_transfer(seed, OPTIMISM, ARBITRUM, 20, 100 + seed as u64);
            fixture.store.transfers.update(&t).await.unwrap();
        }

        watcher.poll().await.unwrap();
        // 20 + 20 fit in 50, the other two wait for credit
        assert_eq!(fixture.sent_labels(ARBITRUM).len(), 2);
        let in_flight = fixture
            .store
            .transfers
            .in_flight_bonds(ARBITRUM)
            .await
            .unwrap();
        assert_eq!(in_flight.len(), 2);
    }
}
