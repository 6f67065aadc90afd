// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_syncer::{EventHandler, HandlerAction};
use crate::error::{BonderError, BonderResult};
use crate::events::{BridgeEvent, BridgeLog};
use crate::merkle::check_root;
use crate::metrics::BonderMetrics;
use crate::notifier::{Severity, SharedNotifier};
use crate::store::StateStore;
use crate::types::{compute_transfer_root_id, ChainId, RootHash, Transfer, TransferRoot};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Applies synced events to the state store. Every write is a merge patch
/// keyed by id, so replaying an event leaves the store unchanged.
pub struct StoreEventHandler {
    store: StateStore,
    metrics: Arc<BonderMetrics>,
    notifier: SharedNotifier,
}

impl StoreEventHandler {
    pub fn new(store: StateStore, metrics: Arc<BonderMetrics>, notifier: SharedNotifier) -> Self {
        Self {
            store,
            metrics,
            notifier,
        }
    }

    async fn transfer_sent(&self, log: &BridgeLog) -> BonderResult<()> {
        let BridgeEvent::TransferSent {
            transfer_id,
            destination_chain_id,
            recipient,
            amount,
            transfer_nonce,
            bonder_fee,
            index,
            amount_out_min,
            deadline,
        } = &log.event
        else {
            return Ok(());
        };
        let patch = Transfer {
            source_chain_id: Some(log.chain_id),
            destination_chain_id: Some(*destination_chain_id),
            recipient: Some(*recipient),
            amount: Some(*amount),
            transfer_nonce: Some(*transfer_nonce),
            bonder_fee: Some(*bonder_fee),
            amount_out_min: Some(*amount_out_min),
            deadline: Some(*deadline),
            pending_index: Some(*index),
            transfer_sent_block: Some(log.block_number),
            transfer_sent_log_index: Some(log.log_index),
            transfer_sent_tx_hash: Some(log.tx_hash),
            transfer_sent_timestamp: Some(log.block_timestamp),
            ..Transfer::new(*transfer_id)
        };
        self.store.transfers.update(&patch).await?;
        debug!(
            "[{}] transfer {:?} sent to chain {}",
            log.chain_id, transfer_id, destination_chain_id
        );
        Ok(())
    }

    async fn transfers_committed(&self, log: &BridgeLog) -> BonderResult<()> {
        let BridgeEvent::TransfersCommitted {
            destination_chain_id,
            root_hash,
            total_amount,
            root_committed_at,
        } = &log.event
        else {
            return Ok(());
        };
        let mut patch = TransferRoot {
            transfer_root_id: Some(compute_transfer_root_id(*root_hash, *total_amount)),
            total_amount: Some(*total_amount),
            source_chain_id: Some(log.chain_id),
            destination_chain_id: Some(*destination_chain_id),
            committed: Some(true),
            committed_at: Some(*root_committed_at),
            commit_tx_hash: Some(log.tx_hash),
            commit_block: Some(log.block_number),
            commit_log_index: Some(log.log_index),
            ..TransferRoot::new(*root_hash)
        };

        let existing = self.store.transfer_roots.get(root_hash).await?;
        if existing
            .as_ref()
            .map(|r| r.transfer_ids.is_some() || r.is_suspect())
            .unwrap_or(false)
        {
            // replayed event, already linked or already flagged
            self.store.transfer_roots.update(&patch).await?;
            return Ok(());
        }

        let ids = self
            .committed_transfer_ids(log.chain_id, *destination_chain_id, log.position())
            .await?;
        if ids.is_empty() {
            warn!(
                "[{}] root {:?} committed but no pending transfers are known for chain {}",
                log.chain_id, root_hash, destination_chain_id
            );
            self.store.transfer_roots.update(&patch).await?;
            return Ok(());
        }

        if let Err(e) = check_root(root_hash, &ids) {
            self.store.transfer_roots.update(&patch).await?;
            self.flag(*root_hash, &e).await?;
            return Ok(());
        }

        for id in &ids {
            let link = Transfer {
                committed: Some(true),
                transfer_root_hash: Some(*root_hash),
                ..Transfer::new(*id)
            };
            self.store.transfers.update(&link).await?;
        }
        info!(
            "[{}] root {:?} committed for chain {} with {} transfers, total {}",
            log.chain_id,
            root_hash,
            destination_chain_id,
            ids.len(),
            total_amount
        );
        patch.transfer_ids = Some(ids);
        self.store.transfer_roots.update(&patch).await?;
        Ok(())
    }

    /// Uncommitted transfers of the route sent before the commit, starting at
    /// the last pending list reset (index 0).
    async fn committed_transfer_ids(
        &self,
        source: ChainId,
        destination: ChainId,
        commit_position: (u64, u64),
    ) -> BonderResult<Vec<RootHash>> {
        let pending = self
            .store
            .transfers
            .pending_for_route(source, destination)
            .await?
            .into_iter()
            .filter(|t| t.sent_position() < commit_position)
            .collect::<Vec<_>>();
        let start = pending
            .iter()
            .rposition(|t| t.pending_index == Some(0))
            .unwrap_or(0);
        Ok(pending[start..].iter().map(|t| t.transfer_id).collect())
    }

    async fn flag(&self, root_hash: RootHash, err: &BonderError) -> BonderResult<()> {
        self.metrics
            .invariant_violations
            .with_label_values(&[err.error_type()])
            .inc();
        let count = self
            .store
            .transfer_roots
            .flag_suspect(&root_hash, &err.to_string())
            .await?;
        error!("root {:?} flagged as suspect: {}", root_hash, err);
        self.notifier
            .notify(
                Severity::Warning,
                "invariant violation",
                &format!("root {:?} (#{}): {}", root_hash, count, err),
            )
            .await;
        Ok(())
    }

    async fn withdrawal_settled(
        &self,
        log: &BridgeLog,
        bonder: Address,
        root_hash: RootHash,
        reported_total: Option<U256>,
    ) -> BonderResult<()> {
        let root = self.store.transfer_roots.get(&root_hash).await?;
        let mut settled = root
            .as_ref()
            .and_then(|r| r.settled_by_bonder.clone())
            .unwrap_or_default();
        let total_amount = root.as_ref().and_then(|r| r.total_amount);

        let linked = self.store.transfers.for_root(&root_hash).await?;
        let by_bonder = linked
            .iter()
            .filter(|t| t.withdrawal_bonder == Some(bonder) && t.is_settled())
            .fold(U256::zero(), |acc, t| {
                acc.saturating_add(t.amount.unwrap_or_default())
            });
        let entry = settled.entry(bonder).or_insert_with(U256::zero);
        // recomputing from transfers makes replays harmless
        *entry = match reported_total {
            Some(reported) if linked.is_empty() => (*entry).max(reported),
            _ => by_bonder,
        };

        let mut patch = TransferRoot {
            settled_by_bonder: Some(BTreeMap::from([(bonder, *entry)])),
            ..TransferRoot::new(root_hash)
        };
        let total_settled = settled
            .values()
            .fold(U256::zero(), |acc, v| acc.saturating_add(*v));
        if let Some(total) = total_amount {
            if total_settled > total {
                let err = BonderError::OverSettled {
                    settled: total_settled,
                    total,
                };
                self.store.transfer_roots.update(&patch).await?;
                return self.flag(root_hash, &err).await;
            }
            patch.all_settled = Some(total_settled == total);
        }
        self.store.transfer_roots.update(&patch).await?;
        debug!(
            "[{}] root {:?} settled {} of {:?} (bonder {:?})",
            log.chain_id, root_hash, total_settled, total_amount, bonder
        );
        Ok(())
    }

    async fn apply(&self, log: &BridgeLog) -> BonderResult<()> {
        match &log.event {
            BridgeEvent::TransferSent { .. } => self.transfer_sent(log).await,
            BridgeEvent::TransfersCommitted { .. } => self.transfers_committed(log).await,
            BridgeEvent::TransferRootBonded { root_hash, amount } => {
                let patch = TransferRoot {
                    transfer_root_id: Some(compute_transfer_root_id(*root_hash, *amount)),
                    total_amount: Some(*amount),
                    bonded: Some(true),
                    bonder: log.tx_from,
                    bonded_at: Some(log.block_timestamp),
                    bond_tx_hash: Some(log.tx_hash),
                    ..TransferRoot::new(*root_hash)
                };
                self.store.transfer_roots.update(&patch).await?;
                Ok(())
            }
            BridgeEvent::TransferRootConfirmed {
                origin_chain_id,
                destination_chain_id,
                root_hash,
                total_amount,
            } => {
                let patch = TransferRoot {
                    transfer_root_id: Some(compute_transfer_root_id(*root_hash, *total_amount)),
                    total_amount: Some(*total_amount),
                    source_chain_id: Some(*origin_chain_id),
                    destination_chain_id: Some(*destination_chain_id),
                    confirmed: Some(true),
                    confirmed_at: Some(log.block_timestamp),
                    confirm_tx_hash: Some(log.tx_hash),
                    ..TransferRoot::new(*root_hash)
                };
                self.store.transfer_roots.update(&patch).await?;
                Ok(())
            }
            BridgeEvent::TransferRootSet {
                root_hash,
                total_amount,
            } => {
                let patch = TransferRoot {
                    total_amount: Some(*total_amount),
                    root_set_on_destination: Some(true),
                    root_set_tx_hash: Some(log.tx_hash),
                    ..TransferRoot::new(*root_hash)
                };
                self.store.transfer_roots.update(&patch).await?;
                Ok(())
            }
            BridgeEvent::WithdrawalBonded {
                transfer_id,
                amount,
            } => {
                let patch = Transfer {
                    destination_chain_id: Some(log.chain_id),
                    amount: Some(*amount),
                    withdrawal_bonded: Some(true),
                    withdrawal_bonder: log.tx_from,
                    withdrawal_bond_tx_hash: Some(log.tx_hash),
                    withdrawal_bond_in_flight: Some(false),
                    ..Transfer::new(*transfer_id)
                };
                self.store.transfers.update(&patch).await?;
                Ok(())
            }
            BridgeEvent::Withdrew { transfer_id, .. } => {
                let patch = Transfer {
                    destination_chain_id: Some(log.chain_id),
                    is_transfer_spent: Some(true),
                    transfer_spent_tx_hash: Some(log.tx_hash),
                    withdrawal_bond_in_flight: Some(false),
                    ..Transfer::new(*transfer_id)
                };
                self.store.transfers.update(&patch).await?;
                Ok(())
            }
            BridgeEvent::WithdrawalBondSettled {
                bonder,
                transfer_id,
                root_hash,
            } => {
                let patch = Transfer {
                    withdrawal_bond_settled: Some(true),
                    withdrawal_bond_settled_tx_hash: Some(log.tx_hash),
                    ..Transfer::new(*transfer_id)
                };
                self.store.transfers.update(&patch).await?;
                self.withdrawal_settled(log, *bonder, *root_hash, None).await
            }
            BridgeEvent::MultipleWithdrawalsSettled {
                bonder,
                root_hash,
                total_bonds_settled,
            } => {
                for transfer in self.store.transfers.for_root(root_hash).await? {
                    if transfer.withdrawal_bonder != Some(*bonder) || transfer.is_settled() {
                        continue;
                    }
                    let patch = Transfer {
                        withdrawal_bond_settled: Some(true),
                        withdrawal_bond_settled_tx_hash: Some(log.tx_hash),
                        ..Transfer::new(transfer.transfer_id)
                    };
                    self.store.transfers.update(&patch).await?;
                }
                self.withdrawal_settled(log, *bonder, *root_hash, Some(*total_bonds_settled))
                    .await
            }
            BridgeEvent::TransferBondChallenged {
                transfer_root_id,
                root_hash,
                original_amount,
            } => {
                warn!(
                    "[{}] bond on root {:?} challenged (amount {})",
                    log.chain_id, root_hash, original_amount
                );
                let patch = TransferRoot {
                    transfer_root_id: Some(*transfer_root_id),
                    challenged: Some(true),
                    ..TransferRoot::new(*root_hash)
                };
                self.store.transfer_roots.update(&patch).await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EventHandler for StoreEventHandler {
    async fn handle(&self, log: &BridgeLog) -> BonderResult<HandlerAction> {
        self.apply(log).await?;
        Ok(HandlerAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::build_root;
    use crate::test_utils::{sent_transfer, RecordingNotifier};
    use ethers::types::H256;

    const OPTIMISM: ChainId = ChainId(10);
    const ARBITRUM: ChainId = ChainId(42161);

    fn handler(store: &StateStore) -> (StoreEventHandler, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        (
            StoreEventHandler::new(
                store.clone(),
                Arc::new(BonderMetrics::new_for_testing()),
                notifier.clone(),
            ),
            notifier,
        )
    }

    fn log(chain_id: ChainId, block_number: u64, log_index: u64, event: BridgeEvent) -> BridgeLog {
        BridgeLog {
            chain_id,
            block_number,
            log_index,
            tx_hash: H256::from_low_u64_be(block_number * 1000 + log_index),
            block_timestamp: block_number * 12,
            tx_from: Some(Address::repeat_byte(0xb0)),
            event,
        }
    }

    fn sent_log(transfer: &Transfer) -> BridgeLog {
        log(
            transfer.source_chain_id.unwrap(),
            transfer.transfer_sent_block.unwrap(),
            0,
            BridgeEvent::TransferSent {
                transfer_id: transfer.transfer_id,
                destination_chain_id: transfer.destination_chain_id.unwrap(),
                recipient: transfer.recipient.unwrap(),
                amount: transfer.amount.unwrap(),
                transfer_nonce: transfer.transfer_nonce.unwrap(),
                bonder_fee: transfer.bonder_fee.unwrap(),
                index: transfer.pending_index.unwrap(),
                amount_out_min: U256::zero(),
                deadline: U256::zero(),
            },
        )
    }

    fn committed_log(block: u64, root_hash: RootHash, total: u64) -> BridgeLog {
        log(
            OPTIMISM,
            block,
            5,
            BridgeEvent::TransfersCommitted {
                destination_chain_id: ARBITRUM,
                root_hash,
                total_amount: U256::from(total),
                root_committed_at: block * 12,
            },
        )
    }

    fn with_index(mut transfer: Transfer, index: u64) -> Transfer {
        transfer.pending_index = Some(index);
        transfer
    }

    #[tokio::test]
    async fn test_commit_links_transfers_in_send_order() {
        let store = StateStore::in_memory();
        let (handler, notifier) = handler(&store);
        let transfers = vec![
            with_index(sent_transfer(1, OPTIMISM, ARBITRUM, 10, 100), 0),
            with_index(sent_transfer(2, OPTIMISM, ARBITRUM, 20, 101), 1),
            with_index(sent_transfer(3, OPTIMISM, ARBITRUM, 15, 102), 2),
        ];
        for t in &transfers {
            handler.handle(&sent_log(t)).await.unwrap();
        }
        // sent after the commit, belongs to the next root
        let late = with_index(sent_transfer(4, OPTIMISM, ARBITRUM, 5, 120), 0);
        handler.handle(&sent_log(&late)).await.unwrap();

        let ids = transfers.iter().map(|t| t.transfer_id).collect::<Vec<_>>();
        let root_hash = build_root(&ids).unwrap();
        handler.handle(&committed_log(110, root_hash, 45)).await.unwrap();

        let root = store.transfer_roots.get(&root_hash).await.unwrap().unwrap();
        assert_eq!(root.total_amount, Some(U256::from(45)));
        assert_eq!(root.transfer_ids, Some(ids.clone()));
        assert!(!root.is_suspect());
        for id in &ids {
            let t = store.transfers.get(id).await.unwrap().unwrap();
            assert_eq!(t.transfer_root_hash, Some(root_hash));
        }
        let late = store.transfers.get(&late.transfer_id).await.unwrap().unwrap();
        assert!(!late.is_committed());
        assert!(notifier.titles().is_empty());
    }

    #[tokio::test]
    async fn test_commit_starts_at_last_index_reset() {
        let store = StateStore::in_memory();
        let (handler, _) = handler(&store);
        // a stale transfer from before an unseen commit
        let stale = with_index(sent_transfer(1, OPTIMISM, ARBITRUM, 10, 90), 3);
        let fresh = vec![
            with_index(sent_transfer(2, OPTIMISM, ARBITRUM, 20, 100), 0),
            with_index(sent_transfer(3, OPTIMISM, ARBITRUM, 15, 101), 1),
        ];
        handler.handle(&sent_log(&stale)).await.unwrap();
        for t in &fresh {
            handler.handle(&sent_log(t)).await.unwrap();
        }
        let ids = fresh.iter().map(|t| t.transfer_id).collect::<Vec<_>>();
        let root_hash = build_root(&ids).unwrap();
        handler.handle(&committed_log(110, root_hash, 35)).await.unwrap();

        let root = store.transfer_roots.get(&root_hash).await.unwrap().unwrap();
        assert_eq!(root.transfer_ids, Some(ids));
    }

    #[tokio::test]
    async fn test_commit_with_wrong_ids_flags_root() {
        let store = StateStore::in_memory();
        let (handler, notifier) = handler(&store);
        let t = with_index(sent_transfer(1, OPTIMISM, ARBITRUM, 10, 100), 0);
        handler.handle(&sent_log(&t)).await.unwrap();

        let root_hash = H256::repeat_byte(0xee);
        handler.handle(&committed_log(110, root_hash, 10)).await.unwrap();

        let root = store.transfer_roots.get(&root_hash).await.unwrap().unwrap();
        assert!(root.is_suspect());
        assert!(root.transfer_ids.is_none());
        let t = store.transfers.get(&t.transfer_id).await.unwrap().unwrap();
        assert!(!t.is_committed());
        assert_eq!(notifier.titles(), vec!["invariant violation"]);
    }

    #[tokio::test]
    async fn test_replaying_events_is_idempotent() {
        let store = StateStore::in_memory();
        let (handler, _) = handler(&store);
        let transfers = vec![
            with_index(sent_transfer(1, OPTIMISM, ARBITRUM, 10, 100), 0),
            with_index(sent_transfer(2, OPTIMISM, ARBITRUM, 20, 101), 1),
        ];
        let ids = transfers.iter().map(|t| t.transfer_id).collect::<Vec<_>>();
        let root_hash = build_root(&ids).unwrap();
        let bonder = Address::repeat_byte(0xb0);

        let mut logs = transfers.iter().map(sent_log).collect::<Vec<_>>();
        logs.push(committed_log(110, root_hash, 30));
        for (i, t) in transfers.iter().enumerate() {
            logs.push(log(
                ARBITRUM,
                200 + i as u64,
                0,
                BridgeEvent::WithdrawalBonded {
                    transfer_id: t.transfer_id,
                    amount: t.amount.unwrap(),
                },
            ));
        }
        logs.push(log(
            ARBITRUM,
            300,
            0,
            BridgeEvent::MultipleWithdrawalsSettled {
                bonder,
                root_hash,
                total_bonds_settled: U256::from(30),
            },
        ));

        for l in &logs {
            handler.handle(l).await.unwrap();
        }
        let transfers_once = store.transfers.all().await.unwrap();
        let roots_once = store.transfer_roots.all().await.unwrap();

        for l in &logs {
            handler.handle(l).await.unwrap();
        }
        assert_eq!(store.transfers.all().await.unwrap(), transfers_once);
        assert_eq!(store.transfer_roots.all().await.unwrap(), roots_once);

        let root = &roots_once[0];
        assert_eq!(root.total_settled(), U256::from(30));
        assert!(root.is_all_settled());
    }

    #[tokio::test]
    async fn test_settled_total_never_exceeds_root_total() {
        let store = StateStore::in_memory();
        let (handler, _) = handler(&store);
        let a = with_index(sent_transfer(1, OPTIMISM, ARBITRUM, 10, 100), 0);
        let b = with_index(sent_transfer(2, OPTIMISM, ARBITRUM, 20, 101), 1);
        for t in [&a, &b] {
            handler.handle(&sent_log(t)).await.unwrap();
        }
        let root_hash = build_root(&[a.transfer_id, b.transfer_id]).unwrap();
        handler.handle(&committed_log(110, root_hash, 30)).await.unwrap();

        let first = Address::repeat_byte(0xb0);
        let second = Address::repeat_byte(0xb1);
        let mut bonded_a = log(
            ARBITRUM,
            200,
            0,
            BridgeEvent::WithdrawalBonded {
                transfer_id: a.transfer_id,
                amount: U256::from(10),
            },
        );
        bonded_a.tx_from = Some(first);
        let mut bonded_b = log(
            ARBITRUM,
            201,
            0,
            BridgeEvent::WithdrawalBonded {
                transfer_id: b.transfer_id,
                amount: U256::from(20),
            },
        );
        bonded_b.tx_from = Some(second);
        handler.handle(&bonded_a).await.unwrap();
        handler.handle(&bonded_b).await.unwrap();

        // each bonder settles its own transfer, the first one twice
        for (block, bonder, id) in [
            (300, first, a.transfer_id),
            (301, first, a.transfer_id),
            (302, second, b.transfer_id),
        ] {
            handler
                .handle(&log(
                    ARBITRUM,
                    block,
                    0,
                    BridgeEvent::WithdrawalBondSettled {
                        bonder,
                        transfer_id: id,
                        root_hash,
                    },
                ))
                .await
                .unwrap();
            let root = store.transfer_roots.get(&root_hash).await.unwrap().unwrap();
            assert!(root.total_settled() <= U256::from(30));
        }
        let root = store.transfer_roots.get(&root_hash).await.unwrap().unwrap();
        assert_eq!(root.settled_by_bonder.as_ref().unwrap()[&first], U256::from(10));
        assert_eq!(root.settled_by_bonder.as_ref().unwrap()[&second], U256::from(20));
        assert!(root.is_all_settled());
        assert!(!root.is_suspect());
    }
}
