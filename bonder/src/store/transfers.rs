// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::indexes::{
    index_transfer, pending_prefix, scan_bonds, scan_ids, transfer_bond_prefix, unbonded_prefix,
    InFlightBond,
};
use super::{from_value, hex_key, to_value, KeyRange, KvBackend, TRANSFERS_NAMESPACE};
use crate::error::BonderResult;
use crate::types::{ChainId, RootHash, Transfer, TransferId};
use ethers::types::Address;
use std::sync::Arc;

#[derive(Clone)]
pub struct TransfersDb {
    backend: Arc<dyn KvBackend>,
}

impl TransfersDb {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub async fn get(&self, transfer_id: &TransferId) -> BonderResult<Option<Transfer>> {
        self.backend
            .get(TRANSFERS_NAMESPACE, &hex_key(transfer_id))
            .await?
            .map(from_value)
            .transpose()
    }

    /// Merge the populated fields of `patch` into the stored transfer.
    pub async fn update(&self, patch: &Transfer) -> BonderResult<Transfer> {
        let merged = self
            .backend
            .merge(
                TRANSFERS_NAMESPACE,
                &hex_key(&patch.transfer_id),
                to_value(patch)?,
            )
            .await?;
        let merged: Transfer = from_value(merged)?;
        index_transfer(self.backend.as_ref(), &merged).await?;
        Ok(merged)
    }

    pub async fn all(&self) -> BonderResult<Vec<Transfer>> {
        self.backend
            .scan(TRANSFERS_NAMESPACE, KeyRange::All)
            .await?
            .into_iter()
            .map(|(_, v)| from_value(v))
            .collect()
    }

    async fn filtered<F>(&self, keep: F) -> BonderResult<Vec<Transfer>>
    where
        F: Fn(&Transfer) -> bool,
    {
        let mut transfers = self
            .all()
            .await?
            .into_iter()
            .filter(|t| keep(t))
            .collect::<Vec<_>>();
        transfers.sort_by_key(|t| t.sent_position());
        Ok(transfers)
    }

    /// Records listed under an index prefix that still satisfy `keep`, in
    /// send order.
    async fn indexed<F>(&self, prefix: String, keep: F) -> BonderResult<Vec<Transfer>>
    where
        F: Fn(&Transfer) -> bool,
    {
        let mut transfers = vec![];
        for id in scan_ids(self.backend.as_ref(), prefix).await? {
            if let Some(t) = self.get(&id).await? {
                if keep(&t) {
                    transfers.push(t);
                }
            }
        }
        transfers.sort_by_key(|t| t.sent_position());
        Ok(transfers)
    }

    /// Transfers sent from `source` to `destination` not yet part of a root, in
    /// send order.
    pub async fn pending_for_route(
        &self,
        source: ChainId,
        destination: ChainId,
    ) -> BonderResult<Vec<Transfer>> {
        self.indexed(pending_prefix(source, destination), |t| {
            t.source_chain_id == Some(source)
                && t.destination_chain_id == Some(destination)
                && t.amount.is_some()
                && !t.is_committed()
        })
        .await
    }

    /// Transfers heading to `destination` that nobody has bonded or withdrawn.
    pub async fn unbonded_for_destination(
        &self,
        destination: ChainId,
    ) -> BonderResult<Vec<Transfer>> {
        self.indexed(unbonded_prefix(destination), |t| {
            t.destination_chain_id == Some(destination)
                && t.amount.is_some()
                && t.transfer_sent_block.is_some()
                && !t.is_bonded()
                && !t.is_spent()
                && !t.is_not_found.unwrap_or(false)
        })
        .await
    }

    /// Transfers linked to `root_hash`, ordered by their pending-list position.
    pub async fn for_root(&self, root_hash: &RootHash) -> BonderResult<Vec<Transfer>> {
        let mut transfers = self
            .filtered(|t| t.transfer_root_hash.as_ref() == Some(root_hash))
            .await?;
        transfers.sort_by_key(|t| (t.pending_index.unwrap_or(u64::MAX), t.sent_position()));
        Ok(transfers)
    }

    /// Bond transactions to `destination` sent by this process that have not
    /// landed yet.
    pub async fn in_flight_bonds(&self, destination: ChainId) -> BonderResult<Vec<InFlightBond>> {
        let mut bonds = vec![];
        for bond in scan_bonds(self.backend.as_ref(), transfer_bond_prefix(destination)).await? {
            let Some(t) = self.get(&bond.subject).await? else {
                continue;
            };
            if t.is_in_flight() && !t.is_bonded() && !t.is_spent() {
                bonds.push(InFlightBond {
                    sent_at: t.withdrawal_bond_attempted_at.unwrap_or(0),
                    ..bond
                });
            }
        }
        Ok(bonds)
    }

    pub async fn bonded_by(
        &self,
        bonder: Address,
        ids: &[TransferId],
    ) -> BonderResult<Vec<Transfer>> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(t) = self.get(id).await? {
                if t.is_bonded() && t.withdrawal_bonder == Some(bonder) {
                    out.push(t);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use ethers::types::{H256, U256};

    fn sent(id: u8, block: u64, dest: u64) -> Transfer {
        Transfer {
            transfer_id: H256::repeat_byte(id),
            source_chain_id: Some(ChainId(10)),
            destination_chain_id: Some(ChainId(dest)),
            amount: Some(U256::from(id as u64 * 10)),
            transfer_sent_block: Some(block),
            transfer_sent_log_index: Some(0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_update_is_idempotent_merge() {
        let store = StateStore::in_memory();
        let transfer = sent(1, 100, 1);
        let once = store.transfers.update(&transfer).await.unwrap();
        let twice = store.transfers.update(&transfer).await.unwrap();
        assert_eq!(once, twice);

        let mut patch = Transfer::new(transfer.transfer_id);
        patch.withdrawal_bonded = Some(true);
        let merged = store.transfers.update(&patch).await.unwrap();
        assert_eq!(merged.amount, transfer.amount);
        assert!(merged.is_bonded());
    }

    #[tokio::test]
    async fn test_pending_for_route_orders_by_send_position() {
        let store = StateStore::in_memory();
        store.transfers.update(&sent(3, 300, 1)).await.unwrap();
        store.transfers.update(&sent(1, 100, 1)).await.unwrap();
        store.transfers.update(&sent(2, 200, 1)).await.unwrap();
        store.transfers.update(&sent(4, 150, 42)).await.unwrap();
        let pending = store
            .transfers
            .pending_for_route(ChainId(10), ChainId(1))
            .await
            .unwrap();
        let ids = pending.iter().map(|t| t.transfer_id).collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec![H256::repeat_byte(1), H256::repeat_byte(2), H256::repeat_byte(3)]
        );
    }

    #[tokio::test]
    async fn test_indexes_follow_merged_state() {
        let store = StateStore::in_memory();
        let a = sent(1, 100, 42);
        let b = sent(2, 200, 42);
        store.transfers.update(&a).await.unwrap();
        store.transfers.update(&b).await.unwrap();
        store.transfers.update(&sent(3, 300, 1)).await.unwrap();

        let unbonded = store.transfers.unbonded_for_destination(ChainId(42)).await.unwrap();
        assert_eq!(unbonded.len(), 2);
        assert!(store.transfers.in_flight_bonds(ChainId(42)).await.unwrap().is_empty());

        let mut attempt = Transfer::new(a.transfer_id);
        attempt.withdrawal_bond_in_flight = Some(true);
        attempt.withdrawal_bond_attempted_at = Some(1_000);
        store.transfers.update(&attempt).await.unwrap();
        assert_eq!(
            store.transfers.in_flight_bonds(ChainId(42)).await.unwrap(),
            vec![InFlightBond {
                subject: a.transfer_id,
                amount: U256::from(10),
                sent_at: 1_000,
            }]
        );

        // the bond lands: out of both the unbonded list and the in-flight list
        let mut bonded = Transfer::new(a.transfer_id);
        bonded.withdrawal_bonded = Some(true);
        store.transfers.update(&bonded).await.unwrap();
        let unbonded = store.transfers.unbonded_for_destination(ChainId(42)).await.unwrap();
        assert_eq!(
            unbonded.iter().map(|t| t.transfer_id).collect::<Vec<_>>(),
            vec![b.transfer_id]
        );
        assert!(store.transfers.in_flight_bonds(ChainId(42)).await.unwrap().is_empty());

        // committing removes it from the route's pending list
        let mut committed = Transfer::new(b.transfer_id);
        committed.committed = Some(true);
        store.transfers.update(&committed).await.unwrap();
        let pending = store
            .transfers
            .pending_for_route(ChainId(10), ChainId(42))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].transfer_id, a.transfer_id);
    }
}
