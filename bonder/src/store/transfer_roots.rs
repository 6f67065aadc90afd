// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::indexes::{index_root, scan_root_bonds, InFlightBond};
use super::{from_value, hex_key, to_value, KeyRange, KvBackend, TRANSFER_ROOTS_NAMESPACE};
use crate::error::BonderResult;
use crate::types::{ChainId, RootHash, TransferRoot};
use std::sync::Arc;

#[derive(Clone)]
pub struct TransferRootsDb {
    backend: Arc<dyn KvBackend>,
}

impl TransferRootsDb {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub async fn get(&self, root_hash: &RootHash) -> BonderResult<Option<TransferRoot>> {
        self.backend
            .get(TRANSFER_ROOTS_NAMESPACE, &hex_key(root_hash))
            .await?
            .map(from_value)
            .transpose()
    }

    pub async fn update(&self, patch: &TransferRoot) -> BonderResult<TransferRoot> {
        let merged = self
            .backend
            .merge(
                TRANSFER_ROOTS_NAMESPACE,
                &hex_key(&patch.transfer_root_hash),
                to_value(patch)?,
            )
            .await?;
        let merged: TransferRoot = from_value(merged)?;
        index_root(self.backend.as_ref(), &merged).await?;
        Ok(merged)
    }

    pub async fn all(&self) -> BonderResult<Vec<TransferRoot>> {
        let mut roots = self
            .backend
            .scan(TRANSFER_ROOTS_NAMESPACE, KeyRange::All)
            .await?
            .into_iter()
            .map(|(_, v)| from_value::<TransferRoot>(v))
            .collect::<BonderResult<Vec<_>>>()?;
        roots.sort_by_key(|r| (r.committed_at.unwrap_or(u64::MAX), r.transfer_root_hash));
        Ok(roots)
    }

    pub async fn by_destination(&self, destination: ChainId) -> BonderResult<Vec<TransferRoot>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|r| r.destination_chain_id == Some(destination))
            .collect())
    }

    pub async fn by_source(&self, source: ChainId) -> BonderResult<Vec<TransferRoot>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|r| r.source_chain_id == Some(source))
            .collect())
    }

    /// Root bonds sent by this process that have not landed yet.
    pub async fn in_flight_bonds(&self) -> BonderResult<Vec<InFlightBond>> {
        let mut bonds = vec![];
        for bond in scan_root_bonds(self.backend.as_ref()).await? {
            let Some(root) = self.get(&bond.subject).await? else {
                continue;
            };
            let sent_at = root.sent_bond_tx_at.unwrap_or(0);
            if sent_at > 0 && !root.is_bonded() && !root.is_confirmed() {
                bonds.push(InFlightBond { sent_at, ..bond });
            }
        }
        Ok(bonds)
    }

    /// Record one more invariant violation and flag the root as suspect.
    pub async fn flag_suspect(&self, root_hash: &RootHash, reason: &str) -> BonderResult<u32> {
        let count = self
            .get(root_hash)
            .await?
            .and_then(|r| r.invariant_violations)
            .unwrap_or(0)
            + 1;
        let mut patch = TransferRoot::new(*root_hash);
        patch.is_not_found = Some(true);
        patch.suspect_reason = Some(reason.to_string());
        patch.invariant_violations = Some(count);
        self.update(&patch).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::StateStore;
    use crate::types::TransferRoot;
    use ethers::types::{Address, H256, U256};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_settled_amounts_merge_per_bonder() {
        let store = StateStore::in_memory();
        let hash = H256::repeat_byte(9);
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);

        let mut patch = TransferRoot::new(hash);
        patch.settled_by_bonder = Some(BTreeMap::from([(a, U256::from(10))]));
        store.transfer_roots.update(&patch).await.unwrap();
        // replay of the same event
        store.transfer_roots.update(&patch).await.unwrap();
        patch.settled_by_bonder = Some(BTreeMap::from([(b, U256::from(5))]));
        let root = store.transfer_roots.update(&patch).await.unwrap();
        assert_eq!(root.total_settled(), U256::from(15));
    }

    #[tokio::test]
    async fn test_flag_suspect_counts_violations() {
        let store = StateStore::in_memory();
        let hash = H256::repeat_byte(3);
        assert_eq!(
            store.transfer_roots.flag_suspect(&hash, "mismatch").await.unwrap(),
            1
        );
        assert_eq!(
            store.transfer_roots.flag_suspect(&hash, "mismatch").await.unwrap(),
            2
        );
        let root = store.transfer_roots.get(&hash).await.unwrap().unwrap();
        assert!(root.is_suspect());
    }

    #[tokio::test]
    async fn test_in_flight_root_bonds() {
        let store = StateStore::in_memory();
        let hash = H256::repeat_byte(4);
        let mut root = TransferRoot::new(hash);
        root.total_amount = Some(U256::from(60));
        root.sent_bond_tx_at = Some(1_000);
        store.transfer_roots.update(&root).await.unwrap();
        let bonds = store.transfer_roots.in_flight_bonds().await.unwrap();
        assert_eq!(bonds.len(), 1);
        assert_eq!(bonds[0].amount, U256::from(60));

        // a rolled back send frees the amount
        let mut rollback = TransferRoot::new(hash);
        rollback.sent_bond_tx_at = Some(0);
        store.transfer_roots.update(&rollback).await.unwrap();
        assert!(store.transfer_roots.in_flight_bonds().await.unwrap().is_empty());
    }
}
