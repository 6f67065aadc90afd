// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Secondary keys kept next to the transfer and root records so the hot
//! queries read a handful of keys instead of decoding every record.
//!
//! Entries are rewritten from the merged record on every update. Readers
//! re-check the record itself, an entry only says where to look.

use super::{from_value, hex_key, to_value, KeyRange, KvBackend, INDEX_NAMESPACE};
use crate::error::{BonderError, BonderResult};
use crate::types::{ChainId, Transfer, TransferRoot};
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

const ROOT_BOND_PREFIX: &str = "in_flight/root/";

/// A bond this process sent that has not landed yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightBond {
    /// Transfer id or root hash.
    pub subject: H256,
    pub amount: U256,
    pub sent_at: u64,
}

pub(crate) fn unbonded_prefix(destination: ChainId) -> String {
    format!("unbonded/{:020}/", destination.0)
}

pub(crate) fn pending_prefix(source: ChainId, destination: ChainId) -> String {
    format!("pending/{:020}/{:020}/", source.0, destination.0)
}

pub(crate) fn transfer_bond_prefix(destination: ChainId) -> String {
    format!("in_flight/transfer/{:020}/", destination.0)
}

async fn set_entry(backend: &dyn KvBackend, key: String, value: Option<Value>) -> BonderResult<()> {
    match value {
        Some(value) => backend.put(INDEX_NAMESPACE, &key, value).await,
        None => backend.delete(INDEX_NAMESPACE, &key).await.map(|_| ()),
    }
}

pub(crate) async fn index_transfer(backend: &dyn KvBackend, t: &Transfer) -> BonderResult<()> {
    let Some(destination) = t.destination_chain_id else {
        return Ok(());
    };
    let id = hex_key(&t.transfer_id);
    let open = t.amount.is_some()
        && t.transfer_sent_block.is_some()
        && !t.is_bonded()
        && !t.is_spent()
        && !t.is_not_found.unwrap_or(false);
    set_entry(
        backend,
        format!("{}{}", unbonded_prefix(destination), id),
        open.then_some(Value::Null),
    )
    .await?;

    let in_flight = match t.amount {
        Some(amount) if t.is_in_flight() && !t.is_bonded() && !t.is_spent() => Some(to_value(&InFlightBond {
            subject: t.transfer_id,
            amount,
            sent_at: t.withdrawal_bond_attempted_at.unwrap_or(0),
        })?),
        _ => None,
    };
    set_entry(
        backend,
        format!("{}{}", transfer_bond_prefix(destination), id),
        in_flight,
    )
    .await?;

    if let Some(source) = t.source_chain_id {
        let pending = t.amount.is_some() && !t.is_committed();
        set_entry(
            backend,
            format!("{}{}", pending_prefix(source, destination), id),
            pending.then_some(Value::Null),
        )
        .await?;
    }
    Ok(())
}

pub(crate) async fn index_root(backend: &dyn KvBackend, r: &TransferRoot) -> BonderResult<()> {
    let sent_at = r.sent_bond_tx_at.unwrap_or(0);
    let in_flight = match r.total_amount {
        Some(amount) if sent_at > 0 && !r.is_bonded() && !r.is_confirmed() => Some(to_value(&InFlightBond {
            subject: r.transfer_root_hash,
            amount,
            sent_at,
        })?),
        _ => None,
    };
    set_entry(
        backend,
        format!("{}{}", ROOT_BOND_PREFIX, hex_key(&r.transfer_root_hash)),
        in_flight,
    )
    .await
}

/// Subjects listed under `prefix`, in key order.
pub(crate) async fn scan_ids(backend: &dyn KvBackend, prefix: String) -> BonderResult<Vec<H256>> {
    backend
        .scan(INDEX_NAMESPACE, KeyRange::Prefix(prefix.clone()))
        .await?
        .into_iter()
        .map(|(key, _)| {
            H256::from_str(&key[prefix.len()..])
                .map_err(|e| BonderError::StorageError(format!("bad index key {}: {}", key, e)))
        })
        .collect()
}

pub(crate) async fn scan_bonds(backend: &dyn KvBackend, prefix: String) -> BonderResult<Vec<InFlightBond>> {
    backend
        .scan(INDEX_NAMESPACE, KeyRange::Prefix(prefix))
        .await?
        .into_iter()
        .map(|(_, v)| from_value(v))
        .collect()
}

pub(crate) async fn scan_root_bonds(backend: &dyn KvBackend) -> BonderResult<Vec<InFlightBond>> {
    scan_bonds(backend, ROOT_BOND_PREFIX.to_string()).await
}
