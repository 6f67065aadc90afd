// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{from_value, to_value, KeyRange, KvBackend, GAS_BOOST_NAMESPACE};
use crate::error::BonderResult;
use crate::types::{ChainId, FeeParams, TxRequest};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoostAttempt {
    pub tx_hash: H256,
    pub fees: FeeParams,
    pub sent_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum BoostState {
    Pending,
    Confirmed { tx_hash: H256, block_number: u64 },
    Reverted { tx_hash: H256 },
    Abandoned { reason: String },
}

/// One nonce slot of a signer together with every fee bump sent for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasBoostTransaction {
    pub chain_id: ChainId,
    pub from: Address,
    pub nonce: u64,
    pub request: TxRequest,
    pub fees: FeeParams,
    pub boost_count: u32,
    pub attempts: Vec<BoostAttempt>,
    pub state: BoostState,
    pub created_at: u64,
    pub max_fee_reached: bool,
}

impl GasBoostTransaction {
    pub fn key(&self) -> String {
        gas_boost_key(self.chain_id, self.from, self.nonce)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, BoostState::Pending)
    }

    pub fn tx_hashes(&self) -> Vec<H256> {
        self.attempts.iter().map(|a| a.tx_hash).collect()
    }

    pub fn last_sent_at(&self) -> Option<u64> {
        self.attempts.last().map(|a| a.sent_at)
    }
}

fn signer_prefix(chain_id: ChainId, from: Address) -> String {
    format!("{}:{:#x}:", chain_id, from)
}

pub fn gas_boost_key(chain_id: ChainId, from: Address, nonce: u64) -> String {
    // zero padded so keys sort by nonce
    format!("{}{:020}", signer_prefix(chain_id, from), nonce)
}

#[derive(Clone)]
pub struct GasBoostDb {
    backend: Arc<dyn KvBackend>,
}

impl GasBoostDb {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub async fn put(&self, tx: &GasBoostTransaction) -> BonderResult<()> {
        self.backend
            .put(GAS_BOOST_NAMESPACE, &tx.key(), to_value(tx)?)
            .await
    }

    pub async fn get(
        &self,
        chain_id: ChainId,
        from: Address,
        nonce: u64,
    ) -> BonderResult<Option<GasBoostTransaction>> {
        self.backend
            .get(GAS_BOOST_NAMESPACE, &gas_boost_key(chain_id, from, nonce))
            .await?
            .map(from_value)
            .transpose()
    }

    /// Every record of one signer, ordered by nonce.
    pub async fn for_signer(
        &self,
        chain_id: ChainId,
        from: Address,
    ) -> BonderResult<Vec<GasBoostTransaction>> {
        self.backend
            .scan(
                GAS_BOOST_NAMESPACE,
                KeyRange::Prefix(signer_prefix(chain_id, from)),
            )
            .await?
            .into_iter()
            .map(|(_, v)| from_value(v))
            .collect()
    }

    pub async fn pending_for_signer(
        &self,
        chain_id: ChainId,
        from: Address,
    ) -> BonderResult<Vec<GasBoostTransaction>> {
        Ok(self
            .for_signer(chain_id, from)
            .await?
            .into_iter()
            .filter(|tx| !tx.is_terminal())
            .collect())
    }
}
