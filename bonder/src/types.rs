// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type TransferId = H256;
pub type RootHash = H256;

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChainId {
    fn from(value: u64) -> Self {
        ChainId(value)
    }
}

impl From<ChainId> for U256 {
    fn from(value: ChainId) -> Self {
        U256::from(value.0)
    }
}

/// Which side of the bridge a deployment lives on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainRole {
    L1,
    L2,
}

/// Rollup family of a chain, drives how transfer roots reach L1.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Ethereum,
    Optimism,
    Arbitrum,
    Polygon,
    Gnosis,
}

impl ChainFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainFamily::Ethereum => "ethereum",
            ChainFamily::Optimism => "optimism",
            ChainFamily::Arbitrum => "arbitrum",
            ChainFamily::Polygon => "polygon",
            ChainFamily::Gnosis => "gnosis",
        }
    }
}

pub fn compute_transfer_id(
    chain_id: ChainId,
    recipient: Address,
    amount: U256,
    transfer_nonce: H256,
    bonder_fee: U256,
    amount_out_min: U256,
    deadline: U256,
) -> TransferId {
    let encoded = encode(&[
        Token::Uint(chain_id.into()),
        Token::Address(recipient),
        Token::Uint(amount),
        Token::FixedBytes(transfer_nonce.as_bytes().to_vec()),
        Token::Uint(bonder_fee),
        Token::Uint(amount_out_min),
        Token::Uint(deadline),
    ]);
    H256::from(keccak256(encoded))
}

pub fn compute_transfer_root_id(root_hash: RootHash, total_amount: U256) -> H256 {
    let encoded = encode(&[
        Token::FixedBytes(root_hash.as_bytes().to_vec()),
        Token::Uint(total_amount),
    ]);
    H256::from(keccak256(encoded))
}

/// Lifecycle position of a transfer, derived from its stored fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransferStatus {
    Sent,
    Bonded,
    Committed,
    RootBonded,
    RootConfirmed,
    Settled,
}

/// One user send. Every field but the id is optional so a record can also be
/// used as a merge patch: only populated fields are written.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub transfer_id: TransferId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_chain_id: Option<ChainId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_chain_id: Option<ChainId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_nonce: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonder_fee: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_out_min: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<U256>,
    /// Position inside the source chain's pending list at send time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_sent_block: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_sent_log_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_sent_tx_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_sent_timestamp: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_root_hash: Option<RootHash>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_bonded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_bonder: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_bond_tx_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_bond_in_flight: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_bond_attempted_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_bond_backoff: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_bondable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unbondable_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_bond_settled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_bond_settled_tx_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_transfer_spent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_spent_tx_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_not_found: Option<bool>,
}

impl Transfer {
    pub fn new(transfer_id: TransferId) -> Self {
        Self {
            transfer_id,
            ..Default::default()
        }
    }

    pub fn is_bonded(&self) -> bool {
        self.withdrawal_bonded.unwrap_or(false)
    }

    pub fn is_spent(&self) -> bool {
        self.is_transfer_spent.unwrap_or(false)
    }

    pub fn is_committed(&self) -> bool {
        self.committed.unwrap_or(false) || self.transfer_root_hash.is_some()
    }

    pub fn is_in_flight(&self) -> bool {
        self.withdrawal_bond_in_flight.unwrap_or(false)
    }

    pub fn is_settled(&self) -> bool {
        self.withdrawal_bond_settled.unwrap_or(false)
    }

    /// Send position used to order transfers within one source chain.
    pub fn sent_position(&self) -> (u64, u64) {
        (
            self.transfer_sent_block.unwrap_or(u64::MAX),
            self.transfer_sent_log_index.unwrap_or(u64::MAX),
        )
    }

    /// Status in the transfer lifecycle, given the root it was committed under.
    pub fn status(&self, root: Option<&TransferRoot>) -> TransferStatus {
        if self.is_settled() {
            return TransferStatus::Settled;
        }
        if let Some(root) = root {
            if root.is_confirmed() {
                return TransferStatus::RootConfirmed;
            }
            if root.is_bonded() {
                return TransferStatus::RootBonded;
            }
        }
        if self.is_committed() {
            return TransferStatus::Committed;
        }
        if self.is_bonded() {
            return TransferStatus::Bonded;
        }
        TransferStatus::Sent
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RootStatus {
    Committed,
    Bonded,
    Confirmed,
    Settled,
}

/// A batch of transfers committed together for one destination chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRoot {
    pub transfer_root_hash: RootHash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_root_id: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_chain_id: Option<ChainId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_chain_id: Option<ChainId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_ids: Option<Vec<TransferId>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_tx_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_block: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_log_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_commit_tx_at: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonder: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonded_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bond_tx_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_bond_tx_at: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_tx_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_confirm_tx_at: Option<u64>,

    /// Root has been set on the destination chain and can be settled there.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_set_on_destination: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_set_tx_hash: Option<H256>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_challenge_tx_at: Option<u64>,

    /// Cumulative settled bond amount reported on-chain, per bonder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_by_bonder: Option<BTreeMap<Address, U256>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_settle_tx_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_settled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_not_found: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspect_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invariant_violations: Option<u32>,
}

impl TransferRoot {
    pub fn new(transfer_root_hash: RootHash) -> Self {
        Self {
            transfer_root_hash,
            ..Default::default()
        }
    }

    pub fn is_committed(&self) -> bool {
        self.committed.unwrap_or(false)
    }

    pub fn is_bonded(&self) -> bool {
        self.bonded.unwrap_or(false)
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.unwrap_or(false)
    }

    pub fn is_suspect(&self) -> bool {
        self.is_not_found.unwrap_or(false)
    }

    pub fn is_all_settled(&self) -> bool {
        self.all_settled.unwrap_or(false)
    }

    pub fn total_settled(&self) -> U256 {
        self.settled_by_bonder
            .as_ref()
            .map(|m| m.values().fold(U256::zero(), |acc, v| acc.saturating_add(*v)))
            .unwrap_or_default()
    }

    pub fn status(&self) -> RootStatus {
        if self.is_all_settled() {
            RootStatus::Settled
        } else if self.is_confirmed() {
            RootStatus::Confirmed
        } else if self.is_bonded() {
            RootStatus::Bonded
        } else {
            RootStatus::Committed
        }
    }
}

/// Fee fields for one transaction attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FeeParams {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl FeeParams {
    /// Highest per-gas price this attempt can pay.
    pub fn max_price(&self) -> U256 {
        match self {
            FeeParams::Legacy { gas_price } => *gas_price,
            FeeParams::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

/// An unsigned contract call ready to hand to the submitter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    pub chain_id: ChainId,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<U256>,
    /// Short name of the call, used in logs, metrics and cost samples.
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptInfo {
    pub tx_hash: H256,
    pub block_number: u64,
    pub success: bool,
    pub gas_used: U256,
    pub effective_gas_price: U256,
}
