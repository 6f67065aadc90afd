// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed access to one bridge deployment.
//!
//! L1 and L2 deployments are served by the same [`BridgeContract`] trait; the
//! chain role decides which calls are legal. Writes are only encoded here and
//! always go out through the submitter.

mod eth;
mod metered_provider;

pub use eth::*;
pub use metered_provider::*;

use crate::abi::{
    BondTransferRootCall, BondWithdrawalAndDistributeCall, BondWithdrawalCall,
    ChallengeTransferBondCall, CommitTransfersCall, ResolveChallengeCall,
    SettleBondedWithdrawalsCall,
};
use crate::error::{BonderError, BonderResult};
use crate::events::{BridgeLog, EventKind};
use crate::types::{ChainId, ChainRole, RootHash, TransferId, TxRequest};
use async_trait::async_trait;
use ethers::abi::AbiEncode;
use ethers::types::{Address, Bytes, H256, U256};

/// Write calls the bonder can make.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContractCall {
    CommitTransfers {
        destination_chain_id: ChainId,
    },
    BondWithdrawal {
        recipient: Address,
        amount: U256,
        transfer_nonce: H256,
        bonder_fee: U256,
    },
    BondWithdrawalAndDistribute {
        recipient: Address,
        amount: U256,
        transfer_nonce: H256,
        bonder_fee: U256,
        amount_out_min: U256,
        deadline: U256,
    },
    BondTransferRoot {
        root_hash: RootHash,
        destination_chain_id: ChainId,
        total_amount: U256,
    },
    SettleBondedWithdrawals {
        bonder: Address,
        transfer_ids: Vec<TransferId>,
        total_amount: U256,
    },
    ChallengeTransferBond {
        root_hash: RootHash,
        original_amount: U256,
        destination_chain_id: ChainId,
        stake: U256,
    },
    ResolveChallenge {
        root_hash: RootHash,
        original_amount: U256,
        destination_chain_id: ChainId,
    },
    /// Deliver an L2 exit message to the L1 messenger of the source rollup.
    RelayRoot {
        messenger: Address,
        calldata: Bytes,
    },
}

impl ContractCall {
    pub fn label(&self) -> &'static str {
        match self {
            ContractCall::CommitTransfers { .. } => "commit_transfers",
            ContractCall::BondWithdrawal { .. } => "bond_withdrawal",
            ContractCall::BondWithdrawalAndDistribute { .. } => "bond_withdrawal_and_distribute",
            ContractCall::BondTransferRoot { .. } => "bond_transfer_root",
            ContractCall::SettleBondedWithdrawals { .. } => "settle_bonded_withdrawals",
            ContractCall::ChallengeTransferBond { .. } => "challenge_transfer_bond",
            ContractCall::ResolveChallenge { .. } => "resolve_challenge",
            ContractCall::RelayRoot { .. } => "relay_root",
        }
    }

    pub fn allowed_on(&self, role: ChainRole) -> bool {
        match self {
            ContractCall::BondWithdrawal { .. } | ContractCall::SettleBondedWithdrawals { .. } => {
                true
            }
            ContractCall::CommitTransfers { .. }
            | ContractCall::BondWithdrawalAndDistribute { .. } => role == ChainRole::L2,
            ContractCall::BondTransferRoot { .. }
            | ContractCall::ChallengeTransferBond { .. }
            | ContractCall::ResolveChallenge { .. }
            | ContractCall::RelayRoot { .. } => role == ChainRole::L1,
        }
    }
}

/// Build the transaction request for `call` against the bridge at `bridge`.
pub fn encode_call(
    chain_id: ChainId,
    role: ChainRole,
    bridge: Address,
    call: &ContractCall,
) -> BonderResult<TxRequest> {
    if !call.allowed_on(role) {
        return Err(BonderError::InvalidCall(format!(
            "{} is not available on {:?} chain {}",
            call.label(),
            role,
            chain_id
        )));
    }
    let mut to = bridge;
    let mut value = U256::zero();
    let data: Vec<u8> = match call.clone() {
        ContractCall::CommitTransfers {
            destination_chain_id,
        } => CommitTransfersCall {
            destination_chain_id: destination_chain_id.into(),
        }
        .encode(),
        ContractCall::BondWithdrawal {
            recipient,
            amount,
            transfer_nonce,
            bonder_fee,
        } => BondWithdrawalCall {
            recipient,
            amount,
            transfer_nonce: transfer_nonce.0,
            bonder_fee,
        }
        .encode(),
        ContractCall::BondWithdrawalAndDistribute {
            recipient,
            amount,
            transfer_nonce,
            bonder_fee,
            amount_out_min,
            deadline,
        } => BondWithdrawalAndDistributeCall {
            recipient,
            amount,
            transfer_nonce: transfer_nonce.0,
            bonder_fee,
            amount_out_min,
            deadline,
        }
        .encode(),
        ContractCall::BondTransferRoot {
            root_hash,
            destination_chain_id,
            total_amount,
        } => BondTransferRootCall {
            root_hash: root_hash.0,
            destination_chain_id: destination_chain_id.into(),
            total_amount,
        }
        .encode(),
        ContractCall::SettleBondedWithdrawals {
            bonder,
            transfer_ids,
            total_amount,
        } => SettleBondedWithdrawalsCall {
            bonder,
            transfer_ids: transfer_ids.iter().map(|id| id.0).collect(),
            total_amount,
        }
        .encode(),
        ContractCall::ChallengeTransferBond {
            root_hash,
            original_amount,
            destination_chain_id,
            stake,
        } => {
            value = stake;
            ChallengeTransferBondCall {
                root_hash: root_hash.0,
                original_amount,
                destination_chain_id: destination_chain_id.into(),
            }
            .encode()
        }
        ContractCall::ResolveChallenge {
            root_hash,
            original_amount,
            destination_chain_id,
        } => ResolveChallengeCall {
            root_hash: root_hash.0,
            original_amount,
            destination_chain_id: destination_chain_id.into(),
        }
        .encode(),
        ContractCall::RelayRoot {
            messenger,
            calldata,
        } => {
            to = messenger;
            calldata.to_vec()
        }
    };
    Ok(TxRequest {
        chain_id,
        to,
        data: Bytes::from(data),
        value,
        gas_limit: None,
        label: call.label().to_string(),
    })
}

/// On-chain view of a transfer root as stored by a bridge deployment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferRootInfo {
    pub total: U256,
    pub amount_withdrawn: U256,
    /// Zero when the root is not known to this deployment.
    pub created_at: u64,
}

/// Bond placed on a transfer root on L1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferBondInfo {
    pub bonder: Address,
    pub created_at: u64,
    pub total_amount: U256,
    pub challenge_start_time: u64,
    pub challenger: Address,
    pub challenge_resolved: bool,
}

#[async_trait]
pub trait BridgeContract: Send + Sync {
    fn chain_id(&self) -> ChainId;

    fn role(&self) -> ChainRole;

    fn bridge_address(&self) -> Address;

    async fn latest_block(&self) -> BonderResult<u64>;

    async fn block_timestamp(&self, block_number: u64) -> BonderResult<u64>;

    /// Decoded bridge events in `[from_block, to_block]`, in block/log order.
    /// An empty `kinds` slice means every bridge event.
    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        kinds: &[EventKind],
    ) -> BonderResult<Vec<BridgeLog>>;

    async fn credit(&self, bonder: Address) -> BonderResult<U256>;

    async fn debit(&self, bonder: Address) -> BonderResult<U256>;

    async fn bonded_withdrawal_amount(
        &self,
        bonder: Address,
        transfer_id: TransferId,
    ) -> BonderResult<U256>;

    async fn is_transfer_spent(&self, transfer_id: TransferId) -> BonderResult<bool>;

    /// L2 only.
    async fn pending_amount_for_chain(&self, destination: ChainId) -> BonderResult<U256>;

    async fn transfer_root(
        &self,
        root_hash: RootHash,
        total_amount: U256,
    ) -> BonderResult<TransferRootInfo>;

    /// L1 only. Zero until the root has been confirmed.
    async fn transfer_root_committed_at(&self, transfer_root_id: H256) -> BonderResult<u64>;

    /// L1 only.
    async fn transfer_bond(&self, transfer_root_id: H256)
        -> BonderResult<Option<TransferBondInfo>>;

    /// L1 only.
    async fn challenge_amount(&self, amount: U256) -> BonderResult<U256>;

    /// L1 only.
    async fn challenge_resolution_period(&self) -> BonderResult<u64>;

    /// Credit minus debit, floored at zero.
    async fn available_credit(&self, bonder: Address) -> BonderResult<U256> {
        let credit = self.credit(bonder).await?;
        let debit = self.debit(bonder).await?;
        Ok(credit.saturating_sub(debit))
    }

    fn encode(&self, call: &ContractCall) -> BonderResult<TxRequest> {
        encode_call(self.chain_id(), self.role(), self.bridge_address(), call)
    }
}

pub(crate) fn require_role(
    chain_id: ChainId,
    actual: ChainRole,
    expected: ChainRole,
    what: &str,
) -> BonderResult<()> {
    if actual != expected {
        return Err(BonderError::InvalidCall(format!(
            "{} requires a {:?} deployment, chain {} is {:?}",
            what, expected, chain_id, actual
        )));
    }
    Ok(())
}
