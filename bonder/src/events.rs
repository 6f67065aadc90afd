// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::abi::{
    MultipleWithdrawalsSettledFilter, TokenBridgeEvents, TransferBondChallengedFilter,
    TransferRootBondedFilter, TransferRootConfirmedFilter, TransferRootSetFilter,
    TransferSentFilter, TransfersCommittedFilter, WithdrawalBondSettledFilter,
    WithdrawalBondedFilter, WithdrewFilter,
};
use crate::types::{ChainId, RootHash, TransferId};
use ethers::abi::RawLog;
use ethers::contract::{EthEvent, EthLogDecode};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    TransferSent,
    TransfersCommitted,
    TransferRootBonded,
    TransferRootConfirmed,
    TransferRootSet,
    WithdrawalBonded,
    Withdrew,
    MultipleWithdrawalsSettled,
    WithdrawalBondSettled,
    TransferBondChallenged,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::TransferSent,
        EventKind::TransfersCommitted,
        EventKind::TransferRootBonded,
        EventKind::TransferRootConfirmed,
        EventKind::TransferRootSet,
        EventKind::WithdrawalBonded,
        EventKind::Withdrew,
        EventKind::MultipleWithdrawalsSettled,
        EventKind::WithdrawalBondSettled,
        EventKind::TransferBondChallenged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TransferSent => "transfer_sent",
            EventKind::TransfersCommitted => "transfers_committed",
            EventKind::TransferRootBonded => "transfer_root_bonded",
            EventKind::TransferRootConfirmed => "transfer_root_confirmed",
            EventKind::TransferRootSet => "transfer_root_set",
            EventKind::WithdrawalBonded => "withdrawal_bonded",
            EventKind::Withdrew => "withdrew",
            EventKind::MultipleWithdrawalsSettled => "multiple_withdrawals_settled",
            EventKind::WithdrawalBondSettled => "withdrawal_bond_settled",
            EventKind::TransferBondChallenged => "transfer_bond_challenged",
        }
    }

    /// topic0 of the event
    pub fn signature(&self) -> H256 {
        match self {
            EventKind::TransferSent => TransferSentFilter::signature(),
            EventKind::TransfersCommitted => TransfersCommittedFilter::signature(),
            EventKind::TransferRootBonded => TransferRootBondedFilter::signature(),
            EventKind::TransferRootConfirmed => TransferRootConfirmedFilter::signature(),
            EventKind::TransferRootSet => TransferRootSetFilter::signature(),
            EventKind::WithdrawalBonded => WithdrawalBondedFilter::signature(),
            EventKind::Withdrew => WithdrewFilter::signature(),
            EventKind::MultipleWithdrawalsSettled => {
                MultipleWithdrawalsSettledFilter::signature()
            }
            EventKind::WithdrawalBondSettled => WithdrawalBondSettledFilter::signature(),
            EventKind::TransferBondChallenged => TransferBondChallengedFilter::signature(),
        }
    }

    /// Whether handling this event needs the sender of the emitting transaction.
    pub fn needs_tx_sender(&self) -> bool {
        matches!(
            self,
            EventKind::WithdrawalBonded | EventKind::TransferRootBonded
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeEvent {
    TransferSent {
        transfer_id: TransferId,
        destination_chain_id: ChainId,
        recipient: Address,
        amount: U256,
        transfer_nonce: H256,
        bonder_fee: U256,
        index: u64,
        amount_out_min: U256,
        deadline: U256,
    },
    TransfersCommitted {
        destination_chain_id: ChainId,
        root_hash: RootHash,
        total_amount: U256,
        root_committed_at: u64,
    },
    TransferRootBonded {
        root_hash: RootHash,
        amount: U256,
    },
    TransferRootConfirmed {
        origin_chain_id: ChainId,
        destination_chain_id: ChainId,
        root_hash: RootHash,
        total_amount: U256,
    },
    TransferRootSet {
        root_hash: RootHash,
        total_amount: U256,
    },
    WithdrawalBonded {
        transfer_id: TransferId,
        amount: U256,
    },
    Withdrew {
        transfer_id: TransferId,
        recipient: Address,
        amount: U256,
        transfer_nonce: H256,
    },
    MultipleWithdrawalsSettled {
        bonder: Address,
        root_hash: RootHash,
        total_bonds_settled: U256,
    },
    WithdrawalBondSettled {
        bonder: Address,
        transfer_id: TransferId,
        root_hash: RootHash,
    },
    TransferBondChallenged {
        transfer_root_id: H256,
        root_hash: RootHash,
        original_amount: U256,
    },
}

fn chain(value: U256) -> ChainId {
    ChainId(value.low_u64())
}

impl From<TokenBridgeEvents> for BridgeEvent {
    fn from(event: TokenBridgeEvents) -> Self {
        match event {
            TokenBridgeEvents::TransferSentFilter(e) => BridgeEvent::TransferSent {
                transfer_id: H256(e.transfer_id),
                destination_chain_id: chain(e.chain_id),
                recipient: e.recipient,
                amount: e.amount,
                transfer_nonce: H256(e.transfer_nonce),
                bonder_fee: e.bonder_fee,
                index: e.index.low_u64(),
                amount_out_min: e.amount_out_min,
                deadline: e.deadline,
            },
            TokenBridgeEvents::TransfersCommittedFilter(e) => BridgeEvent::TransfersCommitted {
                destination_chain_id: chain(e.destination_chain_id),
                root_hash: H256(e.root_hash),
                total_amount: e.total_amount,
                root_committed_at: e.root_committed_at.low_u64(),
            },
            TokenBridgeEvents::TransferRootBondedFilter(e) => BridgeEvent::TransferRootBonded {
                root_hash: H256(e.root),
                amount: e.amount,
            },
            TokenBridgeEvents::TransferRootConfirmedFilter(e) => {
                BridgeEvent::TransferRootConfirmed {
                    origin_chain_id: chain(e.origin_chain_id),
                    destination_chain_id: chain(e.destination_chain_id),
                    root_hash: H256(e.root_hash),
                    total_amount: e.total_amount,
                }
            }
            TokenBridgeEvents::TransferRootSetFilter(e) => BridgeEvent::TransferRootSet {
                root_hash: H256(e.root_hash),
                total_amount: e.total_amount,
            },
            TokenBridgeEvents::WithdrawalBondedFilter(e) => BridgeEvent::WithdrawalBonded {
                transfer_id: H256(e.transfer_id),
                amount: e.amount,
            },
            TokenBridgeEvents::WithdrewFilter(e) => BridgeEvent::Withdrew {
                transfer_id: H256(e.transfer_id),
                recipient: e.recipient,
                amount: e.amount,
                transfer_nonce: H256(e.transfer_nonce),
            },
            TokenBridgeEvents::MultipleWithdrawalsSettledFilter(e) => {
                BridgeEvent::MultipleWithdrawalsSettled {
                    bonder: e.bonder,
                    root_hash: H256(e.root_hash),
                    total_bonds_settled: e.total_bonds_settled,
                }
            }
            TokenBridgeEvents::WithdrawalBondSettledFilter(e) => {
                BridgeEvent::WithdrawalBondSettled {
                    bonder: e.bonder,
                    transfer_id: H256(e.transfer_id),
                    root_hash: H256(e.root_hash),
                }
            }
            TokenBridgeEvents::TransferBondChallengedFilter(e) => {
                BridgeEvent::TransferBondChallenged {
                    transfer_root_id: H256(e.transfer_root_id),
                    root_hash: H256(e.root_hash),
                    original_amount: e.original_amount,
                }
            }
        }
    }
}

impl BridgeEvent {
    /// Decode a raw log. Returns None for logs that are not bridge events.
    pub fn try_from_log(topics: Vec<H256>, data: Vec<u8>) -> Option<Self> {
        TokenBridgeEvents::decode_log(&RawLog { topics, data })
            .ok()
            .map(BridgeEvent::from)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::TransferSent { .. } => EventKind::TransferSent,
            BridgeEvent::TransfersCommitted { .. } => EventKind::TransfersCommitted,
            BridgeEvent::TransferRootBonded { .. } => EventKind::TransferRootBonded,
            BridgeEvent::TransferRootConfirmed { .. } => EventKind::TransferRootConfirmed,
            BridgeEvent::TransferRootSet { .. } => EventKind::TransferRootSet,
            BridgeEvent::WithdrawalBonded { .. } => EventKind::WithdrawalBonded,
            BridgeEvent::Withdrew { .. } => EventKind::Withdrew,
            BridgeEvent::MultipleWithdrawalsSettled { .. } => {
                EventKind::MultipleWithdrawalsSettled
            }
            BridgeEvent::WithdrawalBondSettled { .. } => EventKind::WithdrawalBondSettled,
            BridgeEvent::TransferBondChallenged { .. } => EventKind::TransferBondChallenged,
        }
    }
}

/// A decoded bridge event with its position on chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeLog {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: H256,
    pub block_timestamp: u64,
    /// Sender of the emitting transaction, filled for events that need it.
    pub tx_from: Option<Address>,
    pub event: BridgeEvent,
}

impl BridgeLog {
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::{encode, Token};

    #[test]
    fn test_decode_transfers_committed() {
        let root = H256::repeat_byte(0xab);
        let topics = vec![
            EventKind::TransfersCommitted.signature(),
            H256::from_low_u64_be(1),
            root,
        ];
        let data = encode(&[Token::Uint(U256::from(45)), Token::Uint(U256::from(1_700_000_000u64))]);
        let event = BridgeEvent::try_from_log(topics, data).unwrap();
        assert_eq!(
            event,
            BridgeEvent::TransfersCommitted {
                destination_chain_id: ChainId(1),
                root_hash: root,
                total_amount: U256::from(45),
                root_committed_at: 1_700_000_000,
            }
        );
        assert_eq!(event.kind(), EventKind::TransfersCommitted);
    }

    #[test]
    fn test_unknown_log_is_skipped() {
        let topics = vec![H256::repeat_byte(0x11)];
        assert!(BridgeEvent::try_from_log(topics, vec![]).is_none());
    }

    #[test]
    fn test_signatures_are_distinct() {
        let mut sigs = EventKind::ALL.iter().map(|k| k.signature()).collect::<Vec<_>>();
        sigs.sort();
        sigs.dedup();
        assert_eq!(sigs.len(), EventKind::ALL.len());
    }
}
