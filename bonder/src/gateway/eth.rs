// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{
    new_metered_eth_provider, require_role, BridgeContract, MeteredEthHttpProvider,
    TransferBondInfo, TransferRootInfo,
};
use crate::abi::TokenBridge;
use crate::error::{BonderError, BonderResult};
use crate::events::{BridgeEvent, BridgeLog, EventKind};
use crate::metrics::BonderMetrics;
use crate::ttl_cache::TtlCache;
use crate::types::{ChainId, ChainRole, RootHash, TransferId};
use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::types::{Address, Filter, H256, U256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tap::TapFallible;

const HEAD_CACHE_TTL: Duration = Duration::from_secs(2);

pub struct EthBridgeGateway<P> {
    chain_id: ChainId,
    role: ChainRole,
    address: Address,
    provider: Arc<Provider<P>>,
    contract: TokenBridge<Provider<P>>,
    head: TtlCache<u64>,
}

impl EthBridgeGateway<MeteredEthHttpProvider> {
    pub fn new(
        rpc_url: &str,
        address: Address,
        chain_id: ChainId,
        role: ChainRole,
        metrics: Arc<BonderMetrics>,
    ) -> anyhow::Result<Self> {
        let provider = new_metered_eth_provider(rpc_url, &chain_id.to_string(), metrics)?;
        Ok(Self::from_provider(Arc::new(provider), address, chain_id, role))
    }
}

impl<P> EthBridgeGateway<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn from_provider(
        provider: Arc<Provider<P>>,
        address: Address,
        chain_id: ChainId,
        role: ChainRole,
    ) -> Self {
        let contract = TokenBridge::new(address, provider.clone());
        Self {
            chain_id,
            role,
            address,
            provider,
            contract,
            head: TtlCache::new(HEAD_CACHE_TTL),
        }
    }

    pub fn provider(&self) -> Arc<Provider<P>> {
        self.provider.clone()
    }

    /// Fails when the endpoint serves a different chain than configured.
    pub async fn verify_chain_id(&self) -> BonderResult<()> {
        let actual = self.provider.get_chainid().await.map_err(BonderError::from)?;
        if actual != U256::from(self.chain_id.0) {
            return Err(BonderError::ConfigError(format!(
                "rpc endpoint for chain {} reports chain id {}",
                self.chain_id, actual
            )));
        }
        Ok(())
    }

    async fn tx_sender(&self, tx_hash: H256) -> BonderResult<Address> {
        let tx = self
            .provider
            .get_transaction(tx_hash)
            .await
            .map_err(BonderError::from)?
            .ok_or(BonderError::ProviderError(format!(
                "Provider cannot find transaction {:?}",
                tx_hash
            )))?;
        Ok(tx.from)
    }
}

#[async_trait]
impl<P> BridgeContract for EthBridgeGateway<P>
where
    P: JsonRpcClient + 'static,
{
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn role(&self) -> ChainRole {
        self.role
    }

    fn bridge_address(&self) -> Address {
        self.address
    }

    async fn latest_block(&self) -> BonderResult<u64> {
        self.head
            .get_or_fetch(|| async {
                self.provider
                    .get_block_number()
                    .await
                    .map(|n| n.as_u64())
                    .map_err(BonderError::from)
            })
            .await
    }

    async fn block_timestamp(&self, block_number: u64) -> BonderResult<u64> {
        let block = self
            .provider
            .get_block(block_number)
            .await
            .map_err(BonderError::from)?
            .ok_or(BonderError::TransientProviderError(format!(
                "block {} not available yet",
                block_number
            )))?;
        Ok(block.timestamp.low_u64())
    }

    // Note: query may fail if range is too big. Callsite is responsible
    // for chunking the query.
    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        kinds: &[EventKind],
    ) -> BonderResult<Vec<BridgeLog>> {
        let mut filter = Filter::new()
            .from_block(from_block)
            .to_block(to_block)
            .address(self.address);
        if !kinds.is_empty() {
            filter = filter.topic0(kinds.iter().map(|k| k.signature()).collect::<Vec<_>>());
        }
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(BonderError::from)
            .tap_err(|e| {
                tracing::error!(
                    "[{}] get_logs failed. Filter: {:?}. Error {:?}",
                    self.chain_id,
                    filter,
                    e
                )
            })?;

        let mut timestamps: HashMap<u64, u64> = HashMap::new();
        let mut out = Vec::with_capacity(logs.len());
        for log in logs {
            // Safeguard check that all events are emitted from the bridge
            if log.address != self.address {
                return Err(BonderError::ProviderError(format!(
                    "Provider returns logs from different contract address (expected: {:?}): {:?}",
                    self.address, log
                )));
            }
            let Some(event) = BridgeEvent::try_from_log(log.topics.clone(), log.data.to_vec())
            else {
                continue;
            };
            let block_number = log
                .block_number
                .ok_or(BonderError::ProviderError(
                    "Provider returns log without block_number".into(),
                ))?
                .as_u64();
            let tx_hash = log.transaction_hash.ok_or(BonderError::ProviderError(
                "Provider returns log without transaction_hash".into(),
            ))?;
            let log_index = log
                .log_index
                .ok_or(BonderError::ProviderError(
                    "Provider returns log without log_index".into(),
                ))?
                .low_u64();
            let block_timestamp = match timestamps.get(&block_number) {
                Some(ts) => *ts,
                None => {
                    let ts = self.block_timestamp(block_number).await?;
                    timestamps.insert(block_number, ts);
                    ts
                }
            };
            let tx_from = if event.kind().needs_tx_sender() {
                Some(self.tx_sender(tx_hash).await?)
            } else {
                None
            };
            out.push(BridgeLog {
                chain_id: self.chain_id,
                block_number,
                log_index,
                tx_hash,
                block_timestamp,
                tx_from,
                event,
            });
        }
        out.sort_by_key(|l| l.position());
        Ok(out)
    }

    async fn credit(&self, bonder: Address) -> BonderResult<U256> {
        self.contract
            .get_credit(bonder)
            .call()
            .await
            .map_err(BonderError::from)
    }

    async fn debit(&self, bonder: Address) -> BonderResult<U256> {
        self.contract
            .get_debit_and_additional_debit(bonder)
            .call()
            .await
            .map_err(BonderError::from)
    }

    async fn bonded_withdrawal_amount(
        &self,
        bonder: Address,
        transfer_id: TransferId,
    ) -> BonderResult<U256> {
        self.contract
            .get_bonded_withdrawal_amount(bonder, transfer_id.0)
            .call()
            .await
            .map_err(BonderError::from)
    }

    async fn is_transfer_spent(&self, transfer_id: TransferId) -> BonderResult<bool> {
        self.contract
            .is_transfer_id_spent(transfer_id.0)
            .call()
            .await
            .map_err(BonderError::from)
    }

    async fn pending_amount_for_chain(&self, destination: ChainId) -> BonderResult<U256> {
        require_role(self.chain_id, self.role, ChainRole::L2, "pendingAmountForChainId")?;
        self.contract
            .pending_amount_for_chain_id(destination.into())
            .call()
            .await
            .map_err(BonderError::from)
    }

    async fn transfer_root(
        &self,
        root_hash: RootHash,
        total_amount: U256,
    ) -> BonderResult<TransferRootInfo> {
        let (total, amount_withdrawn, created_at) = self
            .contract
            .get_transfer_root(root_hash.0, total_amount)
            .call()
            .await
            .map_err(BonderError::from)?;
        Ok(TransferRootInfo {
            total,
            amount_withdrawn,
            created_at: created_at.low_u64(),
        })
    }

    async fn transfer_root_committed_at(&self, transfer_root_id: H256) -> BonderResult<u64> {
        require_role(self.chain_id, self.role, ChainRole::L1, "transferRootCommittedAt")?;
        self.contract
            .transfer_root_committed_at(transfer_root_id.0)
            .call()
            .await
            .map(|v| v.low_u64())
            .map_err(BonderError::from)
    }

    async fn transfer_bond(
        &self,
        transfer_root_id: H256,
    ) -> BonderResult<Option<TransferBondInfo>> {
        require_role(self.chain_id, self.role, ChainRole::L1, "transferBonds")?;
        let (bonder, created_at, total_amount, challenge_start_time, challenger, resolved) = self
            .contract
            .transfer_bonds(transfer_root_id.0)
            .call()
            .await
            .map_err(BonderError::from)?;
        if created_at.is_zero() {
            return Ok(None);
        }
        Ok(Some(TransferBondInfo {
            bonder,
            created_at: created_at.low_u64(),
            total_amount,
            challenge_start_time: challenge_start_time.low_u64(),
            challenger,
            challenge_resolved: resolved,
        }))
    }

    async fn challenge_amount(&self, amount: U256) -> BonderResult<U256> {
        require_role(self.chain_id, self.role, ChainRole::L1, "challengeAmount")?;
        self.contract
            .get_challenge_amount_for_transfer_amount(amount)
            .call()
            .await
            .map_err(BonderError::from)
    }

    async fn challenge_resolution_period(&self) -> BonderResult<u64> {
        require_role(
            self.chain_id,
            self.role,
            ChainRole::L1,
            "challengeResolutionPeriod",
        )?;
        self.contract
            .challenge_resolution_period()
            .call()
            .await
            .map(|v| v.low_u64())
            .map_err(BonderError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::MockProvider;
    use ethers::types::U64;

    #[tokio::test]
    async fn test_latest_block_is_cached() {
        let (provider, mock) = Provider::mocked();
        mock.push(U64::from(42)).unwrap();
        let gateway: EthBridgeGateway<MockProvider> = EthBridgeGateway::from_provider(
            Arc::new(provider),
            Address::repeat_byte(1),
            ChainId(10),
            ChainRole::L2,
        );
        assert_eq!(gateway.latest_block().await.unwrap(), 42);
        // the mock has no more responses, a second provider call would fail
        assert_eq!(gateway.latest_block().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_l1_reads_rejected_on_l2() {
        let (provider, _mock) = Provider::mocked();
        let gateway = EthBridgeGateway::from_provider(
            Arc::new(provider),
            Address::repeat_byte(1),
            ChainId(10),
            ChainRole::L2,
        );
        let err = gateway
            .transfer_root_committed_at(H256::zero())
            .await
            .unwrap_err();
        assert!(matches!(err, BonderError::InvalidCall(_)));
    }
}
