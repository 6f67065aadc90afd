// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::config::GasConfig;
use crate::error::{BonderError, BonderResult};
use crate::types::{ChainId, FeeParams, ReceiptInfo, TxRequest};
use crate::utils::apply_bps;
use anyhow::Context;
use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockNumber, Eip1559TransactionRequest, TransactionRequest, H256, U256, U64,
};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tap::TapFallible;

/// Signs and broadcasts for one key on one chain. Never picks nonces itself.
#[async_trait]
pub trait TxBroadcaster: Send + Sync {
    fn chain_id(&self) -> ChainId;

    fn signer_address(&self) -> Address;

    /// Transaction count of the signer including the provider's pending pool.
    async fn pending_nonce(&self) -> BonderResult<u64>;

    async fn suggest_fees(&self) -> BonderResult<FeeParams>;

    async fn estimate_gas(&self, request: &TxRequest) -> BonderResult<U256>;

    async fn broadcast(
        &self,
        request: &TxRequest,
        nonce: u64,
        fees: &FeeParams,
    ) -> BonderResult<H256>;

    async fn receipt(&self, tx_hash: H256) -> BonderResult<Option<ReceiptInfo>>;
}

/// Read a hex encoded secp256k1 private key.
pub fn load_signer(path: &Path, chain_id: ChainId) -> anyhow::Result<LocalWallet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bonder key file {}", path.display()))?;
    let wallet = LocalWallet::from_str(content.trim())
        .map_err(|e| anyhow::anyhow!("Invalid bonder key in {}: {:?}", path.display(), e))?;
    Ok(wallet.with_chain_id(chain_id.0))
}

pub struct EthTxBroadcaster<P> {
    chain_id: ChainId,
    client: Arc<SignerMiddleware<Arc<Provider<P>>, LocalWallet>>,
    eip1559: bool,
    gas_limit_multiplier_bps: u64,
}

impl<P> EthTxBroadcaster<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(
        chain_id: ChainId,
        provider: Arc<Provider<P>>,
        wallet: LocalWallet,
        gas: &GasConfig,
    ) -> Self {
        let wallet = wallet.with_chain_id(chain_id.0);
        Self {
            chain_id,
            client: Arc::new(SignerMiddleware::new(provider, wallet)),
            eip1559: gas.eip1559,
            gas_limit_multiplier_bps: gas.gas_limit_multiplier_bps,
        }
    }

    fn build(&self, request: &TxRequest) -> TypedTransaction {
        if self.eip1559 {
            Eip1559TransactionRequest::new()
                .from(self.signer_address())
                .to(request.to)
                .data(request.data.clone())
                .value(request.value)
                .chain_id(self.chain_id.0)
                .into()
        } else {
            TransactionRequest::new()
                .from(self.signer_address())
                .to(request.to)
                .data(request.data.clone())
                .value(request.value)
                .chain_id(self.chain_id.0)
                .into()
        }
    }
}

#[async_trait]
impl<P> TxBroadcaster for EthTxBroadcaster<P>
where
    P: JsonRpcClient + 'static,
{
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn signer_address(&self) -> Address {
        self.client.signer().address()
    }

    async fn pending_nonce(&self) -> BonderResult<u64> {
        let count = self
            .client
            .get_transaction_count(self.signer_address(), Some(BlockNumber::Pending.into()))
            .await
            .map_err(BonderError::from)?;
        Ok(count.as_u64())
    }

    async fn suggest_fees(&self) -> BonderResult<FeeParams> {
        if self.eip1559 {
            let (max_fee_per_gas, max_priority_fee_per_gas) = self
                .client
                .estimate_eip1559_fees(None)
                .await
                .map_err(BonderError::from)?;
            Ok(FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            })
        } else {
            let gas_price = self
                .client
                .get_gas_price()
                .await
                .map_err(BonderError::from)?;
            Ok(FeeParams::Legacy { gas_price })
        }
    }

    async fn estimate_gas(&self, request: &TxRequest) -> BonderResult<U256> {
        let tx = self.build(request);
        let estimate = self
            .client
            .estimate_gas(&tx, None)
            .await
            .map_err(BonderError::from)
            .tap_err(|e| {
                tracing::warn!(
                    "[{}] gas estimation for {} failed: {}",
                    self.chain_id,
                    request.label,
                    e
                )
            })?;
        Ok(apply_bps(estimate, self.gas_limit_multiplier_bps))
    }

    async fn broadcast(
        &self,
        request: &TxRequest,
        nonce: u64,
        fees: &FeeParams,
    ) -> BonderResult<H256> {
        let gas_limit = match request.gas_limit {
            Some(limit) => limit,
            None => self.estimate_gas(request).await?,
        };
        let mut tx = self.build(request);
        tx.set_nonce(nonce);
        tx.set_gas(gas_limit);
        match fees {
            FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } if self.eip1559 => {
                if let TypedTransaction::Eip1559(inner) = &mut tx {
                    inner.max_fee_per_gas = Some(*max_fee_per_gas);
                    inner.max_priority_fee_per_gas = Some(*max_priority_fee_per_gas);
                }
            }
            _ => {
                tx.set_gas_price(fees.max_price());
            }
        }
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(BonderError::from)?;
        Ok(pending.tx_hash())
    }

    async fn receipt(&self, tx_hash: H256) -> BonderResult<Option<ReceiptInfo>> {
        let receipt = self
            .client
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(BonderError::from)?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };
        Ok(Some(ReceiptInfo {
            tx_hash,
            block_number: block_number.as_u64(),
            success: receipt.status == Some(U64::from(1)),
            gas_used: receipt.gas_used.unwrap_or_default(),
            effective_gas_price: receipt.effective_gas_price.unwrap_or_default(),
        }))
    }
}
