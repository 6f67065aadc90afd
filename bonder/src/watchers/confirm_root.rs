// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Moves committed transfer roots from a rollup to L1.
//!
//! How a root reaches L1 depends on the rollup family. Optimistic rollups
//! finalize their exit messages on their own once the challenge window ends;
//! the watcher only records the confirmation. Proof based rollups need the
//! exit message and its proof delivered to the L1 messenger, which the
//! watcher does once the proof service reports it ready.

use super::{on_failure, record_outcome, Outcome, Watcher, WatcherContext};
use crate::error::{BonderError, BonderResult};
use crate::gateway::{BridgeContract, ContractCall};
use crate::types::{compute_transfer_root_id, ChainFamily, ChainId, RootHash, TransferRoot};
use crate::utils::{now_secs, short_hex};
use async_trait::async_trait;
use ethers::types::{Bytes, H256};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const NAME: &str = "confirm_root";

const IN_FLIGHT_TIMEOUT_SECS: u64 = 1_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStrategy {
    /// The rollup delivers the message itself after its challenge window.
    AutoFinalize,
    /// Someone has to submit the exit proof to the L1 messenger.
    ProofRelay,
    /// Roots never leave this chain.
    None,
}

impl RelayStrategy {
    pub fn for_family(family: ChainFamily) -> Self {
        match family {
            ChainFamily::Optimism => RelayStrategy::AutoFinalize,
            ChainFamily::Arbitrum | ChainFamily::Polygon | ChainFamily::Gnosis => {
                RelayStrategy::ProofRelay
            }
            ChainFamily::Ethereum => RelayStrategy::None,
        }
    }
}

/// Calldata for the L1 messenger that executes a root's exit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitProof {
    pub calldata: Bytes,
}

#[async_trait]
pub trait ExitProofProvider: Send + Sync {
    /// `None` while the exit is not provable yet.
    async fn fetch(
        &self,
        source: ChainId,
        root_hash: RootHash,
        commit_tx_hash: H256,
    ) -> BonderResult<Option<ExitProof>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExitProofResponse {
    ready: bool,
    #[serde(default)]
    calldata: Option<Bytes>,
}

/// Exit proofs from an HTTP proof service.
pub struct HttpExitProofProvider {
    client: Client,
    base_url: Url,
}

impl HttpExitProofProvider {
    pub fn new(base_url: &str) -> BonderResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| BonderError::ConfigError(format!("invalid exit proof url {}: {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BonderError::ConfigError(format!("failed to build http client: {}", e)))?;
        Ok(Self { client, base_url })
    }

    fn proof_url(&self, source: ChainId, root_hash: RootHash, commit_tx_hash: H256) -> BonderResult<Url> {
        let mut url = self
            .base_url
            .join("v1/exit-proof")
            .map_err(|e| BonderError::InternalError(format!("bad exit proof path: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("chainId", &source.to_string())
            .append_pair("rootHash", &format!("{:?}", root_hash))
            .append_pair("commitTxHash", &format!("{:?}", commit_tx_hash));
        Ok(url)
    }
}

#[async_trait]
impl ExitProofProvider for HttpExitProofProvider {
    async fn fetch(
        &self,
        source: ChainId,
        root_hash: RootHash,
        commit_tx_hash: H256,
    ) -> BonderResult<Option<ExitProof>> {
        let url = self.proof_url(source, root_hash, commit_tx_hash)?;
        let response = self.client.get(url).send().await.map_err(|e| {
            BonderError::TransientProviderError(format!("exit proof request failed: {}", e))
        })?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(BonderError::RateLimited("exit proof service".into()));
        }
        if status.is_server_error() {
            return Err(BonderError::TransientProviderError(format!(
                "exit proof service returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(BonderError::ProviderError(format!(
                "exit proof service returned {}",
                status
            )));
        }
        let body: ExitProofResponse = response.json().await.map_err(|e| {
            BonderError::SerializationError(format!("bad exit proof response: {}", e))
        })?;
        Ok(match (body.ready, body.calldata) {
            (true, Some(calldata)) => Some(ExitProof { calldata }),
            _ => None,
        })
    }
}

/// Relays roots committed on one L2 source chain.
pub struct ConfirmRootWatcher {
    ctx: WatcherContext,
    chain_id: ChainId,
    strategy: RelayStrategy,
    proofs: Option<Arc<dyn ExitProofProvider>>,
}

impl ConfirmRootWatcher {
    pub fn new(
        ctx: WatcherContext,
        chain_id: ChainId,
        proofs: Option<Arc<dyn ExitProofProvider>>,
    ) -> BonderResult<Self> {
        let entry = ctx.chains.get(chain_id)?;
        let strategy = RelayStrategy::for_family(entry.family);
        if strategy == RelayStrategy::ProofRelay && (proofs.is_none() || entry.messenger.is_none()) {
            return Err(BonderError::ConfigError(format!(
                "chain {} relays by proof and needs a proof provider and messenger",
                chain_id
            )));
        }
        Ok(Self {
            ctx,
            chain_id,
            strategy,
            proofs,
        })
    }

    pub fn strategy(&self) -> RelayStrategy {
        self.strategy
    }

    fn l1(&self) -> Arc<dyn BridgeContract> {
        self.ctx.chains.l1().bridge.clone()
    }

    async fn confirmed_on_l1(bridge: &Arc<dyn BridgeContract>, root_id: H256) -> BonderResult<u64> {
        bridge.transfer_root_committed_at(root_id).await
    }

    async fn mark_confirmed(&self, root_hash: RootHash, committed_at: u64) -> BonderResult<()> {
        let patch = TransferRoot {
            confirmed: Some(true),
            confirmed_at: Some(committed_at),
            ..TransferRoot::new(root_hash)
        };
        self.ctx.store.transfer_roots.update(&patch).await?;
        Ok(())
    }

    pub async fn check_confirm(&self, root_hash: RootHash) -> BonderResult<Outcome> {
        if self.strategy == RelayStrategy::None {
            return Ok(Outcome::NotApplicable);
        }
        let _guard = self.ctx.lock_action(NAME, self.chain_id, root_hash).await;
        let label = format!("confirm {}", short_hex(&root_hash));
        let Some(root) = self.ctx.store.transfer_roots.get(&root_hash).await? else {
            return Ok(Outcome::NotApplicable);
        };
        if root.source_chain_id != Some(self.chain_id) {
            return Ok(Outcome::NotApplicable);
        }
        if root.is_confirmed() {
            return Ok(Outcome::Skipped("root already confirmed".into()));
        }
        if root.is_suspect() {
            return Ok(Outcome::Skipped("root flagged suspect".into()));
        }
        let total = root.total_amount.ok_or_else(|| {
            BonderError::MissingLinkage(format!("root {:?} has no total", root_hash))
        })?;
        let root_id = root
            .transfer_root_id
            .unwrap_or_else(|| compute_transfer_root_id(root_hash, total));

        let l1 = self.l1();
        let committed_at = Self::confirmed_on_l1(&l1, root_id).await?;
        if committed_at > 0 {
            info!("[{}][{}] root {:?} confirmed on l1", NAME, self.chain_id, root_hash);
            self.mark_confirmed(root_hash, committed_at).await?;
            return Ok(Outcome::Skipped("confirmed on l1".into()));
        }
        if self.strategy == RelayStrategy::AutoFinalize {
            return Ok(Outcome::NotDue("waiting for the rollup to finalize".into()));
        }

        let sent_at = root.sent_confirm_tx_at.unwrap_or(0);
        if sent_at > 0 && now_secs().saturating_sub(sent_at) < IN_FLIGHT_TIMEOUT_SECS {
            return Err(BonderError::AlreadyHandled(label));
        }
        let commit_tx_hash = root.commit_tx_hash.ok_or_else(|| {
            BonderError::MissingLinkage(format!("root {:?} has no commit tx", root_hash))
        })?;
        let (Some(proofs), Some(messenger)) = (self.proofs.as_ref(), self.ctx.chains.get(self.chain_id)?.messenger)
        else {
            return Err(BonderError::ConfigError(format!(
                "chain {} has no proof relay setup",
                self.chain_id
            )));
        };
        let Some(proof) = proofs.fetch(self.chain_id, root_hash, commit_tx_hash).await? else {
            return Ok(Outcome::NotDue("exit proof not ready".into()));
        };
        debug!(
            "[{}][{}] exit proof for {:?} is {} bytes",
            NAME,
            self.chain_id,
            root_hash,
            proof.calldata.len()
        );

        let check_bridge = l1.clone();
        self.ctx
            .coordinator
            .wait_turn(
                &label,
                || {
                    let bridge = check_bridge.clone();
                    async move { Ok(Self::confirmed_on_l1(&bridge, root_id).await? > 0) }
                },
                &self.ctx.cancel,
            )
            .await?;
        if Self::confirmed_on_l1(&l1, root_id).await? > 0 {
            return Err(BonderError::AlreadyHandled(label));
        }
        if self.ctx.dry_run() {
            return Ok(Outcome::DryRun);
        }

        let call = ContractCall::RelayRoot {
            messenger,
            calldata: proof.calldata,
        };
        let patch = TransferRoot {
            sent_confirm_tx_at: Some(now_secs()),
            ..TransferRoot::new(root_hash)
        };
        self.ctx.store.transfer_roots.update(&patch).await?;
        let rollback = TransferRoot {
            sent_confirm_tx_at: Some(0),
            ..TransferRoot::new(root_hash)
        };
        let l1_chain = self.ctx.chains.l1().chain_id;
        let tx = match self.ctx.submit(l1_chain, &call).await {
            Ok(tx) => tx,
            Err(e) => {
                self.ctx.store.transfer_roots.update(&rollback).await?;
                return Err(e);
            }
        };
        let tx_hash = tx.tx_hash();
        let store = self.ctx.store.clone();
        on_failure(label, tx, move |_| async move {
            if let Err(e) = store.transfer_roots.update(&rollback).await {
                warn!("Failed to roll back relay of {:?}: {}", root_hash, e);
            }
        });
        Ok(Outcome::Submitted(tx_hash))
    }
}

#[async_trait]
impl Watcher for ConfirmRootWatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn poll(&self) -> BonderResult<()> {
        if self.strategy == RelayStrategy::None {
            return Ok(());
        }
        let roots = self.ctx.store.transfer_roots.by_source(self.chain_id).await?;
        for root in roots {
            if !root.is_committed() || root.is_confirmed() || root.is_suspect() {
                continue;
            }
            if self.ctx.cancel.is_cancelled() {
                return Err(BonderError::Cancelled);
            }
            let result = self.check_confirm(root.transfer_root_hash).await;
            record_outcome(
                &self.ctx.metrics,
                NAME,
                self.chain_id,
                &format!("root {:?}", root.transfer_root_hash),
                &result,
            );
        }
        Ok(())
    }

    async fn check_root(&self, root_hash: RootHash) -> BonderResult<Outcome> {
        self.check_confirm(root_hash).await
    }
}
