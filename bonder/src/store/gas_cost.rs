// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{from_value, to_value, KeyRange, KvBackend, GAS_COST_NAMESPACE};
use crate::error::BonderResult;
use crate::types::ChainId;
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Observed cost of one confirmed bonder transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasCostSample {
    pub chain_id: ChainId,
    pub token: String,
    pub timestamp: u64,
    /// Call label, e.g. `bond_withdrawal`.
    pub variant: String,
    pub tx_hash: H256,
    pub gas_used: U256,
    pub gas_price: U256,
    pub gas_cost: U256,
}

impl GasCostSample {
    pub fn key(&self) -> String {
        format!(
            "{}{:020}:{}",
            cost_prefix(self.chain_id, &self.token),
            self.timestamp,
            self.variant
        )
    }
}

fn cost_prefix(chain_id: ChainId, token: &str) -> String {
    format!("{}:{}:", chain_id, token)
}

#[derive(Clone)]
pub struct GasCostDb {
    backend: Arc<dyn KvBackend>,
}

impl GasCostDb {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub async fn add(&self, sample: &GasCostSample) -> BonderResult<()> {
        self.backend
            .put(GAS_COST_NAMESPACE, &sample.key(), to_value(sample)?)
            .await
    }

    /// Samples with `from <= timestamp < to`, oldest first.
    pub async fn in_range(
        &self,
        chain_id: ChainId,
        token: &str,
        from: u64,
        to: u64,
    ) -> BonderResult<Vec<GasCostSample>> {
        let prefix = cost_prefix(chain_id, token);
        self.backend
            .scan(
                GAS_COST_NAMESPACE,
                KeyRange::Between {
                    start: format!("{}{:020}", prefix, from),
                    end: format!("{}{:020}", prefix, to),
                },
            )
            .await?
            .into_iter()
            .map(|(_, v)| from_value(v))
            .collect()
    }

    pub async fn latest(
        &self,
        chain_id: ChainId,
        token: &str,
        variant: &str,
    ) -> BonderResult<Option<GasCostSample>> {
        let samples = self
            .backend
            .scan(
                GAS_COST_NAMESPACE,
                KeyRange::Prefix(cost_prefix(chain_id, token)),
            )
            .await?;
        for (_, value) in samples.into_iter().rev() {
            let sample: GasCostSample = from_value(value)?;
            if sample.variant == variant {
                return Ok(Some(sample));
            }
        }
        Ok(None)
    }
}
