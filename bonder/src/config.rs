// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_syncer::FetchConfig;
use crate::types::{ChainFamily, ChainId, ChainRole};
use anyhow::anyhow;
use bonder_config::Config;
use ethers::types::{Address, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{serde_as, DeserializeAs, DurationSeconds, SerializeAs};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Big integers in config files are written as decimal strings.
pub struct DecimalU256;

impl SerializeAs<U256> for DecimalU256 {
    fn serialize_as<S>(source: &U256, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&source.to_string())
    }
}

impl<'de> DeserializeAs<'de, U256> for DecimalU256 {
    fn deserialize_as<D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        U256::from_dec_str(raw.trim())
            .map_err(|e| serde::de::Error::custom(format!("invalid amount {:?}: {:?}", raw, e)))
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BonderNodeConfig {
    // The port for the metrics server.
    pub metrics_port: u16,
    // Path of the file holding the bonder's hex encoded secp256k1 private key.
    pub bonder_key_path: PathBuf,
    // Token symbol this node bonds, used to key gas cost samples.
    #[serde(default = "default_token")]
    pub token: String,
    // Run every decision but never submit a transaction.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub store: StoreConfig,
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub commit: CommitConfig,
    #[serde(default)]
    pub bond: BondConfig,
    #[serde(default)]
    pub settle: SettleConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    pub ordering: OrderingConfig,
    #[serde(default)]
    pub watchers: WatchersConfig,
    // Exit proof service used to relay roots from proof-relay rollups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_proof_api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notifier: Option<NotifierConfig>,
}

fn default_token() -> String {
    "ETH".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    // SQLite file. The store is kept in memory when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub role: ChainRole,
    pub family: ChainFamily,
    pub rpc_url: String,
    pub bridge_address: Address,
    // First block the bridge can have emitted events in.
    #[serde(default)]
    pub deployment_block: u64,
    // Unix timestamp; sync starts at the first block at or after it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_from_timestamp: Option<u64>,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub gas: GasConfig,
    // L1 messenger that accepts exit messages from this rollup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messenger_address: Option<Address>,
}

impl ChainConfig {
    pub fn chain_id(&self) -> ChainId {
        ChainId(self.chain_id)
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct GasConfig {
    #[serde(default = "default_true")]
    pub eip1559: bool,
    // Time an attempt may stay unconfirmed before its fees are bumped.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_boost_interval")]
    pub boost_interval: Duration,
    // Fee multiplier applied per bump, in basis points.
    #[serde(default = "default_boost_multiplier_bps")]
    pub boost_multiplier_bps: u64,
    // Ceiling for gas price / max fee per gas, in wei.
    #[serde_as(as = "DecimalU256")]
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price: U256,
    #[serde(default = "default_gas_limit_multiplier_bps")]
    pub gas_limit_multiplier_bps: u64,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_receipt_poll_interval")]
    pub receipt_poll_interval: Duration,
    // How often the tracked nonce is compared with the provider's.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: Duration,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            eip1559: true,
            boost_interval: default_boost_interval(),
            boost_multiplier_bps: default_boost_multiplier_bps(),
            max_gas_price: default_max_gas_price(),
            gas_limit_multiplier_bps: default_gas_limit_multiplier_bps(),
            receipt_poll_interval: default_receipt_poll_interval(),
            reconcile_interval: default_reconcile_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_boost_interval() -> Duration {
    Duration::from_secs(120)
}

fn default_boost_multiplier_bps() -> u64 {
    11_250
}

fn default_max_gas_price() -> U256 {
    // 500 gwei
    U256::from(500_000_000_000u64)
}

fn default_gas_limit_multiplier_bps() -> u64 {
    12_000
}

fn default_receipt_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(300)
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CommitConfig {
    // Pending total that triggers a commit, per destination chain id.
    #[serde_as(as = "BTreeMap<_, DecimalU256>")]
    #[serde(default)]
    pub min_thresholds: BTreeMap<u64, U256>,
    // Used for destinations without an explicit threshold.
    #[serde_as(as = "DecimalU256")]
    #[serde(default = "default_min_threshold")]
    pub default_min_threshold: U256,
    // Commit regardless of amount once this many transfers are pending.
    #[serde(default = "default_max_pending_transfers")]
    pub max_pending_transfers: usize,
    // Commit regardless of amount once the oldest pending transfer is this old.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_force_commit_age")]
    pub force_commit_age: Duration,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            min_thresholds: BTreeMap::new(),
            default_min_threshold: default_min_threshold(),
            max_pending_transfers: default_max_pending_transfers(),
            force_commit_age: default_force_commit_age(),
        }
    }
}

impl CommitConfig {
    pub fn threshold_for(&self, destination: ChainId) -> U256 {
        self.min_thresholds
            .get(&destination.0)
            .copied()
            .unwrap_or(self.default_min_threshold)
    }
}

fn default_min_threshold() -> U256 {
    // 1 token with 18 decimals
    U256::exp10(18)
}

fn default_max_pending_transfers() -> usize {
    128
}

fn default_force_commit_age() -> Duration {
    Duration::from_secs(6 * 3600)
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BondConfig {
    #[serde_as(as = "DecimalU256")]
    #[serde(default)]
    pub min_amount: U256,
    #[serde_as(as = "Option<DecimalU256>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<U256>,
    #[serde_as(as = "DecimalU256")]
    #[serde(default)]
    pub min_bonder_fee: U256,
    // Base delay before a reverted bond is retried, doubled per revert.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_bond_backoff")]
    pub retry_backoff: Duration,
}

impl Default for BondConfig {
    fn default() -> Self {
        Self {
            min_amount: U256::zero(),
            max_amount: None,
            min_bonder_fee: U256::zero(),
            retry_backoff: default_bond_backoff(),
        }
    }
}

fn default_bond_backoff() -> Duration {
    Duration::from_secs(60)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SettleConfig {
    // Our bonded share of a root, in percent of its total, needed to settle.
    #[serde(default = "default_settle_threshold_percent")]
    pub threshold_percent: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            threshold_percent: default_settle_threshold_percent(),
        }
    }
}

fn default_settle_threshold_percent() -> u64 {
    5
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChallengeConfig {
    // Age of a root bond after which a missing source commit is challenged.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_challenge_grace_period")]
    pub grace_period: Duration,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            grace_period: default_challenge_grace_period(),
        }
    }
}

fn default_challenge_grace_period() -> Duration {
    Duration::from_secs(3600)
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OrderingConfig {
    pub hostname: String,
    // Rank of this instance, 0 acts first.
    #[serde(default)]
    pub declared_order: u32,
    // Heartbeats are exchanged in-process when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(default = "default_heartbeat_channel")]
    pub channel: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout: Duration,
    // Wait per unit of effective order.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_wait_delay")]
    pub wait_delay: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_ordering_poll_interval")]
    pub poll_interval: Duration,
}

impl OrderingConfig {
    pub fn local(hostname: &str, declared_order: u32) -> Self {
        Self {
            hostname: hostname.to_string(),
            declared_order,
            redis_url: None,
            channel: default_heartbeat_channel(),
            heartbeat_interval: default_heartbeat_interval(),
            liveness_timeout: default_liveness_timeout(),
            wait_delay: default_wait_delay(),
            poll_interval: default_ordering_poll_interval(),
        }
    }
}

fn default_heartbeat_channel() -> String {
    "bonder:heartbeat".to_string()
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_liveness_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_wait_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_ordering_poll_interval() -> Duration {
    Duration::from_secs(2)
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WatchersConfig {
    #[serde(default = "default_true")]
    pub commit: bool,
    #[serde(default = "default_true")]
    pub bond_withdrawal: bool,
    #[serde(default = "default_true")]
    pub bond_root: bool,
    #[serde(default = "default_true")]
    pub settle: bool,
    #[serde(default = "default_true")]
    pub confirm_root: bool,
    #[serde(default)]
    pub challenge: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_watcher_poll_interval")]
    pub poll_interval: Duration,
}

impl Default for WatchersConfig {
    fn default() -> Self {
        Self {
            commit: true,
            bond_withdrawal: true,
            bond_root: true,
            settle: true,
            confirm_root: true,
            challenge: false,
            poll_interval: default_watcher_poll_interval(),
        }
    }
}

fn default_watcher_poll_interval() -> Duration {
    Duration::from_secs(10)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NotifierConfig {
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
}

impl Config for BonderNodeConfig {}

impl BonderNodeConfig {
    pub fn l1_chain(&self) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.role == ChainRole::L1)
    }

    pub fn chain(&self, chain_id: ChainId) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id.0)
    }

    /// Static checks run once at startup. Any error is fatal.
    pub fn validate(&self) -> anyhow::Result<()> {
        info!("Starting config validation");
        if self.chains.is_empty() {
            return Err(anyhow!("At least one chain must be configured"));
        }
        let l1_count = self
            .chains
            .iter()
            .filter(|c| c.role == ChainRole::L1)
            .count();
        if l1_count != 1 {
            return Err(anyhow!(
                "Exactly one l1 chain is required, found {}",
                l1_count
            ));
        }
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for chain in &self.chains {
            if !ids.insert(chain.chain_id) {
                return Err(anyhow!("Duplicate chain id {}", chain.chain_id));
            }
            if !names.insert(chain.name.as_str()) {
                return Err(anyhow!("Duplicate chain name {}", chain.name));
            }
            if chain.rpc_url.is_empty() {
                return Err(anyhow!("Chain {} has an empty rpc-url", chain.name));
            }
            if chain.bridge_address == Address::zero() {
                return Err(anyhow!("Chain {} has a zero bridge-address", chain.name));
            }
            chain
                .fetch
                .validate()
                .map_err(|e| anyhow!("Chain {}: {}", chain.name, e))?;
            if chain.gas.max_gas_price.is_zero() {
                return Err(anyhow!("Chain {} has a zero max-gas-price", chain.name));
            }
            if chain.gas.boost_multiplier_bps <= 10_000 {
                return Err(anyhow!(
                    "Chain {} boost-multiplier-bps must be above 10000",
                    chain.name
                ));
            }
            match (chain.role, chain.family) {
                (ChainRole::L1, ChainFamily::Ethereum) => {}
                (ChainRole::L1, family) => {
                    return Err(anyhow!(
                        "Chain {} is l1 but has rollup family {}",
                        chain.name,
                        family.as_str()
                    ))
                }
                (ChainRole::L2, ChainFamily::Ethereum) => {
                    return Err(anyhow!(
                        "Chain {} is l2 but has family ethereum",
                        chain.name
                    ))
                }
                (ChainRole::L2, ChainFamily::Optimism) => {}
                (ChainRole::L2, _) => {
                    if self.watchers.confirm_root
                        && (chain.messenger_address.is_none() || self.exit_proof_api_url.is_none())
                    {
                        return Err(anyhow!(
                            "Chain {} relays roots by proof and needs messenger-address and exit-proof-api-url",
                            chain.name
                        ));
                    }
                }
            }
        }
        for destination in self.commit.min_thresholds.keys() {
            if !ids.contains(destination) {
                return Err(anyhow!(
                    "Commit threshold configured for unknown chain {}",
                    destination
                ));
            }
        }
        if let Some(max) = self.bond.max_amount {
            if max < self.bond.min_amount {
                return Err(anyhow!("bond max-amount is below min-amount"));
            }
        }
        if self.settle.threshold_percent > 100 {
            return Err(anyhow!("settle threshold-percent must be within 0..=100"));
        }
        if self.ordering.hostname.is_empty() {
            return Err(anyhow!("ordering hostname cannot be empty"));
        }
        if self.ordering.liveness_timeout <= self.ordering.heartbeat_interval {
            return Err(anyhow!(
                "ordering liveness-timeout must exceed heartbeat-interval"
            ));
        }
        info!("Config validation complete");
        Ok(())
    }
}
