// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_syncer::FetchConfig;
use crate::config::{
    BondConfig, BonderNodeConfig, ChainConfig, ChallengeConfig, CommitConfig, GasConfig,
    OrderingConfig, SettleConfig, StoreConfig, WatchersConfig,
};
use crate::error::{BonderError, BonderResult};
use crate::events::{BridgeEvent, BridgeLog, EventKind};
use crate::gateway::{BridgeContract, TransferBondInfo, TransferRootInfo};
use crate::metrics::BonderMetrics;
use crate::notifier::{Notifier, Severity};
use crate::ordering::OrderingCoordinator;
use crate::retry::KeyedQueue;
use crate::store::StateStore;
use crate::submitter::{Submitter, TxBroadcaster};
use crate::types::{
    compute_transfer_id, ChainFamily, ChainId, ChainRole, FeeParams, ReceiptInfo, RootHash,
    Transfer, TransferId, TxRequest,
};
use crate::watchers::{ChainEntry, ChainRegistry, WatcherContext};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const BLOCK_TIME: u64 = 12;

static INIT: Once = Once::new();

pub fn init_for_testing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn bonder_address() -> Address {
    Address::repeat_byte(0xb0)
}

#[derive(Default)]
pub struct MockBridgeState {
    pub head: u64,
    pub logs: Vec<BridgeLog>,
    pub failing_log_queries: u32,
    pub log_queries: Vec<(u64, u64)>,
    pub credit: HashMap<Address, U256>,
    pub debit: HashMap<Address, U256>,
    pub bonded_withdrawals: HashMap<(Address, TransferId), U256>,
    pub spent: HashSet<TransferId>,
    pub pending_amounts: HashMap<ChainId, U256>,
    pub roots: HashMap<RootHash, TransferRootInfo>,
    pub root_committed_at: HashMap<H256, u64>,
    pub bonds: HashMap<H256, TransferBondInfo>,
    pub challenge_resolution_period: u64,
}

/// In-memory bridge deployment. Block `n` has timestamp `n * 12`.
pub struct MockBridge {
    chain_id: ChainId,
    role: ChainRole,
    address: Address,
    state: Mutex<MockBridgeState>,
}

impl MockBridge {
    pub fn new(chain_id: ChainId, role: ChainRole) -> Self {
        Self {
            chain_id,
            role,
            address: Address::from_low_u64_be(0xb000 + chain_id.0),
            state: Mutex::new(MockBridgeState {
                challenge_resolution_period: 10 * 24 * 3600,
                ..Default::default()
            }),
        }
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut MockBridgeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_head(&self, head: u64) {
        self.with(|s| s.head = head);
    }

    pub fn push_log(&self, block_number: u64, log_index: u64, event: BridgeEvent) {
        self.push_log_from(block_number, log_index, None, event);
    }

    pub fn push_log_from(
        &self,
        block_number: u64,
        log_index: u64,
        tx_from: Option<Address>,
        event: BridgeEvent,
    ) {
        let log = BridgeLog {
            chain_id: self.chain_id,
            block_number,
            log_index,
            tx_hash: H256::from_low_u64_be(block_number * 1000 + log_index),
            block_timestamp: block_number * BLOCK_TIME,
            tx_from,
            event,
        };
        self.with(|s| {
            s.logs.push(log);
            s.head = s.head.max(block_number);
        });
    }

    pub fn fail_next_log_queries(&self, count: u32) {
        self.with(|s| s.failing_log_queries = count);
    }

    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.with(|s| s.log_queries.clone())
    }

    pub fn set_credit(&self, bonder: Address, credit: U256) {
        self.with(|s| {
            s.credit.insert(bonder, credit);
        });
    }

    pub fn set_debit(&self, bonder: Address, debit: U256) {
        self.with(|s| {
            s.debit.insert(bonder, debit);
        });
    }

    pub fn set_spent(&self, transfer_id: TransferId) {
        self.with(|s| {
            s.spent.insert(transfer_id);
        });
    }

    pub fn set_pending_amount(&self, destination: ChainId, amount: U256) {
        self.with(|s| {
            s.pending_amounts.insert(destination, amount);
        });
    }

    pub fn set_root(&self, root_hash: RootHash, info: TransferRootInfo) {
        self.with(|s| {
            s.roots.insert(root_hash, info);
        });
    }

    pub fn set_root_committed_at(&self, transfer_root_id: H256, committed_at: u64) {
        self.with(|s| {
            s.root_committed_at.insert(transfer_root_id, committed_at);
        });
    }

    pub fn set_bond(&self, transfer_root_id: H256, bond: TransferBondInfo) {
        self.with(|s| {
            s.bonds.insert(transfer_root_id, bond);
        });
    }
}

#[async_trait]
impl BridgeContract for MockBridge {
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
        Ok(self.with(|s| s.head))
    }

    async fn block_timestamp(&self, block_number: u64) -> BonderResult<u64> {
        Ok(block_number * BLOCK_TIME)
    }

    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        kinds: &[EventKind],
    ) -> BonderResult<Vec<BridgeLog>> {
        self.with(|s| {
            s.log_queries.push((from_block, to_block));
            if s.failing_log_queries > 0 {
                s.failing_log_queries -= 1;
                return Err(BonderError::TransientProviderError(
                    "connection reset".into(),
                ));
            }
            let mut logs = s
                .logs
                .iter()
                .filter(|l| l.block_number >= from_block && l.block_number <= to_block)
                .filter(|l| kinds.is_empty() || kinds.contains(&l.event.kind()))
                .cloned()
                .collect::<Vec<_>>();
            logs.sort_by_key(|l| l.position());
            Ok(logs)
        })
    }

    async fn credit(&self, bonder: Address) -> BonderResult<U256> {
        Ok(self.with(|s| s.credit.get(&bonder).copied().unwrap_or_default()))
    }

    async fn debit(&self, bonder: Address) -> BonderResult<U256> {
        Ok(self.with(|s| s.debit.get(&bonder).copied().unwrap_or_default()))
    }

    async fn bonded_withdrawal_amount(
        &self,
        bonder: Address,
        transfer_id: TransferId,
    ) -> BonderResult<U256> {
        Ok(self.with(|s| {
            s.bonded_withdrawals
                .get(&(bonder, transfer_id))
                .copied()
                .unwrap_or_default()
        }))
    }

    async fn is_transfer_spent(&self, transfer_id: TransferId) -> BonderResult<bool> {
        Ok(self.with(|s| s.spent.contains(&transfer_id)))
    }

    async fn pending_amount_for_chain(&self, destination: ChainId) -> BonderResult<U256> {
        Ok(self.with(|s| {
            s.pending_amounts
                .get(&destination)
                .copied()
                .unwrap_or_default()
        }))
    }

    async fn transfer_root(
        &self,
        root_hash: RootHash,
        _total_amount: U256,
    ) -> BonderResult<TransferRootInfo> {
        Ok(self.with(|s| s.roots.get(&root_hash).cloned().unwrap_or_default()))
    }

    async fn transfer_root_committed_at(&self, transfer_root_id: H256) -> BonderResult<u64> {
        Ok(self.with(|s| {
            s.root_committed_at
                .get(&transfer_root_id)
                .copied()
                .unwrap_or(0)
        }))
    }

    async fn transfer_bond(
        &self,
        transfer_root_id: H256,
    ) -> BonderResult<Option<TransferBondInfo>> {
        Ok(self.with(|s| s.bonds.get(&transfer_root_id).cloned()))
    }

    async fn challenge_amount(&self, amount: U256) -> BonderResult<U256> {
        Ok(amount / 10)
    }

    async fn challenge_resolution_period(&self) -> BonderResult<u64> {
        Ok(self.with(|s| s.challenge_resolution_period))
    }
}

#[derive(Clone, Debug)]
pub struct SentTx {
    pub request: TxRequest,
    pub nonce: u64,
    pub fees: FeeParams,
    pub tx_hash: H256,
}

struct MockBroadcasterState {
    pending_nonce: u64,
    fees: FeeParams,
    broadcast_errors: VecDeque<BonderError>,
    auto_confirm: bool,
    sent: Vec<SentTx>,
    mined: HashMap<H256, bool>,
    counter: u64,
}

/// Signer that records every broadcast instead of sending it.
pub struct MockBroadcaster {
    chain_id: ChainId,
    signer: Address,
    state: Mutex<MockBroadcasterState>,
}

impl MockBroadcaster {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            signer: bonder_address(),
            state: Mutex::new(MockBroadcasterState {
                pending_nonce: 0,
                fees: FeeParams::Legacy {
                    gas_price: U256::from(1_000_000_000u64),
                },
                broadcast_errors: VecDeque::new(),
                auto_confirm: false,
                sent: vec![],
                mined: HashMap::new(),
                counter: 0,
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockBroadcasterState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_pending_nonce(&self, nonce: u64) {
        self.with(|s| s.pending_nonce = nonce);
    }

    pub fn set_fees(&self, fees: FeeParams) {
        self.with(|s| s.fees = fees);
    }

    pub fn push_broadcast_error(&self, error: BonderError) {
        self.with(|s| s.broadcast_errors.push_back(error));
    }

    pub fn set_auto_confirm(&self, auto_confirm: bool) {
        self.with(|s| s.auto_confirm = auto_confirm);
    }

    pub fn mine(&self, tx_hash: H256, success: bool) {
        self.with(|s| {
            s.mined.insert(tx_hash, success);
        });
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.with(|s| s.sent.clone())
    }

    pub fn sent_nonces(&self) -> Vec<u64> {
        self.sent().into_iter().map(|t| t.nonce).collect()
    }

    pub fn sent_fees(&self) -> Vec<FeeParams> {
        self.sent().into_iter().map(|t| t.fees).collect()
    }

    pub fn sent_hashes(&self) -> Vec<H256> {
        self.sent().into_iter().map(|t| t.tx_hash).collect()
    }

    pub fn sent_labels(&self) -> Vec<String> {
        self.sent().into_iter().map(|t| t.request.label).collect()
    }

    pub fn sent_requests(&self) -> Vec<TxRequest> {
        self.sent().into_iter().map(|t| t.request).collect()
    }
}

#[async_trait]
impl TxBroadcaster for MockBroadcaster {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn signer_address(&self) -> Address {
        self.signer
    }

    async fn pending_nonce(&self) -> BonderResult<u64> {
        Ok(self.with(|s| s.pending_nonce))
    }

    async fn suggest_fees(&self) -> BonderResult<FeeParams> {
        Ok(self.with(|s| s.fees))
    }

    async fn estimate_gas(&self, _request: &TxRequest) -> BonderResult<U256> {
        Ok(U256::from(100_000u64))
    }

    async fn broadcast(
        &self,
        request: &TxRequest,
        nonce: u64,
        fees: &FeeParams,
    ) -> BonderResult<H256> {
        self.with(|s| {
            if let Some(error) = s.broadcast_errors.pop_front() {
                return Err(error);
            }
            s.counter += 1;
            let tx_hash = H256::from_low_u64_be(s.counter);
            s.sent.push(SentTx {
                request: request.clone(),
                nonce,
                fees: *fees,
                tx_hash,
            });
            s.pending_nonce = s.pending_nonce.max(nonce + 1);
            Ok(tx_hash)
        })
    }

    async fn receipt(&self, tx_hash: H256) -> BonderResult<Option<ReceiptInfo>> {
        Ok(self.with(|s| {
            let sent = s.sent.iter().find(|t| t.tx_hash == tx_hash)?;
            let success = match s.mined.get(&tx_hash) {
                Some(success) => *success,
                None if s.auto_confirm => true,
                None => return None,
            };
            Some(ReceiptInfo {
                tx_hash,
                block_number: 100 + sent.nonce,
                success,
                gas_used: U256::from(21_000u64),
                effective_gas_price: sent.fees.max_price(),
            })
        }))
    }
}

/// Keeps every alert title for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<(Severity, String, String)>>,
}

impl RecordingNotifier {
    pub fn titles(&self) -> Vec<String> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, title, _)| title.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, severity: Severity, title: &str, body: &str) {
        self.alerts
            .lock()
            .unwrap()
            .push((severity, title.to_string(), body.to_string()));
    }
}

pub fn test_gas_config() -> GasConfig {
    GasConfig {
        eip1559: false,
        boost_interval: Duration::from_secs(3600),
        boost_multiplier_bps: 12_500,
        max_gas_price: U256::from(1_000_000_000_000u64),
        gas_limit_multiplier_bps: 10_000,
        receipt_poll_interval: Duration::from_millis(5),
        reconcile_interval: Duration::from_secs(3600),
    }
}

pub fn test_tx_request(chain_id: ChainId) -> TxRequest {
    TxRequest {
        chain_id,
        to: Address::repeat_byte(0x42),
        data: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
        value: U256::zero(),
        gas_limit: None,
        label: "test_call".to_string(),
    }
}

fn test_chain(name: &str, chain_id: u64, role: ChainRole, family: ChainFamily) -> ChainConfig {
    ChainConfig {
        name: name.to_string(),
        chain_id,
        role,
        family,
        rpc_url: format!("http://127.0.0.1:{}", 8000 + chain_id % 1000),
        bridge_address: Address::from_low_u64_be(0xb000 + chain_id),
        deployment_block: 0,
        sync_from_timestamp: None,
        fetch: FetchConfig::default(),
        gas: test_gas_config(),
        messenger_address: match family {
            ChainFamily::Arbitrum | ChainFamily::Polygon | ChainFamily::Gnosis => {
                Some(Address::from_low_u64_be(0xe000 + chain_id))
            }
            _ => None,
        },
    }
}

/// Ethereum L1 (1), Optimism (10) and Arbitrum (42161).
pub fn test_node_config() -> BonderNodeConfig {
    BonderNodeConfig {
        metrics_port: 0,
        bonder_key_path: PathBuf::from("/dev/null"),
        token: "ETH".to_string(),
        dry_run: false,
        store: StoreConfig::default(),
        chains: vec![
            test_chain("ethereum", 1, ChainRole::L1, ChainFamily::Ethereum),
            test_chain("optimism", 10, ChainRole::L2, ChainFamily::Optimism),
            test_chain("arbitrum", 42161, ChainRole::L2, ChainFamily::Arbitrum),
        ],
        commit: CommitConfig {
            default_min_threshold: U256::from(1000u64),
            ..Default::default()
        },
        bond: BondConfig {
            retry_backoff: Duration::from_secs(60),
            ..Default::default()
        },
        settle: SettleConfig::default(),
        challenge: ChallengeConfig::default(),
        ordering: OrderingConfig {
            wait_delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
            ..OrderingConfig::local("bonder-test", 0)
        },
        watchers: WatchersConfig {
            challenge: true,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        },
        exit_proof_api_url: None,
        notifier: None,
    }
}

pub fn test_transfer_id(seed: u8, destination: ChainId, amount: U256, bonder_fee: U256) -> TransferId {
    compute_transfer_id(
        destination,
        Address::repeat_byte(0x11),
        amount,
        H256::repeat_byte(seed),
        bonder_fee,
        U256::zero(),
        U256::zero(),
    )
}

/// A fully populated transfer as the syncer would store it.
pub fn sent_transfer(
    seed: u8,
    source: ChainId,
    destination: ChainId,
    amount: u64,
    block: u64,
) -> Transfer {
    let amount = U256::from(amount);
    let bonder_fee = U256::from(10u64);
    Transfer {
        transfer_id: test_transfer_id(seed, destination, amount, bonder_fee),
        source_chain_id: Some(source),
        destination_chain_id: Some(destination),
        recipient: Some(Address::repeat_byte(0x11)),
        amount: Some(amount),
        transfer_nonce: Some(H256::repeat_byte(seed)),
        bonder_fee: Some(bonder_fee),
        amount_out_min: Some(U256::zero()),
        deadline: Some(U256::zero()),
        pending_index: Some(seed as u64),
        transfer_sent_block: Some(block),
        transfer_sent_log_index: Some(0),
        transfer_sent_tx_hash: Some(H256::from_low_u64_be(block * 1000)),
        transfer_sent_timestamp: Some(block * BLOCK_TIME),
        ..Transfer::new(H256::zero())
    }
}

/// Watcher context over mock chains from [`test_node_config`]. Every chain
/// gets a real submitter backed by a [`MockBroadcaster`].
pub struct WatcherFixture {
    pub ctx: WatcherContext,
    pub store: StateStore,
    pub notifier: Arc<RecordingNotifier>,
    bridges: HashMap<ChainId, Arc<MockBridge>>,
    broadcasters: HashMap<ChainId, Arc<MockBroadcaster>>,
}

impl WatcherFixture {
    pub fn new() -> Self {
        Self::with_config(test_node_config())
    }

    pub fn with_config(config: BonderNodeConfig) -> Self {
        let store = StateStore::in_memory();
        Self::build(config, store, None)
    }

    /// A second bonder instance sharing chains and store with `other`.
    pub fn peer_of(other: &WatcherFixture, config: BonderNodeConfig) -> Self {
        Self::build(
            config,
            other.store.clone(),
            Some((&other.bridges, &other.broadcasters)),
        )
    }

    fn build(
        config: BonderNodeConfig,
        store: StateStore,
        shared: Option<(
            &HashMap<ChainId, Arc<MockBridge>>,
            &HashMap<ChainId, Arc<MockBroadcaster>>,
        )>,
    ) -> Self {
        init_for_testing();
        let metrics = Arc::new(BonderMetrics::new_for_testing());
        let notifier = Arc::new(RecordingNotifier::default());
        let cancel = CancellationToken::new();
        let mut bridges = HashMap::new();
        let mut broadcasters = HashMap::new();
        let mut entries = vec![];
        for chain in &config.chains {
            let chain_id = chain.chain_id();
            let bridge = shared
                .and_then(|(b, _)| b.get(&chain_id).cloned())
                .unwrap_or_else(|| Arc::new(MockBridge::new(chain_id, chain.role)));
            let broadcaster = shared
                .and_then(|(_, b)| b.get(&chain_id).cloned())
                .unwrap_or_else(|| {
                    let broadcaster = Arc::new(MockBroadcaster::new(chain_id));
                    broadcaster.set_auto_confirm(true);
                    broadcaster
                });
            let (submitter, _) = Submitter::new(
                broadcaster.clone(),
                store.clone(),
                test_gas_config(),
                metrics.clone(),
                notifier.clone(),
                &config.token,
                cancel.clone(),
            )
            .spawn();
            entries.push(ChainEntry {
                chain_id,
                name: chain.name.clone(),
                role: chain.role,
                family: chain.family,
                bridge: bridge.clone(),
                submitter,
                messenger: chain.messenger_address,
            });
            bridges.insert(chain_id, bridge);
            broadcasters.insert(chain_id, broadcaster);
        }
        let coordinator = Arc::new(OrderingCoordinator::new(
            config.ordering.clone(),
            metrics.clone(),
        ));
        let ctx = WatcherContext {
            store: store.clone(),
            chains: Arc::new(ChainRegistry::new(entries).unwrap()),
            config: Arc::new(config),
            bonder: bonder_address(),
            coordinator,
            metrics,
            notifier: notifier.clone(),
            queue: Arc::new(KeyedQueue::new()),
            cancel,
        };
        Self {
            ctx,
            store,
            notifier,
            bridges,
            broadcasters,
        }
    }

    pub fn bridge(&self, chain_id: ChainId) -> Arc<MockBridge> {
        self.bridges[&chain_id].clone()
    }

    pub fn broadcaster(&self, chain_id: ChainId) -> Arc<MockBroadcaster> {
        self.broadcasters[&chain_id].clone()
    }

    /// Labels of every call broadcast on `chain_id`.
    pub fn sent_labels(&self, chain_id: ChainId) -> Vec<String> {
        self.broadcaster(chain_id).sent_labels()
    }
}

impl Drop for WatcherFixture {
    fn drop(&mut self) {
        self.ctx.cancel.cancel();
    }
}

/// Wait until `check` holds, for at most a second.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
