// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_syncer::{resolve_start_block, EventHandler, EventSyncer};
use crate::config::{BonderNodeConfig, ChainConfig};
use crate::error::BonderError;
use crate::gateway::{BridgeContract, EthBridgeGateway};
use crate::metrics::BonderMetrics;
use crate::notifier::{LogNotifier, SharedNotifier, TelegramConfig, TelegramNotifier};
use crate::ordering::{HeartbeatTransport, LocalTransport, OrderingCoordinator, RedisTransport};
use crate::retry::KeyedQueue;
use crate::server::run_server;
use crate::store::StateStore;
use crate::submitter::{load_signer, EthTxBroadcaster, Submitter};
use crate::types::ChainRole;
use crate::watchers::{
    BondRootWatcher, BondWithdrawalWatcher, ChainEntry, ChainRegistry, ChallengeWatcher,
    CommitWatcher, ConfirmRootWatcher, ExitProofProvider, HttpExitProofProvider, SettleWatcher,
    StoreEventHandler, Watcher, WatcherContext, WatcherSupervisor,
};
use anyhow::anyhow;
use ethers::signers::Signer;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Build every component from `config`, start the syncers, watchers and the
/// metrics server. The returned handle completes once `cancel` fires and
/// every task has wound down.
pub async fn run_bonder_node(
    config: BonderNodeConfig,
    prometheus_registry: prometheus::Registry,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let metrics = Arc::new(BonderMetrics::new(&prometheus_registry));
    let start_time = std::time::Instant::now();

    // Start uptime tracking task
    let uptime_metrics = metrics.clone();
    tokio::spawn(async move {
        loop {
            uptime_metrics
                .uptime_seconds
                .set(start_time.elapsed().as_secs() as i64);
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    });

    let config = Arc::new(config);
    let store = match &config.store.path {
        Some(path) => {
            info!("Opening state store at {}", path.display());
            StateStore::open_sqlite(path)
                .map_err(|e| anyhow!("Failed to open state store {}: {:?}", path.display(), e))?
        }
        None => {
            warn!("No store path configured, state is kept in memory only");
            StateStore::in_memory()
        }
    };
    let notifier = build_notifier(&config)?;

    let mut handles = vec![];
    let mut entries = vec![];
    let mut bonder = None;
    for chain in &config.chains {
        let gateway = EthBridgeGateway::new(
            &chain.rpc_url,
            chain.bridge_address,
            chain.chain_id(),
            chain.role,
            metrics.clone(),
        )?;
        gateway
            .verify_chain_id()
            .await
            .map_err(|e| anyhow!("Chain {} is unusable: {:?}", chain.name, e))?;
        let wallet = load_signer(&config.bonder_key_path, chain.chain_id())?;
        bonder = Some(wallet.address());
        let broadcaster = EthTxBroadcaster::new(
            chain.chain_id(),
            gateway.provider(),
            wallet,
            &chain.gas,
        );
        let (submitter, handle) = Submitter::new(
            Arc::new(broadcaster),
            store.clone(),
            chain.gas.clone(),
            metrics.clone(),
            notifier.clone(),
            &config.token,
            cancel.clone(),
        )
        .spawn();
        handles.push(handle);
        entries.push(ChainEntry {
            chain_id: chain.chain_id(),
            name: chain.name.clone(),
            role: chain.role,
            family: chain.family,
            bridge: Arc::new(gateway),
            submitter,
            messenger: chain.messenger_address,
        });
        info!("[{}] Chain {} ready", chain.name, chain.chain_id);
    }
    let bonder = bonder.ok_or_else(|| anyhow!("No chain configured"))?;
    info!("Bonding as {:?}", bonder);
    let chains = Arc::new(
        ChainRegistry::new(entries).map_err(|e| anyhow!("Invalid chain set: {:?}", e))?,
    );

    let coordinator = Arc::new(OrderingCoordinator::new(
        config.ordering.clone(),
        metrics.clone(),
    ));
    let transport: Arc<dyn HeartbeatTransport> = match &config.ordering.redis_url {
        Some(url) => Arc::new(
            RedisTransport::new(url, &config.ordering.channel)
                .map_err(|e| anyhow!("Failed to connect heartbeat channel: {:?}", e))?,
        ),
        None => {
            info!("No redis url configured, ordering runs without peers");
            Arc::new(LocalTransport::new())
        }
    };
    handles.extend(coordinator.spawn(transport, cancel.clone()));

    let handler: Arc<dyn EventHandler> = Arc::new(StoreEventHandler::new(
        store.clone(),
        metrics.clone(),
        notifier.clone(),
    ));
    for chain in &config.chains {
        let entry = chains
            .get(chain.chain_id())
            .map_err(|e| anyhow!("Chain {} missing: {:?}", chain.name, e))?;
        handles.push(
            start_syncer(
                chain,
                entry.bridge.clone(),
                store.clone(),
                metrics.clone(),
                handler.clone(),
                cancel.clone(),
            )
            .await?,
        );
    }

    let ctx = WatcherContext {
        store,
        chains,
        config: config.clone(),
        bonder,
        coordinator,
        metrics,
        notifier,
        queue: Arc::new(KeyedQueue::new()),
        cancel: cancel.clone(),
    };
    let mut supervisor = WatcherSupervisor::new(config.watchers.poll_interval, cancel.clone());
    for watcher in build_watchers(&ctx)? {
        let key = supervisor
            .register(watcher)
            .map_err(|e| anyhow!("Failed to register watcher: {:?}", e))?;
        info!("Registered watcher {}", key);
    }
    if config.dry_run {
        warn!("Dry run enabled, no transaction will be submitted");
    }
    supervisor
        .start_all()
        .map_err(|e| anyhow!("Failed to start watchers: {:?}", e))?;
    let supervisor = Arc::new(supervisor);

    let socket_address =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), config.metrics_port);
    let server = run_server(&socket_address, prometheus_registry, supervisor.clone());

    Ok(tokio::spawn(async move {
        cancel.cancelled().await;
        info!("Shutting down bonder node");
        supervisor.shutdown().await;
        server.abort();
        futures::future::join_all(handles).await;
        info!("Bonder node stopped");
    }))
}

fn build_notifier(config: &BonderNodeConfig) -> anyhow::Result<SharedNotifier> {
    let Some(notifier) = &config.notifier else {
        return Ok(Arc::new(LogNotifier));
    };
    let telegram = TelegramConfig {
        bot_token: notifier.telegram_bot_token.clone(),
        chat_id: notifier.telegram_chat_id.clone(),
    };
    if !telegram.is_configured() {
        warn!("Telegram notifier is incomplete, alerts go to the log only");
        return Ok(Arc::new(LogNotifier));
    }
    Ok(Arc::new(TelegramNotifier::new(
        telegram,
        &config.ordering.hostname,
    )?))
}

async fn start_syncer(
    chain: &ChainConfig,
    bridge: Arc<dyn BridgeContract>,
    store: StateStore,
    metrics: Arc<BonderMetrics>,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let start_block = resolve_start_block(
        bridge.as_ref(),
        chain.deployment_block,
        chain.sync_from_timestamp,
    )
    .await
    .map_err(|e| anyhow!("[{}] Failed to resolve start block: {:?}", chain.name, e))?;
    let syncer = EventSyncer::new(&chain.name, bridge, store, chain.fetch.clone(), metrics)
        .with_start_block(start_block);
    info!(
        "[{}] Starting event syncer from block {} with cursor {}",
        chain.name,
        start_block,
        syncer.cursor_key()
    );
    Ok(tokio::spawn(syncer.run(handler, cancel)))
}

/// One watcher per enabled duty: per-route watchers for every chain they
/// apply to, the L1 watchers once.
pub fn build_watchers(ctx: &WatcherContext) -> anyhow::Result<Vec<Arc<dyn Watcher>>> {
    let flags = &ctx.config.watchers;
    let proofs: Option<Arc<dyn ExitProofProvider>> = match &ctx.config.exit_proof_api_url {
        Some(url) => Some(Arc::new(
            HttpExitProofProvider::new(url).map_err(|e| anyhow!("Invalid exit proof api: {:?}", e))?,
        )),
        None => None,
    };
    let wrap = |e: BonderError| anyhow!("Failed to build watcher: {:?}", e);

    let mut watchers: Vec<Arc<dyn Watcher>> = vec![];
    for entry in ctx.chains.iter() {
        if flags.commit && entry.role == ChainRole::L2 {
            watchers.push(Arc::new(
                CommitWatcher::new(ctx.clone(), entry.chain_id).map_err(wrap)?,
            ));
        }
        if flags.bond_withdrawal {
            watchers.push(Arc::new(
                BondWithdrawalWatcher::new(ctx.clone(), entry.chain_id).map_err(wrap)?,
            ));
        }
        if flags.settle {
            watchers.push(Arc::new(
                SettleWatcher::new(ctx.clone(), entry.chain_id).map_err(wrap)?,
            ));
        }
        if flags.confirm_root && entry.role == ChainRole::L2 {
            watchers.push(Arc::new(
                ConfirmRootWatcher::new(ctx.clone(), entry.chain_id, proofs.clone())
                    .map_err(wrap)?,
            ));
        }
    }
    if flags.bond_root {
        watchers.push(Arc::new(BondRootWatcher::new(ctx.clone())));
    }
    if flags.challenge {
        watchers.push(Arc::new(ChallengeWatcher::new(ctx.clone())));
    }
    Ok(watchers)
}
