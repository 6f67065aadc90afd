// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, HistogramVec,
    IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

const FINE_GRAINED_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.15, 0.2, 0.25, 0.3, 0.35, 0.4, 0.45, 0.5, 0.6, 0.7, 0.8, 0.9,
    1.0, 1.2, 1.4, 1.6, 1.8, 2.0, 2.5, 3.0, 3.5, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10., 15., 20., 25.,
    30., 40., 50., 60., 90., 120.,
];

#[derive(Clone, Debug)]
pub struct BonderMetrics {
    pub(crate) rpc_queries: IntCounterVec,
    pub(crate) rpc_queries_latency: HistogramVec,
    pub(crate) rpc_rate_limited: IntCounterVec,
    pub(crate) rpc_node_connected: IntGaugeVec,

    pub(crate) chain_head: IntGaugeVec,
    pub(crate) last_synced_block: IntGaugeVec,
    pub(crate) handled_events: IntCounterVec,
    pub(crate) sync_window_failures: IntCounterVec,
    pub(crate) sync_handler_stops: IntCounterVec,

    pub(crate) watcher_outcomes: IntCounterVec,
    pub(crate) watcher_errors: IntCounterVec,
    pub(crate) invariant_violations: IntCounterVec,

    pub(crate) tx_submitted: IntCounterVec,
    pub(crate) tx_confirmed: IntCounterVec,
    pub(crate) tx_reverted: IntCounterVec,
    pub(crate) tx_boosted: IntCounterVec,
    pub(crate) tx_max_fee_reached: IntCounterVec,
    pub(crate) tracked_nonce: IntGaugeVec,
    pub(crate) nonce_drift: IntCounterVec,

    pub(crate) effective_order: IntGauge,
    pub(crate) live_peers: IntGauge,
    pub(crate) uptime_seconds: IntGauge,
}

impl BonderMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            rpc_queries: register_int_counter_vec_with_registry!(
                "bonder_rpc_queries",
                "Total number of JSON-RPC queries by chain and method",
                &["chain", "method"],
                registry,
            )
            .unwrap(),
            rpc_queries_latency: register_histogram_vec_with_registry!(
                "bonder_rpc_queries_latency",
                "Latency of JSON-RPC queries by chain and method",
                &["chain", "method"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            rpc_rate_limited: register_int_counter_vec_with_registry!(
                "bonder_rpc_rate_limited",
                "Total number of rate limited JSON-RPC responses",
                &["chain"],
                registry,
            )
            .unwrap(),
            rpc_node_connected: register_int_gauge_vec_with_registry!(
                "bonder_rpc_node_connected",
                "Whether the last JSON-RPC request to the chain succeeded",
                &["chain"],
                registry,
            )
            .unwrap(),
            chain_head: register_int_gauge_vec_with_registry!(
                "bonder_chain_head",
                "Latest block number observed per chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            last_synced_block: register_int_gauge_vec_with_registry!(
                "bonder_last_synced_block",
                "Last block fully processed per sync cursor",
                &["chain", "cursor"],
                registry,
            )
            .unwrap(),
            handled_events: register_int_counter_vec_with_registry!(
                "bonder_handled_events",
                "Total number of bridge events applied to the state store",
                &["chain", "event"],
                registry,
            )
            .unwrap(),
            sync_window_failures: register_int_counter_vec_with_registry!(
                "bonder_sync_window_failures",
                "Total number of sync windows that had to be retried",
                &["chain"],
                registry,
            )
            .unwrap(),
            sync_handler_stops: register_int_counter_vec_with_registry!(
                "bonder_sync_handler_stops",
                "Total number of sync passes a handler ended before the window's end",
                &["chain"],
                registry,
            )
            .unwrap(),
            watcher_outcomes: register_int_counter_vec_with_registry!(
                "bonder_watcher_outcomes",
                "Watcher decisions by watcher, chain and outcome",
                &["watcher", "chain", "outcome"],
                registry,
            )
            .unwrap(),
            watcher_errors: register_int_counter_vec_with_registry!(
                "bonder_watcher_errors",
                "Errors raised inside watcher polls by error type",
                &["watcher", "error_type"],
                registry,
            )
            .unwrap(),
            invariant_violations: register_int_counter_vec_with_registry!(
                "bonder_invariant_violations",
                "Stored data contradicting on-chain state",
                &["kind"],
                registry,
            )
            .unwrap(),
            tx_submitted: register_int_counter_vec_with_registry!(
                "bonder_tx_submitted",
                "Total number of transactions broadcast (first attempt only)",
                &["chain", "call"],
                registry,
            )
            .unwrap(),
            tx_confirmed: register_int_counter_vec_with_registry!(
                "bonder_tx_confirmed",
                "Total number of transactions confirmed successfully",
                &["chain", "call"],
                registry,
            )
            .unwrap(),
            tx_reverted: register_int_counter_vec_with_registry!(
                "bonder_tx_reverted",
                "Total number of transactions mined with failure status",
                &["chain", "call"],
                registry,
            )
            .unwrap(),
            tx_boosted: register_int_counter_vec_with_registry!(
                "bonder_tx_boosted",
                "Total number of fee bumps",
                &["chain"],
                registry,
            )
            .unwrap(),
            tx_max_fee_reached: register_int_counter_vec_with_registry!(
                "bonder_tx_max_fee_reached",
                "Total number of transactions that hit the fee ceiling",
                &["chain"],
                registry,
            )
            .unwrap(),
            tracked_nonce: register_int_gauge_vec_with_registry!(
                "bonder_tracked_nonce",
                "Next nonce the submitter will assign",
                &["chain"],
                registry,
            )
            .unwrap(),
            nonce_drift: register_int_counter_vec_with_registry!(
                "bonder_nonce_drift",
                "Reconciliations where the provider nonce disagreed with the tracked one",
                &["chain"],
                registry,
            )
            .unwrap(),
            effective_order: register_int_gauge_with_registry!(
                "bonder_effective_order",
                "Current effective order of this instance",
                registry,
            )
            .unwrap(),
            live_peers: register_int_gauge_with_registry!(
                "bonder_live_peers",
                "Number of peer instances currently considered up",
                registry,
            )
            .unwrap(),
            uptime_seconds: register_int_gauge_with_registry!(
                "bonder_uptime_seconds",
                "Bonder node uptime in seconds",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
