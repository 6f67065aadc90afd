// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::BonderResult;
use crate::watchers::{Outcome, WatcherSupervisor};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use ethers::types::H256;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};

pub const HEALTH_PATH: &str = "/health";
pub const METRICS_PATH: &str = "/metrics";
pub const WATCHERS_PATH: &str = "/watchers";
// Note: axum 0.7.x path parameter syntax
pub const CHECK_TRANSFER_PATH: &str = "/check/transfer/:transfer_id";
pub const CHECK_ROOT_PATH: &str = "/check/root/:root_hash";

type ServerState = (Registry, Arc<WatcherSupervisor>);

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct WatcherStatus {
    pub name: String,
    pub running: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CheckResult {
    pub watcher: String,
    pub outcome: String,
    pub detail: String,
}

impl CheckResult {
    fn new(watcher: String, result: BonderResult<Outcome>) -> Self {
        match result {
            Ok(outcome) => Self {
                watcher,
                outcome: outcome.as_str().to_string(),
                detail: format!("{:?}", outcome),
            },
            Err(e) => Self {
                watcher,
                outcome: e.error_type().to_string(),
                detail: e.to_string(),
            },
        }
    }
}

pub fn run_server(
    socket_address: &SocketAddr,
    registry: Registry,
    supervisor: Arc<WatcherSupervisor>,
) -> tokio::task::JoinHandle<()> {
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(socket_address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server to {}: {}", socket_address, e);
                return;
            }
        };
        info!("Metrics server listening on {}", socket_address);
        if let Err(e) = axum::serve(
            listener,
            make_router(registry, supervisor).into_make_service(),
        )
        .await
        {
            error!("Metrics server stopped: {}", e);
        }
    })
}

pub(crate) fn make_router(registry: Registry, supervisor: Arc<WatcherSupervisor>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route(HEALTH_PATH, get(health_check))
        .route(METRICS_PATH, get(metrics))
        .route(WATCHERS_PATH, get(watchers))
        .route(CHECK_TRANSFER_PATH, post(check_transfer))
        .route(CHECK_ROOT_PATH, post(check_root))
        .with_state((registry, supervisor))
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State((registry, _)): State<ServerState>) -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn watchers(State((_, supervisor)): State<ServerState>) -> Json<Vec<WatcherStatus>> {
    Json(
        supervisor
            .names()
            .into_iter()
            .map(|name| WatcherStatus {
                running: supervisor.is_running(&name),
                name,
            })
            .collect(),
    )
}

fn parse_hash(raw: &str) -> Result<H256, (StatusCode, String)> {
    H256::from_str(raw).map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid hash {}: {}", raw, e)))
}

async fn check_transfer(
    Path(transfer_id): Path<String>,
    State((_, supervisor)): State<ServerState>,
) -> Result<Json<Vec<CheckResult>>, (StatusCode, String)> {
    let transfer_id = parse_hash(&transfer_id)?;
    info!("Forced check of transfer {:?}", transfer_id);
    let results = supervisor.force_check_transfer(transfer_id).await;
    Ok(Json(
        results
            .into_iter()
            .map(|(watcher, result)| CheckResult::new(watcher, result))
            .collect(),
    ))
}

async fn check_root(
    Path(root_hash): Path<String>,
    State((_, supervisor)): State<ServerState>,
) -> Result<Json<Vec<CheckResult>>, (StatusCode, String)> {
    let root_hash = parse_hash(&root_hash)?;
    info!("Forced check of root {:?}", root_hash);
    let results = supervisor.force_check_root(root_hash).await;
    Ok(Json(
        results
            .into_iter()
            .map(|(watcher, result)| CheckResult::new(watcher, result))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BonderError;
    use crate::metrics::BonderMetrics;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn state() -> ServerState {
        let registry = Registry::new();
        let supervisor = WatcherSupervisor::new(Duration::from_secs(1), CancellationToken::new());
        (registry, Arc::new(supervisor))
    }

    #[tokio::test]
    async fn test_metrics_are_rendered_as_text() {
        let (registry, supervisor) = state();
        let metrics = BonderMetrics::new(&registry);
        metrics.uptime_seconds.set(42);

        let (status, body) = super::metrics(State((registry, supervisor))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("bonder_uptime_seconds 42"));
    }

    #[tokio::test]
    async fn test_bad_hash_is_rejected() {
        let (registry, supervisor) = state();
        let err = check_root(Path("0x1234".to_string()), State((registry, supervisor)))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_check_results_carry_error_type() {
        let result = CheckResult::new(
            "bond_withdrawal:10".into(),
            Err(BonderError::AlreadyHandled("bond 0x12".into())),
        );
        assert_eq!(result.watcher, "bond_withdrawal:10");
        assert_eq!(result.outcome, BonderError::AlreadyHandled(String::new()).error_type());

        let result = CheckResult::new("commit:10".into(), Ok(Outcome::NotDue("below threshold".into())));
        assert_eq!(result.outcome, "not_due");
        assert!(result.detail.contains("below threshold"));
    }
}
