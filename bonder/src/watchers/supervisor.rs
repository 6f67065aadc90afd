// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{run_watcher, Outcome, Watcher};
use crate::error::{BonderError, BonderResult};
use crate::types::{RootHash, TransferId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<BonderResult<()>>,
}

/// Owns every watcher of the node. Watchers run independently; a failing
/// one never takes its siblings down.
pub struct WatcherSupervisor {
    watchers: BTreeMap<String, Arc<dyn Watcher>>,
    running: Mutex<BTreeMap<String, Running>>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl WatcherSupervisor {
    pub fn new(poll_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            watchers: BTreeMap::new(),
            running: Mutex::new(BTreeMap::new()),
            poll_interval,
            cancel,
        }
    }

    /// Register under `<name>:<chain id>`.
    pub fn register(&mut self, watcher: Arc<dyn Watcher>) -> BonderResult<String> {
        let key = format!("{}:{}", watcher.name(), watcher.chain_id());
        if self.watchers.insert(key.clone(), watcher).is_some() {
            return Err(BonderError::ConfigError(format!(
                "watcher {} registered twice",
                key
            )));
        }
        Ok(key)
    }

    pub fn names(&self) -> Vec<String> {
        self.watchers.keys().cloned().collect()
    }

    fn running(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Running>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.running()
            .get(key)
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn start(&self, key: &str) -> BonderResult<()> {
        let watcher = self
            .watchers
            .get(key)
            .cloned()
            .ok_or_else(|| BonderError::Generic(format!("unknown watcher {}", key)))?;
        let mut running = self.running();
        if running.get(key).map(|r| !r.handle.is_finished()).unwrap_or(false) {
            return Ok(());
        }
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(run_watcher(watcher, self.poll_interval, cancel.clone()));
        running.insert(key.to_string(), Running { cancel, handle });
        Ok(())
    }

    pub fn start_all(&self) -> BonderResult<()> {
        for key in self.watchers.keys() {
            self.start(key)?;
        }
        info!("Started {} watchers", self.watchers.len());
        Ok(())
    }

    /// Stop one watcher and wait for its loop to exit.
    pub async fn stop(&self, key: &str) -> BonderResult<()> {
        let Some(running) = self.running().remove(key) else {
            return Ok(());
        };
        running.cancel.cancel();
        match running.handle.await {
            Ok(result) => result,
            Err(e) => Err(BonderError::InternalError(format!(
                "watcher {} panicked: {}",
                key, e
            ))),
        }
    }

    /// Cancel everything and wait for every loop to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let running = std::mem::take(&mut *self.running());
        for (key, running) in running {
            match running.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Watcher {} ended with error: {}", key, e),
                Err(e) => error!("Watcher {} panicked: {}", key, e),
            }
        }
    }

    /// Run every watcher's decision for one transfer now, outside the poll
    /// loop. Watchers it does not concern are left out.
    pub async fn force_check_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Vec<(String, BonderResult<Outcome>)> {
        let mut outcomes = vec![];
        for (key, watcher) in &self.watchers {
            let result = watcher.check_transfer(transfer_id).await;
            if result != Ok(Outcome::NotApplicable) {
                outcomes.push((key.clone(), result));
            }
        }
        outcomes
    }

    pub async fn force_check_root(&self, root_hash: RootHash) -> Vec<(String, BonderResult<Outcome>)> {
        let mut outcomes = vec![];
        for (key, watcher) in &self.watchers {
            let result = watcher.check_root(root_hash).await;
            if result != Ok(Outcome::NotApplicable) {
                outcomes.push((key.clone(), result));
            }
        }
        outcomes
    }
}
