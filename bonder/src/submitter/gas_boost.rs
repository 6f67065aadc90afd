// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fee escalation for unconfirmed transactions.
//!
//! Every accepted send gets a tracker task. It polls receipts for all hashes
//! sent under the nonce and, once an attempt has waited `boost_interval`,
//! re-sends the same nonce with bumped fees. Fees never exceed the configured
//! ceiling; reaching it raises one alert and the tracker keeps waiting.

use super::broadcaster::TxBroadcaster;
use super::TxStatus;
use crate::config::GasConfig;
use crate::error::{BonderError, ErrorClass};
use crate::metrics::BonderMetrics;
use crate::notifier::{Severity, SharedNotifier};
use crate::store::{BoostAttempt, BoostState, GasBoostTransaction, GasCostSample, StateStore};
use crate::types::{FeeParams, ReceiptInfo};
use crate::utils::{apply_bps, now_secs};
use ethers::types::U256;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polls after a nonce-too-low on re-send before giving the nonce up.
const NONCE_CONSUMED_GRACE_POLLS: u32 = 30;

/// Clamp every fee field to `cap`. Returns the clamped fees and whether any
/// field had to be lowered.
pub fn clamp_fees(fees: &FeeParams, cap: U256) -> (FeeParams, bool) {
    match *fees {
        FeeParams::Legacy { gas_price } => (
            FeeParams::Legacy {
                gas_price: gas_price.min(cap),
            },
            gas_price > cap,
        ),
        FeeParams::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => {
            let max_fee = max_fee_per_gas.min(cap);
            let priority = max_priority_fee_per_gas.min(max_fee);
            (
                FeeParams::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority,
                },
                max_fee_per_gas > cap || max_priority_fee_per_gas > max_fee,
            )
        }
    }
}

/// Fees for the next attempt: the previous fees bumped by `multiplier_bps`,
/// never below the current market suggestion, never above `cap`.
/// Returns None when the previous attempt is already at the cap.
pub fn next_boost_fees(
    current: &FeeParams,
    suggested: &FeeParams,
    multiplier_bps: u64,
    cap: U256,
) -> Option<(FeeParams, bool)> {
    if current.max_price() >= cap {
        return None;
    }
    let bumped = match (*current, *suggested) {
        (
            FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            },
            FeeParams::Eip1559 {
                max_fee_per_gas: market_max,
                max_priority_fee_per_gas: market_priority,
            },
        ) => FeeParams::Eip1559 {
            max_fee_per_gas: apply_bps(max_fee_per_gas, multiplier_bps).max(market_max),
            max_priority_fee_per_gas: apply_bps(max_priority_fee_per_gas, multiplier_bps)
                .max(market_priority),
        },
        (
            FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            },
            FeeParams::Legacy { .. },
        ) => FeeParams::Eip1559 {
            max_fee_per_gas: apply_bps(max_fee_per_gas, multiplier_bps),
            max_priority_fee_per_gas: apply_bps(max_priority_fee_per_gas, multiplier_bps),
        },
        (FeeParams::Legacy { gas_price }, suggested) => FeeParams::Legacy {
            gas_price: apply_bps(gas_price, multiplier_bps).max(suggested.max_price()),
        },
    };
    let (fees, capped) = clamp_fees(&bumped, cap);
    Some((fees, capped || fees.max_price() >= cap))
}

pub(crate) struct BoostTracker {
    pub broadcaster: Arc<dyn TxBroadcaster>,
    pub store: StateStore,
    pub config: GasConfig,
    pub metrics: Arc<BonderMetrics>,
    pub notifier: SharedNotifier,
    pub token: String,
    pub status: watch::Sender<TxStatus>,
    pub cancel: CancellationToken,
}

impl BoostTracker {
    fn chain(&self) -> String {
        self.broadcaster.chain_id().to_string()
    }

    async fn persist(&self, record: &GasBoostTransaction) {
        if let Err(e) = self.store.gas_boost.put(record).await {
            error!(
                "[{}] failed to persist gas boost record {}: {}",
                self.chain(),
                record.key(),
                e
            );
        }
    }

    async fn first_receipt(&self, record: &GasBoostTransaction) -> Option<ReceiptInfo> {
        for hash in record.tx_hashes().iter().rev() {
            match self.broadcaster.receipt(*hash).await {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => {}
                Err(e) => {
                    debug!("[{}] receipt lookup for {:?} failed: {}", self.chain(), hash, e);
                }
            }
        }
        None
    }

    /// Drive `record` to a terminal state or until cancelled.
    pub async fn run(self, mut record: GasBoostTransaction) {
        let chain = self.chain();
        let mut interval = tokio::time::interval(self.config.receipt_poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut nonce_consumed_polls: Option<u32> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("[{}] boost tracker for nonce {} stopped, record stays pending", chain, record.nonce);
                    return;
                }
                _ = interval.tick() => {}
            }

            if let Some(receipt) = self.first_receipt(&record).await {
                self.finish(&mut record, receipt).await;
                return;
            }

            if let Some(polls) = nonce_consumed_polls.as_mut() {
                *polls += 1;
                if *polls >= NONCE_CONSUMED_GRACE_POLLS {
                    let reason = "nonce consumed by another transaction".to_string();
                    warn!("[{}] nonce {} {}", chain, record.nonce, reason);
                    record.state = BoostState::Abandoned {
                        reason: reason.clone(),
                    };
                    self.persist(&record).await;
                    self.notifier
                        .notify(
                            Severity::Warning,
                            "transaction abandoned",
                            &format!(
                                "chain {} nonce {} ({}): {}",
                                chain, record.nonce, record.request.label, reason
                            ),
                        )
                        .await;
                    let _ = self.status.send(TxStatus::Abandoned(reason));
                    return;
                }
                continue;
            }

            let waited = now_secs().saturating_sub(record.last_sent_at().unwrap_or(record.created_at));
            if waited < self.config.boost_interval.as_secs() {
                continue;
            }
            if record.attempts.is_empty() {
                // persisted before the first broadcast went out
                let fees = record.fees;
                self.send_attempt(&mut record, fees, &mut nonce_consumed_polls)
                    .await;
                continue;
            }
            self.boost(&mut record, &mut nonce_consumed_polls).await;
        }
    }

    async fn boost(&self, record: &mut GasBoostTransaction, nonce_consumed: &mut Option<u32>) {
        let chain = self.chain();
        let suggested = match self.broadcaster.suggest_fees().await {
            Ok(fees) => fees,
            Err(e) => {
                debug!("[{}] fee suggestion failed, reusing current fees: {}", chain, e);
                record.fees
            }
        };
        match next_boost_fees(
            &record.fees,
            &suggested,
            self.config.boost_multiplier_bps,
            self.config.max_gas_price,
        ) {
            None => {
                if !record.max_fee_reached {
                    record.max_fee_reached = true;
                    self.persist(record).await;
                    self.max_fee_alert(record).await;
                }
            }
            Some((fees, reached_cap)) => {
                if self.send_attempt(record, fees, nonce_consumed).await {
                    record.boost_count += 1;
                    self.metrics
                        .tx_boosted
                        .with_label_values(&[chain.as_str()])
                        .inc();
                    info!(
                        "[{}] boosted nonce {} ({}) to {} wei, boost #{}",
                        chain,
                        record.nonce,
                        record.request.label,
                        fees.max_price(),
                        record.boost_count
                    );
                    if reached_cap && !record.max_fee_reached {
                        record.max_fee_reached = true;
                        self.max_fee_alert(record).await;
                    }
                    self.persist(record).await;
                    let _ = self.status.send(TxStatus::Pending {
                        tx_hash: record.tx_hashes().last().copied().unwrap_or_default(),
                        boost_count: record.boost_count,
                    });
                }
            }
        }
    }

    /// Broadcast one attempt. Returns true when it was accepted.
    async fn send_attempt(
        &self,
        record: &mut GasBoostTransaction,
        fees: FeeParams,
        nonce_consumed: &mut Option<u32>,
    ) -> bool {
        let chain = self.chain();
        match self
            .broadcaster
            .broadcast(&record.request, record.nonce, &fees)
            .await
        {
            Ok(tx_hash) => {
                record.fees = fees;
                record.attempts.push(BoostAttempt {
                    tx_hash,
                    fees,
                    sent_at: now_secs(),
                });
                self.persist(record).await;
                true
            }
            Err(e) if e.class() == ErrorClass::NonceTooLow => {
                // one of our attempts (or an out of band tx) landed
                debug!(
                    "[{}] nonce {} already used, waiting for receipts",
                    chain, record.nonce
                );
                *nonce_consumed = Some(0);
                false
            }
            Err(e) => {
                warn!(
                    "[{}] re-send of nonce {} ({}) failed: {}",
                    chain, record.nonce, record.request.label, e
                );
                false
            }
        }
    }

    async fn max_fee_alert(&self, record: &GasBoostTransaction) {
        let chain = self.chain();
        self.metrics
            .tx_max_fee_reached
            .with_label_values(&[chain.as_str()])
            .inc();
        warn!(
            "[{}] nonce {} ({}) reached the fee ceiling {}",
            chain, record.nonce, record.request.label, self.config.max_gas_price
        );
        self.notifier
            .notify(
                Severity::Warning,
                "gas ceiling reached",
                &format!(
                    "chain {} nonce {} ({}) is unconfirmed at the max fee {} wei",
                    chain, record.nonce, record.request.label, self.config.max_gas_price
                ),
            )
            .await;
    }

    async fn finish(&self, record: &mut GasBoostTransaction, receipt: ReceiptInfo) {
        let chain = self.chain();
        let label = record.request.label.clone();
        if receipt.success {
            record.state = BoostState::Confirmed {
                tx_hash: receipt.tx_hash,
                block_number: receipt.block_number,
            };
            self.metrics
                .tx_confirmed
                .with_label_values(&[chain.as_str(), label.as_str()])
                .inc();
            info!(
                "[{}] {} confirmed in block {} (nonce {}, tx {:?})",
                chain, label, receipt.block_number, record.nonce, receipt.tx_hash
            );
        } else {
            record.state = BoostState::Reverted {
                tx_hash: receipt.tx_hash,
            };
            self.metrics
                .tx_reverted
                .with_label_values(&[chain.as_str(), label.as_str()])
                .inc();
            warn!(
                "[{}] {} reverted in block {} (nonce {}, tx {:?})",
                chain, label, receipt.block_number, record.nonce, receipt.tx_hash
            );
            self.notifier
                .notify(
                    Severity::Warning,
                    "transaction reverted",
                    &format!("chain {} {} tx {:?}", chain, label, receipt.tx_hash),
                )
                .await;
        }
        self.persist(record).await;

        let sample = GasCostSample {
            chain_id: record.chain_id,
            token: self.token.clone(),
            timestamp: now_secs(),
            variant: label,
            tx_hash: receipt.tx_hash,
            gas_used: receipt.gas_used,
            gas_price: receipt.effective_gas_price,
            gas_cost: receipt.gas_used.saturating_mul(receipt.effective_gas_price),
        };
        if let Err(e) = self.store.gas_cost.add(&sample).await {
            warn!("[{}] failed to record gas cost sample: {}", chain, e);
        }

        let status = if receipt.success {
            TxStatus::Confirmed(receipt)
        } else {
            TxStatus::Reverted(receipt)
        };
        let _ = self.status.send(status);
    }
}

/// Surface a terminal tracker status as a result for callers.
pub(crate) fn status_to_result(status: &TxStatus) -> Option<Result<ReceiptInfo, BonderError>> {
    match status {
        TxStatus::Pending { .. } => None,
        TxStatus::Confirmed(receipt) => Some(Ok(receipt.clone())),
        TxStatus::Reverted(receipt) => Some(Err(BonderError::TxReverted(receipt.tx_hash))),
        TxStatus::Abandoned(reason) => Some(Err(BonderError::InternalError(format!(
            "transaction abandoned: {}",
            reason
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    #[test]
    fn test_boost_never_exceeds_cap() {
        let cap = gwei(100);
        let mut fees = FeeParams::Eip1559 {
            max_fee_per_gas: gwei(10),
            max_priority_fee_per_gas: gwei(1),
        };
        let market = FeeParams::Eip1559 {
            max_fee_per_gas: gwei(5),
            max_priority_fee_per_gas: gwei(1),
        };
        let mut boosts = 0;
        let mut saw_cap = false;
        while let Some((next, capped)) = next_boost_fees(&fees, &market, 11_250, cap) {
            assert!(next.max_price() <= cap);
            assert!(next.max_price() > fees.max_price());
            if let FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } = next
            {
                assert!(max_priority_fee_per_gas <= max_fee_per_gas);
            }
            saw_cap |= capped;
            fees = next;
            boosts += 1;
            assert!(boosts < 100);
        }
        assert!(saw_cap);
        assert_eq!(fees.max_price(), cap);
    }

    #[test]
    fn test_boost_follows_market_when_higher() {
        let fees = FeeParams::Legacy {
            gas_price: gwei(10),
        };
        let market = FeeParams::Legacy {
            gas_price: gwei(30),
        };
        let (next, capped) = next_boost_fees(&fees, &market, 11_250, gwei(100)).unwrap();
        assert_eq!(next.max_price(), gwei(30));
        assert!(!capped);
    }

    #[test]
    fn test_clamp_initial_fees() {
        let fees = FeeParams::Eip1559 {
            max_fee_per_gas: gwei(300),
            max_priority_fee_per_gas: gwei(200),
        };
        let (clamped, lowered) = clamp_fees(&fees, gwei(150));
        assert!(lowered);
        assert_eq!(
            clamped,
            FeeParams::Eip1559 {
                max_fee_per_gas: gwei(150),
                max_priority_fee_per_gas: gwei(150),
            }
        );
    }
}
