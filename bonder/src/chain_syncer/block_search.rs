// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::BonderResult;
use crate::gateway::BridgeContract;
use tracing::info;

/// First block in `[low, head]` whose timestamp is at or after `timestamp`.
/// Returns the head when every block is older.
pub async fn block_at_or_after(
    bridge: &dyn BridgeContract,
    timestamp: u64,
    low: u64,
) -> BonderResult<u64> {
    let head = bridge.latest_block().await?;
    if low >= head || bridge.block_timestamp(head).await? < timestamp {
        return Ok(head.max(low));
    }
    let (mut lo, mut hi) = (low, head);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if bridge.block_timestamp(mid).await? < timestamp {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Block a fresh syncer starts at: the deployment block, or the first block
/// at `sync_from_timestamp` when that is later.
pub async fn resolve_start_block(
    bridge: &dyn BridgeContract,
    deployment_block: u64,
    sync_from_timestamp: Option<u64>,
) -> BonderResult<u64> {
    let Some(timestamp) = sync_from_timestamp else {
        return Ok(deployment_block);
    };
    let block = block_at_or_after(bridge, timestamp, deployment_block).await?;
    info!(
        "[{}] Timestamp {} resolves to block {}",
        bridge.chain_id(),
        timestamp,
        block
    );
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockBridge;
    use crate::types::{ChainId, ChainRole};

    #[tokio::test]
    async fn test_binary_search_by_timestamp() {
        // block n has timestamp n * 12
        let bridge = MockBridge::new(ChainId(1), ChainRole::L1);
        bridge.set_head(1000);
        assert_eq!(block_at_or_after(&bridge, 120, 0).await.unwrap(), 10);
        assert_eq!(block_at_or_after(&bridge, 121, 0).await.unwrap(), 11);
        assert_eq!(block_at_or_after(&bridge, 0, 0).await.unwrap(), 0);
        assert_eq!(block_at_or_after(&bridge, 1_000_000, 0).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_start_block_never_before_deployment() {
        let bridge = MockBridge::new(ChainId(1), ChainRole::L1);
        bridge.set_head(1000);
        assert_eq!(resolve_start_block(&bridge, 300, None).await.unwrap(), 300);
        assert_eq!(
            resolve_start_block(&bridge, 300, Some(120)).await.unwrap(),
            300
        );
        assert_eq!(
            resolve_start_block(&bridge, 300, Some(12 * 500)).await.unwrap(),
            500
        );
    }
}
