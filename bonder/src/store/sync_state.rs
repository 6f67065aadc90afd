// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{from_value, to_value, KvBackend, SYNC_STATE_NAMESPACE};
use crate::error::BonderResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Last fully processed block for one sync stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub key: String,
    pub block_number: u64,
    pub updated_at: u64,
}

#[derive(Clone)]
pub struct SyncStateDb {
    backend: Arc<dyn KvBackend>,
}

impl SyncStateDb {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub async fn get(&self, key: &str) -> BonderResult<Option<SyncCursor>> {
        self.backend
            .get(SYNC_STATE_NAMESPACE, key)
            .await?
            .map(from_value)
            .transpose()
    }

    /// Move the cursor forward. Returns false when `block_number` is not ahead.
    pub async fn advance(&self, key: &str, block_number: u64, now: u64) -> BonderResult<bool> {
        if let Some(current) = self.get(key).await? {
            if current.block_number >= block_number {
                return Ok(false);
            }
        }
        let cursor = SyncCursor {
            key: key.to_string(),
            block_number,
            updated_at: now,
        };
        self.backend
            .put(SYNC_STATE_NAMESPACE, key, to_value(&cursor)?)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::StateStore;

    #[tokio::test]
    async fn test_cursor_only_moves_forward() {
        let store = StateStore::in_memory();
        assert!(store.sync_state.advance("10:bridge", 100, 1).await.unwrap());
        assert!(!store.sync_state.advance("10:bridge", 90, 2).await.unwrap());
        assert!(!store.sync_state.advance("10:bridge", 100, 3).await.unwrap());
        assert!(store.sync_state.advance("10:bridge", 101, 4).await.unwrap());
        let cursor = store.sync_state.get("10:bridge").await.unwrap().unwrap();
        assert_eq!(cursor.block_number, 101);
    }
}
