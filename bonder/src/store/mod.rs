// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable bonder state.
//!
//! Every entity lives in its own namespace of a [`KvBackend`]. Writers send
//! partial records that are merged into what is stored, so replaying the same
//! update is harmless. Each field has a single owning writer; there are no
//! multi-key transactions.

mod backend;
mod gas_boost;
mod gas_cost;
mod indexes;
mod sync_state;
mod transfer_roots;
mod transfers;

pub use backend::*;
pub use gas_boost::*;
pub use gas_cost::*;
pub use indexes::InFlightBond;
pub use sync_state::*;
pub use transfer_roots::*;
pub use transfers::*;

use crate::error::{BonderError, BonderResult};
use ethers::types::H256;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

pub const TRANSFERS_NAMESPACE: &str = "transfers";
pub const TRANSFER_ROOTS_NAMESPACE: &str = "transfer_roots";
pub const SYNC_STATE_NAMESPACE: &str = "sync_state";
pub const GAS_BOOST_NAMESPACE: &str = "gas_boost";
pub const GAS_COST_NAMESPACE: &str = "gas_cost";
pub const INDEX_NAMESPACE: &str = "index";

pub(crate) fn hex_key(hash: &H256) -> String {
    format!("{:#x}", hash)
}

pub(crate) fn to_value<T: Serialize>(value: &T) -> BonderResult<Value> {
    serde_json::to_value(value).map_err(|e| BonderError::SerializationError(e.to_string()))
}

pub(crate) fn from_value<T: DeserializeOwned>(value: Value) -> BonderResult<T> {
    serde_json::from_value(value).map_err(|e| BonderError::SerializationError(e.to_string()))
}

#[derive(Clone)]
pub struct StateStore {
    pub transfers: TransfersDb,
    pub transfer_roots: TransferRootsDb,
    pub sync_state: SyncStateDb,
    pub gas_boost: GasBoostDb,
    pub gas_cost: GasCostDb,
}

impl StateStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            transfers: TransfersDb::new(backend.clone()),
            transfer_roots: TransferRootsDb::new(backend.clone()),
            sync_state: SyncStateDb::new(backend.clone()),
            gas_boost: GasBoostDb::new(backend.clone()),
            gas_cost: GasCostDb::new(backend),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn open_sqlite(path: impl AsRef<Path>) -> BonderResult<Self> {
        Ok(Self::new(Arc::new(SqliteBackend::open(path)?)))
    }
}
