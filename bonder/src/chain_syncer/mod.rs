// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Chain Syncer Module
//!
//! Replays bridge events of one deployment into an [`EventHandler`].
//!
//! ```text
//!   cursor ──▶ [from, from + max_block_range) ──▶ get_logs ──▶ sort by (block, log)
//!                                                               │
//!                   advance cursor ◀── all handled ◀── handler ◀┘
//! ```
//!
//! Handlers only ever see events in block/log order, and a window is either
//! fully handled or replayed from its first event.

mod block_search;
mod config;
mod syncer;

pub use block_search::*;
pub use config::*;
pub use syncer::*;
