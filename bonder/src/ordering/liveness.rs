// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::HeartbeatMessage;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub declared_order: u32,
    pub last_seen: Instant,
}

/// Last heartbeat of every peer this instance has heard from.
#[derive(Debug)]
pub struct LivenessTable {
    hostname: String,
    declared_order: u32,
    timeout: Duration,
    peers: HashMap<String, PeerStatus>,
}

impl LivenessTable {
    pub fn new(hostname: &str, declared_order: u32, timeout: Duration) -> Self {
        Self {
            hostname: hostname.to_string(),
            declared_order,
            timeout,
            peers: HashMap::new(),
        }
    }

    /// Record a heartbeat. Our own messages are ignored.
    pub fn observe(&mut self, message: &HeartbeatMessage, at: Instant) {
        if message.hostname == self.hostname {
            return;
        }
        self.peers.insert(
            message.hostname.clone(),
            PeerStatus {
                declared_order: message.declared_order,
                last_seen: at,
            },
        );
    }

    pub fn is_up(&self, hostname: &str, now: Instant) -> bool {
        self.peers
            .get(hostname)
            .map(|p| now.saturating_duration_since(p.last_seen) <= self.timeout)
            .unwrap_or(false)
    }

    pub fn live_peers(&self, now: Instant) -> usize {
        self.peers
            .keys()
            .filter(|hostname| self.is_up(hostname, now))
            .count()
    }

    /// Declared order minus one for every lower ranked peer that was seen
    /// and has since gone silent. Peers never heard from do not promote us.
    pub fn effective_order(&self, now: Instant) -> u32 {
        let down = self
            .peers
            .iter()
            .filter(|(hostname, peer)| {
                peer.declared_order < self.declared_order && !self.is_up(hostname, now)
            })
            .count() as u32;
        self.declared_order.saturating_sub(down)
    }
}
