// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

/// Next nonce of one signer. Only the submitter task owns an instance.
#[derive(Debug, Default, Clone)]
pub struct NonceTracker {
    next: Option<u64>,
}

/// Result of comparing the tracked nonce with the provider's pending count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceDrift {
    InSync,
    /// The provider has seen more transactions than we sent.
    Ahead { tracked: u64, provider: u64 },
    /// Transactions we sent are missing from the provider's view.
    Behind { tracked: u64, provider: u64 },
}

impl NonceTracker {
    pub fn new() -> Self {
        Self { next: None }
    }

    pub fn is_seeded(&self) -> bool {
        self.next.is_some()
    }

    /// Seed from the provider's pending count and the highest nonce we persisted.
    pub fn seed(&mut self, provider_pending: u64, highest_persisted: Option<u64>) -> u64 {
        let from_store = highest_persisted.map(|n| n + 1).unwrap_or(0);
        let next = provider_pending.max(from_store);
        self.next = Some(next);
        next
    }

    pub fn peek(&self) -> Option<u64> {
        self.next
    }

    /// Record that `nonce` is used on chain, either by us or out of band.
    pub fn consumed(&mut self, nonce: u64) {
        let next = self.next.unwrap_or(0).max(nonce + 1);
        self.next = Some(next);
    }

    pub fn check_drift(&self, provider_pending: u64) -> NonceDrift {
        match self.next {
            None => NonceDrift::InSync,
            Some(tracked) if provider_pending > tracked => NonceDrift::Ahead {
                tracked,
                provider: provider_pending,
            },
            Some(tracked) if provider_pending < tracked => NonceDrift::Behind {
                tracked,
                provider: provider_pending,
            },
            Some(_) => NonceDrift::InSync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_prefers_highest_source() {
        let mut tracker = NonceTracker::new();
        assert!(!tracker.is_seeded());
        assert_eq!(tracker.seed(5, None), 5);
        assert_eq!(tracker.seed(5, Some(9)), 10);
        assert_eq!(tracker.seed(12, Some(9)), 12);
    }

    #[test]
    fn test_consumed_never_moves_backwards() {
        let mut tracker = NonceTracker::new();
        tracker.seed(7, None);
        tracker.consumed(7);
        assert_eq!(tracker.peek(), Some(8));
        tracker.consumed(3);
        assert_eq!(tracker.peek(), Some(8));
    }

    #[test]
    fn test_drift() {
        let mut tracker = NonceTracker::new();
        assert_eq!(tracker.check_drift(4), NonceDrift::InSync);
        tracker.seed(4, None);
        assert_eq!(tracker.check_drift(4), NonceDrift::InSync);
        assert_eq!(
            tracker.check_drift(6),
            NonceDrift::Ahead {
                tracked: 4,
                provider: 6
            }
        );
        assert_eq!(
            tracker.check_drift(2),
            NonceDrift::Behind {
                tracked: 4,
                provider: 2
            }
        );
    }
}
