// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::types::{H256, U256};

/// Coarse grouping of errors that decides how callers react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// RPC timeouts, rate limits, dropped connections. Retried on the next tick.
    Transient,
    /// Expected control flow such as a faster peer having acted already.
    Cancellation,
    /// A configured guard rejected the action; nothing was changed.
    DomainGuard,
    /// The chain already holds a transaction at our tracked nonce.
    NonceTooLow,
    /// Stored data contradicts what the chain reports.
    Invariant,
    /// Startup cannot proceed.
    Fatal,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BonderError {
    // Transient provider error (timeout, connection reset)
    TransientProviderError(String),
    // Provider asked us to slow down
    RateLimited(String),
    // Non-transient provider error
    ProviderError(String),
    // Another bonder (or an earlier attempt) already performed the action
    AlreadyHandled(String),
    // Stop flag observed while waiting
    Cancelled,
    // Available credit does not cover the action
    InsufficientCredit { available: U256, required: U256 },
    // Transfer amount outside configured bondable range
    AmountOutOfBounds(String),
    // Bonder fee below the configured minimum
    BonderFeeTooLow(String),
    // Root was confirmed on L1, bonding against it is pointless
    RootAlreadyConfirmed(H256),
    // Provider rejected the send because the nonce was already used
    NonceTooLow { nonce: u64 },
    // Replacement transaction did not bump fees enough
    ReplacementUnderpriced(String),
    // Transaction mined with status 0
    TxReverted(H256),
    // Stored transfer ids do not reproduce the observed root
    MerkleRootMismatch { expected: H256, computed: H256 },
    // Required linkage field is absent on a stored entity
    MissingLinkage(String),
    // Settled bonds of a root add up to more than its total
    OverSettled { settled: U256, total: U256 },
    // Call not supported on a chain with this role
    InvalidCall(String),
    // Unknown chain id
    UnknownChain(u64),
    // Storage Error
    StorageError(String),
    // Failure to serialize or deserialize a record
    SerializationError(String),
    // Invalid configuration
    ConfigError(String),
    // Internal bonder error
    InternalError(String),
    // Uncategorized error
    Generic(String),
}

impl BonderError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            BonderError::TransientProviderError(_) => "transient_provider_error",
            BonderError::RateLimited(_) => "rate_limited",
            BonderError::ProviderError(_) => "provider_error",
            BonderError::AlreadyHandled(_) => "already_handled",
            BonderError::Cancelled => "cancelled",
            BonderError::InsufficientCredit { .. } => "insufficient_credit",
            BonderError::AmountOutOfBounds(_) => "amount_out_of_bounds",
            BonderError::BonderFeeTooLow(_) => "bonder_fee_too_low",
            BonderError::RootAlreadyConfirmed(_) => "root_already_confirmed",
            BonderError::NonceTooLow { .. } => "nonce_too_low",
            BonderError::ReplacementUnderpriced(_) => "replacement_underpriced",
            BonderError::TxReverted(_) => "tx_reverted",
            BonderError::MerkleRootMismatch { .. } => "merkle_root_mismatch",
            BonderError::MissingLinkage(_) => "missing_linkage",
            BonderError::OverSettled { .. } => "over_settled",
            BonderError::InvalidCall(_) => "invalid_call",
            BonderError::UnknownChain(_) => "unknown_chain",
            BonderError::StorageError(_) => "storage_error",
            BonderError::SerializationError(_) => "serialization_error",
            BonderError::ConfigError(_) => "config_error",
            BonderError::InternalError(_) => "internal_error",
            BonderError::Generic(_) => "generic",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            BonderError::TransientProviderError(_)
            | BonderError::RateLimited(_)
            | BonderError::ReplacementUnderpriced(_) => ErrorClass::Transient,
            BonderError::AlreadyHandled(_) | BonderError::Cancelled => ErrorClass::Cancellation,
            BonderError::InsufficientCredit { .. }
            | BonderError::AmountOutOfBounds(_)
            | BonderError::BonderFeeTooLow(_)
            | BonderError::RootAlreadyConfirmed(_) => ErrorClass::DomainGuard,
            BonderError::NonceTooLow { .. } => ErrorClass::NonceTooLow,
            BonderError::MerkleRootMismatch { .. }
            | BonderError::MissingLinkage(_)
            | BonderError::OverSettled { .. } => ErrorClass::Invariant,
            BonderError::ConfigError(_) => ErrorClass::Fatal,
            _ => ErrorClass::Other,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, BonderError::RateLimited(_))
    }

    /// Classify a raw provider/contract error message.
    pub fn from_provider_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("rate limit")
            || lower.contains("429")
            || lower.contains("too many requests")
            || lower.contains("-32005")
        {
            BonderError::RateLimited(message)
        } else if lower.contains("nonce too low") || lower.contains("nonce has already been used") {
            BonderError::NonceTooLow { nonce: 0 }
        } else if lower.contains("replacement transaction underpriced")
            || lower.contains("fee too low")
        {
            BonderError::ReplacementUnderpriced(message)
        } else if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection reset")
            || lower.contains("connection refused")
            || lower.contains("error sending request")
            || lower.contains("bad gateway")
            || lower.contains("503")
        {
            BonderError::TransientProviderError(message)
        } else {
            BonderError::ProviderError(message)
        }
    }
}

impl std::fmt::Display for BonderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BonderError::InsufficientCredit {
                available,
                required,
            } => write!(
                f,
                "insufficient credit: available {}, required {}",
                available, required
            ),
            BonderError::MerkleRootMismatch { expected, computed } => write!(
                f,
                "merkle root mismatch: expected {:?}, computed {:?}",
                expected, computed
            ),
            BonderError::NonceTooLow { nonce } => write!(f, "nonce too low: {}", nonce),
            other => write!(f, "{:?}", other),
        }
    }
}

impl<E> From<E> for BonderError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::from_provider_message(format!("{:#}", err.into()))
    }
}

pub type BonderResult<T> = Result<T, BonderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_valid_prometheus_labels() {
        let errors_to_test = vec![
            BonderError::TransientProviderError("test".to_string()),
            BonderError::AlreadyHandled("0x01".to_string()),
            BonderError::InsufficientCredit {
                available: U256::from(5),
                required: U256::from(10),
            },
            BonderError::NonceTooLow { nonce: 7 },
            BonderError::MerkleRootMismatch {
                expected: H256::zero(),
                computed: H256::repeat_byte(1),
            },
            BonderError::Cancelled,
        ];

        for error in errors_to_test {
            let error_type = error.error_type();
            assert!(!error_type.is_empty());
            for c in error_type.chars() {
                assert!(
                    c.is_ascii_lowercase() || c == '_',
                    "error_type '{}' contains invalid character '{}' for Prometheus label",
                    error_type,
                    c
                );
            }
            assert!(!error_type.starts_with('_'));
            assert!(!error_type.ends_with('_'));
        }
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            BonderError::RateLimited("429".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            BonderError::AlreadyHandled("x".into()).class(),
            ErrorClass::Cancellation
        );
        assert_eq!(
            BonderError::RootAlreadyConfirmed(H256::zero()).class(),
            ErrorClass::DomainGuard
        );
        assert_eq!(
            BonderError::MissingLinkage("root".into()).class(),
            ErrorClass::Invariant
        );
        assert_eq!(
            BonderError::ConfigError("bad".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            BonderError::NonceTooLow { nonce: 1 }.class(),
            ErrorClass::NonceTooLow
        );
    }

    #[test]
    fn test_provider_message_classification() {
        assert!(BonderError::from_provider_message("HTTP 429 Too Many Requests").is_rate_limit());
        assert_eq!(
            BonderError::from_provider_message("(code: -32000, message: nonce too low)"),
            BonderError::NonceTooLow { nonce: 0 }
        );
        assert!(BonderError::from_provider_message("request timed out").is_transient());
        assert!(matches!(
            BonderError::from_provider_message("execution reverted: L2_BRG: bad"),
            BonderError::ProviderError(_)
        ));
    }

    #[test]
    fn test_from_anyhow() {
        let err: BonderError = anyhow::anyhow!("connection reset by peer").into();
        assert!(err.is_transient());
    }
}
