//! # Design
//!
//! - Provide structured, constant-message errors for the pipeline core.
//! - Capture operation context (statuses, identifiers, missing fields) so
//!   failures are reproducible in tests.
//! - Preserve source errors without interpolating context into messages.

use fetcharr_events::ItemStatus;
use thiserror::Error;
use uuid::Uuid;

use crate::validation::ValidationPhase;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors produced by the pipeline core.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The attempted edge does not exist in the state machine.
    #[error("invalid status transition")]
    InvalidTransition {
        /// Status the item currently holds.
        from: ItemStatus,
        /// Status the caller attempted to move to.
        to: ItemStatus,
    },
    /// Entry or exit preconditions were not met for the transition.
    #[error("transition validation failed")]
    ValidationFailed {
        /// Whether entry or exit validation rejected the transition.
        phase: ValidationPhase,
        /// Status whose preconditions were violated.
        status: ItemStatus,
        /// Human-readable missing-field messages.
        errors: Vec<String>,
    },
    /// The referenced item does not exist.
    #[error("item not found")]
    ItemNotFound {
        /// Identifier that failed to resolve.
        id: Uuid,
    },
    /// The referenced request does not exist.
    #[error("request not found")]
    RequestNotFound {
        /// Identifier that failed to resolve.
        id: Uuid,
    },
    /// The operation is not permitted on a terminal item.
    #[error("item is terminal")]
    TerminalStatus {
        /// Item the operation targeted.
        id: Uuid,
        /// Terminal status the item holds.
        status: ItemStatus,
    },
    /// Manual retry was requested for an item that has not failed.
    #[error("retry requires a failed item")]
    RetryFromNonFailed {
        /// Item the retry targeted.
        id: Uuid,
        /// Status the item holds instead of `failed`.
        status: ItemStatus,
    },
    /// A concurrent writer updated the item first.
    #[error("concurrent item update")]
    Conflict {
        /// Item whose optimistic update lost the race.
        id: Uuid,
    },
    /// The persistent store failed.
    #[error("store failure")]
    Store {
        /// Underlying store error.
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Wrap a store-layer failure.
    #[must_use]
    pub fn store(source: impl Into<anyhow::Error>) -> Self {
        Self::Store {
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn store_errors_preserve_their_source() {
        let err = PipelineError::store(anyhow::anyhow!("connection reset"));
        assert!(matches!(err, PipelineError::Store { .. }));
        assert!(err.source().is_some());
    }

    #[test]
    fn validation_errors_carry_missing_fields() {
        let err = PipelineError::ValidationFailed {
            phase: ValidationPhase::Entry,
            status: ItemStatus::Encoded,
            errors: vec!["Encoded file path required for encoded state".to_string()],
        };
        if let PipelineError::ValidationFailed { errors, .. } = &err {
            assert_eq!(errors.len(), 1);
        } else {
            panic!("expected validation variant");
        }
    }
}
