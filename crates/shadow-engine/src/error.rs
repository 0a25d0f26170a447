//! Error types for the shadow engine
//!
//! [`EngineError`] carries the engine's failure taxonomy:
//! - `ResourceExhausted`: another evaluation holds the lease; retry later
//! - `InvalidProposal`: malformed or inapplicable diff, refused before any shadow work
//! - `InvariantViolation`: a bright-line rule failed; the proposal is rejected
//! - `JudgmentUnavailable`: the judge failed or timed out after retries
//! - `VersionNotFound`: rollback target is not in the version store
//! - `TimeoutExceeded`: the run hit its wall-clock or turn ceiling

use shadow_core::{DiffError, ProposalId, VersionId};
use shadow_invariants::InvariantConfigError;
use shadow_ledger::LedgerError;

use crate::settings::SettingsError;

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The single evaluation lease is held
    #[error("resource exhausted: evaluation lease held by {holder}")]
    ResourceExhausted { holder: String },

    /// Proposal refused before evaluation
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    /// Bright-line safety rule failed
    #[error("invariant '{rule}' violated: {detail}")]
    InvariantViolation { rule: String, detail: String },

    /// External judgment capability failed
    #[error("judgment unavailable: {0}")]
    JudgmentUnavailable(String),

    /// Rollback target missing
    #[error("configuration version {0} not found")]
    VersionNotFound(VersionId),

    /// Evaluation ceiling reached
    #[error("evaluation ceiling exceeded after {turns} turns ({elapsed_ms}ms)")]
    TimeoutExceeded { turns: u64, elapsed_ms: u64 },

    #[error("proposal {0} not found")]
    ProposalNotFound(ProposalId),

    #[error("proposal {0} has no pending escalation")]
    EscalationNotPending(ProposalId),

    #[error("ledger error: {0}")]
    Ledger(LedgerError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("invariant configuration error: {0}")]
    InvariantConfig(#[from] InvariantConfigError),

    /// Policy or tool execution failed
    #[error("execution failed: {0}")]
    Execution(String),
}

impl EngineError {
    /// Caller may retry the same request later
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::JudgmentUnavailable(_)
        )
    }

    /// Error is final for the proposal it concerns
    #[inline]
    #[must_use]
    pub fn is_fatal_to_proposal(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. } | Self::InvalidProposal(_))
    }
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::VersionNotFound(v) => Self::VersionNotFound(v),
            other => Self::Ledger(other),
        }
    }
}

impl From<DiffError> for EngineError {
    fn from(e: DiffError) -> Self {
        Self::InvalidProposal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(EngineError::ResourceExhausted {
            holder: "evaluation".into()
        }
        .is_retryable());
        assert!(EngineError::JudgmentUnavailable("timeout".into()).is_retryable());
        assert!(!EngineError::InvalidProposal("empty".into()).is_retryable());
        assert!(!EngineError::VersionNotFound(VersionId(4)).is_retryable());
    }

    #[test]
    fn ledger_version_not_found_is_surfaced_directly() {
        let e: EngineError = LedgerError::VersionNotFound(VersionId(7)).into();
        assert!(matches!(e, EngineError::VersionNotFound(VersionId(7))));
    }

    #[test]
    fn diff_errors_are_invalid_proposals() {
        let e: EngineError = DiffError::Empty.into();
        assert!(e.is_fatal_to_proposal());
    }
}
