//! Shadow Engine Core Types
//!
//! Leaf data model shared by the ledger, the invariant checker and the
//! evaluation engine.
//!
//! # Core Concepts
//!
//! - [`Configuration`]: Immutable, versioned, content-hashed parameter snapshot
//! - [`ConfigDiff`]: Ordered JSON-pointer edits that derive a new snapshot
//! - [`ModificationProposal`]: A diff plus a declared [`Scope`]
//! - [`Verdict`]: APPROVE / REJECT / EXTEND / ESCALATE with divergence and rationale
//! - [`ExecutionTrace`]: What a shadow context did, as seen by the invariant checker
//!
//! # Example
//!
//! ```rust,ignore
//! use shadow_core::prelude::*;
//!
//! let live = Configuration::genesis(json!({"retrieval": {"threshold": 0.4}}))?;
//! let diff = ConfigDiff::new().set("/retrieval/threshold", json!(0.5));
//! let params = diff.apply_to(&live)?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod hash;
pub mod proposal;
pub mod trace;
pub mod verdict;

pub use config::{canonical_json, merge_json, ConfigDiff, Configuration, DiffError, DiffOp, VersionId};
pub use hash::{ContentHash, HashError};
pub use proposal::{
    allowed_transitions, validate_transition, InvalidTransition, ModificationProposal,
    ProposalDraft, ProposalId, ProposalMetadata, ProposalState, Scope, UnknownScope,
};
pub use trace::{
    Effect, Evidence, ExecutionTrace, InputUnit, JudgmentContext, MandateEnvelope, ToolCall,
    TurnRecord,
};
pub use verdict::{InvariantOutcome, JudgmentResult, Rationale, Verdict, VerdictKind};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used items
pub mod prelude {
    pub use crate::{
        ConfigDiff, Configuration, ContentHash, Evidence, ExecutionTrace, InputUnit,
        InvariantOutcome, JudgmentContext, JudgmentResult, ModificationProposal, ProposalDraft,
        ProposalId, ProposalMetadata, ProposalState, Rationale, Scope, ToolCall, TurnRecord,
        Verdict, VerdictKind, VersionId,
    };
}
