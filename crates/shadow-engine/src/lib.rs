//! Shadow Verification & Promotion Engine
//!
//! Candidate configuration changes are evaluated against live traffic in an
//! isolated shadow context before they are allowed to become live:
//!
//! 1. **Fork**: a proposal's diff is applied to the live configuration and a
//!    shadow context is created behind the single evaluation lease
//! 2. **Shadow**: every live input unit is served by the primary and
//!    duplicated, in order, to the shadow; side effects are intercepted
//! 3. **Decide**: invariants are checked every turn, the judge compares
//!    outputs once the scope's window is full, and the decision engine
//!    returns APPROVE, REJECT, EXTEND or ESCALATE
//! 4. **Record**: approvals promote a new version; every verdict lands in
//!    the hash-linked golden trace
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use shadow_engine::prelude::*;
//!
//! let engine = ShadowEngine::builder(policy, tools)
//!     .settings(EngineSettings::load("engine.toml")?)
//!     .genesis(json!({"retrieval": {"threshold": 0.4}}))
//!     .build()?;
//!
//! let id = engine
//!     .submit_proposal(
//!         ConfigDiff::new().set("/retrieval/threshold", json!(0.5)),
//!         Scope::Retrieval,
//!         ProposalMetadata::new("widen recall"),
//!     )
//!     .await?;
//!
//! while !engine.get_status(id)?.is_settled() {
//!     engine.handle_input(next_request().await).await;
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod calibration;
pub mod coordinator;
pub mod decision;
pub mod engine;
pub mod error;
pub mod escalation;
mod evaluation;
pub mod evolution;
pub mod execution;
pub mod fork;
pub mod judgment;
pub mod replay;
pub mod runs;
pub mod settings;
pub mod state;
pub mod telemetry;

pub use calibration::{CalibrationJob, CalibrationReport, Disagreement, Drift};
pub use coordinator::{EvaluationCoordinator, Served, ShadowFeed};
pub use decision::{decide, Progress};
pub use engine::{ProposalStatus, ShadowEngine, ShadowEngineBuilder, SHUTDOWN_REASON};
pub use error::EngineError;
pub use escalation::{
    ChannelApproval, EscalationGate, EscalationTicket, HumanApproval, HumanVerdict, LoggingApproval,
};
pub use evolution::{EvolutionRecord, EvolutionaryCandidate, EvolutionaryQueue, GenerationInfo};
pub use execution::{
    PolicyError, PolicyFunction, PolicyOutput, SharedState, StateAccess, ToolError, ToolGateway,
    ToolRequest, TurnContext,
};
pub use fork::{EvaluationLease, ForkManager, LeaseHolder, ShadowContext};
pub use judgment::{compare_outputs, JudgmentAdapter, JudgmentCapability, JudgmentError, RuleBasedJudge};
pub use replay::{InterceptedWrite, MockReplayLayer, ResponseSource};
pub use runs::{RecoveryReport, RunJournal, RunRecord, INTERRUPTED_REASON};
pub use settings::{EngineSettings, ScopePolicies, ScopePolicy, SettingsError};
pub use state::StateLayout;

/// Commonly used items
pub mod prelude {
    pub use crate::{
        EngineError, EngineSettings, HumanVerdict, JudgmentCapability, PolicyFunction,
        PolicyOutput, ProposalStatus, ShadowEngine, ToolGateway, ToolRequest, TurnContext,
    };
    pub use shadow_core::prelude::*;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
