//! Modification proposals and their lifecycle

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::config::{ConfigDiff, VersionId};
use crate::trace::MandateEnvelope;

/// Unique proposal identifier (sortable by submission time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(Ulid);

impl ProposalId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[inline]
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProposalId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Declared blast radius of a proposal
///
/// Ordered from narrowest to widest. Wider scopes get longer evaluation
/// windows and stricter escalation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Config,
    Retrieval,
    Behavioral,
    Reasoning,
    Fundamental,
}

impl Scope {
    pub const ALL: [Self; 5] = [
        Self::Config,
        Self::Retrieval,
        Self::Behavioral,
        Self::Reasoning,
        Self::Fundamental,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Retrieval => "retrieval",
            Self::Behavioral => "behavioral",
            Self::Reasoning => "reasoning",
            Self::Fundamental => "fundamental",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = UnknownScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownScope(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown scope '{0}'")]
pub struct UnknownScope(pub String);

/// Lifecycle state of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalState {
    Pending,
    Evaluating,
    Extended,
    Approved,
    Rejected,
    Escalated,
}

impl ProposalState {
    /// No further transitions possible
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    /// Holds the evaluation lease
    #[inline]
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Evaluating | Self::Extended)
    }
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Evaluating => "EVALUATING",
            Self::Extended => "EXTENDED",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Escalated => "ESCALATED",
        };
        f.write_str(s)
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: ProposalState) -> &'static [ProposalState] {
    use ProposalState::{Approved, Escalated, Evaluating, Extended, Pending, Rejected};
    match from {
        // Pending -> Rejected covers crash recovery before the first turn
        Pending => &[Evaluating, Rejected],
        Evaluating => &[Extended, Approved, Rejected, Escalated],
        Extended => &[Evaluating, Rejected, Escalated],
        Escalated => &[Approved, Rejected],
        Approved | Rejected => &[],
    }
}

/// Check a single lifecycle step
///
/// # Errors
/// Returns error if `to` is not reachable from `from`
pub fn validate_transition(
    from: ProposalState,
    to: ProposalState,
) -> Result<(), InvalidTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid proposal transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ProposalState,
    pub to: ProposalState,
}

/// Free-form information attached by the proposer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalMetadata {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Proposal whose shadow run discovered this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ProposalId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ProposalMetadata {
    #[inline]
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    #[inline]
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_parent(mut self, parent: ProposalId) -> Self {
        self.parent = Some(parent);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A candidate change to the live configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationProposal {
    pub id: ProposalId,
    pub diff: ConfigDiff,
    pub scope: Scope,
    pub metadata: ProposalMetadata,
    /// Live version the diff was evaluated against
    pub base_version: VersionId,
    pub submitted_at: DateTime<Utc>,
    /// Signed statement of the declared diff, checked by the invariant layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandate: Option<MandateEnvelope>,
}

impl ModificationProposal {
    #[must_use]
    pub fn new(diff: ConfigDiff, scope: Scope, metadata: ProposalMetadata, base: VersionId) -> Self {
        Self {
            id: ProposalId::new(),
            diff,
            scope,
            metadata,
            base_version: base,
            submitted_at: Utc::now(),
            mandate: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_mandate(mut self, mandate: MandateEnvelope) -> Self {
        self.mandate = Some(mandate);
        self
    }
}

/// Proposal content emitted by a running context, not yet submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalDraft {
    pub diff: ConfigDiff,
    pub scope: Scope,
    pub description: String,
}

impl ProposalDraft {
    #[must_use]
    pub fn new(diff: ConfigDiff, scope: Scope, description: impl Into<String>) -> Self {
        Self {
            diff,
            scope,
            description: description.into(),
        }
    }
}
