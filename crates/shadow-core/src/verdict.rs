//! Verdicts and the rationale recorded with them

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of the decision state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictKind {
    Approve,
    Reject,
    Extend,
    Escalate,
}

impl VerdictKind {
    /// Rank used to compare verdicts for drift
    ///
    /// APPROVE < EXTEND < ESCALATE < REJECT
    #[inline]
    #[must_use]
    pub const fn strictness(self) -> u8 {
        match self {
            Self::Approve => 0,
            Self::Extend => 1,
            Self::Escalate => 2,
            Self::Reject => 3,
        }
    }

    /// Verdict ends the proposal without further evaluation
    #[inline]
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Approve | Self::Reject)
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approve => "APPROVE",
            Self::Reject => "REJECT",
            Self::Extend => "EXTEND",
            Self::Escalate => "ESCALATE",
        };
        f.write_str(s)
    }
}

/// Result of the invariant checker for one trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantOutcome {
    pub passed: bool,
    /// Name of the first rule that failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Turn at which the failing event occurred
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<u64>,
    pub rules_checked: usize,
}

impl InvariantOutcome {
    #[must_use]
    pub fn pass(rules_checked: usize) -> Self {
        Self {
            passed: true,
            failed_rule: None,
            detail: None,
            turn: None,
            rules_checked,
        }
    }

    #[must_use]
    pub fn fail(
        rule: impl Into<String>,
        detail: impl Into<String>,
        turn: Option<u64>,
        rules_checked: usize,
    ) -> Self {
        Self {
            passed: false,
            failed_rule: Some(rule.into()),
            detail: Some(detail.into()),
            turn,
            rules_checked,
        }
    }
}

/// Four-way judgment plus a divergence score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentResult {
    pub safety_ok: bool,
    pub quality_ok: bool,
    pub alignment_ok: bool,
    pub regression_ok: bool,
    pub divergence: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
}

impl JudgmentResult {
    /// All checks pass with the given divergence
    #[must_use]
    pub fn clean(divergence: f64) -> Self {
        Self {
            safety_ok: true,
            quality_ok: true,
            alignment_ok: true,
            regression_ok: true,
            divergence,
            summary: String::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }
}

/// Everything the decision engine looked at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rationale {
    pub invariant: InvariantOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judgment: Option<JudgmentResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    pub turns_evaluated: u64,
    pub extensions: u32,
}

impl Rationale {
    #[must_use]
    pub fn new(invariant: InvariantOutcome) -> Self {
        Self {
            invariant,
            judgment: None,
            reasons: Vec::new(),
            turns_evaluated: 0,
            extensions: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    /// One-line summary for logs and CLI listings
    #[must_use]
    pub fn summary(&self) -> String {
        if let Some(rule) = &self.invariant.failed_rule {
            return format!("invariant '{rule}' failed");
        }
        self.reasons.last().cloned().unwrap_or_default()
    }
}

/// Immutable decision for one proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub kind: VerdictKind,
    pub divergence: f64,
    pub rationale: Rationale,
}

impl Verdict {
    #[must_use]
    pub fn new(kind: VerdictKind, divergence: f64, rationale: Rationale) -> Self {
        Self {
            kind,
            divergence,
            rationale,
        }
    }
}
