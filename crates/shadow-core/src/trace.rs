//! Execution traces captured during an evaluation run
//!
//! Primary and shadow contexts both produce a [`TurnRecord`] per input unit.
//! The shadow side is wrapped in an [`ExecutionTrace`] that the invariant
//! checker inspects, and both sides are kept as [`Evidence`] so that
//! calibration can replay the original judgment.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::hash::ContentHash;
use crate::proposal::{ProposalId, Scope};

/// One opaque unit of live input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputUnit {
    /// Position in the live stream, assigned by the coordinator
    pub seq: u64,
    pub payload: JsonValue,
}

impl InputUnit {
    #[must_use]
    pub fn new(seq: u64, payload: JsonValue) -> Self {
        Self { seq, payload }
    }
}

/// Whether an operation observes or mutates external state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Read,
    Write,
}

/// A single tool/operation invocation and its response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub operation: String,
    pub arguments: JsonValue,
    pub effect: Effect,
    /// Network destination, when the operation leaves the process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_target: Option<String>,
    /// Budget consumed by the call
    #[serde(default)]
    pub cost: f64,
    pub response: JsonValue,
    /// Served by the mock/replay layer instead of a real system
    #[serde(default)]
    pub intercepted: bool,
}

/// Output of one context for one input unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub seq: u64,
    pub response: JsonValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TurnRecord {
    #[must_use]
    pub fn ok(seq: u64, response: JsonValue, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            seq,
            response,
            tool_calls,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(seq: u64, error: impl Into<String>) -> Self {
        Self {
            seq,
            response: JsonValue::Null,
            tool_calls: Vec::new(),
            error: Some(error.into()),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Budget consumed during this turn
    #[must_use]
    pub fn spend(&self) -> f64 {
        self.tool_calls.iter().map(|c| c.cost).sum()
    }
}

/// Signed statement binding a proposal to the diff it declared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandateEnvelope {
    pub proposal_id: ProposalId,
    pub diff_hash: ContentHash,
    pub scope: Scope,
    /// Hex-encoded ed25519 signature
    pub signature: String,
}

impl MandateEnvelope {
    /// Bytes covered by the signature
    #[must_use]
    pub fn signing_message(proposal_id: ProposalId, diff_hash: ContentHash, scope: Scope) -> Vec<u8> {
        format!("{proposal_id}:{diff_hash}:{scope}").into_bytes()
    }

    #[must_use]
    pub fn message(&self) -> Vec<u8> {
        Self::signing_message(self.proposal_id, self.diff_hash, self.scope)
    }
}

/// Shadow-side trace handed to the invariant checker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub proposal_id: ProposalId,
    /// Hash of the diff actually being evaluated
    pub declared_diff_hash: ContentHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandate: Option<MandateEnvelope>,
    pub turns: Vec<TurnRecord>,
}

impl ExecutionTrace {
    #[must_use]
    pub fn new(proposal_id: ProposalId, declared_diff_hash: ContentHash) -> Self {
        Self {
            proposal_id,
            declared_diff_hash,
            mandate: None,
            turns: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_mandate(mut self, mandate: MandateEnvelope) -> Self {
        self.mandate = Some(mandate);
        self
    }

    pub fn push(&mut self, turn: TurnRecord) {
        self.turns.push(turn);
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Every tool call in turn order, paired with its turn sequence
    pub fn tool_calls(&self) -> impl Iterator<Item = (u64, &ToolCall)> {
        self.turns
            .iter()
            .flat_map(|t| t.tool_calls.iter().map(move |c| (t.seq, c)))
    }

    #[must_use]
    pub fn total_spend(&self) -> f64 {
        self.turns.iter().map(TurnRecord::spend).sum()
    }
}

/// Information passed to the judge alongside the two traces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgmentContext {
    pub proposal_id: ProposalId,
    pub scope: Scope,
    pub description: String,
}

/// Captured primary/shadow outputs kept for calibration replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub primary: Vec<TurnRecord>,
    pub shadow: Vec<TurnRecord>,
    pub context: JudgmentContext,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(op: &str, cost: f64) -> ToolCall {
        ToolCall {
            operation: op.to_string(),
            arguments: json!({}),
            effect: Effect::Read,
            egress_target: None,
            cost,
            response: json!(null),
            intercepted: true,
        }
    }

    #[test]
    fn spend_accumulates_across_turns() {
        let mut trace = ExecutionTrace::new(ProposalId::new(), ContentHash::compute(b"d"));
        trace.push(TurnRecord::ok(1, json!("a"), vec![call("search", 0.5), call("fetch", 0.25)]));
        trace.push(TurnRecord::ok(2, json!("b"), vec![call("search", 1.0)]));
        assert!((trace.total_spend() - 1.75).abs() < f64::EPSILON);

        let seqs: Vec<u64> = trace.tool_calls().map(|(seq, _)| seq).collect();
        assert_eq!(seqs, vec![1, 1, 2]);
    }

    #[test]
    fn failed_turn_has_no_response() {
        let t = TurnRecord::failed(7, "policy crashed");
        assert!(t.is_failed());
        assert_eq!(t.response, JsonValue::Null);
    }

    #[test]
    fn mandate_message_binds_all_fields() {
        let id = ProposalId::new();
        let h = ContentHash::compute(b"diff");
        let a = MandateEnvelope::signing_message(id, h, Scope::Config);
        let b = MandateEnvelope::signing_message(id, h, Scope::Reasoning);
        assert_ne!(a, b);
    }
}
