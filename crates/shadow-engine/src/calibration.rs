//! Calibration: replaying past decisions through a fresh judge
//!
//! The job samples recent APPROVE/REJECT entries that the engine decided on
//! captured evidence, re-judges each twice through a fresh adapter, re-runs
//! the decision with the original extension count and compares verdicts.
//! It only reports; history is never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shadow_core::{ProposalId, VerdictKind};
use shadow_ledger::{GoldenTraceEntry, Resolution};

use crate::decision::{decide, Progress};
use crate::judgment::JudgmentAdapter;
use crate::settings::{CalibrationSettings, ScopePolicies};

/// Direction the judge has moved relative to history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Drift {
    Stable,
    MorePermissive,
    MoreConservative,
    Inconsistent,
}

/// One replay that disagreed with the recorded verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disagreement {
    pub proposal_id: ProposalId,
    pub sequence: u64,
    pub recorded: VerdictKind,
    pub replayed: VerdictKind,
    pub recorded_divergence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed_divergence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub run_at: DateTime<Utc>,
    pub sampled: usize,
    pub agreed: usize,
    pub agreement_rate: f64,
    pub drift: Drift,
    /// Replays less strict than the recorded verdict
    pub permissive: usize,
    /// Replays stricter than the recorded verdict
    pub conservative: usize,
    /// The judge returned different results for identical input
    pub non_idempotent: bool,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disagreements: Vec<Disagreement>,
}

/// Replays golden trace evidence through a judgment adapter
#[derive(Debug, Clone)]
pub struct CalibrationJob {
    adapter: JudgmentAdapter,
    scopes: ScopePolicies,
    max_extensions: u32,
    settings: CalibrationSettings,
}

impl CalibrationJob {
    #[must_use]
    pub fn new(
        adapter: JudgmentAdapter,
        scopes: ScopePolicies,
        max_extensions: u32,
        settings: CalibrationSettings,
    ) -> Self {
        Self {
            adapter,
            scopes,
            max_extensions,
            settings,
        }
    }

    /// Entries eligible for replay, most recent `lookback`
    fn sample<'a>(&self, entries: &'a [GoldenTraceEntry]) -> Vec<&'a GoldenTraceEntry> {
        let eligible: Vec<&GoldenTraceEntry> = entries
            .iter()
            .filter(|e| {
                e.is_final()
                    && e.resolved_by == Resolution::Engine
                    && e.evidence.is_some()
                    && e.verdict.rationale.invariant.passed
            })
            .collect();
        let start = eligible.len().saturating_sub(self.settings.lookback);
        eligible[start..].to_vec()
    }

    /// Replay the sample and compare
    pub async fn run(&self, entries: &[GoldenTraceEntry]) -> CalibrationReport {
        let sample = self.sample(entries);
        let adapter = self.adapter.fresh();

        let mut agreed = 0;
        let mut permissive = 0;
        let mut conservative = 0;
        let mut non_idempotent = false;
        let mut disagreements = Vec::new();

        for entry in &sample {
            let Some(evidence) = &entry.evidence else {
                continue;
            };
            let first = adapter
                .evaluate(&evidence.primary, &evidence.shadow, &evidence.context)
                .await
                .ok();
            let second = adapter
                .evaluate(&evidence.primary, &evidence.shadow, &evidence.context)
                .await
                .ok();
            if first != second {
                non_idempotent = true;
                tracing::warn!(
                    proposal_id = %entry.proposal_id,
                    "judge returned different results for identical evidence"
                );
            }

            let rationale = &entry.verdict.rationale;
            let replayed = decide(
                &rationale.invariant,
                first.as_ref(),
                &self.scopes.for_scope(entry.scope),
                Progress {
                    turns_evaluated: rationale.turns_evaluated,
                    extensions: rationale.extensions,
                    max_extensions: self.max_extensions,
                },
            );

            let recorded = entry.kind();
            if replayed.kind == recorded {
                agreed += 1;
                continue;
            }
            if replayed.kind.strictness() < recorded.strictness() {
                permissive += 1;
            } else {
                conservative += 1;
            }
            tracing::warn!(
                proposal_id = %entry.proposal_id,
                sequence = entry.sequence,
                recorded = %recorded,
                replayed = %replayed.kind,
                recorded_divergence = entry.divergence(),
                "calibration disagreement"
            );
            disagreements.push(Disagreement {
                proposal_id: entry.proposal_id,
                sequence: entry.sequence,
                recorded,
                replayed: replayed.kind,
                recorded_divergence: entry.divergence(),
                replayed_divergence: first.map(|j| j.divergence),
            });
        }

        let sampled = sample.len();
        let agreement_rate = if sampled == 0 {
            1.0
        } else {
            agreed as f64 / sampled as f64
        };
        let threshold = self.settings.consistency_threshold;
        let drift = if agreement_rate >= threshold {
            Drift::Stable
        } else if permissive > 0 && conservative == 0 {
            Drift::MorePermissive
        } else if conservative > 0 && permissive == 0 {
            Drift::MoreConservative
        } else {
            Drift::Inconsistent
        };
        let healthy = agreement_rate >= threshold && !non_idempotent;

        tracing::info!(
            sampled,
            agreed,
            agreement_rate,
            drift = ?drift,
            healthy,
            "calibration complete"
        );

        CalibrationReport {
            run_at: Utc::now(),
            sampled,
            agreed,
            agreement_rate,
            drift,
            permissive,
            conservative,
            non_idempotent,
            healthy,
            disagreements,
        }
    }
}
