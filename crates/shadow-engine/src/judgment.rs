//! Judgment adapter and the built-in rule-based judge
//!
//! A [`JudgmentCapability`] compares primary and shadow turns and reports
//! four booleans plus a divergence score. Implementations must be
//! deterministic: identical turns and context must yield an identical
//! result, otherwise calibration replay cannot tell drift from noise.
//!
//! The [`JudgmentAdapter`] treats the capability as untrusted. It retries
//! with backoff, bounds each call by a timeout, refuses malformed scores and
//! combines the judge's divergence with a structural comparison by taking
//! the maximum, so a judge can raise divergence but never hide it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value as JsonValue;
use shadow_core::{canonical_json, JudgmentContext, JudgmentResult, TurnRecord};

use crate::error::EngineError;
use crate::settings::{JudgmentSettings, RuleJudgeSettings};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JudgmentError {
    #[error("judge unavailable: {0}")]
    Unavailable(String),

    #[error("judge returned malformed result: {0}")]
    Malformed(String),
}

/// Pluggable comparison of primary and shadow behavior
#[async_trait]
pub trait JudgmentCapability: Send + Sync {
    async fn judge(
        &self,
        primary: &[TurnRecord],
        shadow: &[TurnRecord],
        context: &JudgmentContext,
    ) -> Result<JudgmentResult, JudgmentError>;

    fn name(&self) -> &str {
        "judge"
    }
}

/// Lower-cased alphanumeric tokens of a response
pub(crate) fn tokens(value: &JsonValue) -> BTreeSet<String> {
    let text = match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => canonical_json(other),
    };
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

pub(crate) fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn key_divergence(a: &JsonValue, b: &JsonValue) -> f64 {
    match (a.as_object(), b.as_object()) {
        (Some(a), Some(b)) => {
            let ka: BTreeSet<&String> = a.keys().collect();
            let kb: BTreeSet<&String> = b.keys().collect();
            let union = ka.union(&kb).count();
            if union == 0 {
                0.0
            } else {
                1.0 - ka.intersection(&kb).count() as f64 / union as f64
            }
        }
        (None, None) => 0.0,
        _ => 1.0,
    }
}

fn op_counts(turns: &[TurnRecord]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for call in turns.iter().flat_map(|t| t.tool_calls.iter()) {
        *counts.entry(call.operation.as_str()).or_insert(0) += 1;
    }
    counts
}

fn tool_divergence(primary: &[TurnRecord], shadow: &[TurnRecord]) -> f64 {
    let p = op_counts(primary);
    let s = op_counts(shadow);
    let ops: BTreeSet<&str> = p.keys().chain(s.keys()).copied().collect();
    if ops.is_empty() {
        return 0.0;
    }
    let differing = ops.iter().filter(|op| p.get(*op) != s.get(*op)).count();
    differing as f64 / ops.len() as f64
}

/// Structural divergence of two turn sequences, in `[0, 1]`
///
/// Averages four signals: turn-count mismatch, response text dissimilarity,
/// response key mismatch, and tool-call pattern differences (operations
/// added, missing, or called a different number of times).
#[must_use]
pub fn compare_outputs(primary: &[TurnRecord], shadow: &[TurnRecord]) -> f64 {
    let longest = primary.len().max(shadow.len());
    if longest == 0 {
        return 0.0;
    }
    let count = primary.len().abs_diff(shadow.len()) as f64 / longest as f64;

    let pairs: Vec<(&TurnRecord, &TurnRecord)> = primary.iter().zip(shadow.iter()).collect();
    let (text, keys) = if pairs.is_empty() {
        (1.0, 1.0)
    } else {
        let mut text = 0.0;
        let mut keys = 0.0;
        for (p, s) in &pairs {
            if p.is_failed() != s.is_failed() {
                text += 1.0;
                keys += 1.0;
                continue;
            }
            text += 1.0 - jaccard(&tokens(&p.response), &tokens(&s.response));
            keys += key_divergence(&p.response, &s.response);
        }
        (text / pairs.len() as f64, keys / pairs.len() as f64)
    };

    let tools = tool_divergence(primary, shadow);
    ((count + text + keys + tools) / 4.0).clamp(0.0, 1.0)
}

/// Retry, timeout and sanity layer over a [`JudgmentCapability`]
#[derive(Clone)]
pub struct JudgmentAdapter {
    capability: Arc<dyn JudgmentCapability>,
    settings: JudgmentSettings,
}

impl std::fmt::Debug for JudgmentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JudgmentAdapter")
            .field("capability", &self.capability.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl JudgmentAdapter {
    #[must_use]
    pub fn new(capability: Arc<dyn JudgmentCapability>, settings: JudgmentSettings) -> Self {
        Self {
            capability,
            settings,
        }
    }

    /// New adapter over the same capability with no shared call state
    #[must_use]
    pub fn fresh(&self) -> Self {
        Self::new(Arc::clone(&self.capability), self.settings.clone())
    }

    /// Judge the captured turns
    ///
    /// # Errors
    /// Returns `JudgmentUnavailable` once every attempt failed, timed out, or
    /// returned a malformed score
    pub async fn evaluate(
        &self,
        primary: &[TurnRecord],
        shadow: &[TurnRecord],
        context: &JudgmentContext,
    ) -> Result<JudgmentResult, EngineError> {
        let structural = compare_outputs(primary, shadow);
        let mut last_error = String::new();

        for attempt in 0..=self.settings.retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
            let call = self.capability.judge(primary, shadow, context);
            let error = match tokio::time::timeout(self.settings.timeout(), call).await {
                Ok(Ok(result)) => match sanitize(result, structural) {
                    Ok(result) => {
                        tracing::debug!(
                            proposal_id = %context.proposal_id,
                            divergence = result.divergence,
                            structural,
                            attempt,
                            "judgment complete"
                        );
                        return Ok(result);
                    }
                    Err(e) => e.to_string(),
                },
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}ms", self.settings.timeout_ms),
            };
            tracing::warn!(
                proposal_id = %context.proposal_id,
                judge = self.capability.name(),
                attempt,
                error = %error,
                "judgment attempt failed"
            );
            last_error = error;
        }

        Err(EngineError::JudgmentUnavailable(last_error))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.backoff_ms.saturating_mul(1 << attempt.saturating_sub(1).min(16));
        let jitter = if self.settings.backoff_ms > 1 {
            rand::thread_rng().gen_range(0..self.settings.backoff_ms / 2)
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter))
    }
}

fn sanitize(mut result: JudgmentResult, structural: f64) -> Result<JudgmentResult, JudgmentError> {
    if !result.divergence.is_finite() || result.divergence < 0.0 {
        return Err(JudgmentError::Malformed(format!(
            "divergence {} is not a non-negative number",
            result.divergence
        )));
    }
    result.divergence = result.divergence.max(structural);
    Ok(result)
}

/// Deterministic judge built from token overlap and term lists
#[derive(Debug, Clone, Default)]
pub struct RuleBasedJudge {
    settings: RuleJudgeSettings,
}

impl RuleBasedJudge {
    #[must_use]
    pub fn new(settings: RuleJudgeSettings) -> Self {
        Self { settings }
    }

    fn term_coverage(&self, text: &BTreeSet<String>) -> f64 {
        if self.settings.alignment_terms.is_empty() {
            return 1.0;
        }
        let hits = self
            .settings
            .alignment_terms
            .iter()
            .filter(|t| text.contains(&t.to_lowercase()))
            .count();
        hits as f64 / self.settings.alignment_terms.len() as f64
    }

    /// Pure scoring, shared by the async trait method
    #[must_use]
    pub fn score(&self, primary: &[TurnRecord], shadow: &[TurnRecord]) -> JudgmentResult {
        let pairs: Vec<_> = primary.iter().zip(shadow.iter()).collect();
        let similarity = if pairs.is_empty() {
            if primary.len() == shadow.len() {
                1.0
            } else {
                0.0
            }
        } else {
            pairs
                .iter()
                .map(|(p, s)| jaccard(&tokens(&p.response), &tokens(&s.response)))
                .sum::<f64>()
                / pairs.len() as f64
        };

        let all = |turns: &[TurnRecord]| -> BTreeSet<String> {
            turns.iter().flat_map(|t| tokens(&t.response)).collect()
        };
        let shadow_tokens = all(shadow);
        let primary_tokens = all(primary);

        let shadow_text = shadow
            .iter()
            .map(|t| canonical_json(&t.response).to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
        let flagged: Vec<&String> = self
            .settings
            .flagged_terms
            .iter()
            .filter(|t| shadow_text.contains(&t.to_lowercase()))
            .collect();

        let required = self.settings.min_alignment.min(self.term_coverage(&primary_tokens));
        let alignment = self.term_coverage(&shadow_tokens);

        let failures = |turns: &[TurnRecord]| turns.iter().filter(|t| t.is_failed()).count();

        let result = JudgmentResult {
            safety_ok: flagged.is_empty(),
            quality_ok: similarity >= self.settings.min_quality,
            alignment_ok: alignment >= required,
            regression_ok: failures(shadow) <= failures(primary),
            divergence: 1.0 - similarity,
            summary: String::new(),
        };
        let summary = format!(
            "similarity {similarity:.3}, alignment {alignment:.3}, flagged {}",
            flagged.len()
        );
        result.with_summary(summary)
    }
}

#[async_trait]
impl JudgmentCapability for RuleBasedJudge {
    async fn judge(
        &self,
        primary: &[TurnRecord],
        shadow: &[TurnRecord],
        _context: &JudgmentContext,
    ) -> Result<JudgmentResult, JudgmentError> {
        Ok(self.score(primary, shadow))
    }

    fn name(&self) -> &str {
        "rule-based"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use shadow_core::{Effect, ProposalId, Scope, ToolCall};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn turn(seq: u64, text: &str) -> TurnRecord {
        TurnRecord::ok(seq, json!(text), Vec::new())
    }

    fn call(op: &str) -> ToolCall {
        ToolCall {
            operation: op.into(),
            arguments: json!({}),
            effect: Effect::Read,
            egress_target: None,
            cost: 0.0,
            response: json!(null),
            intercepted: false,
        }
    }

    fn ctx() -> JudgmentContext {
        JudgmentContext {
            proposal_id: ProposalId::new(),
            scope: Scope::Config,
            description: "test".into(),
        }
    }

    fn fast() -> JudgmentSettings {
        JudgmentSettings {
            timeout_ms: 50,
            retries: 2,
            backoff_ms: 1,
        }
    }

    struct Fixed(f64);

    #[async_trait]
    impl JudgmentCapability for Fixed {
        async fn judge(&self, _: &[TurnRecord], _: &[TurnRecord], _: &JudgmentContext) -> Result<JudgmentResult, JudgmentError> {
            Ok(JudgmentResult::clean(self.0))
        }
    }

    struct FailThenOk(AtomicU32);

    #[async_trait]
    impl JudgmentCapability for FailThenOk {
        async fn judge(&self, _: &[TurnRecord], _: &[TurnRecord], _: &JudgmentContext) -> Result<JudgmentResult, JudgmentError> {
            if self.0.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(JudgmentError::Unavailable("busy".into()));
            }
            Ok(JudgmentResult::clean(0.01))
        }
    }

    struct Hangs;

    #[async_trait]
    impl JudgmentCapability for Hangs {
        async fn judge(&self, _: &[TurnRecord], _: &[TurnRecord], _: &JudgmentContext) -> Result<JudgmentResult, JudgmentError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(JudgmentResult::clean(0.0))
        }
    }

    #[test]
    fn identical_turns_have_zero_divergence() {
        let turns = vec![turn(1, "the answer is 42"), turn(2, "done")];
        assert!(compare_outputs(&turns, &turns).abs() < f64::EPSILON);
    }

    #[test]
    fn tool_pattern_changes_raise_divergence() {
        let p = vec![TurnRecord::ok(1, json!("x"), vec![call("search")])];
        let same = compare_outputs(&p, &p.clone());
        let s = vec![TurnRecord::ok(1, json!("x"), vec![call("search"), call("delete")])];
        assert!(compare_outputs(&p, &s) > same);
    }

    #[test]
    fn failed_shadow_turn_counts_as_full_text_divergence() {
        let p = vec![turn(1, "ok")];
        let s = vec![TurnRecord::failed(1, "boom")];
        assert!(compare_outputs(&p, &s) >= 0.5);
    }

    #[tokio::test]
    async fn judge_cannot_lower_structural_divergence() {
        let adapter = JudgmentAdapter::new(Arc::new(Fixed(0.0)), fast());
        let p = vec![turn(1, "alpha beta")];
        let s = vec![turn(1, "gamma delta")];
        let result = adapter.evaluate(&p, &s, &ctx()).await.unwrap();
        assert!((result.divergence - compare_outputs(&p, &s)).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let adapter = JudgmentAdapter::new(Arc::new(FailThenOk(AtomicU32::new(2))), fast());
        let t = vec![turn(1, "same")];
        let result = adapter.evaluate(&t, &t, &ctx()).await.unwrap();
        assert!((result.divergence - 0.01).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn exhausted_retries_are_unavailable() {
        let adapter = JudgmentAdapter::new(Arc::new(FailThenOk(AtomicU32::new(10))), fast());
        let t = vec![turn(1, "same")];
        let err = adapter.evaluate(&t, &t, &ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::JudgmentUnavailable(_)));
    }

    #[tokio::test]
    async fn malformed_divergence_is_refused() {
        let adapter = JudgmentAdapter::new(Arc::new(Fixed(f64::NAN)), fast());
        let t = vec![turn(1, "same")];
        assert!(adapter.evaluate(&t, &t, &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn hung_judge_times_out() {
        let adapter = JudgmentAdapter::new(Arc::new(Hangs), fast());
        let t = vec![turn(1, "same")];
        let err = adapter.evaluate(&t, &t, &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn rule_judge_flags_terms_and_regressions() {
        let judge = RuleBasedJudge::new(RuleJudgeSettings {
            flagged_terms: vec!["password".into()],
            ..RuleJudgeSettings::default()
        });
        let p = vec![turn(1, "here is the summary"), turn(2, "ok")];
        let clean = judge.score(&p, &p);
        assert!(clean.safety_ok && clean.quality_ok && clean.regression_ok);
        assert!(clean.divergence.abs() < f64::EPSILON);

        let leaky = vec![turn(1, "here is the password"), TurnRecord::failed(2, "crash")];
        let r = judge.score(&p, &leaky);
        assert!(!r.safety_ok);
        assert!(!r.regression_ok);
    }

    #[test]
    fn rule_judge_alignment_terms() {
        let judge = RuleBasedJudge::new(RuleJudgeSettings {
            alignment_terms: vec!["cite".into(), "sources".into()],
            ..RuleJudgeSettings::default()
        });
        let p = vec![turn(1, "answer cite sources")];
        let s = vec![turn(1, "answer only")];
        assert!(judge.score(&p, &p).alignment_ok);
        assert!(!judge.score(&p, &s).alignment_ok);
    }

    proptest! {
        #[test]
        fn prop_divergence_bounded(a in "[a-z ]{0,30}", b in "[a-z ]{0,30}") {
            let d = compare_outputs(&[turn(1, &a)], &[turn(1, &b)]);
            prop_assert!((0.0..=1.0).contains(&d));
        }

        #[test]
        fn prop_more_dropped_turns_more_divergence(n in 1usize..8, dropped in 1usize..8) {
            let full: Vec<TurnRecord> = (0..n + dropped).map(|i| turn(i as u64, "same reply")).collect();
            let fewer = &full[..n];
            let fewest = &full[..n.saturating_sub(1).max(1)];
            prop_assert!(compare_outputs(&full, fewest) >= compare_outputs(&full, fewer));
        }
    }
}
