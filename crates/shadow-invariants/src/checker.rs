use shadow_core::{ExecutionTrace, InvariantOutcome};

use crate::error::InvariantConfigError;
use crate::rules::{
    BudgetLimit, DisallowedOperation, DisallowedOutput, EgressAllowlist, InvariantRules,
    MandateSignature, Rule,
};

/// Evaluates a fixed rule set against execution traces
///
/// Checking is pure: no I/O, no clock, no randomness. Rules run in a fixed
/// order and the first failure is reported.
#[derive(Debug)]
pub struct InvariantChecker {
    rules: Vec<Box<dyn Rule>>,
}

impl InvariantChecker {
    /// Build the checker from configuration
    ///
    /// # Errors
    /// Returns error if a pattern, key or limit is invalid
    pub fn from_rules(config: &InvariantRules) -> Result<Self, InvariantConfigError> {
        let mut rules: Vec<Box<dyn Rule>> = Vec::new();
        if let Some(key) = &config.mandate_key {
            rules.push(Box::new(MandateSignature::new(key, config.require_mandate)?));
        }
        rules.push(Box::new(DisallowedOperation::new(&config.disallowed_operations)?));
        rules.push(Box::new(EgressAllowlist::new(&config.egress_allowlist)));
        if let Some(limit) = config.budget_limit {
            rules.push(Box::new(BudgetLimit::new(limit)?));
        }
        if !config.disallowed_output.is_empty() {
            rules.push(Box::new(DisallowedOutput::new(&config.disallowed_output)?));
        }
        Ok(Self { rules })
    }

    /// Checker with an explicit rule list
    #[must_use]
    pub fn with_rules(rules: Vec<Box<dyn Rule>>) -> Self {
        Self { rules }
    }

    #[must_use]
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Evaluate every rule; any single failure fails the trace
    #[must_use]
    pub fn check(&self, trace: &ExecutionTrace) -> InvariantOutcome {
        for rule in &self.rules {
            if let Some(failure) = rule.check(trace) {
                tracing::warn!(
                    proposal_id = %trace.proposal_id,
                    rule = rule.name(),
                    turn = failure.turn,
                    detail = %failure.detail,
                    "invariant violated"
                );
                return InvariantOutcome::fail(rule.name(), failure.detail, failure.turn, self.rules.len());
            }
        }
        InvariantOutcome::pass(self.rules.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;
    use shadow_core::{ContentHash, Effect, ProposalId, Scope, ToolCall, TurnRecord};

    use crate::mandate::sign_mandate;

    fn call(op: &str, args: serde_json::Value, egress: Option<&str>, cost: f64) -> ToolCall {
        ToolCall {
            operation: op.to_string(),
            arguments: args,
            effect: Effect::Write,
            egress_target: egress.map(String::from),
            cost,
            response: json!(null),
            intercepted: true,
        }
    }

    fn trace_with(turns: Vec<Vec<ToolCall>>) -> ExecutionTrace {
        let mut trace = ExecutionTrace::new(ProposalId::new(), ContentHash::compute(b"diff"));
        for (i, calls) in turns.into_iter().enumerate() {
            trace.push(TurnRecord::ok(i as u64 + 1, json!("ok"), calls));
        }
        trace
    }

    fn rules() -> InvariantRules {
        InvariantRules {
            egress_allowlist: vec!["api.internal".to_string()],
            budget_limit: Some(10.0),
            ..InvariantRules::default()
        }
    }

    #[test]
    fn clean_trace_passes() {
        let checker = InvariantChecker::from_rules(&rules()).unwrap();
        let trace = trace_with(vec![
            vec![call("search", json!({"q": "weather"}), Some("https://api.internal/s"), 1.0)],
            vec![call("fetch", json!("doc-1"), None, 2.0)],
        ]);
        let outcome = checker.check(&trace);
        assert!(outcome.passed);
        assert_eq!(outcome.rules_checked, 3);
    }

    #[test]
    fn disallowed_operation_cites_rule_and_turn() {
        let checker = InvariantChecker::from_rules(&rules()).unwrap();
        let trace = trace_with(vec![
            vec![],
            vec![],
            vec![],
            vec![call("shell", json!({"cmd": "rm -rf / --no-preserve-root"}), None, 0.0)],
        ]);
        let outcome = checker.check(&trace);
        assert!(!outcome.passed);
        assert_eq!(outcome.failed_rule.as_deref(), Some("disallowed_operation"));
        assert_eq!(outcome.turn, Some(4));
    }

    #[test]
    fn egress_outside_allowlist_fails() {
        let checker = InvariantChecker::from_rules(&rules()).unwrap();
        let trace = trace_with(vec![vec![call("post", json!({}), Some("https://exfil.example"), 0.0)]]);
        assert_eq!(checker.check(&trace).failed_rule.as_deref(), Some("egress_allowlist"));
    }

    #[test]
    fn cumulative_budget_is_enforced() {
        let checker = InvariantChecker::from_rules(&rules()).unwrap();
        let trace = trace_with(vec![
            vec![call("llm", json!({}), None, 4.0)],
            vec![call("llm", json!({}), None, 4.0)],
            vec![call("llm", json!({}), None, 4.0)],
        ]);
        let outcome = checker.check(&trace);
        assert_eq!(outcome.failed_rule.as_deref(), Some("budget_limit"));
        assert_eq!(outcome.turn, Some(3));
    }

    #[test]
    fn disallowed_output_pattern() {
        let config = InvariantRules {
            disallowed_output: vec![r"\b\d{3}-\d{2}-\d{4}\b".to_string()],
            ..rules()
        };
        let checker = InvariantChecker::from_rules(&config).unwrap();
        let mut trace = trace_with(vec![]);
        trace.push(TurnRecord::ok(1, json!("your SSN is 123-45-6789"), vec![]));
        assert_eq!(checker.check(&trace).failed_rule.as_deref(), Some("disallowed_output"));
    }

    #[test]
    fn mandate_must_match_evaluated_diff() {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let config = InvariantRules {
            mandate_key: Some(hex::encode(key.verifying_key().to_bytes())),
            require_mandate: true,
            ..rules()
        };
        let checker = InvariantChecker::from_rules(&config).unwrap();

        let base = trace_with(vec![vec![]]);
        assert_eq!(checker.check(&base).failed_rule.as_deref(), Some("mandate_signature"));

        let good = base
            .clone()
            .with_mandate(sign_mandate(base.proposal_id, base.declared_diff_hash, Scope::Config, &key));
        assert!(checker.check(&good).passed);

        let swapped = base.clone().with_mandate(sign_mandate(
            base.proposal_id,
            ContentHash::compute(b"other diff"),
            Scope::Config,
            &key,
        ));
        let outcome = checker.check(&swapped);
        assert_eq!(outcome.detail.as_deref(), Some("mandate diff hash does not match evaluated diff"));
    }

    proptest! {
        #[test]
        fn prop_check_is_deterministic(costs in proptest::collection::vec(0.0f64..5.0, 0..12)) {
            let checker = InvariantChecker::from_rules(&rules()).unwrap();
            let trace = trace_with(costs.iter().map(|c| vec![call("llm", json!({}), None, *c)]).collect());
            prop_assert_eq!(checker.check(&trace), checker.check(&trace));
            let total: f64 = costs.iter().sum();
            prop_assert_eq!(checker.check(&trace).passed, total <= 10.0);
        }
    }
}
