//! Individual bright-line rules and their configuration

use ed25519_dalek::VerifyingKey;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shadow_core::{canonical_json, ExecutionTrace};

use crate::error::InvariantConfigError;
use crate::mandate::{parse_verifying_key, verify_mandate};

/// Rule set as loaded from engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvariantRules {
    /// Hosts (and their subdomains) a context may reach; empty denies all egress
    pub egress_allowlist: Vec<String>,
    /// Cumulative budget a shadow run may consume
    pub budget_limit: Option<f64>,
    /// Regexes matched against `operation arguments`
    pub disallowed_operations: Vec<String>,
    /// Regexes matched against each turn's response text
    pub disallowed_output: Vec<String>,
    /// Hex ed25519 key that signs proposal mandates
    pub mandate_key: Option<String>,
    /// Fail traces that carry no mandate when a key is configured
    pub require_mandate: bool,
}

impl Default for InvariantRules {
    fn default() -> Self {
        Self {
            egress_allowlist: Vec::new(),
            budget_limit: None,
            disallowed_operations: default_operation_patterns(),
            disallowed_output: Vec::new(),
            mandate_key: None,
            require_mandate: false,
        }
    }
}

fn default_operation_patterns() -> Vec<String> {
    [
        r"\brm\s+-rf\s+/",
        r"\bchmod\s+777\b",
        r"\bcurl\b.*\|\s*\b(ba)?sh\b",
        r"\bwget\b.*\|\s*\b(ba)?sh\b",
        r"\bdd\s+if=/dev/",
        r"\bmkfs\b",
        r">\s*/dev/sd[a-z]",
        r"\bshutdown\b|\breboot\b",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Why a rule failed and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFailure {
    pub detail: String,
    pub turn: Option<u64>,
}

impl RuleFailure {
    fn at(turn: u64, detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            turn: Some(turn),
        }
    }
}

/// A single pure predicate over an execution trace
pub trait Rule: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// `None` when the trace satisfies the rule
    fn check(&self, trace: &ExecutionTrace) -> Option<RuleFailure>;
}

/// Every egress target must be an allowlisted host or one of its subdomains
#[derive(Debug, Clone)]
pub struct EgressAllowlist {
    hosts: Vec<String>,
}

impl EgressAllowlist {
    #[must_use]
    pub fn new(hosts: &[String]) -> Self {
        Self {
            hosts: hosts.iter().map(|h| h.trim().to_ascii_lowercase()).collect(),
        }
    }

    fn allows(&self, target: &str) -> bool {
        let Some(host) = host_of(target) else {
            return false;
        };
        self.hosts
            .iter()
            .any(|allowed| host == *allowed || host.ends_with(&format!(".{allowed}")))
    }
}

/// Extract the lowercase host from a URL or bare `host[:port]`
fn host_of(target: &str) -> Option<String> {
    let rest = target.split_once("://").map_or(target, |(_, r)| r);
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = if let Some(v6) = authority.strip_prefix('[') {
        v6.split(']').next()?
    } else {
        authority.split(':').next()?
    };
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

impl Rule for EgressAllowlist {
    fn name(&self) -> &'static str {
        "egress_allowlist"
    }

    fn check(&self, trace: &ExecutionTrace) -> Option<RuleFailure> {
        trace.tool_calls().find_map(|(turn, call)| {
            let target = call.egress_target.as_deref()?;
            (!self.allows(target)).then(|| {
                RuleFailure::at(turn, format!("egress to '{target}' via '{}' not allowlisted", call.operation))
            })
        })
    }
}

/// Cumulative spend must stay within the limit
#[derive(Debug, Clone, Copy)]
pub struct BudgetLimit {
    limit: f64,
}

impl BudgetLimit {
    /// # Errors
    /// Returns error for a negative or non-finite limit
    pub fn new(limit: f64) -> Result<Self, InvariantConfigError> {
        if !limit.is_finite() || limit < 0.0 {
            return Err(InvariantConfigError::InvalidBudget(limit));
        }
        Ok(Self { limit })
    }
}

impl Rule for BudgetLimit {
    fn name(&self) -> &'static str {
        "budget_limit"
    }

    fn check(&self, trace: &ExecutionTrace) -> Option<RuleFailure> {
        let mut spent = 0.0;
        for (turn, call) in trace.tool_calls() {
            if !call.cost.is_finite() || call.cost < 0.0 {
                return Some(RuleFailure::at(turn, format!("invalid cost {} for '{}'", call.cost, call.operation)));
            }
            spent += call.cost;
            if spent > self.limit {
                return Some(RuleFailure::at(
                    turn,
                    format!("spend {spent:.4} exceeds budget {:.4}", self.limit),
                ));
            }
        }
        None
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, InvariantConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("(?i){p}")).map_err(|source| InvariantConfigError::InvalidPattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

fn text_of(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => canonical_json(other),
    }
}

/// No operation may match a disallowed pattern
#[derive(Debug, Clone)]
pub struct DisallowedOperation {
    patterns: Vec<Regex>,
}

impl DisallowedOperation {
    /// # Errors
    /// Returns error if any pattern fails to compile
    pub fn new(patterns: &[String]) -> Result<Self, InvariantConfigError> {
        Ok(Self {
            patterns: compile_all(patterns)?,
        })
    }
}

impl Rule for DisallowedOperation {
    fn name(&self) -> &'static str {
        "disallowed_operation"
    }

    fn check(&self, trace: &ExecutionTrace) -> Option<RuleFailure> {
        trace.tool_calls().find_map(|(turn, call)| {
            let subject = format!("{} {}", call.operation, text_of(&call.arguments));
            self.patterns.iter().find(|re| re.is_match(&subject)).map(|re| {
                RuleFailure::at(
                    turn,
                    format!("operation '{}' matches disallowed pattern '{}'", call.operation, re.as_str()),
                )
            })
        })
    }
}

/// No response may match a disallowed pattern
#[derive(Debug, Clone)]
pub struct DisallowedOutput {
    patterns: Vec<Regex>,
}

impl DisallowedOutput {
    /// # Errors
    /// Returns error if any pattern fails to compile
    pub fn new(patterns: &[String]) -> Result<Self, InvariantConfigError> {
        Ok(Self {
            patterns: compile_all(patterns)?,
        })
    }
}

impl Rule for DisallowedOutput {
    fn name(&self) -> &'static str {
        "disallowed_output"
    }

    fn check(&self, trace: &ExecutionTrace) -> Option<RuleFailure> {
        trace.turns.iter().find_map(|turn| {
            let text = text_of(&turn.response);
            self.patterns
                .iter()
                .find(|re| re.is_match(&text))
                .map(|re| RuleFailure::at(turn.seq, format!("response matches disallowed pattern '{}'", re.as_str())))
        })
    }
}

/// The declared mandate must be validly signed and match the evaluated diff
#[derive(Debug, Clone)]
pub struct MandateSignature {
    key: VerifyingKey,
    required: bool,
}

impl MandateSignature {
    /// # Errors
    /// Returns error if the key is not a valid hex ed25519 public key
    pub fn new(hex_key: &str, required: bool) -> Result<Self, InvariantConfigError> {
        Ok(Self {
            key: parse_verifying_key(hex_key)?,
            required,
        })
    }
}

impl Rule for MandateSignature {
    fn name(&self) -> &'static str {
        "mandate_signature"
    }

    fn check(&self, trace: &ExecutionTrace) -> Option<RuleFailure> {
        let first_turn = trace.turns.first().map(|t| t.seq);
        let fail = |detail: &str| {
            Some(RuleFailure {
                detail: detail.to_string(),
                turn: first_turn,
            })
        };
        let Some(mandate) = &trace.mandate else {
            return if self.required { fail("no mandate declared") } else { None };
        };
        if mandate.proposal_id != trace.proposal_id {
            return fail("mandate names a different proposal");
        }
        if mandate.diff_hash != trace.declared_diff_hash {
            return fail("mandate diff hash does not match evaluated diff");
        }
        if !verify_mandate(mandate, &self.key) {
            return fail("mandate signature invalid");
        }
        None
    }
}
