//! Engine settings
//!
//! Loaded from TOML, YAML or JSON (chosen by file extension). Every field has
//! a default so a partial file only overrides what it names.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shadow_core::Scope;
use shadow_invariants::InvariantRules;

/// Evaluation policy for one scope tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScopePolicy {
    /// Minimum shadow turns before any verdict
    pub min_turns: u32,
    /// Divergence above which the run is extended
    pub borderline_floor: f64,
    /// Divergence at or above which the run is escalated
    pub escalation_threshold: f64,
    /// Turns added per extension
    pub extension_turns: u32,
    /// Escalate instead of approving
    #[serde(default)]
    pub always_escalate: bool,
}

impl ScopePolicy {
    const fn tier(min_turns: u32, borderline_floor: f64, escalation_threshold: f64) -> Self {
        Self {
            min_turns,
            borderline_floor,
            escalation_threshold,
            extension_turns: min_turns,
            always_escalate: false,
        }
    }
}

/// Per-scope policies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopePolicies {
    pub config: ScopePolicy,
    pub retrieval: ScopePolicy,
    pub behavioral: ScopePolicy,
    pub reasoning: ScopePolicy,
    pub fundamental: ScopePolicy,
}

impl Default for ScopePolicies {
    fn default() -> Self {
        Self {
            config: ScopePolicy::tier(10, 0.15, 0.30),
            retrieval: ScopePolicy::tier(25, 0.15, 0.30),
            behavioral: ScopePolicy::tier(50, 0.20, 0.40),
            reasoning: ScopePolicy::tier(200, 0.10, 0.20),
            fundamental: ScopePolicy {
                always_escalate: true,
                ..ScopePolicy::tier(200, 0.10, 0.20)
            },
        }
    }
}

impl ScopePolicies {
    fn raw(&self, scope: Scope) -> &ScopePolicy {
        match scope {
            Scope::Config => &self.config,
            Scope::Retrieval => &self.retrieval,
            Scope::Behavioral => &self.behavioral,
            Scope::Reasoning => &self.reasoning,
            Scope::Fundamental => &self.fundamental,
        }
    }

    /// Effective policy; `fundamental` never gets a shorter window than any tier
    #[must_use]
    pub fn for_scope(&self, scope: Scope) -> ScopePolicy {
        let mut policy = *self.raw(scope);
        if scope == Scope::Fundamental {
            policy.min_turns = Scope::ALL
                .iter()
                .map(|s| self.raw(*s).min_turns)
                .max()
                .unwrap_or(policy.min_turns);
        }
        policy
    }
}

/// Retry and timeout policy for the external judge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgmentSettings {
    pub timeout_ms: u64,
    pub retries: u32,
    pub backoff_ms: u64,
}

impl Default for JudgmentSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retries: 3,
            backoff_ms: 200,
        }
    }
}

impl JudgmentSettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Parameters of the built-in rule-based judge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleJudgeSettings {
    pub min_quality: f64,
    pub min_alignment: f64,
    pub alignment_terms: Vec<String>,
    pub flagged_terms: Vec<String>,
}

impl Default for RuleJudgeSettings {
    fn default() -> Self {
        Self {
            min_quality: 0.6,
            min_alignment: 0.5,
            alignment_terms: Vec::new(),
            flagged_terms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub enabled: bool,
    /// Completed cycles between automatic runs
    pub min_cycles: usize,
    /// Optional fixed schedule, in seconds
    pub interval_secs: Option<u64>,
    /// Most recent golden trace entries considered
    pub lookback: usize,
    pub consistency_threshold: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_cycles: 50,
            interval_secs: None,
            lookback: 100,
            consistency_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionSettings {
    pub capacity: usize,
    /// Dequeue and submit the next candidate after every finished cycle
    pub auto_advance: bool,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            capacity: 20,
            auto_advance: false,
        }
    }
}

/// Top-level engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub scopes: ScopePolicies,
    /// Extensions allowed before a borderline run is escalated
    pub max_extensions: u32,
    /// Hard turn ceiling per run
    pub max_turns: u64,
    /// Hard wall-clock ceiling per run, in seconds
    pub max_run_duration_secs: u64,
    pub judgment: JudgmentSettings,
    /// Retries of a failed shadow turn before it is recorded as failed
    pub shadow_turn_retries: u32,
    pub invariants: InvariantRules,
    pub rule_judge: RuleJudgeSettings,
    pub calibration: CalibrationSettings,
    pub evolution: EvolutionSettings,
    /// Canned responses served to shadow contexts, by operation name
    pub mock_responses: BTreeMap<String, JsonValue>,
    /// Directory for durable journals; in-memory when absent
    pub state_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scopes: ScopePolicies::default(),
            max_extensions: 3,
            max_turns: 1000,
            max_run_duration_secs: 3600,
            judgment: JudgmentSettings::default(),
            shadow_turn_retries: 2,
            invariants: InvariantRules::default(),
            rule_judge: RuleJudgeSettings::default(),
            calibration: CalibrationSettings::default(),
            evolution: EvolutionSettings::default(),
            mock_responses: BTreeMap::new(),
            state_dir: None,
        }
    }
}

impl EngineSettings {
    /// Load and validate settings from a file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let settings: Self = match ext.as_str() {
            "toml" => toml::from_str(&text)?,
            "yaml" | "yml" => serde_yaml::from_str(&text)?,
            "json" => serde_json::from_str(&text)?,
            other => return Err(SettingsError::UnsupportedFormat(other.to_string())),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject inconsistent thresholds and ceilings
    ///
    /// # Errors
    /// Returns `Invalid` naming the first offending field
    pub fn validate(&self) -> Result<(), SettingsError> {
        for scope in Scope::ALL {
            let p = self.scopes.raw(scope);
            if p.min_turns == 0 {
                return Err(SettingsError::invalid(format!("{scope}: min_turns must be positive")));
            }
            if !p.borderline_floor.is_finite() || !p.escalation_threshold.is_finite() {
                return Err(SettingsError::invalid(format!("{scope}: thresholds must be finite")));
            }
            if p.borderline_floor < 0.0 || p.borderline_floor > p.escalation_threshold {
                return Err(SettingsError::invalid(format!(
                    "{scope}: borderline_floor {} must lie in [0, escalation_threshold {}]",
                    p.borderline_floor, p.escalation_threshold
                )));
            }
            if p.extension_turns == 0 {
                return Err(SettingsError::invalid(format!("{scope}: extension_turns must be positive")));
            }
        }
        if self.max_turns == 0 || self.max_run_duration_secs == 0 {
            return Err(SettingsError::invalid("run ceilings must be positive"));
        }
        let c = &self.calibration;
        if !(0.0..=1.0).contains(&c.consistency_threshold) {
            return Err(SettingsError::invalid("calibration.consistency_threshold must lie in [0, 1]"));
        }
        if c.lookback == 0 {
            return Err(SettingsError::invalid("calibration.lookback must be positive"));
        }
        if self.evolution.capacity == 0 {
            return Err(SettingsError::invalid("evolution.capacity must be positive"));
        }
        Ok(())
    }

    #[must_use]
    pub fn policy_for(&self, scope: Scope) -> ScopePolicy {
        self.scopes.for_scope(scope)
    }

    #[must_use]
    pub fn max_run_duration(&self) -> Duration {
        Duration::from_secs(self.max_run_duration_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported settings format '{0}'")]
    UnsupportedFormat(String),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

impl SettingsError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let s = EngineSettings::default();
        s.validate().unwrap();
        assert_eq!(s.policy_for(Scope::Config).min_turns, 10);
        assert_eq!(s.policy_for(Scope::Behavioral).escalation_threshold, 0.40);
        assert_eq!(s.evolution.capacity, 20);
    }

    #[test]
    fn fundamental_uses_largest_window() {
        let mut s = EngineSettings::default();
        s.scopes.behavioral.min_turns = 500;
        let p = s.policy_for(Scope::Fundamental);
        assert_eq!(p.min_turns, 500);
        assert!(p.always_escalate);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            r#"
max_extensions = 1

[scopes.config]
min_turns = 20
borderline_floor = 0.15
escalation_threshold = 0.30
extension_turns = 5

[invariants]
egress_allowlist = ["api.internal"]
"#,
        )
        .unwrap();
        let s = EngineSettings::load(&path).unwrap();
        assert_eq!(s.max_extensions, 1);
        assert_eq!(s.scopes.config.min_turns, 20);
        assert_eq!(s.scopes.retrieval.min_turns, 25);
        assert_eq!(s.invariants.egress_allowlist, vec!["api.internal".to_string()]);
    }

    #[test]
    fn yaml_is_supported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "calibration:\n  min_cycles: 5\n").unwrap();
        assert_eq!(EngineSettings::load(&path).unwrap().calibration.min_cycles, 5);
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let mut s = EngineSettings::default();
        s.scopes.config.borderline_floor = 0.5;
        assert!(matches!(s.validate(), Err(SettingsError::Invalid(_))));

        let mut s = EngineSettings::default();
        s.scopes.reasoning.escalation_threshold = f64::NAN;
        assert!(s.validate().is_err());
    }

    #[test]
    fn unknown_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.ini");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            EngineSettings::load(&path),
            Err(SettingsError::UnsupportedFormat(_))
        ));
    }
}
