//! Testing utilities for the shadow engine workspace
//!
//! Scripted policy functions and judges, gateways that count real calls, and
//! helpers that feed live input until a proposal settles.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use shadow_core::{
    ConfigDiff, InputUnit, JudgmentContext, JudgmentResult, ProposalDraft, ProposalId, Scope,
    TurnRecord,
};
use shadow_engine::{
    EngineSettings, JudgmentCapability, JudgmentError, PolicyError, PolicyFunction, PolicyOutput,
    ProposalStatus, ShadowEngine, ToolError, ToolGateway, ToolRequest, TurnContext,
};

/// Upper bound on any single wait in the helpers
pub const WAIT: Duration = Duration::from_secs(10);

/// When a scripted rule fires
#[derive(Debug, Clone, Default)]
pub struct Trigger {
    config: Option<(String, JsonValue)>,
    turn: Option<u64>,
}

impl Trigger {
    #[must_use]
    pub fn always() -> Self {
        Self::default()
    }

    /// Fires while the configuration holds `value` at `pointer`
    #[must_use]
    pub fn config(pointer: impl Into<String>, value: JsonValue) -> Self {
        Self {
            config: Some((pointer.into(), value)),
            turn: None,
        }
    }

    /// Also require the input's `turn` field to equal `turn`
    #[must_use]
    pub fn at_turn(mut self, turn: u64) -> Self {
        self.turn = Some(turn);
        self
    }

    fn matches(&self, input: &InputUnit, ctx: &TurnContext<'_>) -> bool {
        let config_ok = self
            .config
            .as_ref()
            .map_or(true, |(pointer, value)| ctx.config.get(pointer) == Some(value));
        let turn_ok = self.turn.map_or(true, |t| turn_of(input) == t);
        config_ok && turn_ok
    }
}

/// What a scripted rule does
#[derive(Debug, Clone)]
pub enum Action {
    Respond(JsonValue),
    Tool(ToolRequest),
    Propose(ProposalDraft),
    Fail(String),
    /// Never return; the turn hangs until its future is dropped
    Stall,
}

/// Turn index carried in the payload, else the input sequence number
#[must_use]
pub fn turn_of(input: &InputUnit) -> u64 {
    input
        .payload
        .get("turn")
        .and_then(JsonValue::as_u64)
        .unwrap_or(input.seq)
}

/// Policy whose behavior is a list of (trigger, action) rules
///
/// Without a matching `Respond` the response echoes the payload, so two
/// configurations that no rule distinguishes behave identically.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPolicy {
    rules: Vec<(Trigger, Action)>,
}

impl ScriptedPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn when(mut self, trigger: Trigger, action: Action) -> Self {
        self.rules.push((trigger, action));
        self
    }
}

#[async_trait]
impl PolicyFunction for ScriptedPolicy {
    async fn respond(&self, input: &InputUnit, ctx: TurnContext<'_>) -> Result<PolicyOutput, PolicyError> {
        let mut output = PolicyOutput::respond(json!({ "echo": input.payload }));
        for (trigger, action) in &self.rules {
            if !trigger.matches(input, &ctx) {
                continue;
            }
            match action {
                Action::Respond(value) => output.response = value.clone(),
                Action::Tool(request) => {
                    ctx.tools.invoke(request).await?;
                }
                Action::Propose(draft) => output.proposals.push(draft.clone()),
                Action::Fail(message) => return Err(PolicyError(message.clone())),
                Action::Stall => std::future::pending::<()>().await,
            }
        }
        Ok(output)
    }
}

/// Gateway standing in for real external systems
///
/// Counts every call so tests can assert that shadow contexts never reach it.
#[derive(Debug, Default)]
pub struct CountingGateway {
    calls: AtomicUsize,
    log: Mutex<Vec<ToolRequest>>,
}

impl CountingGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn requests(&self) -> Vec<ToolRequest> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl ToolGateway for CountingGateway {
    async fn invoke(&self, request: &ToolRequest) -> Result<JsonValue, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(request.clone());
        Ok(json!({ "ok": true, "operation": request.operation }))
    }
}

/// Judge with a fixed answer
#[derive(Debug)]
pub struct ScriptedJudge {
    result: JudgmentResult,
    failures_left: AtomicUsize,
    always_fail: bool,
    stall: bool,
    calls: AtomicUsize,
}

impl ScriptedJudge {
    /// Clean judgment with the given divergence
    #[must_use]
    pub fn divergence(divergence: f64) -> Self {
        Self::with_result(JudgmentResult::clean(divergence))
    }

    #[must_use]
    pub fn with_result(result: JudgmentResult) -> Self {
        Self {
            result,
            failures_left: AtomicUsize::new(0),
            always_fail: false,
            stall: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Judge that accepts the call and never answers
    #[must_use]
    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::divergence(0.0)
        }
    }

    /// Judge that never answers
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            always_fail: true,
            ..Self::divergence(0.0)
        }
    }

    /// Fail the first `n` calls, then answer
    #[must_use]
    pub fn failing_first(mut self, n: usize) -> Self {
        self.failures_left = AtomicUsize::new(n);
        self
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JudgmentCapability for ScriptedJudge {
    async fn judge(
        &self,
        _primary: &[TurnRecord],
        _shadow: &[TurnRecord],
        _context: &JudgmentContext,
    ) -> Result<JudgmentResult, JudgmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stall {
            std::future::pending::<()>().await;
        }
        if self.always_fail {
            return Err(JudgmentError::Unavailable("scripted outage".into()));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(JudgmentError::Unavailable("scripted transient failure".into()));
        }
        Ok(self.result.clone())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Settings with short judgment timeouts and no background calibration
#[must_use]
pub fn fast_settings() -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.judgment.timeout_ms = 500;
    settings.judgment.retries = 1;
    settings.judgment.backoff_ms = 1;
    settings.calibration.enabled = false;
    settings.max_run_duration_secs = 60;
    settings
}

/// Genesis parameters shared by the scenarios
#[must_use]
pub fn genesis() -> JsonValue {
    json!({
        "mode": "baseline",
        "retrieval": { "threshold": 0.4, "top_k": 5 },
        "prompt": { "template": "answer briefly" }
    })
}

/// Diff that changes nothing the scripted policy looks at
#[must_use]
pub fn threshold_diff(value: f64) -> ConfigDiff {
    ConfigDiff::new().set("/retrieval/threshold", json!(value))
}

#[must_use]
pub fn mode_diff(mode: &str) -> ConfigDiff {
    ConfigDiff::new().set("/mode", json!(mode))
}

#[must_use]
pub fn draft(diff: ConfigDiff, scope: Scope, description: &str) -> ProposalDraft {
    ProposalDraft::new(diff, scope, description)
}

/// Build an engine over `policy` with an in-memory ledger
///
/// # Panics
/// Panics if the engine cannot be built
#[must_use]
pub fn engine_with(
    policy: ScriptedPolicy,
    judge: Arc<dyn JudgmentCapability>,
    settings: EngineSettings,
) -> (ShadowEngine, Arc<CountingGateway>) {
    let tools = Arc::new(CountingGateway::new());
    let engine = ShadowEngine::builder(Arc::new(policy), Arc::clone(&tools) as Arc<dyn ToolGateway>)
        .settings(settings)
        .judge(judge)
        .genesis(genesis())
        .build()
        .expect("engine builds");
    (engine, tools)
}

/// Serve `turns` live inputs, waiting for the shadow to consume each one
///
/// Stops early once the proposal settles. Returns the last status seen.
///
/// # Panics
/// Panics if the proposal is not tracked or the shadow stalls
pub async fn drive(engine: &ShadowEngine, id: ProposalId, turns: u64) -> ProposalStatus {
    let mut rx = engine.subscribe(id).expect("proposal is tracked");
    let start = rx.borrow().turns_evaluated;
    for n in 1..=turns {
        if rx.borrow().is_settled() {
            break;
        }
        let turn = start + n;
        engine.handle_input(json!({ "turn": turn, "text": format!("request {turn}") })).await;
        tokio::time::timeout(WAIT, rx.wait_for(|s| s.turns_evaluated >= turn || s.is_settled()))
            .await
            .expect("shadow consumed the turn")
            .expect("status channel open");
    }
    let status = rx.borrow().clone();
    status
}

/// Drive until the proposal settles, serving at most `max_turns` inputs
///
/// # Panics
/// Panics if the proposal does not settle
pub async fn drive_until_settled(engine: &ShadowEngine, id: ProposalId, max_turns: u64) -> ProposalStatus {
    let mut rx = engine.subscribe(id).expect("proposal is tracked");
    for _ in 0..max_turns {
        if rx.borrow().is_settled() {
            break;
        }
        drive(engine, id, 1).await;
    }
    let status = tokio::time::timeout(WAIT, rx.wait_for(ProposalStatus::is_settled))
        .await
        .expect("proposal settled")
        .expect("status channel open")
        .clone();
    status
}

/// Wait until no evaluation holds the lease
///
/// # Panics
/// Panics if the lease is not released in time
pub async fn wait_for_idle(engine: &ShadowEngine) {
    tokio::time::timeout(WAIT, async {
        while engine.active_lease().is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("lease released");
}
