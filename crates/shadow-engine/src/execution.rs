//! Execution seams: the policy function, tool gateway and state access
//!
//! The engine never interprets input or output content. A [`PolicyFunction`]
//! is a stateless capability invoked with an immutable [`Configuration`];
//! everything it does to the outside world goes through a [`ToolGateway`],
//! which is how shadow contexts get their side effects intercepted.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shadow_core::{Configuration, Effect, InputUnit, ProposalDraft, ToolCall, TurnRecord};

/// Request for one external operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub operation: String,
    pub arguments: JsonValue,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_target: Option<String>,
    #[serde(default)]
    pub cost: f64,
}

impl ToolRequest {
    #[must_use]
    pub fn read(operation: impl Into<String>, arguments: JsonValue) -> Self {
        Self {
            operation: operation.into(),
            arguments,
            effect: Effect::Read,
            egress_target: None,
            cost: 0.0,
        }
    }

    #[must_use]
    pub fn write(operation: impl Into<String>, arguments: JsonValue) -> Self {
        Self {
            effect: Effect::Write,
            ..Self::read(operation, arguments)
        }
    }

    #[inline]
    #[must_use]
    pub fn with_egress(mut self, target: impl Into<String>) -> Self {
        self.egress_target = Some(target.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("tool '{operation}' failed: {message}")]
pub struct ToolError {
    pub operation: String,
    pub message: String,
}

/// Gateway to side-effecting operations
#[async_trait]
pub trait ToolGateway: Send + Sync {
    async fn invoke(&self, request: &ToolRequest) -> Result<JsonValue, ToolError>;
}

/// Key/value state visible to a context
pub trait StateAccess: Send + Sync {
    fn read(&self, key: &str) -> Option<JsonValue>;
    fn write(&self, key: &str, value: JsonValue);
}

/// State shared by every context; only the primary writes to it
#[derive(Debug, Default)]
pub struct SharedState {
    entries: DashMap<String, JsonValue>,
}

impl SharedState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateAccess for SharedState {
    fn read(&self, key: &str) -> Option<JsonValue> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn write(&self, key: &str, value: JsonValue) {
        self.entries.insert(key.to_string(), value);
    }
}

/// Everything a policy function may touch during one turn
pub struct TurnContext<'a> {
    pub config: &'a Configuration,
    pub tools: &'a dyn ToolGateway,
    pub state: &'a dyn StateAccess,
}

/// Result of one policy invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyOutput {
    pub response: JsonValue,
    /// Proposals the policy would like evaluated later
    pub proposals: Vec<ProposalDraft>,
}

impl PolicyOutput {
    #[must_use]
    pub fn respond(response: JsonValue) -> Self {
        Self {
            response,
            proposals: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("policy failed: {0}")]
pub struct PolicyError(pub String);

impl From<ToolError> for PolicyError {
    fn from(e: ToolError) -> Self {
        Self(e.to_string())
    }
}

/// The black-box reasoning capability being configured
#[async_trait]
pub trait PolicyFunction: Send + Sync {
    async fn respond(&self, input: &InputUnit, ctx: TurnContext<'_>) -> Result<PolicyOutput, PolicyError>;
}

/// Gateway wrapper that records every exchange
pub(crate) struct RecordingGateway<'a> {
    inner: &'a dyn ToolGateway,
    intercepted: bool,
    calls: Mutex<Vec<ToolCall>>,
}

impl<'a> RecordingGateway<'a> {
    pub(crate) fn new(inner: &'a dyn ToolGateway, intercepted: bool) -> Self {
        Self {
            inner,
            intercepted,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn into_calls(self) -> Vec<ToolCall> {
        self.calls.into_inner()
    }
}

#[async_trait]
impl ToolGateway for RecordingGateway<'_> {
    async fn invoke(&self, request: &ToolRequest) -> Result<JsonValue, ToolError> {
        let result = self.inner.invoke(request).await;
        let response = match &result {
            Ok(v) => v.clone(),
            Err(e) => serde_json::json!({ "error": e.message }),
        };
        self.calls.lock().push(ToolCall {
            operation: request.operation.clone(),
            arguments: request.arguments.clone(),
            effect: request.effect,
            egress_target: request.egress_target.clone(),
            cost: request.cost,
            response,
            intercepted: self.intercepted,
        });
        result
    }
}

/// One executed turn plus any proposals it emitted
#[derive(Debug, Clone)]
pub(crate) struct TurnOutcome {
    pub(crate) record: TurnRecord,
    pub(crate) proposals: Vec<ProposalDraft>,
}

/// Run `policy` for one input, recording every tool exchange
pub(crate) async fn execute_turn(
    policy: &dyn PolicyFunction,
    input: &InputUnit,
    config: &Configuration,
    tools: &dyn ToolGateway,
    state: &dyn StateAccess,
    intercepted: bool,
) -> TurnOutcome {
    let recorder = RecordingGateway::new(tools, intercepted);
    let result = policy
        .respond(
            input,
            TurnContext {
                config,
                tools: &recorder,
                state,
            },
        )
        .await;
    let calls = recorder.into_calls();
    match result {
        Ok(output) => TurnOutcome {
            record: TurnRecord::ok(input.seq, output.response, calls),
            proposals: output.proposals,
        },
        Err(e) => {
            let mut record = TurnRecord::failed(input.seq, e.0);
            record.tool_calls = calls;
            TurnOutcome {
                record,
                proposals: Vec::new(),
            }
        }
    }
}
