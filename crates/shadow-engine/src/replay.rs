//! Mock/replay tool layer for shadow contexts
//!
//! Every operation a shadow context performs lands here instead of on a real
//! system. Responses come from, in order:
//!
//! 1. The replay cache, seeded from the primary's recorded calls
//! 2. Configured mock responses keyed by operation name
//! 3. A synthetic response derived from a digest of the request
//!
//! Within one run the first answer for an `(operation, arguments)` pair is
//! memoized, so repeated calls always agree.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use shadow_core::{canonical_json, ContentHash, Effect, ToolCall};

use crate::execution::{ToolError, ToolGateway, ToolRequest};

type CallKey = (String, String);

fn call_key(operation: &str, arguments: &JsonValue) -> CallKey {
    (operation.to_string(), canonical_json(arguments))
}

/// Where an intercepted response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Replay,
    Mock,
    Synthetic,
}

/// Intercepted write, recorded but never applied
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptedWrite {
    pub operation: String,
    pub arguments: JsonValue,
    pub egress_target: Option<String>,
}

#[derive(Debug, Default)]
struct ReplayState {
    cache: HashMap<CallKey, JsonValue>,
    memo: HashMap<CallKey, JsonValue>,
    writes: Vec<InterceptedWrite>,
    hits: HashMap<&'static str, u64>,
}

/// Deterministic substitute for external systems
#[derive(Debug)]
pub struct MockReplayLayer {
    mocks: BTreeMap<String, JsonValue>,
    state: Mutex<ReplayState>,
}

impl MockReplayLayer {
    #[must_use]
    pub fn new(mocks: BTreeMap<String, JsonValue>) -> Self {
        Self {
            mocks,
            state: Mutex::new(ReplayState::default()),
        }
    }

    /// Seed the replay cache from primary-side calls
    ///
    /// The first captured response for a key wins.
    pub fn record_primary<'a>(&self, calls: impl IntoIterator<Item = &'a ToolCall>) {
        let mut state = self.state.lock();
        for call in calls {
            state
                .cache
                .entry(call_key(&call.operation, &call.arguments))
                .or_insert_with(|| call.response.clone());
        }
    }

    /// Answer one intercepted request
    pub fn respond(&self, request: &ToolRequest) -> (JsonValue, ResponseSource) {
        let key = call_key(&request.operation, &request.arguments);
        let mut state = self.state.lock();

        if request.effect == Effect::Write {
            state.writes.push(InterceptedWrite {
                operation: request.operation.clone(),
                arguments: request.arguments.clone(),
                egress_target: request.egress_target.clone(),
            });
        }

        if let Some(memo) = state.memo.get(&key) {
            let value = memo.clone();
            *state.hits.entry("memo").or_default() += 1;
            return (value, ResponseSource::Replay);
        }

        let (value, source) = if let Some(cached) = state.cache.get(&key) {
            (cached.clone(), ResponseSource::Replay)
        } else if let Some(mock) = self.mocks.get(&request.operation) {
            (mock.clone(), ResponseSource::Mock)
        } else {
            (synthesize(request), ResponseSource::Synthetic)
        };

        let label = match source {
            ResponseSource::Replay => "replay",
            ResponseSource::Mock => "mock",
            ResponseSource::Synthetic => "synthetic",
        };
        *state.hits.entry(label).or_default() += 1;
        state.memo.insert(key, value.clone());
        (value, source)
    }

    /// Writes the shadow attempted, in order
    #[must_use]
    pub fn writes(&self) -> Vec<InterceptedWrite> {
        self.state.lock().writes.clone()
    }

    /// Number of writes recorded so far, for [`Self::truncate_writes`]
    #[must_use]
    pub fn write_mark(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// Forget writes recorded after `mark`
    pub fn truncate_writes(&self, mark: usize) {
        self.state.lock().writes.truncate(mark);
    }

    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Drop all cached and memoized responses
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let hits: u64 = state.hits.values().sum();
        tracing::debug!(
            cached = state.cache.len(),
            writes = state.writes.len(),
            hits,
            "clearing replay layer"
        );
        *state = ReplayState::default();
    }
}

fn synthesize(request: &ToolRequest) -> JsonValue {
    let digest = ContentHash::compute(
        format!("{}\u{0}{}", request.operation, canonical_json(&request.arguments)).as_bytes(),
    );
    match request.effect {
        Effect::Read => json!({
            "synthetic": true,
            "operation": request.operation,
            "digest": digest.short(),
        }),
        Effect::Write => json!({
            "synthetic": true,
            "operation": request.operation,
            "acknowledged": true,
        }),
    }
}

#[async_trait]
impl ToolGateway for MockReplayLayer {
    async fn invoke(&self, request: &ToolRequest) -> Result<JsonValue, ToolError> {
        let (value, source) = self.respond(request);
        tracing::trace!(operation = %request.operation, ?source, "intercepted tool call");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn primary_call(op: &str, args: JsonValue, response: JsonValue) -> ToolCall {
        ToolCall {
            operation: op.to_string(),
            arguments: args,
            effect: Effect::Read,
            egress_target: None,
            cost: 0.0,
            response,
            intercepted: false,
        }
    }

    #[test]
    fn replays_primary_response_first() {
        let mut mocks = BTreeMap::new();
        mocks.insert("search".to_string(), json!("mocked"));
        let layer = MockReplayLayer::new(mocks);
        layer.record_primary(&[
            primary_call("search", json!({"q": "a", "k": 3}), json!(["doc1"])),
            primary_call("search", json!({"k": 3, "q": "a"}), json!(["later"])),
        ]);

        let (value, source) = layer.respond(&ToolRequest::read("search", json!({"k": 3, "q": "a"})));
        assert_eq!(value, json!(["doc1"]));
        assert_eq!(source, ResponseSource::Replay);

        let (value, source) = layer.respond(&ToolRequest::read("search", json!({"q": "b"})));
        assert_eq!(value, json!("mocked"));
        assert_eq!(source, ResponseSource::Mock);
    }

    #[test]
    fn synthetic_responses_are_deterministic() {
        let a = MockReplayLayer::new(BTreeMap::new());
        let b = MockReplayLayer::new(BTreeMap::new());
        let req = ToolRequest::read("lookup", json!({"id": 42}));
        let (first, source) = a.respond(&req);
        assert_eq!(source, ResponseSource::Synthetic);
        assert_eq!(a.respond(&req).0, first);
        assert_eq!(b.respond(&req).0, first);
        assert_ne!(a.respond(&ToolRequest::read("lookup", json!({"id": 43}))).0, first);
    }

    #[test]
    fn writes_are_recorded_not_applied() {
        let layer = MockReplayLayer::new(BTreeMap::new());
        let req = ToolRequest::write("send_email", json!({"to": "ops"})).with_egress("smtp.internal");
        let (ack, _) = layer.respond(&req);
        assert_eq!(ack["acknowledged"], json!(true));

        let writes = layer.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].egress_target.as_deref(), Some("smtp.internal"));

        layer.clear();
        assert!(layer.writes().is_empty());
        assert_eq!(layer.cached_len(), 0);
    }

    #[test]
    fn truncated_writes_are_forgotten() {
        let layer = MockReplayLayer::new(BTreeMap::new());
        layer.respond(&ToolRequest::write("audit", json!({"n": 1})));
        let mark = layer.write_mark();
        layer.respond(&ToolRequest::write("audit", json!({"n": 2})));
        layer.respond(&ToolRequest::read("fetch", json!({})));
        assert_eq!(layer.writes().len(), 2);

        layer.truncate_writes(mark);
        let writes = layer.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].arguments, json!({"n": 1}));
    }

    #[test]
    fn memo_pins_first_answer_even_if_cache_grows() {
        let layer = MockReplayLayer::new(BTreeMap::new());
        let req = ToolRequest::read("fetch", json!({"url": "x"}));
        let (first, _) = layer.respond(&req);
        layer.record_primary(&[primary_call("fetch", json!({"url": "x"}), json!("late"))]);
        assert_eq!(layer.respond(&req).0, first);
    }
}
