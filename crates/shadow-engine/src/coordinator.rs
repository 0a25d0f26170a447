//! Evaluation coordinator: primary service plus the shadow tap
//!
//! Every input unit is served by the primary context on the live
//! configuration. When an evaluation is attached, the same unit and the
//! primary's recorded turn are sent down an unbounded tap to the evaluation
//! task, which may lag but never reorders: units carry a sequence number
//! assigned under the tap lock and the [`ShadowFeed`] reassembles them in
//! order. Primary service never waits on the shadow side.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use shadow_core::{InputUnit, ProposalId, TurnRecord, VersionId};
use shadow_ledger::VersionStore;
use tokio::sync::mpsc;

use crate::execution::{execute_turn, PolicyFunction, SharedState, ToolGateway};

/// What the outside world receives for one input unit
#[derive(Debug, Clone, PartialEq)]
pub struct Served {
    pub seq: u64,
    pub response: JsonValue,
    pub error: Option<String>,
    /// Live configuration version that produced the response
    pub version: VersionId,
}

#[derive(Debug)]
enum TapEnvelope {
    Turn {
        input: InputUnit,
        primary: TurnRecord,
    },
    /// Sequence number consumed without a primary turn
    Skipped(u64),
}

impl TapEnvelope {
    fn seq(&self) -> u64 {
        match self {
            Self::Turn { input, .. } => input.seq,
            Self::Skipped(seq) => *seq,
        }
    }
}

type TapSender = mpsc::UnboundedSender<TapEnvelope>;

#[derive(Debug)]
struct TapState {
    next_seq: u64,
    sink: Option<(ProposalId, TapSender)>,
}

/// Holds a sequence slot on the tap until it is filled
///
/// Dropped unfilled (handler cancelled mid-turn) it sends `Skipped` so the
/// feed never stalls on a gap.
struct TapSlot {
    seq: u64,
    sink: Option<TapSender>,
}

impl TapSlot {
    fn fill(mut self, input: InputUnit, primary: TurnRecord) {
        if let Some(sink) = self.sink.take() {
            // Receiver gone means the evaluation already finished
            let _ = sink.send(TapEnvelope::Turn { input, primary });
        }
    }
}

impl Drop for TapSlot {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            let _ = sink.send(TapEnvelope::Skipped(self.seq));
        }
    }
}

/// Serves live input and duplicates it to the attached shadow
pub struct EvaluationCoordinator {
    policy: Arc<dyn PolicyFunction>,
    tools: Arc<dyn ToolGateway>,
    shared: Arc<SharedState>,
    versions: Arc<VersionStore>,
    tap: Mutex<TapState>,
}

impl std::fmt::Debug for EvaluationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tap = self.tap.lock();
        f.debug_struct("EvaluationCoordinator")
            .field("next_seq", &tap.next_seq)
            .field("attached", &tap.sink.as_ref().map(|(id, _)| *id))
            .finish_non_exhaustive()
    }
}

impl EvaluationCoordinator {
    #[must_use]
    pub fn new(
        policy: Arc<dyn PolicyFunction>,
        tools: Arc<dyn ToolGateway>,
        shared: Arc<SharedState>,
        versions: Arc<VersionStore>,
    ) -> Self {
        Self {
            policy,
            tools,
            shared,
            versions,
            tap: Mutex::new(TapState {
                next_seq: 1,
                sink: None,
            }),
        }
    }

    /// Serve one input unit on the live configuration
    pub async fn handle(&self, payload: JsonValue) -> Served {
        let config = self.versions.live();
        let slot = {
            let mut tap = self.tap.lock();
            let seq = tap.next_seq;
            tap.next_seq += 1;
            TapSlot {
                seq,
                sink: tap.sink.as_ref().map(|(_, tx)| tx.clone()),
            }
        };
        let input = InputUnit::new(slot.seq, payload);

        let outcome = execute_turn(
            self.policy.as_ref(),
            &input,
            &config,
            self.tools.as_ref(),
            self.shared.as_ref(),
            false,
        )
        .await;
        if !outcome.proposals.is_empty() {
            tracing::debug!(
                turn = input.seq,
                count = outcome.proposals.len(),
                "ignoring proposals emitted by primary context"
            );
        }

        let record = outcome.record;
        let served = Served {
            seq: input.seq,
            response: record.response.clone(),
            error: record.error.clone(),
            version: config.version(),
        };
        slot.fill(input, record);
        served
    }

    /// Start duplicating input to an evaluation of `proposal`
    ///
    /// The feed begins with the next unit served; any previous attachment is
    /// replaced.
    pub fn attach(&self, proposal: ProposalId) -> ShadowFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tap = self.tap.lock();
        if let Some((previous, _)) = tap.sink.replace((proposal, tx)) {
            tracing::warn!(proposal_id = %previous, "replaced stale shadow tap");
        }
        ShadowFeed {
            rx,
            next: tap.next_seq,
            pending: BTreeMap::new(),
        }
    }

    /// Stop duplicating input for `proposal`
    pub fn detach(&self, proposal: ProposalId) {
        let mut tap = self.tap.lock();
        if tap.sink.as_ref().is_some_and(|(id, _)| *id == proposal) {
            tap.sink = None;
        }
    }

    #[must_use]
    pub fn attached(&self) -> Option<ProposalId> {
        self.tap.lock().sink.as_ref().map(|(id, _)| *id)
    }

    /// Sequence number the next input unit will receive
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.tap.lock().next_seq
    }
}

/// Ordered stream of (input, primary turn) pairs for one evaluation
#[derive(Debug)]
pub struct ShadowFeed {
    rx: mpsc::UnboundedReceiver<TapEnvelope>,
    next: u64,
    pending: BTreeMap<u64, TapEnvelope>,
}

impl ShadowFeed {
    /// Next unit in sequence order
    ///
    /// Returns `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<(InputUnit, TurnRecord)> {
        loop {
            if let Some(envelope) = self.pending.remove(&self.next) {
                self.next += 1;
                match envelope {
                    TapEnvelope::Turn { input, primary } => return Some((input, primary)),
                    TapEnvelope::Skipped(_) => continue,
                }
            }
            let envelope = self.rx.recv().await?;
            let seq = envelope.seq();
            if seq >= self.next {
                self.pending.insert(seq, envelope);
            }
        }
    }

    /// Units received but not yet deliverable
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{PolicyError, PolicyOutput, ToolError, ToolRequest, TurnContext};
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl PolicyFunction for Echo {
        async fn respond(&self, input: &InputUnit, ctx: TurnContext<'_>) -> Result<PolicyOutput, PolicyError> {
            let threshold = ctx.config.get("/threshold").cloned().unwrap_or(JsonValue::Null);
            Ok(PolicyOutput::respond(json!({"echo": input.payload, "threshold": threshold})))
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolGateway for NoTools {
        async fn invoke(&self, request: &ToolRequest) -> Result<JsonValue, ToolError> {
            Err(ToolError {
                operation: request.operation.clone(),
                message: "no tools".into(),
            })
        }
    }

    fn coordinator() -> EvaluationCoordinator {
        let versions = Arc::new(VersionStore::in_memory(json!({"threshold": 0.4})).unwrap());
        EvaluationCoordinator::new(Arc::new(Echo), Arc::new(NoTools), Arc::new(SharedState::new()), versions)
    }

    #[tokio::test]
    async fn serves_without_attachment() {
        let c = coordinator();
        let served = c.handle(json!("hi")).await;
        assert_eq!(served.seq, 1);
        assert_eq!(served.response["threshold"], json!(0.4));
        assert_eq!(served.version, VersionId::GENESIS);
        assert_eq!(c.next_seq(), 2);
    }

    #[tokio::test]
    async fn feed_starts_at_attach_point() {
        let c = coordinator();
        c.handle(json!("before")).await;
        let id = ProposalId::new();
        let mut feed = c.attach(id);
        c.handle(json!("a")).await;
        c.handle(json!("b")).await;
        c.detach(id);
        c.handle(json!("after")).await;

        let (first, primary) = feed.next().await.unwrap();
        assert_eq!(first.seq, 2);
        assert_eq!(primary.response["echo"], json!("a"));
        assert_eq!(feed.next().await.unwrap().0.payload, json!("b"));
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn feed_reorders_and_skips_gaps() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut feed = ShadowFeed {
            rx,
            next: 5,
            pending: BTreeMap::new(),
        };
        let turn = |seq: u64| TapEnvelope::Turn {
            input: InputUnit::new(seq, json!(seq)),
            primary: TurnRecord::ok(seq, json!(seq), Vec::new()),
        };
        tx.send(turn(7)).unwrap();
        tx.send(TapEnvelope::Skipped(6)).unwrap();
        tx.send(turn(4)).unwrap();
        tx.send(turn(5)).unwrap();
        drop(tx);

        let seqs: Vec<u64> = {
            let mut out = Vec::new();
            while let Some((input, _)) = feed.next().await {
                out.push(input.seq);
            }
            out
        };
        assert_eq!(seqs, vec![5, 7]);
    }

    #[tokio::test]
    async fn cancelled_slot_sends_skip() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(TapSlot { seq: 9, sink: Some(tx) });
        assert!(matches!(rx.recv().await, Some(TapEnvelope::Skipped(9))));
    }
}
