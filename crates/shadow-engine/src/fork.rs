//! Shadow fork manager and the single evaluation lease
//!
//! At most one shadow context exists at a time. The lease is a
//! non-blocking lock: a second `fork` while it is held fails fast with
//! [`EngineError::ResourceExhausted`]. Promotion and calibration take the
//! same lease so that nothing promotes while an evaluation reads the
//! pre-evaluation configuration.
//!
//! Resources owned by a context are released by `Drop`, so every exit path
//! (verdict, error, timeout, task cancellation) tears the context down.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use shadow_core::{Configuration, InputUnit, ModificationProposal, ProposalId, ToolCall};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::EngineError;
use crate::execution::{execute_turn, PolicyFunction, SharedState, StateAccess, TurnOutcome};
use crate::replay::{InterceptedWrite, MockReplayLayer};

/// What currently holds the evaluation lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseHolder {
    Evaluation(ProposalId),
    /// Human-approved escalation being promoted
    Promotion(ProposalId),
    Calibration,
}

impl fmt::Display for LeaseHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evaluation(id) => write!(f, "evaluation of {id}"),
            Self::Promotion(id) => write!(f, "promotion of {id}"),
            Self::Calibration => f.write_str("calibration"),
        }
    }
}

/// Exclusive right to evaluate or promote
///
/// Released on drop.
#[derive(Debug)]
pub struct EvaluationLease {
    holder: LeaseHolder,
    slot: Arc<parking_lot::Mutex<Option<LeaseHolder>>>,
    _guard: OwnedMutexGuard<()>,
}

impl EvaluationLease {
    #[inline]
    #[must_use]
    pub fn holder(&self) -> LeaseHolder {
        self.holder
    }
}

impl Drop for EvaluationLease {
    fn drop(&mut self) {
        *self.slot.lock() = None;
        tracing::debug!(holder = %self.holder, "released evaluation lease");
    }
}

/// Creates shadow contexts and guards the lease
#[derive(Debug)]
pub struct ForkManager {
    lock: Arc<AsyncMutex<()>>,
    slot: Arc<parking_lot::Mutex<Option<LeaseHolder>>>,
    shared: Arc<SharedState>,
    mocks: BTreeMap<String, JsonValue>,
    turn_retries: u32,
}

impl ForkManager {
    #[must_use]
    pub fn new(shared: Arc<SharedState>, mocks: BTreeMap<String, JsonValue>, turn_retries: u32) -> Self {
        Self {
            lock: Arc::new(AsyncMutex::new(())),
            slot: Arc::new(parking_lot::Mutex::new(None)),
            shared,
            mocks,
            turn_retries,
        }
    }

    /// Take the lease without waiting
    ///
    /// # Errors
    /// Returns `ResourceExhausted` naming the current holder
    pub fn try_acquire(&self, holder: LeaseHolder) -> Result<EvaluationLease, EngineError> {
        let guard = Arc::clone(&self.lock).try_lock_owned().map_err(|_| {
            let current = *self.slot.lock();
            let current = current.map_or_else(|| "another task".to_string(), |h| h.to_string());
            EngineError::ResourceExhausted { holder: current }
        })?;
        *self.slot.lock() = Some(holder);
        tracing::debug!(holder = %holder, "acquired evaluation lease");
        Ok(EvaluationLease {
            holder,
            slot: Arc::clone(&self.slot),
            _guard: guard,
        })
    }

    /// Lease holder, if any
    #[must_use]
    pub fn current_holder(&self) -> Option<LeaseHolder> {
        *self.slot.lock()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.current_holder().is_some()
    }

    /// Fork a shadow context bound to `proposal` applied on `base`
    ///
    /// # Errors
    /// Returns `ResourceExhausted` if a context is already active, or
    /// `InvalidProposal` if the diff cannot be applied to `base`
    pub fn fork(
        &self,
        base: Arc<Configuration>,
        proposal: &ModificationProposal,
    ) -> Result<ShadowContext, EngineError> {
        let lease = self.try_acquire(LeaseHolder::Evaluation(proposal.id))?;
        let params = proposal.diff.apply_to(&base)?;
        let candidate = Configuration::new(
            base.version().next(),
            params,
            Some(base.version()),
            Some(proposal.id),
        )?;

        tracing::info!(
            proposal_id = %proposal.id,
            base = %base.version(),
            candidate = %candidate.hash().short(),
            "forked shadow context"
        );

        Ok(ShadowContext {
            proposal_id: proposal.id,
            base,
            candidate,
            turn_retries: self.turn_retries,
            resources: ShadowResources {
                proposal_id: proposal.id,
                replay: MockReplayLayer::new(self.mocks.clone()),
                partition: WritePartition::new(Arc::clone(&self.shared)),
            },
            lease,
        })
    }
}

/// Private write side over read-only shared state
#[derive(Debug)]
pub struct WritePartition {
    shared: Arc<SharedState>,
    overlay: DashMap<String, JsonValue>,
}

impl WritePartition {
    fn new(shared: Arc<SharedState>) -> Self {
        Self {
            shared,
            overlay: DashMap::new(),
        }
    }

    #[must_use]
    pub fn written_keys(&self) -> usize {
        self.overlay.len()
    }

    fn checkpoint(&self) -> Vec<(String, JsonValue)> {
        self.overlay
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn restore(&self, checkpoint: &[(String, JsonValue)]) {
        self.overlay.clear();
        for (key, value) in checkpoint {
            self.overlay.insert(key.clone(), value.clone());
        }
    }
}

impl StateAccess for WritePartition {
    fn read(&self, key: &str) -> Option<JsonValue> {
        self.overlay
            .get(key)
            .map(|v| v.value().clone())
            .or_else(|| self.shared.read(key))
    }

    fn write(&self, key: &str, value: JsonValue) {
        self.overlay.insert(key.to_string(), value);
    }
}

struct ShadowResources {
    proposal_id: ProposalId,
    replay: MockReplayLayer,
    partition: WritePartition,
}

impl Drop for ShadowResources {
    fn drop(&mut self) {
        let writes = self.replay.writes().len();
        let partition_keys = self.partition.written_keys();
        self.replay.clear();
        self.partition.overlay.clear();
        tracing::debug!(
            proposal_id = %self.proposal_id,
            intercepted_writes = writes,
            partition_keys,
            "tore down shadow context"
        );
    }
}

/// Isolated execution context running a candidate configuration
pub struct ShadowContext {
    proposal_id: ProposalId,
    base: Arc<Configuration>,
    candidate: Configuration,
    turn_retries: u32,
    resources: ShadowResources,
    lease: EvaluationLease,
}

impl fmt::Debug for ShadowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowContext")
            .field("proposal_id", &self.proposal_id)
            .field("base", &self.base.version())
            .field("candidate", &self.candidate.hash())
            .finish_non_exhaustive()
    }
}

impl ShadowContext {
    #[must_use]
    pub fn proposal_id(&self) -> ProposalId {
        self.proposal_id
    }

    /// Configuration the diff was applied to
    #[must_use]
    pub fn base(&self) -> &Arc<Configuration> {
        &self.base
    }

    #[must_use]
    pub fn candidate(&self) -> &Configuration {
        &self.candidate
    }

    #[must_use]
    pub fn intercepted_writes(&self) -> Vec<InterceptedWrite> {
        self.resources.replay.writes()
    }

    /// Run one turn under the candidate configuration
    ///
    /// `primary_calls` seed the replay cache first. A failed turn is retried
    /// up to the configured count; the last attempt is returned either way.
    /// Writes made by a retried attempt are discarded before the next one.
    pub async fn execute(
        &self,
        policy: &dyn PolicyFunction,
        input: &InputUnit,
        primary_calls: &[ToolCall],
    ) -> TurnOutcome {
        self.resources.replay.record_primary(primary_calls);
        let write_mark = self.resources.replay.write_mark();
        let partition = self.resources.partition.checkpoint();
        let mut attempt = 0;
        loop {
            let outcome = execute_turn(
                policy,
                input,
                &self.candidate,
                &self.resources.replay,
                &self.resources.partition,
                true,
            )
            .await;
            if !outcome.record.is_failed() || attempt >= self.turn_retries {
                return outcome;
            }
            self.resources.replay.truncate_writes(write_mark);
            self.resources.partition.restore(&partition);
            attempt += 1;
            tracing::debug!(
                proposal_id = %self.proposal_id,
                turn = input.seq,
                attempt,
                "retrying failed shadow turn"
            );
        }
    }

    /// Release context resources, keeping the lease for finalization
    #[must_use]
    pub fn teardown(self) -> EvaluationLease {
        let Self { resources, lease, .. } = self;
        drop(resources);
        lease
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{PolicyError, PolicyOutput, ToolRequest, TurnContext};
    use async_trait::async_trait;
    use serde_json::json;
    use shadow_core::{ConfigDiff, ProposalMetadata, Scope};

    fn manager() -> ForkManager {
        ForkManager::new(Arc::new(SharedState::new()), BTreeMap::new(), 2)
    }

    fn base() -> Arc<Configuration> {
        Arc::new(Configuration::genesis(json!({"threshold": 0.4})).unwrap())
    }

    fn proposal(diff: ConfigDiff) -> ModificationProposal {
        ModificationProposal::new(diff, Scope::Config, ProposalMetadata::new("t"), shadow_core::VersionId::GENESIS)
    }

    #[test]
    fn second_fork_fails_fast() {
        let forks = manager();
        let p = proposal(ConfigDiff::new().set("/threshold", json!(0.5)));
        let ctx = forks.fork(base(), &p).unwrap();
        assert_eq!(ctx.candidate().params(), &json!({"threshold": 0.5}));

        let err = forks.fork(base(), &p).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted { .. }));
        assert!(err.is_retryable());

        drop(ctx);
        assert!(!forks.is_busy());
        assert!(forks.fork(base(), &p).is_ok());
    }

    #[test]
    fn invalid_diff_releases_lease() {
        let forks = manager();
        let p = proposal(ConfigDiff::new().remove("/missing"));
        let err = forks.fork(base(), &p).unwrap_err();
        assert!(matches!(err, EngineError::InvalidProposal(_)));
        assert!(!forks.is_busy());
    }

    #[test]
    fn teardown_keeps_lease() {
        let forks = manager();
        let p = proposal(ConfigDiff::new().set("/threshold", json!(0.1)));
        let lease = forks.fork(base(), &p).unwrap().teardown();
        assert_eq!(forks.current_holder(), Some(LeaseHolder::Evaluation(p.id)));
        drop(lease);
        assert_eq!(forks.current_holder(), None);
    }

    #[test]
    fn partition_shadows_shared_state() {
        let shared = Arc::new(SharedState::new());
        shared.write("k", json!(1));
        let part = WritePartition::new(Arc::clone(&shared));
        assert_eq!(part.read("k"), Some(json!(1)));
        part.write("k", json!(2));
        assert_eq!(part.read("k"), Some(json!(2)));
        assert_eq!(shared.read("k"), Some(json!(1)));
    }

    struct Flaky(parking_lot::Mutex<u32>);

    #[async_trait]
    impl PolicyFunction for Flaky {
        async fn respond(&self, _input: &InputUnit, ctx: TurnContext<'_>) -> Result<PolicyOutput, PolicyError> {
            let mut left = self.0.lock();
            if *left > 0 {
                *left -= 1;
                return Err(PolicyError("transient".into()));
            }
            let v = ctx.tools.invoke(&ToolRequest::write("notify", json!({}))).await?;
            ctx.state.write("seen", json!(true));
            Ok(PolicyOutput::respond(v))
        }
    }

    #[tokio::test]
    async fn shadow_turn_retries_then_succeeds() {
        let shared = Arc::new(SharedState::new());
        let forks = ForkManager::new(Arc::clone(&shared), BTreeMap::new(), 2);
        let p = proposal(ConfigDiff::new().set("/threshold", json!(0.1)));
        let ctx = forks.fork(base(), &p).unwrap();

        let out = ctx.execute(&Flaky(parking_lot::Mutex::new(2)), &InputUnit::new(1, json!("x")), &[]).await;
        assert!(!out.record.is_failed());
        assert!(out.record.tool_calls[0].intercepted);
        assert_eq!(ctx.intercepted_writes().len(), 1);
        assert_eq!(shared.read("seen"), None);

        let out = ctx.execute(&Flaky(parking_lot::Mutex::new(5)), &InputUnit::new(2, json!("x")), &[]).await;
        assert!(out.record.is_failed());
    }

    /// Writes, then fails while attempts remain
    struct WritesThenFails {
        attempts: parking_lot::Mutex<u32>,
        failures: u32,
    }

    #[async_trait]
    impl PolicyFunction for WritesThenFails {
        async fn respond(&self, _input: &InputUnit, ctx: TurnContext<'_>) -> Result<PolicyOutput, PolicyError> {
            let attempt = {
                let mut n = self.attempts.lock();
                *n += 1;
                *n
            };
            ctx.tools
                .invoke(&ToolRequest::write("notify", json!({"attempt": attempt})))
                .await?;
            ctx.state.write(&format!("attempt-{attempt}"), json!(true));
            if attempt <= self.failures {
                return Err(PolicyError("flaky downstream".into()));
            }
            Ok(PolicyOutput::respond(json!(attempt)))
        }
    }

    #[tokio::test]
    async fn retried_attempts_leave_no_writes_behind() {
        let forks = manager();
        let p = proposal(ConfigDiff::new().set("/threshold", json!(0.1)));
        let ctx = forks.fork(base(), &p).unwrap();
        ctx.resources.partition.write("earlier", json!(1));

        let policy = WritesThenFails {
            attempts: parking_lot::Mutex::new(0),
            failures: 2,
        };
        let out = ctx.execute(&policy, &InputUnit::new(1, json!("x")), &[]).await;
        assert!(!out.record.is_failed());
        assert_eq!(out.record.response, json!(3));

        let writes = ctx.intercepted_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].arguments, json!({"attempt": 3}));

        let partition = &ctx.resources.partition;
        assert_eq!(partition.written_keys(), 2);
        assert_eq!(partition.read("earlier"), Some(json!(1)));
        assert_eq!(partition.read("attempt-1"), None);
        assert_eq!(partition.read("attempt-3"), Some(json!(true)));
    }
}
