//! Engine facade
//!
//! [`ShadowEngine`] wires the components together and exposes the inbound
//! interface: submit a proposal, follow its status, serve live input,
//! resolve escalations and roll back. Evaluation runs execute on spawned
//! tasks; the caller only ever waits on the status channel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use shadow_core::{
    validate_transition, ConfigDiff, Configuration, InvariantOutcome, ModificationProposal,
    ProposalId, ProposalMetadata, ProposalState, Rationale, Scope, Verdict, VerdictKind, VersionId,
};
use shadow_invariants::InvariantChecker;
use shadow_ledger::{EntryDraft, GoldenTrace, GoldenTraceEntry, Resolution, VersionStore};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::calibration::{CalibrationJob, CalibrationReport};
use crate::coordinator::{EvaluationCoordinator, Served};
use crate::error::EngineError;
use crate::escalation::{EscalationGate, EscalationTicket, HumanApproval, HumanVerdict, LoggingApproval};
use crate::evaluation::{promote_recorded, spawn_run, EvaluationRun};
use crate::evolution::{EvolutionaryCandidate, EvolutionaryQueue, GenerationInfo};
use crate::execution::{PolicyFunction, SharedState, ToolGateway};
use crate::fork::{ForkManager, LeaseHolder};
use crate::judgment::{JudgmentAdapter, JudgmentCapability, RuleBasedJudge};
use crate::runs::{Recovery, RecoveryReport, RunJournal};
use crate::settings::EngineSettings;
use crate::state::StateLayout;

/// Status reason for evaluations cut off by [`ShadowEngine::shutdown`]
pub const SHUTDOWN_REASON: &str = "interrupted by shutdown";

/// Observable state of one proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalStatus {
    pub proposal_id: ProposalId,
    pub scope: Scope,
    pub state: ProposalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<VerdictKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub divergence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Live configuration version when the status was read
    pub live_version: VersionId,
    pub turns_evaluated: u64,
    pub extensions: u32,
    pub updated_at: DateTime<Utc>,
}

impl ProposalStatus {
    fn pending(proposal: &ModificationProposal, live_version: VersionId) -> Self {
        Self {
            proposal_id: proposal.id,
            scope: proposal.scope,
            state: ProposalState::Pending,
            verdict: None,
            divergence: None,
            reason: None,
            live_version,
            turns_evaluated: 0,
            extensions: 0,
            updated_at: Utc::now(),
        }
    }

    fn from_entry(entry: &GoldenTraceEntry, state: ProposalState, live_version: VersionId) -> Self {
        let rationale = &entry.verdict.rationale;
        Self {
            proposal_id: entry.proposal_id,
            scope: entry.scope,
            state,
            verdict: Some(entry.kind()),
            divergence: Some(entry.divergence()),
            reason: Some(rationale.summary()),
            live_version,
            turns_evaluated: rationale.turns_evaluated,
            extensions: rationale.extensions,
            updated_at: entry.timestamp,
        }
    }

    /// No evaluation work remains; a human may still be due
    #[inline]
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(
            self.state,
            ProposalState::Approved | ProposalState::Rejected | ProposalState::Escalated
        )
    }
}

/// Shared engine state; evaluation tasks hold an `Arc` to it
pub(crate) struct EngineInner {
    pub(crate) settings: EngineSettings,
    pub(crate) policy: Arc<dyn PolicyFunction>,
    pub(crate) versions: Arc<VersionStore>,
    pub(crate) golden: GoldenTrace,
    pub(crate) runs: RunJournal,
    pub(crate) queue: EvolutionaryQueue,
    pub(crate) checker: InvariantChecker,
    pub(crate) adapter: JudgmentAdapter,
    pub(crate) coordinator: EvaluationCoordinator,
    pub(crate) gate: EscalationGate,
    forks: ForkManager,
    calibration: CalibrationJob,
    statuses: DashMap<ProposalId, watch::Sender<ProposalStatus>>,
    cycles_since_calibration: AtomicUsize,
    calibration_trigger: Notify,
    latest_calibration: RwLock<Option<CalibrationReport>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    recovery: RecoveryReport,
    shut_down: AtomicBool,
}

impl EngineInner {
    /// Apply `update` to a tracked status without changing its state
    pub(crate) fn update_status(&self, id: ProposalId, update: impl FnOnce(&mut ProposalStatus)) {
        if let Some(tx) = self.statuses.get(&id) {
            let live = self.versions.live_version();
            tx.send_modify(|s| {
                update(s);
                s.live_version = live;
                s.updated_at = Utc::now();
            });
        }
    }

    /// Move a tracked proposal to `to`, applying `update` on success
    ///
    /// Illegal steps are logged and ignored; the status keeps its state.
    pub(crate) fn transition(
        &self,
        id: ProposalId,
        to: ProposalState,
        update: impl FnOnce(&mut ProposalStatus),
    ) {
        let Some(tx) = self.statuses.get(&id) else {
            tracing::warn!(proposal_id = %id, to = %to, "transition for untracked proposal");
            return;
        };
        let live = self.versions.live_version();
        tx.send_if_modified(|s| match validate_transition(s.state, to) {
            Ok(()) => {
                tracing::debug!(proposal_id = %id, from = %s.state, to = %to, "proposal transition");
                s.state = to;
                update(s);
                s.live_version = live;
                s.updated_at = Utc::now();
                true
            }
            Err(e) => {
                tracing::warn!(proposal_id = %id, error = %e, "ignored illegal transition");
                false
            }
        });
    }

    fn track(&self, status: ProposalStatus) {
        let (tx, _) = watch::channel(status.clone());
        self.statuses.insert(status.proposal_id, tx);
    }

    /// Set once [`ShadowEngine::shutdown`] has run; runs stop before commit
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Count a finished cycle and wake calibration when enough have passed
    pub(crate) fn cycle_completed(&self) {
        let cycles = self.cycles_since_calibration.fetch_add(1, Ordering::SeqCst) + 1;
        let c = &self.settings.calibration;
        if c.enabled && cycles >= c.min_cycles {
            tracing::debug!(cycles, "calibration threshold reached");
            self.calibration_trigger.notify_one();
        }
    }

    /// Fork and register a run without starting it
    fn begin(&self, mut proposal: ModificationProposal) -> Result<EvaluationRun, EngineError> {
        proposal.diff.validate()?;
        let diff_hash = proposal
            .diff
            .hash()
            .map_err(|e| EngineError::InvalidProposal(e.to_string()))?;
        let id = proposal.id;
        if self.statuses.contains_key(&id) || !self.golden.by_proposal(id).is_empty() {
            return Err(EngineError::InvalidProposal(format!("proposal {id} already submitted")));
        }

        let live = self.versions.live();
        if proposal.base_version != live.version() {
            tracing::debug!(
                proposal_id = %id,
                declared = %proposal.base_version,
                live = %live.version(),
                "rebased proposal onto live configuration"
            );
            proposal.base_version = live.version();
        }

        let context = self.forks.fork(live, &proposal)?;
        let run_id = self.runs.started(&proposal)?;
        self.track(ProposalStatus::pending(&proposal, proposal.base_version));
        self.transition(id, ProposalState::Evaluating, |_| {});
        let feed = self.coordinator.attach(id);

        Ok(EvaluationRun {
            run_id,
            proposal,
            diff_hash,
            context,
            feed,
        })
    }

    pub(crate) fn submit(self: &Arc<Self>, proposal: ModificationProposal) -> Result<ProposalId, EngineError> {
        let run = self.begin(proposal)?;
        let id = run.proposal.id;
        spawn_run(Arc::clone(self), run);
        Ok(id)
    }

    /// Submit the head of the evolutionary queue
    ///
    /// Candidates whose diff no longer applies are discarded and the next
    /// one is tried. Returns `None` when the queue is empty.
    pub(crate) async fn advance_cycle(self: &Arc<Self>) -> Result<Option<ProposalId>, EngineError> {
        while let Some(candidate) = self.queue.peek() {
            let proposal = candidate_proposal(&candidate, self.versions.live_version());
            match self.begin(proposal) {
                Ok(run) => {
                    let id = run.proposal.id;
                    if let Err(e) = self.queue.mark_dequeued(candidate.id, id) {
                        self.abandon(run, &format!("could not dequeue candidate {}: {e}", candidate.id));
                        return Err(e);
                    }
                    spawn_run(Arc::clone(self), run);
                    return Ok(Some(id));
                }
                Err(EngineError::InvalidProposal(reason)) => {
                    self.queue.discard(candidate.id, reason)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Reject a registered run that was never started
    ///
    /// The lease is released when `run` drops. If the rejection cannot be
    /// recorded the run stays open for recovery.
    fn abandon(&self, run: EvaluationRun, reason: &str) {
        let EvaluationRun { run_id, proposal, .. } = run;
        let id = proposal.id;
        self.coordinator.detach(id);
        let rationale = Rationale::new(InvariantOutcome::pass(0)).with_reason(reason);
        let recorded = self
            .golden
            .append(EntryDraft {
                proposal_id: id,
                scope: proposal.scope,
                verdict: Verdict::new(VerdictKind::Reject, 0.0, rationale),
                version_before: proposal.base_version,
                version_after: proposal.base_version,
                evidence: None,
                resolved_by: Resolution::Engine,
            })
            .and_then(|_| self.runs.finished(run_id, id, VerdictKind::Reject));
        if let Err(e) = recorded {
            tracing::error!(proposal_id = %id, error = %e, "could not record abandoned run");
        }
        tracing::warn!(proposal_id = %id, reason, "abandoned evaluation before start");
        self.transition(id, ProposalState::Rejected, |s| {
            s.verdict = Some(VerdictKind::Reject);
            s.reason = Some(reason.to_string());
        });
    }

    async fn calibrate(&self) -> Result<CalibrationReport, EngineError> {
        let _lease = self.forks.try_acquire(LeaseHolder::Calibration)?;
        let report = self.calibration.run(&self.golden.entries()).await;
        self.cycles_since_calibration.store(0, Ordering::SeqCst);
        *self.latest_calibration.write() = Some(report.clone());
        Ok(report)
    }

    fn finish_escalation(&self, ticket: &EscalationTicket, human: HumanVerdict) -> Result<VerdictKind, EngineError> {
        let id = ticket.proposal_id();
        let base = ticket.version_before;
        let _lease = match human {
            HumanVerdict::Approve => Some(self.forks.try_acquire(LeaseHolder::Promotion(id))?),
            HumanVerdict::Reject => None,
        };

        let live = self.versions.live_version();
        let (kind, reason) = match human {
            HumanVerdict::Reject => (VerdictKind::Reject, "rejected by reviewer".to_string()),
            HumanVerdict::Approve if live != base => (
                VerdictKind::Reject,
                format!("base {base} superseded by live {live}; resubmit"),
            ),
            HumanVerdict::Approve => (VerdictKind::Approve, "approved by reviewer".to_string()),
        };

        let verdict = Verdict::new(
            kind,
            ticket.verdict.divergence,
            ticket.verdict.rationale.clone().with_reason(reason),
        );
        let draft = EntryDraft {
            proposal_id: id,
            scope: ticket.proposal.scope,
            verdict: verdict.clone(),
            version_before: base,
            version_after: base,
            evidence: None,
            resolved_by: Resolution::Human,
        };
        let version_after = if kind == VerdictKind::Approve {
            let base_config = self.versions.get(base).ok_or(EngineError::VersionNotFound(base))?;
            let params = ticket.proposal.diff.apply_to(&base_config)?;
            let (promoted, _) = promote_recorded(&self.versions, &self.golden, params, draft)?;
            promoted.version()
        } else {
            self.golden.append(draft)?;
            base
        };
        self.runs.resolved(id, human)?;
        self.queue.record_outcome(id, kind, Resolution::Human)?;

        if !self.statuses.contains_key(&id) {
            let mut status = ProposalStatus::pending(&ticket.proposal, live);
            status.state = ProposalState::Escalated;
            self.track(status);
        }
        let state = if kind == VerdictKind::Approve {
            ProposalState::Approved
        } else {
            ProposalState::Rejected
        };
        self.transition(id, state, |s| {
            s.verdict = Some(kind);
            s.reason = Some(verdict.rationale.summary());
        });

        tracing::info!(
            proposal_id = %id,
            human = ?human,
            verdict = %kind,
            version = %version_after,
            "escalation resolved"
        );
        Ok(kind)
    }

    fn status(&self, id: ProposalId) -> Result<ProposalStatus, EngineError> {
        let live = self.versions.live_version();
        if let Some(tx) = self.statuses.get(&id) {
            let mut status = tx.borrow().clone();
            status.live_version = live;
            return Ok(status);
        }
        if let Some(entry) = self.golden.by_proposal(id).pop() {
            let state = match entry.kind() {
                VerdictKind::Approve => ProposalState::Approved,
                VerdictKind::Reject => ProposalState::Rejected,
                VerdictKind::Escalate | VerdictKind::Extend => ProposalState::Escalated,
            };
            return Ok(ProposalStatus::from_entry(&entry, state, live));
        }
        Err(EngineError::ProposalNotFound(id))
    }
}

fn candidate_proposal(candidate: &EvolutionaryCandidate, live: VersionId) -> ModificationProposal {
    let metadata = ProposalMetadata::new(candidate.draft.description.clone())
        .with_parent(candidate.parent)
        .with_label("generation", candidate.generation.to_string())
        .with_label("candidate", candidate.id.to_string());
    ModificationProposal::new(candidate.draft.diff.clone(), candidate.draft.scope, metadata, live)
}

/// Builder for [`ShadowEngine`]
pub struct ShadowEngineBuilder {
    policy: Arc<dyn PolicyFunction>,
    tools: Arc<dyn ToolGateway>,
    settings: EngineSettings,
    judge: Option<Arc<dyn JudgmentCapability>>,
    approver: Option<Arc<dyn HumanApproval>>,
    shared: Option<Arc<SharedState>>,
    genesis: JsonValue,
}

impl ShadowEngineBuilder {
    #[inline]
    #[must_use]
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Judgment capability; the rule-based judge when unset
    #[inline]
    #[must_use]
    pub fn judge(mut self, judge: Arc<dyn JudgmentCapability>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Human-approval collaborator; log-only when unset
    #[inline]
    #[must_use]
    pub fn approver(mut self, approver: Arc<dyn HumanApproval>) -> Self {
        self.approver = Some(approver);
        self
    }

    #[inline]
    #[must_use]
    pub fn shared_state(mut self, shared: Arc<SharedState>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Parameters of version 1 when the version store is empty
    #[inline]
    #[must_use]
    pub fn genesis(mut self, params: JsonValue) -> Self {
        self.genesis = params;
        self
    }

    /// Open journals, recover unfinished work and assemble the engine
    ///
    /// # Errors
    /// Returns error for invalid settings or invariant rules, unreadable
    /// journals, or a golden trace that fails its integrity check
    pub fn build(self) -> Result<ShadowEngine, EngineError> {
        let settings = self.settings;
        settings.validate()?;

        let (versions, golden, queue, runs) = match &settings.state_dir {
            Some(dir) => {
                let layout = StateLayout::new(dir);
                (
                    layout.open_versions(self.genesis)?,
                    layout.open_golden_trace()?,
                    layout.open_queue(settings.evolution.capacity)?,
                    layout.open_runs()?,
                )
            }
            None => (
                VersionStore::in_memory(self.genesis)?,
                GoldenTrace::in_memory(),
                EvolutionaryQueue::in_memory(settings.evolution.capacity),
                RunJournal::in_memory(),
            ),
        };
        golden.verify_integrity()?;
        let versions = Arc::new(versions);

        let checker = InvariantChecker::from_rules(&settings.invariants)?;
        let judge = self
            .judge
            .unwrap_or_else(|| Arc::new(RuleBasedJudge::new(settings.rule_judge.clone())));
        let adapter = JudgmentAdapter::new(judge, settings.judgment.clone());
        let calibration = CalibrationJob::new(
            adapter.clone(),
            settings.scopes.clone(),
            settings.max_extensions,
            settings.calibration.clone(),
        );
        let approver = self.approver.unwrap_or_else(|| Arc::new(LoggingApproval));
        let gate = EscalationGate::new(approver);
        let shared = self.shared.unwrap_or_default();
        let forks = ForkManager::new(
            Arc::clone(&shared),
            settings.mock_responses.clone(),
            settings.shadow_turn_retries,
        );
        let coordinator = EvaluationCoordinator::new(
            Arc::clone(&self.policy),
            self.tools,
            shared,
            Arc::clone(&versions),
        );

        let recovery = Recovery {
            runs: &runs,
            versions: &versions,
            golden: &golden,
            queue: &queue,
            gate: &gate,
        }
        .run()?;

        tracing::info!(
            live = %versions.live_version(),
            golden_entries = golden.len(),
            queued = queue.len(),
            pending_escalations = gate.pending().len(),
            durable = settings.state_dir.is_some(),
            "shadow engine ready"
        );

        Ok(ShadowEngine {
            inner: Arc::new(EngineInner {
                settings,
                policy: self.policy,
                versions,
                golden,
                runs,
                queue,
                checker,
                adapter,
                coordinator,
                gate,
                forks,
                calibration,
                statuses: DashMap::new(),
                cycles_since_calibration: AtomicUsize::new(0),
                calibration_trigger: Notify::new(),
                latest_calibration: RwLock::new(None),
                scheduler: Mutex::new(None),
                recovery,
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

/// Shadow verification and promotion engine
#[derive(Clone)]
pub struct ShadowEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ShadowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowEngine")
            .field("live", &self.inner.versions.live_version())
            .field("lease", &self.inner.forks.current_holder())
            .field("queue", &self.inner.queue.info())
            .finish_non_exhaustive()
    }
}

impl ShadowEngine {
    #[must_use]
    pub fn builder(policy: Arc<dyn PolicyFunction>, tools: Arc<dyn ToolGateway>) -> ShadowEngineBuilder {
        ShadowEngineBuilder {
            policy,
            tools,
            settings: EngineSettings::default(),
            judge: None,
            approver: None,
            shared: None,
            genesis: json!({}),
        }
    }

    /// Proposal against the live configuration, not yet submitted
    #[must_use]
    pub fn prepare(&self, diff: ConfigDiff, scope: Scope, metadata: ProposalMetadata) -> ModificationProposal {
        ModificationProposal::new(diff, scope, metadata, self.inner.versions.live_version())
    }

    /// Fork a shadow context for `proposal` and start evaluating it
    ///
    /// # Errors
    /// `InvalidProposal` for a malformed or inapplicable diff (no audit
    /// entry is written), `ResourceExhausted` while another evaluation or a
    /// promotion holds the lease
    pub async fn submit(&self, proposal: ModificationProposal) -> Result<ProposalId, EngineError> {
        self.inner.submit(proposal)
    }

    /// Build and submit a proposal in one step
    ///
    /// # Errors
    /// As for [`ShadowEngine::submit`]
    pub async fn submit_proposal(
        &self,
        diff: ConfigDiff,
        scope: Scope,
        metadata: ProposalMetadata,
    ) -> Result<ProposalId, EngineError> {
        self.submit(self.prepare(diff, scope, metadata)).await
    }

    /// # Errors
    /// Returns `ProposalNotFound` for an id the engine has never seen
    pub fn get_status(&self, id: ProposalId) -> Result<ProposalStatus, EngineError> {
        self.inner.status(id)
    }

    /// Follow status changes of a proposal submitted to this process
    ///
    /// # Errors
    /// Returns `ProposalNotFound` if the proposal is not tracked
    pub fn subscribe(&self, id: ProposalId) -> Result<watch::Receiver<ProposalStatus>, EngineError> {
        self.inner
            .statuses
            .get(&id)
            .map(|tx| tx.subscribe())
            .ok_or(EngineError::ProposalNotFound(id))
    }

    /// Wait until the proposal is approved, rejected or escalated
    ///
    /// # Errors
    /// Returns `ProposalNotFound` if the proposal is not tracked
    pub async fn wait_until_settled(&self, id: ProposalId) -> Result<ProposalStatus, EngineError> {
        let mut rx = self.subscribe(id)?;
        let status = rx
            .wait_for(ProposalStatus::is_settled)
            .await
            .map_err(|_| EngineError::ProposalNotFound(id))?
            .clone();
        Ok(status)
    }

    /// Serve one live input unit; duplicated to the active shadow if any
    pub async fn handle_input(&self, payload: JsonValue) -> Served {
        self.inner.coordinator.handle(payload).await
    }

    /// Apply a human verdict to an escalated proposal
    ///
    /// An approval whose base is no longer live is recorded as REJECTED.
    ///
    /// # Errors
    /// `EscalationNotPending` if nothing waits for `id`; `ResourceExhausted`
    /// if an approval cannot take the lease, in which case the escalation
    /// stays pending
    pub async fn resolve_escalation(&self, id: ProposalId, verdict: HumanVerdict) -> Result<ProposalStatus, EngineError> {
        let ticket = self.inner.gate.take(id)?;
        match self.inner.finish_escalation(&ticket, verdict) {
            Ok(_) => self.inner.status(id),
            Err(e) => {
                tracing::warn!(proposal_id = %id, error = %e, "escalation left pending");
                self.inner.gate.restore(ticket);
                Err(e)
            }
        }
    }

    /// Point live traffic at a recorded version
    ///
    /// Rolling back to the version that is already live is a no-op.
    ///
    /// # Errors
    /// Returns `VersionNotFound` if `version` was never recorded
    pub fn rollback(&self, version: VersionId) -> Result<Arc<Configuration>, EngineError> {
        let target = self
            .inner
            .versions
            .get(version)
            .ok_or(EngineError::VersionNotFound(version))?;
        match self.inner.versions.set_live(version)? {
            Some(moved) => tracing::info!(from = %moved.from, to = %moved.to, "rolled back live configuration"),
            None => tracing::debug!(version = %version, "rollback target already live"),
        }
        Ok(target)
    }

    #[must_use]
    pub fn current_configuration(&self) -> Arc<Configuration> {
        self.inner.versions.live()
    }

    #[must_use]
    pub fn versions(&self) -> &VersionStore {
        &self.inner.versions
    }

    #[must_use]
    pub fn golden_trace(&self) -> &GoldenTrace {
        &self.inner.golden
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Submit the next evolutionary candidate, if any
    ///
    /// # Errors
    /// Returns `ResourceExhausted` while the lease is held; the candidate
    /// stays queued
    pub async fn advance_cycle(&self) -> Result<Option<ProposalId>, EngineError> {
        self.inner.advance_cycle().await
    }

    #[must_use]
    pub fn evolutionary_candidates(&self) -> Vec<EvolutionaryCandidate> {
        self.inner.queue.candidates()
    }

    #[must_use]
    pub fn generation_info(&self) -> GenerationInfo {
        self.inner.queue.info()
    }

    #[must_use]
    pub fn pending_escalations(&self) -> Vec<ProposalId> {
        self.inner.gate.pending()
    }

    /// What recovery did when the engine was opened
    #[must_use]
    pub fn recovery_report(&self) -> RecoveryReport {
        self.inner.recovery
    }

    /// Current lease holder
    #[must_use]
    pub fn active_lease(&self) -> Option<LeaseHolder> {
        self.inner.forks.current_holder()
    }

    /// Replay recent decisions through a fresh judge now
    ///
    /// # Errors
    /// Returns `ResourceExhausted` while an evaluation holds the lease
    pub async fn calibrate_now(&self) -> Result<CalibrationReport, EngineError> {
        self.inner.calibrate().await
    }

    #[must_use]
    pub fn latest_calibration(&self) -> Option<CalibrationReport> {
        self.inner.latest_calibration.read().clone()
    }

    /// Run calibration in the background on the configured triggers
    ///
    /// Triggers are the cycle threshold and, when set, a fixed interval. A
    /// trigger that finds the lease busy is skipped; the cycle counter keeps
    /// growing so the next finished cycle fires again.
    pub fn spawn_calibration_scheduler(&self) {
        let c = &self.inner.settings.calibration;
        if !c.enabled {
            return;
        }
        let interval = c.interval_secs.map(Duration::from_secs);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                match interval {
                    Some(period) => {
                        tokio::select! {
                            () = tokio::time::sleep(period) => {}
                            () = inner.calibration_trigger.notified() => {}
                        }
                    }
                    None => inner.calibration_trigger.notified().await,
                }
                match inner.calibrate().await {
                    Ok(report) if !report.healthy => {
                        tracing::warn!(
                            agreement_rate = report.agreement_rate,
                            drift = ?report.drift,
                            "judge calibration unhealthy"
                        );
                    }
                    Ok(_) => {}
                    Err(e) if e.is_retryable() => {
                        tracing::debug!(error = %e, "skipped calibration");
                    }
                    Err(e) => tracing::error!(error = %e, "calibration failed"),
                }
            }
        });
        if let Some(previous) = self.inner.scheduler.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop background work
    ///
    /// An evaluation in flight is abandoned: its status reads REJECTED with
    /// [`SHUTDOWN_REASON`] and recovery records the rejection the next time
    /// the state directory is opened. Pending escalations are untouched.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.scheduler.lock().take() {
            handle.abort();
        }
        if let Some(active) = self.inner.coordinator.attached() {
            tracing::warn!(proposal_id = %active, "abandoning active evaluation");
            self.inner.coordinator.detach(active);
        }

        let unsettled: Vec<ProposalId> = self
            .inner
            .statuses
            .iter()
            .filter(|entry| entry.value().borrow().state.is_active())
            .map(|entry| *entry.key())
            .collect();
        for id in unsettled {
            self.inner.transition(id, ProposalState::Rejected, |s| {
                s.verdict = Some(VerdictKind::Reject);
                s.reason = Some(SHUTDOWN_REASON.to_string());
            });
        }
    }
}
