//! One evaluation run, from fork to finalized verdict
//!
//! The run consumes the shadow feed until the scope's window is full,
//! checking invariants after every turn so a violation rejects immediately.
//! A full window goes to the judge and the decision engine; EXTEND grows the
//! window and loops. The wall-clock and turn ceilings force ESCALATE; the
//! wall-clock deadline bounds feed waits, shadow turns and judge calls alike.
//!
//! Finalization happens while the lease is still held, so nothing else can
//! promote between the base check and the version commit.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use shadow_core::{
    Configuration, ContentHash, Evidence, ExecutionTrace, InvariantOutcome, JudgmentContext,
    ModificationProposal, ProposalState, Rationale, TurnRecord, Verdict, VerdictKind, VersionId,
};
use shadow_ledger::{EntryDraft, GoldenTrace, GoldenTraceEntry, Resolution, VersionStore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::coordinator::ShadowFeed;
use crate::decision::{decide, Progress};
use crate::engine::EngineInner;
use crate::error::EngineError;
use crate::escalation::EscalationTicket;
use crate::fork::ShadowContext;

/// Everything a spawned run owns
pub(crate) struct EvaluationRun {
    pub(crate) run_id: Uuid,
    pub(crate) proposal: ModificationProposal,
    /// Hash the signed mandate must declare
    pub(crate) diff_hash: ContentHash,
    pub(crate) context: ShadowContext,
    pub(crate) feed: ShadowFeed,
}

pub(crate) fn spawn_run(inner: Arc<EngineInner>, run: EvaluationRun) -> JoinHandle<()> {
    tokio::spawn(run_evaluation(inner, run))
}

fn ceiling_exceeded(turns: u64, started: Instant) -> EngineError {
    EngineError::TimeoutExceeded {
        turns,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

fn ceiling_verdict(
    err: &EngineError,
    invariant: &InvariantOutcome,
    turns: u64,
    extensions: u32,
) -> Verdict {
    let mut rationale = Rationale::new(invariant.clone()).with_reason(err.to_string());
    rationale.turns_evaluated = turns;
    rationale.extensions = extensions;
    Verdict::new(VerdictKind::Escalate, 0.0, rationale)
}

async fn run_evaluation(inner: Arc<EngineInner>, run: EvaluationRun) {
    let EvaluationRun {
        run_id,
        proposal,
        diff_hash,
        context,
        mut feed,
    } = run;
    let id = proposal.id;
    let policy = inner.settings.policy_for(proposal.scope);
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + inner.settings.max_run_duration();
    let judgment_context = JudgmentContext {
        proposal_id: id,
        scope: proposal.scope,
        description: proposal.metadata.description.clone(),
    };

    let mut trace = ExecutionTrace::new(id, diff_hash);
    if let Some(mandate) = &proposal.mandate {
        trace = trace.with_mandate(mandate.clone());
    }
    let mut primary: Vec<TurnRecord> = Vec::new();
    let mut invariant = InvariantOutcome::pass(0);
    let mut window = u64::from(policy.min_turns);
    let mut extensions = 0u32;

    tracing::info!(
        proposal_id = %id,
        scope = %proposal.scope,
        window,
        "evaluation started"
    );

    let verdict = 'run: loop {
        while (trace.len() as u64) < window {
            let turns = trace.len() as u64;
            if turns >= inner.settings.max_turns {
                let err = ceiling_exceeded(turns, started);
                break 'run ceiling_verdict(&err, &invariant, turns, extensions);
            }

            let (input, primary_turn) = match tokio::time::timeout_at(deadline, feed.next()).await {
                Ok(Some(pair)) => pair,
                Ok(None) => {
                    // Coordinator gone: the engine is shutting down. The run
                    // stays open in the journal and recovery rejects it.
                    tracing::warn!(proposal_id = %id, "input feed closed mid-run");
                    return;
                }
                Err(_) => {
                    let err = ceiling_exceeded(turns, started);
                    break 'run ceiling_verdict(&err, &invariant, turns, extensions);
                }
            };

            let turn = context.execute(inner.policy.as_ref(), &input, &primary_turn.tool_calls);
            let Ok(outcome) = tokio::time::timeout_at(deadline, turn).await else {
                tracing::warn!(proposal_id = %id, turn = input.seq, "shadow turn still running at ceiling");
                let err = ceiling_exceeded(turns, started);
                break 'run ceiling_verdict(&err, &invariant, turns, extensions);
            };
            for draft in outcome.proposals {
                if let Err(e) = inner.queue.enqueue(draft, id) {
                    tracing::warn!(proposal_id = %id, error = %e, "dropped discovered proposal");
                }
            }
            tracing::debug!(
                proposal_id = %id,
                turn = input.seq,
                failed = outcome.record.is_failed(),
                "shadow turn complete"
            );
            primary.push(primary_turn);
            trace.push(outcome.record);
            let turns = trace.len() as u64;
            inner.update_status(id, |s| s.turns_evaluated = turns);

            invariant = inner.checker.check(&trace);
            if !invariant.passed {
                let progress = Progress {
                    turns_evaluated: turns,
                    extensions,
                    max_extensions: inner.settings.max_extensions,
                };
                break 'run decide(&invariant, None, &policy, progress);
            }
        }

        let call = inner.adapter.evaluate(&primary, &trace.turns, &judgment_context);
        let judgment = match tokio::time::timeout_at(deadline, call).await {
            Ok(Ok(j)) => Some(j),
            Ok(Err(e)) => {
                tracing::warn!(proposal_id = %id, error = %e, "judgment unavailable");
                None
            }
            Err(_) => {
                let turns = trace.len() as u64;
                tracing::warn!(proposal_id = %id, turns, "judgment still running at ceiling");
                let err = ceiling_exceeded(turns, started);
                break 'run ceiling_verdict(&err, &invariant, turns, extensions);
            }
        };
        let progress = Progress {
            turns_evaluated: trace.len() as u64,
            extensions,
            max_extensions: inner.settings.max_extensions,
        };
        let verdict = decide(&invariant, judgment.as_ref(), &policy, progress);
        if verdict.kind != VerdictKind::Extend {
            break 'run verdict;
        }

        extensions += 1;
        window += u64::from(policy.extension_turns);
        tracing::info!(
            proposal_id = %id,
            extensions,
            window,
            divergence = verdict.divergence,
            reason = %verdict.rationale.summary(),
            "evaluation extended"
        );
        inner.transition(id, ProposalState::Extended, |s| {
            s.extensions = extensions;
            s.divergence = Some(verdict.divergence);
        });
        inner.transition(id, ProposalState::Evaluating, |_| {});
    };

    let evidence = Evidence {
        primary,
        shadow: trace.turns,
        context: judgment_context,
    };
    finalize(&inner, run_id, proposal, context, verdict, evidence).await;
}

async fn finalize(
    inner: &Arc<EngineInner>,
    run_id: Uuid,
    proposal: ModificationProposal,
    context: ShadowContext,
    verdict: Verdict,
    evidence: Evidence,
) {
    let id = proposal.id;
    inner.coordinator.detach(id);
    if inner.is_shut_down() {
        // Dropping the context releases the lease; recovery settles the run
        tracing::warn!(proposal_id = %id, verdict = %verdict.kind, "engine shut down before commit");
        return;
    }
    let base = Arc::clone(context.base());
    let candidate = context.candidate().params().clone();
    let lease = context.teardown();

    let committed = commit_verdict(inner, run_id, &proposal, base.version(), candidate, verdict, evidence).await;
    drop(lease);
    match committed {
        Ok(kind) => {
            tracing::debug!(proposal_id = %id, verdict = %kind, "evaluation finalized");
            inner.cycle_completed();
        }
        Err(e) => {
            // The run stays open in the journal; recovery settles it on restart
            tracing::error!(proposal_id = %id, error = %e, "failed to finalize evaluation");
            inner.transition(id, ProposalState::Rejected, |s| {
                s.verdict = Some(VerdictKind::Reject);
                s.reason = Some(format!("finalization failed: {e}"));
            });
        }
    }

    if inner.settings.evolution.auto_advance {
        tokio::spawn(advance_after_cycle(Arc::clone(inner)));
    }
}

async fn commit_verdict(
    inner: &EngineInner,
    run_id: Uuid,
    proposal: &ModificationProposal,
    base: VersionId,
    candidate: serde_json::Value,
    mut verdict: Verdict,
    evidence: Evidence,
) -> Result<VerdictKind, EngineError> {
    let id = proposal.id;
    if verdict.kind == VerdictKind::Approve {
        let live = inner.versions.live_version();
        if live != base {
            verdict.kind = VerdictKind::Escalate;
            verdict
                .rationale
                .reasons
                .push(format!("base {base} superseded by live {live}"));
        }
    }

    let draft = |verdict: Verdict, version_after: VersionId, evidence: Option<Evidence>| EntryDraft {
        proposal_id: id,
        scope: proposal.scope,
        verdict,
        version_before: base,
        version_after,
        evidence,
        resolved_by: Resolution::Engine,
    };

    let kind = verdict.kind;
    match kind {
        VerdictKind::Approve => {
            let (promoted, _) = promote_recorded(
                &inner.versions,
                &inner.golden,
                candidate,
                draft(verdict.clone(), base, Some(evidence)),
            )?;
            inner.runs.finished(run_id, id, kind)?;
            tracing::info!(
                proposal_id = %id,
                version = %promoted.version(),
                divergence = verdict.divergence,
                "proposal approved and promoted"
            );
        }
        VerdictKind::Reject => {
            inner.golden.append(draft(verdict.clone(), base, Some(evidence)))?;
            inner.runs.finished(run_id, id, kind)?;
            tracing::warn!(
                proposal_id = %id,
                divergence = verdict.divergence,
                reason = %verdict.rationale.summary(),
                "proposal rejected"
            );
        }
        VerdictKind::Escalate | VerdictKind::Extend => {
            let entry = inner
                .golden
                .append(draft(verdict.clone(), base, Some(evidence.clone())))?;
            let ticket = EscalationTicket {
                proposal: proposal.clone(),
                verdict: verdict.clone(),
                version_before: base,
                evidence: Some(evidence),
                raised_at: entry.timestamp,
            };
            inner.runs.escalated(run_id, &ticket)?;
            inner.gate.raise(ticket).await;
        }
    }
    inner.queue.record_outcome(id, kind, Resolution::Engine)?;

    let state = match kind {
        VerdictKind::Approve => ProposalState::Approved,
        VerdictKind::Reject => ProposalState::Rejected,
        VerdictKind::Escalate | VerdictKind::Extend => ProposalState::Escalated,
    };
    inner.transition(id, state, |s| {
        s.verdict = Some(verdict.kind);
        s.divergence = Some(verdict.divergence);
        s.reason = Some(verdict.rationale.summary());
        s.extensions = verdict.rationale.extensions;
    });
    Ok(kind)
}

/// Commit `params` on top of `draft.version_before`, make it live and record
/// the promotion in the golden trace
///
/// If the entry cannot be written the live pointer goes back to the base, so
/// the live configuration never moves without an audit record. The
/// committed snapshot stays in the store unreferenced.
pub(crate) fn promote_recorded(
    versions: &VersionStore,
    golden: &GoldenTrace,
    params: serde_json::Value,
    mut draft: EntryDraft,
) -> Result<(Arc<Configuration>, GoldenTraceEntry), EngineError> {
    let base = draft.version_before;
    let promoted = versions.promote(params, base, draft.proposal_id)?;
    draft.version_after = promoted.version();
    match golden.append(draft) {
        Ok(entry) => Ok((promoted, entry)),
        Err(e) => {
            if let Err(restore) = versions.set_live(base) {
                // Left for recovery, which rolls back unrecorded promotions
                tracing::error!(
                    version = %promoted.version(),
                    base = %base,
                    error = %restore,
                    "could not restore live pointer after unrecorded promotion"
                );
            } else {
                tracing::warn!(
                    version = %promoted.version(),
                    base = %base,
                    "restored live pointer after unrecorded promotion"
                );
            }
            Err(e.into())
        }
    }
}

/// Declared boxed so the spawn cycle run -> advance -> submit -> run
/// has a nameable type
fn advance_after_cycle(inner: Arc<EngineInner>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        match inner.advance_cycle().await {
            Ok(Some(next)) => tracing::info!(proposal_id = %next, "advanced to next generation"),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "could not advance evolutionary queue"),
        }
    })
}
