//! Run journal and fail-closed crash recovery
//!
//! Every evaluation run writes `Started` before it forks and `Finished` or
//! `Escalated` after its golden trace entry. On open, a run with a start
//! marker but no end marker was interrupted: it is finalized as REJECT
//! unless the golden trace already shows how it ended. Escalations without
//! a `Resolved` marker are reinstated in the gate.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shadow_core::{
    InvariantOutcome, ModificationProposal, ProposalId, Rationale, Verdict, VerdictKind,
};
use shadow_ledger::{
    EntryDraft, GoldenTrace, GoldenTraceEntry, Journal, LedgerError, MemoryJournal, Resolution,
    VersionStore,
};
use uuid::Uuid;

use crate::error::EngineError;
use crate::escalation::{EscalationGate, EscalationTicket, HumanVerdict};
use crate::evolution::EvolutionaryQueue;

/// Reason recorded for runs finalized during recovery
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunRecord {
    Started {
        run_id: Uuid,
        proposal: ModificationProposal,
        at: DateTime<Utc>,
    },
    Finished {
        run_id: Uuid,
        proposal_id: ProposalId,
        verdict: VerdictKind,
        at: DateTime<Utc>,
    },
    Escalated {
        run_id: Uuid,
        ticket: EscalationTicket,
    },
    Resolved {
        proposal_id: ProposalId,
        verdict: HumanVerdict,
        at: DateTime<Utc>,
    },
}

/// Append-only log of run boundaries
pub struct RunJournal {
    journal: Box<dyn Journal<RunRecord>>,
}

impl std::fmt::Debug for RunJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunJournal").finish_non_exhaustive()
    }
}

impl RunJournal {
    #[must_use]
    pub fn new(journal: Box<dyn Journal<RunRecord>>) -> Self {
        Self { journal }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryJournal::new()))
    }

    /// Mark the start of a run
    ///
    /// # Errors
    /// Returns error if the journal write fails
    pub fn started(&self, proposal: &ModificationProposal) -> Result<Uuid, LedgerError> {
        let run_id = Uuid::new_v4();
        self.journal.append(&RunRecord::Started {
            run_id,
            proposal: proposal.clone(),
            at: Utc::now(),
        })?;
        Ok(run_id)
    }

    /// # Errors
    /// Returns error if the journal write fails
    pub fn finished(&self, run_id: Uuid, proposal_id: ProposalId, verdict: VerdictKind) -> Result<(), LedgerError> {
        self.journal.append(&RunRecord::Finished {
            run_id,
            proposal_id,
            verdict,
            at: Utc::now(),
        })
    }

    /// # Errors
    /// Returns error if the journal write fails
    pub fn escalated(&self, run_id: Uuid, ticket: &EscalationTicket) -> Result<(), LedgerError> {
        self.journal.append(&RunRecord::Escalated {
            run_id,
            ticket: ticket.clone(),
        })
    }

    /// # Errors
    /// Returns error if the journal write fails
    pub fn resolved(&self, proposal_id: ProposalId, verdict: HumanVerdict) -> Result<(), LedgerError> {
        self.journal.append(&RunRecord::Resolved {
            proposal_id,
            verdict,
            at: Utc::now(),
        })
    }

    /// Runs and escalations left open by the last process
    ///
    /// # Errors
    /// Returns error if the journal cannot be read
    pub fn open_work(&self) -> Result<OpenWork, LedgerError> {
        let mut started: BTreeMap<Uuid, ModificationProposal> = BTreeMap::new();
        let mut order: Vec<Uuid> = Vec::new();
        let mut escalations: BTreeMap<ProposalId, EscalationTicket> = BTreeMap::new();
        let mut resolved: BTreeSet<ProposalId> = BTreeSet::new();

        for record in self.journal.load()? {
            match record {
                RunRecord::Started { run_id, proposal, .. } => {
                    order.push(run_id);
                    started.insert(run_id, proposal);
                }
                RunRecord::Finished { run_id, .. } => {
                    started.remove(&run_id);
                }
                RunRecord::Escalated { run_id, ticket } => {
                    started.remove(&run_id);
                    resolved.remove(&ticket.proposal_id());
                    escalations.insert(ticket.proposal_id(), ticket);
                }
                RunRecord::Resolved { proposal_id, .. } => {
                    resolved.insert(proposal_id);
                }
            }
        }

        let interrupted = order
            .into_iter()
            .filter_map(|id| started.remove(&id).map(|p| (id, p)))
            .collect();
        let pending = escalations
            .into_iter()
            .filter(|(id, _)| !resolved.contains(id))
            .map(|(_, t)| t)
            .collect();
        Ok(OpenWork {
            interrupted,
            pending,
        })
    }
}

/// Unfinished work found in the run journal
#[derive(Debug, Clone, Default)]
pub struct OpenWork {
    pub interrupted: Vec<(Uuid, ModificationProposal)>,
    pub pending: Vec<EscalationTicket>,
}

/// What recovery did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub rejected: usize,
    pub completed: usize,
    pub restored_escalations: usize,
    pub rolled_back: usize,
}

pub(crate) struct Recovery<'a> {
    pub(crate) runs: &'a RunJournal,
    pub(crate) versions: &'a VersionStore,
    pub(crate) golden: &'a GoldenTrace,
    pub(crate) queue: &'a EvolutionaryQueue,
    pub(crate) gate: &'a EscalationGate,
}

impl Recovery<'_> {
    /// Undo a promotion of `id` that never reached the golden trace
    fn roll_back_orphan(&self, id: ProposalId, report: &mut RecoveryReport) -> Result<(), EngineError> {
        let live = self.versions.live();
        if live.origin() == Some(id) {
            if let Some(parent) = live.parent() {
                self.versions.set_live(parent)?;
                report.rolled_back += 1;
                tracing::warn!(proposal_id = %id, from = %live.version(), to = %parent, "rolled back unrecorded promotion");
            }
        }
        Ok(())
    }

    pub(crate) fn run(&self) -> Result<RecoveryReport, EngineError> {
        let open = self.runs.open_work()?;
        let mut report = RecoveryReport::default();

        for (run_id, proposal) in open.interrupted {
            let id = proposal.id;
            let recorded: Option<GoldenTraceEntry> = self.golden.by_proposal(id).pop();
            match recorded {
                Some(entry) if entry.is_final() => {
                    self.runs.finished(run_id, id, entry.kind())?;
                    self.queue.record_outcome(id, entry.kind(), entry.resolved_by)?;
                    report.completed += 1;
                }
                Some(entry) if entry.kind() == VerdictKind::Escalate => {
                    let ticket = EscalationTicket {
                        proposal,
                        verdict: entry.verdict.clone(),
                        version_before: entry.version_before,
                        evidence: entry.evidence.clone(),
                        raised_at: entry.timestamp,
                    };
                    self.runs.escalated(run_id, &ticket)?;
                    self.queue.record_outcome(id, VerdictKind::Escalate, Resolution::Engine)?;
                    self.gate.restore(ticket);
                    report.restored_escalations += 1;
                }
                _ => {
                    self.roll_back_orphan(id, &mut report)?;
                    let rationale = Rationale::new(InvariantOutcome::pass(0)).with_reason(INTERRUPTED_REASON);
                    self.golden.append(EntryDraft {
                        proposal_id: id,
                        scope: proposal.scope,
                        verdict: Verdict::new(VerdictKind::Reject, 0.0, rationale),
                        version_before: proposal.base_version,
                        version_after: self.versions.live_version(),
                        evidence: None,
                        resolved_by: Resolution::Recovery,
                    })?;
                    self.runs.finished(run_id, id, VerdictKind::Reject)?;
                    self.queue.record_outcome(id, VerdictKind::Reject, Resolution::Recovery)?;
                    report.rejected += 1;
                    tracing::warn!(proposal_id = %id, %run_id, "rejected interrupted evaluation run");
                }
            }
        }

        for ticket in open.pending {
            let id = ticket.proposal_id();
            let human = self
                .golden
                .by_proposal(id)
                .into_iter()
                .rfind(|e| e.resolved_by == Resolution::Human && e.is_final());
            if let Some(entry) = human {
                let verdict = if entry.kind() == VerdictKind::Approve {
                    HumanVerdict::Approve
                } else {
                    HumanVerdict::Reject
                };
                self.runs.resolved(id, verdict)?;
                self.queue.record_outcome(id, entry.kind(), Resolution::Human)?;
                continue;
            }
            self.roll_back_orphan(id, &mut report)?;
            self.gate.restore(ticket);
            report.restored_escalations += 1;
        }

        if report != RecoveryReport::default() {
            tracing::info!(
                rejected = report.rejected,
                completed = report.completed,
                restored_escalations = report.restored_escalations,
                rolled_back = report.rolled_back,
                "recovered unfinished work"
            );
        }
        Ok(report)
    }
}
