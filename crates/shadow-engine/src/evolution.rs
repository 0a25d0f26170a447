//! Evolutionary queue of discovered proposals
//!
//! Shadow contexts may emit proposals while they run. Those are never
//! executed by the run that found them; they are journaled here and consumed
//! strictly FIFO, one per cycle, by later evaluations.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shadow_core::{ProposalDraft, ProposalId, VerdictKind};
use shadow_ledger::{Journal, LedgerError, MemoryJournal, Resolution};

use crate::error::EngineError;

/// A proposal waiting for its cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionaryCandidate {
    pub id: u64,
    pub draft: ProposalDraft,
    /// Proposal whose shadow run discovered this one
    pub parent: ProposalId,
    /// Generation the candidate would produce if approved
    pub generation: u64,
    pub discovered_at: DateTime<Utc>,
}

/// Journaled queue events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EvolutionRecord {
    Enqueued {
        candidate: EvolutionaryCandidate,
    },
    Dequeued {
        candidate: u64,
        proposal_id: ProposalId,
    },
    Discarded {
        candidate: u64,
        reason: String,
    },
    Outcome {
        proposal_id: ProposalId,
        verdict: VerdictKind,
        resolved_by: Resolution,
    },
}

/// Progress of generational evolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationInfo {
    /// Approved cycles so far
    pub generation: u64,
    pub total_evaluated: u64,
    pub total_approved: u64,
    pub total_rejected: u64,
    pub queue_depth: usize,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<EvolutionaryCandidate>,
    next_id: u64,
    info: GenerationInfo,
}

impl QueueState {
    fn apply(&mut self, record: EvolutionRecord) {
        match record {
            EvolutionRecord::Enqueued { candidate } => {
                self.next_id = self.next_id.max(candidate.id + 1);
                self.queue.push_back(candidate);
            }
            EvolutionRecord::Dequeued { candidate, .. }
            | EvolutionRecord::Discarded { candidate, .. } => {
                self.queue.retain(|c| c.id != candidate);
            }
            EvolutionRecord::Outcome {
                verdict,
                resolved_by,
                ..
            } => {
                if resolved_by != Resolution::Human {
                    self.info.total_evaluated += 1;
                }
                match verdict {
                    VerdictKind::Approve => {
                        self.info.total_approved += 1;
                        self.info.generation += 1;
                    }
                    VerdictKind::Reject => self.info.total_rejected += 1,
                    VerdictKind::Extend | VerdictKind::Escalate => {}
                }
            }
        }
        self.info.queue_depth = self.queue.len();
    }
}

/// Durable FIFO of evolutionary candidates
pub struct EvolutionaryQueue {
    journal: Box<dyn Journal<EvolutionRecord>>,
    state: Mutex<QueueState>,
    capacity: usize,
}

impl std::fmt::Debug for EvolutionaryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolutionaryQueue")
            .field("info", &self.info())
            .finish_non_exhaustive()
    }
}

impl EvolutionaryQueue {
    /// Replay `journal` into a queue bounded by `capacity`
    ///
    /// # Errors
    /// Returns error if the journal cannot be read
    pub fn open(journal: Box<dyn Journal<EvolutionRecord>>, capacity: usize) -> Result<Self, LedgerError> {
        let mut state = QueueState {
            next_id: 1,
            ..QueueState::default()
        };
        for record in journal.load()? {
            state.apply(record);
        }
        state.info.capacity = capacity;
        Ok(Self {
            journal,
            state: Mutex::new(state),
            capacity,
        })
    }

    #[must_use]
    pub fn in_memory(capacity: usize) -> Self {
        let mut state = QueueState {
            next_id: 1,
            ..QueueState::default()
        };
        state.info.capacity = capacity;
        Self {
            journal: Box::new(MemoryJournal::new()),
            state: Mutex::new(state),
            capacity,
        }
    }

    fn commit(&self, state: &mut QueueState, record: EvolutionRecord) -> Result<(), EngineError> {
        self.journal.append(&record)?;
        state.apply(record);
        Ok(())
    }

    /// Append a discovered proposal
    ///
    /// # Errors
    /// Returns `InvalidProposal` when the queue is full or the diff is
    /// malformed, or a ledger error if the journal write fails
    pub fn enqueue(&self, draft: ProposalDraft, parent: ProposalId) -> Result<u64, EngineError> {
        draft.diff.validate()?;
        let mut state = self.state.lock();
        if state.queue.len() >= self.capacity {
            return Err(EngineError::InvalidProposal(format!(
                "evolutionary queue full (capacity {})",
                self.capacity
            )));
        }
        let candidate = EvolutionaryCandidate {
            id: state.next_id,
            generation: state.info.generation + 1,
            draft,
            parent,
            discovered_at: Utc::now(),
        };
        let id = candidate.id;
        self.commit(&mut state, EvolutionRecord::Enqueued { candidate })?;
        tracing::info!(candidate = id, parent = %parent, depth = state.queue.len(), "queued evolutionary candidate");
        Ok(id)
    }

    /// Head of the queue, left in place
    #[must_use]
    pub fn peek(&self) -> Option<EvolutionaryCandidate> {
        self.state.lock().queue.front().cloned()
    }

    /// Remove `candidate` once it has been submitted as `proposal_id`
    ///
    /// # Errors
    /// Returns error if the journal write fails
    pub fn mark_dequeued(&self, candidate: u64, proposal_id: ProposalId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        self.commit(&mut state, EvolutionRecord::Dequeued { candidate, proposal_id })
    }

    /// Drop `candidate` without evaluating it
    ///
    /// # Errors
    /// Returns error if the journal write fails
    pub fn discard(&self, candidate: u64, reason: impl Into<String>) -> Result<(), EngineError> {
        let reason = reason.into();
        tracing::warn!(candidate, reason = %reason, "discarded evolutionary candidate");
        let mut state = self.state.lock();
        self.commit(&mut state, EvolutionRecord::Discarded { candidate, reason })
    }

    /// Count a finished cycle
    ///
    /// # Errors
    /// Returns error if the journal write fails
    pub fn record_outcome(
        &self,
        proposal_id: ProposalId,
        verdict: VerdictKind,
        resolved_by: Resolution,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        self.commit(
            &mut state,
            EvolutionRecord::Outcome {
                proposal_id,
                verdict,
                resolved_by,
            },
        )
    }

    #[must_use]
    pub fn candidates(&self) -> Vec<EvolutionaryCandidate> {
        self.state.lock().queue.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn info(&self) -> GenerationInfo {
        self.state.lock().info
    }
}
