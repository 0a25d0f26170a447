//! Escalation gate
//!
//! ESCALATE verdicts are handed to a [`HumanApproval`] collaborator and kept
//! pending until `resolve_escalation` supplies a [`HumanVerdict`]. The
//! configuration does not change while a proposal waits here.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shadow_core::{Evidence, ModificationProposal, ProposalId, Verdict, VersionId};
use tokio::sync::mpsc;

use crate::error::EngineError;

/// Final answer from a human reviewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HumanVerdict {
    Approve,
    Reject,
}

/// Everything a reviewer needs to decide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationTicket {
    pub proposal: ModificationProposal,
    pub verdict: Verdict,
    pub version_before: VersionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    pub raised_at: DateTime<Utc>,
}

impl EscalationTicket {
    #[must_use]
    pub fn proposal_id(&self) -> ProposalId {
        self.proposal.id
    }
}

/// External human-approval collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HumanApproval: Send + Sync {
    /// Notify reviewers; the verdict arrives later through the engine
    async fn escalate(&self, ticket: &EscalationTicket) -> Result<(), EngineError>;
}

/// Reviewer that only logs the request
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingApproval;

#[async_trait]
impl HumanApproval for LoggingApproval {
    async fn escalate(&self, ticket: &EscalationTicket) -> Result<(), EngineError> {
        tracing::warn!(
            proposal_id = %ticket.proposal_id(),
            scope = %ticket.proposal.scope,
            divergence = ticket.verdict.divergence,
            reason = %ticket.verdict.rationale.summary(),
            "proposal awaiting human verdict"
        );
        Ok(())
    }
}

/// Reviewer that forwards tickets to a channel
#[derive(Debug, Clone)]
pub struct ChannelApproval {
    tx: mpsc::UnboundedSender<EscalationTicket>,
}

impl ChannelApproval {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EscalationTicket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl HumanApproval for ChannelApproval {
    async fn escalate(&self, ticket: &EscalationTicket) -> Result<(), EngineError> {
        self.tx
            .send(ticket.clone())
            .map_err(|_| EngineError::Execution("escalation channel closed".to_string()))
    }
}

/// Pending escalations awaiting a human verdict
pub struct EscalationGate {
    approver: Arc<dyn HumanApproval>,
    pending: DashMap<ProposalId, EscalationTicket>,
}

impl std::fmt::Debug for EscalationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationGate")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl EscalationGate {
    #[must_use]
    pub fn new(approver: Arc<dyn HumanApproval>) -> Self {
        Self {
            approver,
            pending: DashMap::new(),
        }
    }

    /// Record `ticket` as pending and notify reviewers
    ///
    /// A failed notification leaves the ticket pending and resolvable.
    pub async fn raise(&self, ticket: EscalationTicket) {
        let id = ticket.proposal_id();
        self.pending.insert(id, ticket.clone());
        if let Err(e) = self.approver.escalate(&ticket).await {
            tracing::warn!(proposal_id = %id, error = %e, "failed to notify reviewers");
        }
    }

    /// Reinstate a ticket without notifying, after restart or a failed resolution
    pub fn restore(&self, ticket: EscalationTicket) {
        self.pending.insert(ticket.proposal_id(), ticket);
    }

    /// Remove and return the pending ticket for `id`
    ///
    /// # Errors
    /// Returns `EscalationNotPending` if nothing waits for `id`
    pub fn take(&self, id: ProposalId) -> Result<EscalationTicket, EngineError> {
        self.pending
            .remove(&id)
            .map(|(_, ticket)| ticket)
            .ok_or(EngineError::EscalationNotPending(id))
    }

    #[must_use]
    pub fn is_pending(&self, id: ProposalId) -> bool {
        self.pending.contains_key(&id)
    }

    #[must_use]
    pub fn pending(&self) -> Vec<ProposalId> {
        let mut ids: Vec<ProposalId> = self.pending.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }
}
