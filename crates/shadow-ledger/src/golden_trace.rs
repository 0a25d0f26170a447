//! Golden trace: the hash-linked audit chain of every modification decision
//!
//! Each entry commits to its predecessor's hash, so the chain is totally
//! ordered and any edit to a recorded entry is detectable with
//! [`GoldenTrace::verify_integrity`]. Appends are serialized by a single
//! writer lock; readers never block each other.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shadow_core::{
    canonical_json, ContentHash, Evidence, ProposalId, Scope, Verdict, VerdictKind, VersionId,
};

use crate::error::LedgerError;
use crate::journal::{Journal, MemoryJournal};

/// Who produced the verdict recorded in an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Decision engine at the end of an evaluation run
    Engine,
    /// Human verdict on an escalated proposal
    Human,
    /// Fail-closed finalization of a run interrupted by a restart
    Recovery,
}

/// Content of an entry before it is linked into the chain
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    pub proposal_id: ProposalId,
    pub scope: Scope,
    pub verdict: Verdict,
    pub version_before: VersionId,
    pub version_after: VersionId,
    pub evidence: Option<Evidence>,
    pub resolved_by: Resolution,
}

/// One audit record
///
/// `prev_hash` and `hash` are SHA-256 chain digests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenTraceEntry {
    pub sequence: u64,
    pub proposal_id: ProposalId,
    pub scope: Scope,
    pub verdict: Verdict,
    pub version_before: VersionId,
    pub version_after: VersionId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    pub resolved_by: Resolution,
    pub prev_hash: ContentHash,
    pub hash: ContentHash,
}

impl GoldenTraceEntry {
    #[inline]
    #[must_use]
    pub fn kind(&self) -> VerdictKind {
        self.verdict.kind
    }

    #[inline]
    #[must_use]
    pub fn divergence(&self) -> f64 {
        self.verdict.divergence
    }

    /// Entry records an APPROVE/REJECT outcome
    #[inline]
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.verdict.kind.is_final()
    }

    /// Recompute this entry's chain digest from its fields
    ///
    /// # Errors
    /// Returns error if the rationale or evidence cannot be encoded
    pub fn compute_hash(&self) -> Result<ContentHash, LedgerError> {
        let rationale = serde_json::to_value(&self.verdict.rationale)?;
        let evidence = match &self.evidence {
            Some(e) => canonical_json(&serde_json::to_value(e)?),
            None => String::new(),
        };

        let mut hasher = Sha256::new();
        hasher.update(self.sequence.to_le_bytes());
        hasher.update(self.proposal_id.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(self.scope.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.verdict.kind.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(self.verdict.divergence.to_bits().to_le_bytes());
        hasher.update(self.version_before.0.to_le_bytes());
        hasher.update(self.version_after.0.to_le_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update([0]);
        hasher.update(canonical_json(&rationale).as_bytes());
        hasher.update([0]);
        hasher.update(evidence.as_bytes());
        hasher.update([0]);
        hasher.update(serde_json::to_vec(&self.resolved_by)?);
        hasher.update(self.prev_hash.as_bytes());
        Ok(ContentHash::from_digest(hasher.finalize().into()))
    }
}

/// Append-only, hash-linked audit log
pub struct GoldenTrace {
    journal: Box<dyn Journal<GoldenTraceEntry>>,
    entries: RwLock<Vec<GoldenTraceEntry>>,
}

impl std::fmt::Debug for GoldenTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoldenTrace")
            .field("entries", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl GoldenTrace {
    /// Load every entry from `journal`
    ///
    /// Integrity is not checked here; call [`Self::verify_integrity`].
    ///
    /// # Errors
    /// Returns error if the journal cannot be read
    pub fn open(journal: Box<dyn Journal<GoldenTraceEntry>>) -> Result<Self, LedgerError> {
        let entries = journal.load()?;
        Ok(Self {
            journal,
            entries: RwLock::new(entries),
        })
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            journal: Box::new(MemoryJournal::new()),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Link `draft` onto the chain and persist it
    ///
    /// # Errors
    /// Returns error if the entry cannot be hashed or journaled; the chain is
    /// unchanged in that case
    pub fn append(&self, draft: EntryDraft) -> Result<GoldenTraceEntry, LedgerError> {
        let mut entries = self.entries.write();
        let (sequence, prev_hash) = entries
            .last()
            .map_or((1, ContentHash::ZERO), |e| (e.sequence + 1, e.hash));

        let mut entry = GoldenTraceEntry {
            sequence,
            proposal_id: draft.proposal_id,
            scope: draft.scope,
            verdict: draft.verdict,
            version_before: draft.version_before,
            version_after: draft.version_after,
            timestamp: Utc::now(),
            evidence: draft.evidence,
            resolved_by: draft.resolved_by,
            prev_hash,
            hash: ContentHash::ZERO,
        };
        entry.hash = entry.compute_hash()?;

        if let Err(e) = self.journal.append(&entry) {
            tracing::error!(
                proposal_id = %entry.proposal_id,
                sequence,
                error = %e,
                "failed to persist golden trace entry"
            );
            return Err(e);
        }
        entries.push(entry.clone());

        tracing::debug!(
            proposal_id = %entry.proposal_id,
            sequence,
            verdict = %entry.verdict.kind,
            divergence = entry.verdict.divergence,
            "appended golden trace entry"
        );
        Ok(entry)
    }

    /// Walk the chain checking links and digests
    ///
    /// # Errors
    /// Returns `IntegrityViolation` naming the first bad entry
    pub fn verify_integrity(&self) -> Result<(), LedgerError> {
        verify_chain(&self.entries.read())
    }

    /// Snapshot of all entries, oldest first
    #[must_use]
    pub fn entries(&self) -> Vec<GoldenTraceEntry> {
        self.entries.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<GoldenTraceEntry> {
        self.entries.read().last().cloned()
    }

    /// Entries for one proposal in chain order
    #[must_use]
    pub fn by_proposal(&self, id: ProposalId) -> Vec<GoldenTraceEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.proposal_id == id)
            .cloned()
            .collect()
    }

    /// Number of APPROVE/REJECT entries (completed cycles)
    #[must_use]
    pub fn final_count(&self) -> usize {
        self.entries.read().iter().filter(|e| e.is_final()).count()
    }

    /// Most recent `limit` entries, oldest first
    #[must_use]
    pub fn tail(&self, limit: usize) -> Vec<GoldenTraceEntry> {
        let entries = self.entries.read();
        let start = entries.len().saturating_sub(limit);
        entries[start..].to_vec()
    }
}

/// Check links and digests of an entry slice starting at genesis
///
/// # Errors
/// Returns `IntegrityViolation` naming the first bad entry
pub fn verify_chain(entries: &[GoldenTraceEntry]) -> Result<(), LedgerError> {
    let mut prev = ContentHash::ZERO;
    for (idx, e) in entries.iter().enumerate() {
        let violation = |reason: &str| LedgerError::IntegrityViolation {
            sequence: e.sequence,
            reason: reason.to_string(),
        };
        if e.sequence != idx as u64 + 1 {
            return Err(violation("sequence gap"));
        }
        if e.prev_hash != prev {
            return Err(violation("predecessor hash mismatch"));
        }
        if e.compute_hash()? != e.hash {
            return Err(violation("entry digest mismatch"));
        }
        prev = e.hash;
    }
    Ok(())
}
