//! Append-only configuration version store
//!
//! Versions are never deleted or rewritten. The live configuration is a
//! pointer into the version list; promotion and rollback both move the
//! pointer, and every move is journaled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shadow_core::{Configuration, ProposalId, VersionId};

use crate::error::LedgerError;
use crate::journal::{Journal, MemoryJournal};

/// Why the live pointer moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerMoveReason {
    Promotion,
    Rollback,
}

/// One journaled live-pointer move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerMove {
    pub from: VersionId,
    pub to: VersionId,
    pub reason: PointerMoveReason,
    pub at: DateTime<Utc>,
}

/// Journal record for the version store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionRecord {
    /// A new snapshot, optionally made live in the same record
    Commit {
        config: Configuration,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        moved: Option<PointerMove>,
    },
    /// Live pointer moved to an existing snapshot
    Pointer { moved: PointerMove },
}

#[derive(Debug)]
struct StoreState {
    versions: Vec<Arc<Configuration>>,
    live: VersionId,
    moves: Vec<PointerMove>,
}

impl StoreState {
    fn get(&self, version: VersionId) -> Option<&Arc<Configuration>> {
        // Versions are dense and start at genesis
        let idx = usize::try_from(version.0.checked_sub(VersionId::GENESIS.0)?).ok()?;
        self.versions.get(idx).filter(|c| c.version() == version)
    }

    fn apply(&mut self, record: VersionRecord) {
        match record {
            VersionRecord::Commit { config, moved } => {
                self.versions.push(Arc::new(config));
                if let Some(m) = moved {
                    self.live = m.to;
                    self.moves.push(m);
                }
            }
            VersionRecord::Pointer { moved } => {
                self.live = moved.to;
                self.moves.push(moved);
            }
        }
    }
}

/// Durable store of every configuration version
pub struct VersionStore {
    journal: Box<dyn Journal<VersionRecord>>,
    state: RwLock<StoreState>,
}

impl std::fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("VersionStore")
            .field("versions", &state.versions.len())
            .field("live", &state.live)
            .finish_non_exhaustive()
    }
}

impl VersionStore {
    /// Replay `journal`, bootstrapping it with `genesis` when empty
    ///
    /// # Errors
    /// Returns error if the journal cannot be read or written, or if the
    /// genesis parameters are not a JSON object
    pub fn open(
        journal: Box<dyn Journal<VersionRecord>>,
        genesis: JsonValue,
    ) -> Result<Self, LedgerError> {
        let records = journal.load()?;
        let mut state = StoreState {
            versions: Vec::with_capacity(records.len()),
            live: VersionId::GENESIS,
            moves: Vec::new(),
        };

        if records.is_empty() {
            let config = Configuration::genesis(genesis)?;
            let record = VersionRecord::Commit {
                config,
                moved: None,
            };
            journal.append(&record)?;
            state.apply(record);
            tracing::info!(version = %VersionId::GENESIS, "bootstrapped version store");
        } else {
            for record in records {
                state.apply(record);
            }
            tracing::debug!(
                versions = state.versions.len(),
                live = %state.live,
                "replayed version store"
            );
        }

        Ok(Self {
            journal,
            state: RwLock::new(state),
        })
    }

    /// Volatile store seeded with `genesis`
    ///
    /// # Errors
    /// Returns error if `genesis` is not a JSON object
    pub fn in_memory(genesis: JsonValue) -> Result<Self, LedgerError> {
        Self::open(Box::new(MemoryJournal::new()), genesis)
    }

    /// Configuration currently serving live traffic
    #[must_use]
    pub fn live(&self) -> Arc<Configuration> {
        let state = self.state.read();
        state
            .get(state.live)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&state.versions[0]))
    }

    #[must_use]
    pub fn live_version(&self) -> VersionId {
        self.state.read().live
    }

    /// Highest version ever committed
    #[must_use]
    pub fn latest_version(&self) -> VersionId {
        self.state
            .read()
            .versions
            .last()
            .map_or(VersionId::GENESIS, |c| c.version())
    }

    #[must_use]
    pub fn get(&self, version: VersionId) -> Option<Arc<Configuration>> {
        self.state.read().get(version).cloned()
    }

    #[must_use]
    pub fn contains(&self, version: VersionId) -> bool {
        self.state.read().get(version).is_some()
    }

    /// All versions, oldest first
    #[must_use]
    pub fn versions(&self) -> Vec<Arc<Configuration>> {
        self.state.read().versions.clone()
    }

    /// Every journaled live-pointer move, oldest first
    #[must_use]
    pub fn pointer_history(&self) -> Vec<PointerMove> {
        self.state.read().moves.clone()
    }

    /// Commit promoted parameters as the next version and make it live
    ///
    /// # Errors
    /// Returns error if `parent` is unknown, the parameters are not an
    /// object, or the journal write fails
    pub fn promote(
        &self,
        params: JsonValue,
        parent: VersionId,
        origin: ProposalId,
    ) -> Result<Arc<Configuration>, LedgerError> {
        let mut state = self.state.write();
        if state.get(parent).is_none() {
            return Err(LedgerError::VersionNotFound(parent));
        }
        let version = state
            .versions
            .last()
            .map_or(VersionId::GENESIS, |c| c.version().next());
        let config = Configuration::new(version, params, Some(parent), Some(origin))?;
        let moved = PointerMove {
            from: state.live,
            to: version,
            reason: PointerMoveReason::Promotion,
            at: Utc::now(),
        };
        let record = VersionRecord::Commit {
            config,
            moved: Some(moved),
        };
        self.journal.append(&record)?;
        state.apply(record);

        tracing::info!(
            version = %version,
            parent = %parent,
            proposal_id = %origin,
            "committed configuration version"
        );
        state
            .get(version)
            .cloned()
            .ok_or(LedgerError::VersionNotFound(version))
    }

    /// Point live traffic at an existing version
    ///
    /// Returns `None` when `version` is already live.
    ///
    /// # Errors
    /// Returns `VersionNotFound` for an unknown version, or a journal error
    pub fn set_live(&self, version: VersionId) -> Result<Option<PointerMove>, LedgerError> {
        let mut state = self.state.write();
        if state.get(version).is_none() {
            return Err(LedgerError::VersionNotFound(version));
        }
        if state.live == version {
            return Ok(None);
        }
        let moved = PointerMove {
            from: state.live,
            to: version,
            reason: PointerMoveReason::Rollback,
            at: Utc::now(),
        };
        let record = VersionRecord::Pointer {
            moved: moved.clone(),
        };
        self.journal.append(&record)?;
        state.apply(record);
        tracing::info!(from = %moved.from, to = %moved.to, "moved live configuration pointer");
        Ok(Some(moved))
    }
}
