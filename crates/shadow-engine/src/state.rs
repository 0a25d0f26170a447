//! On-disk layout of the engine's journals

use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;
use shadow_ledger::{FileJournal, GoldenTrace, LedgerError, VersionStore};

use crate::evolution::EvolutionaryQueue;
use crate::runs::RunJournal;

pub const VERSIONS_FILE: &str = "versions.jsonl";
pub const GOLDEN_TRACE_FILE: &str = "golden_trace.jsonl";
pub const EVOLUTION_FILE: &str = "evolution.jsonl";
pub const RUNS_FILE: &str = "runs.jsonl";

/// Journal paths under one state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    dir: PathBuf,
}

impl StateLayout {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn versions(&self) -> PathBuf {
        self.dir.join(VERSIONS_FILE)
    }

    #[must_use]
    pub fn golden_trace(&self) -> PathBuf {
        self.dir.join(GOLDEN_TRACE_FILE)
    }

    #[must_use]
    pub fn evolution(&self) -> PathBuf {
        self.dir.join(EVOLUTION_FILE)
    }

    #[must_use]
    pub fn runs(&self) -> PathBuf {
        self.dir.join(RUNS_FILE)
    }

    /// Open the version store, bootstrapping `genesis` into an empty journal
    ///
    /// # Errors
    /// Returns error if the journal cannot be opened or replayed
    pub fn open_versions(&self, genesis: JsonValue) -> Result<VersionStore, LedgerError> {
        VersionStore::open(Box::new(FileJournal::open(self.versions())?), genesis)
    }

    /// # Errors
    /// Returns error if the journal cannot be opened or replayed
    pub fn open_golden_trace(&self) -> Result<GoldenTrace, LedgerError> {
        GoldenTrace::open(Box::new(FileJournal::open(self.golden_trace())?))
    }

    /// # Errors
    /// Returns error if the journal cannot be opened or replayed
    pub fn open_queue(&self, capacity: usize) -> Result<EvolutionaryQueue, LedgerError> {
        EvolutionaryQueue::open(Box::new(FileJournal::open(self.evolution())?), capacity)
    }

    /// # Errors
    /// Returns error if the journal cannot be opened
    pub fn open_runs(&self) -> Result<RunJournal, LedgerError> {
        Ok(RunJournal::new(Box::new(FileJournal::open(self.runs())?)))
    }

    /// True when no journal has been written yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        [self.versions(), self.golden_trace(), self.evolution(), self.runs()]
            .iter()
            .all(|p| !p.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shadow_core::VersionId;

    #[test]
    fn journals_land_under_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(dir.path());
        assert!(layout.is_empty());

        let versions = layout.open_versions(json!({"threshold": 0.4})).unwrap();
        assert_eq!(versions.live_version(), VersionId::GENESIS);
        assert!(layout.versions().exists());
        assert!(!layout.is_empty());

        let reopened = layout.open_versions(json!({"ignored": true})).unwrap();
        assert_eq!(reopened.live().get("/threshold"), Some(&json!(0.4)));
    }
}
