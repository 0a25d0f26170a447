//! Append-only record journals
//!
//! A journal is the durability primitive beneath every ledger structure. The
//! file-backed implementation writes one JSON record per line and syncs after
//! each append; the in-memory implementation backs tests and ephemeral
//! engines.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::LedgerError;

/// Ordered, append-only sequence of records
pub trait Journal<T>: Send + Sync {
    /// Durably append one record
    ///
    /// # Errors
    /// Returns error if the record cannot be encoded or persisted
    fn append(&self, record: &T) -> Result<(), LedgerError>;

    /// Read back every record in append order
    ///
    /// # Errors
    /// Returns error if stored records cannot be read or decoded
    fn load(&self) -> Result<Vec<T>, LedgerError>;
}

impl<T, J> Journal<T> for std::sync::Arc<J>
where
    J: Journal<T> + ?Sized,
{
    fn append(&self, record: &T) -> Result<(), LedgerError> {
        (**self).append(record)
    }

    fn load(&self) -> Result<Vec<T>, LedgerError> {
        (**self).load()
    }
}

/// JSON-lines journal on disk
///
/// Appends are serialized by a mutex and followed by `sync_data`.
#[derive(Debug)]
pub struct FileJournal<T> {
    path: PathBuf,
    file: Mutex<File>,
    _record: PhantomData<fn() -> T>,
}

impl<T> FileJournal<T> {
    /// Open (or create) the journal at `path`
    ///
    /// A partial record after the last newline, left by a crash mid-append,
    /// is cut off so the next append starts on a fresh line.
    ///
    /// # Errors
    /// Returns error if the file or its parent directory cannot be created,
    /// or a torn tail cannot be truncated
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LedgerError::io(&path, e))?;
        trim_torn_tail(&path, &file)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            _record: PhantomData,
        })
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Truncate `file` to its last newline-terminated record
fn trim_torn_tail(path: &Path, file: &File) -> Result<(), LedgerError> {
    let bytes = std::fs::read(path).map_err(|e| LedgerError::io(path, e))?;
    let complete = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    if complete == bytes.len() {
        return Ok(());
    }
    tracing::warn!(
        path = %path.display(),
        kept_bytes = complete,
        discarded_bytes = bytes.len() - complete,
        "truncating torn journal record"
    );
    file.set_len(complete as u64)
        .and_then(|()| file.sync_data())
        .map_err(|e| LedgerError::io(path, e))
}

impl<T> Journal<T> for FileJournal<T>
where
    T: Serialize + DeserializeOwned,
{
    fn append(&self, record: &T) -> Result<(), LedgerError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        let len = file.metadata().map_err(|e| LedgerError::io(&self.path, e))?.len();
        if let Err(e) = file.write_all(&line).and_then(|()| file.sync_data()) {
            // A partial line would swallow the next append
            if let Err(cut) = file.set_len(len) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %cut,
                    "could not truncate failed journal append"
                );
            }
            return Err(LedgerError::io(&self.path, e));
        }
        Ok(())
    }

    fn load(&self) -> Result<Vec<T>, LedgerError> {
        // Hold the writer lock so a concurrent append can't be half-read
        let _guard = self.file.lock();
        let file = File::open(&self.path).map_err(|e| LedgerError::io(&self.path, e))?;
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<Result<_, _>>()
            .map_err(|e| LedgerError::io(&self.path, e))?;

        let last = lines.len().saturating_sub(1);
        let mut records = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                // A torn final line is what a crash mid-append leaves behind
                Err(e) if idx == last => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = idx + 1,
                        error = %e,
                        "ignoring torn trailing journal record"
                    );
                }
                Err(e) => {
                    return Err(LedgerError::Corrupt {
                        path: self.path.clone(),
                        line: idx + 1,
                        message: e.to_string(),
                    })
                }
            }
        }
        Ok(records)
    }
}

/// Volatile journal
#[derive(Debug)]
pub struct MemoryJournal<T> {
    records: Mutex<Vec<T>>,
}

impl<T> MemoryJournal<T> {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// Pre-populated journal, as if reopened after a restart
    #[inline]
    #[must_use]
    pub fn with_records(records: Vec<T>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl<T> Default for MemoryJournal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Journal<T> for MemoryJournal<T>
where
    T: Clone + Send,
{
    fn append(&self, record: &T) -> Result<(), LedgerError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<T>, LedgerError> {
        Ok(self.records.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rec {
        n: u32,
    }

    #[test]
    fn file_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/records.jsonl");
        {
            let j = FileJournal::<Rec>::open(&path).unwrap();
            j.append(&Rec { n: 1 }).unwrap();
            j.append(&Rec { n: 2 }).unwrap();
        }
        let j = FileJournal::<Rec>::open(&path).unwrap();
        assert_eq!(j.load().unwrap(), vec![Rec { n: 1 }, Rec { n: 2 }]);
    }

    #[test]
    fn torn_tail_is_cut_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        std::fs::write(&path, "{\"n\":1}\n{\"n\":").unwrap();
        let j = FileJournal::<Rec>::open(&path).unwrap();
        assert_eq!(j.load().unwrap(), vec![Rec { n: 1 }]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"n\":1}\n");
    }

    #[test]
    fn torn_only_record_leaves_empty_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        std::fs::write(&path, "{\"n\"").unwrap();
        let j = FileJournal::<Rec>::open(&path).unwrap();
        assert!(j.load().unwrap().is_empty());
        j.append(&Rec { n: 7 }).unwrap();
        assert_eq!(j.load().unwrap(), vec![Rec { n: 7 }]);
    }

    #[test]
    fn torn_line_seen_by_load_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let j = FileJournal::<Rec>::open(&path).unwrap();
        j.append(&Rec { n: 1 }).unwrap();
        // Written behind the journal's back after it was opened
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{\"n\":").unwrap();
        assert_eq!(j.load().unwrap(), vec![Rec { n: 1 }]);
    }

    #[test]
    fn corrupt_interior_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        std::fs::write(&path, "{\"n\":1}\ngarbage\n{\"n\":3}\n").unwrap();
        let j = FileJournal::<Rec>::open(&path).unwrap();
        assert!(matches!(j.load(), Err(LedgerError::Corrupt { line: 2, .. })));
    }

    #[test]
    fn memory_journal_appends_in_order() {
        let j = MemoryJournal::new();
        for n in 0..5 {
            j.append(&Rec { n }).unwrap();
        }
        let loaded: Vec<u32> = j.load().unwrap().into_iter().map(|r| r.n).collect();
        assert_eq!(loaded, vec![0, 1, 2, 3, 4]);
    }
}
