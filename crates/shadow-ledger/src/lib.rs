//! Shadow Engine Ledger
//!
//! Durable, append-only state that must survive restarts:
//!
//! - [`VersionStore`]: every configuration version plus the live pointer
//! - [`GoldenTrace`]: hash-linked audit chain of every verdict
//! - [`Journal`]: JSON-lines persistence beneath both, also used by the
//!   engine for its run and evolution journals

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod error;
pub mod golden_trace;
pub mod journal;
pub mod version_store;

pub use error::LedgerError;
pub use golden_trace::{verify_chain, EntryDraft, GoldenTrace, GoldenTraceEntry, Resolution};
pub use journal::{FileJournal, Journal, MemoryJournal};
pub use version_store::{PointerMove, PointerMoveReason, VersionRecord, VersionStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
