//! Warden Audit - Append-only hash-chained ledger.
//!
//! Every governance decision in the gateway is recorded as one
//! immutable [`LedgerEntry`]. Entries are chain-linked: each carries
//! the hash of the previous entry, and its own hash covers every
//! field including that link. Any in-place edit, insertion or
//! deletion breaks the chain and is caught by [`Ledger::verify`].
//!
//! # Writer discipline
//!
//! One logical writer per ledger. [`Ledger::append`] holds the writer
//! lock across canonicalize-hash-persist-advance; if persistence
//! fails, the in-memory chain head does not move and the caller's
//! request aborts.
//!
//! # Example
//!
//! ```
//! use warden_audit::{EntryDraft, EventType, Ledger};
//!
//! let ledger = Ledger::in_memory();
//! ledger
//!     .append(EntryDraft::new(EventType::ToolCall, "github").tool("create_issue"))
//!     .unwrap();
//!
//! let report = ledger.verify().unwrap();
//! assert!(report.valid);
//! assert_eq!(report.entries_checked, 1);
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod entry;
mod error;
mod ledger;
mod storage;

pub use entry::{EntryDraft, EventType, LedgerEntry};
pub use error::{LedgerError, LedgerResult};
pub use ledger::{
    ChainVerification, DEFAULT_QUERY_LIMIT, ExportFormat, Ledger, LedgerQuery, LedgerStats,
    MAX_QUERY_LIMIT,
};
pub use storage::{LedgerStorage, MemoryLedgerStorage, SqliteLedgerStorage};
