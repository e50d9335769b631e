//! Hash-chained, secret-redacted per-session evidence ledger with
//! periodic checkpoint compaction.

pub mod row;
pub mod store;

pub use row::{EvidenceEntry, EvidenceRow, Verdict, CHECKPOINT_TOOL};
pub use store::{ChainReport, CompactOptions, EvidenceLedger, LedgerFilter};
