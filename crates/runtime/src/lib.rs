//! The per-session runtime façade: one object wiring the event stream,
//! evidence ledger, context pipeline, skill policy, cost tracker, memory
//! engine, and verification layer, plus the recovery snapshot store.

pub mod runtime;
pub mod snapshot;

pub use runtime::{SessionRuntime, ToolOutcome};
pub use snapshot::{RecoverySnapshot, SessionSnapshotStore};
