//! Append-only, per-session, JSON-line structured event streams with
//! live subscribers and a process-wide monotonic sequence.

pub mod record;
pub mod store;

pub use record::{EventCategory, EventRecord, StructuredEvent, EVENT_SCHEMA};
pub use store::{EventQuery, EventStore, SubscriptionId};
