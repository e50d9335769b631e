//! The process-wide broadcast sequence.
//!
//! Every outbound event frame carries one value from this counter; all
//! recipients of the same event observe the same `seq`. Single owner,
//! advanced only through [`BroadcastSeq::advance`].

use std::sync::atomic::{AtomicU64, Ordering};

pub struct BroadcastSeq {
    next: AtomicU64,
}

impl Default for BroadcastSeq {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastSeq {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn advance(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}
