// src/fabric/pending.rs
//! Per-ring waiter bookkeeping
//!
//! When a send fails with a full ring, the sender is recorded here together
//! with the space it needs. The notify path harvests satisfied entries under
//! the ring lock and signals them afterwards, outside any ring lock, because
//! event-channel delivery takes unrelated locks of its own.

use alloc::vec::Vec;

use crate::errors::Result;
use crate::platform::DomainId;

/// One parked sender: `domain` wants to place `required` payload bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PendingEntry {
    /// Sending domain to wake.
    pub domain: DomainId,
    /// Payload bytes of the failed send.
    pub required: u32,
}

/// The waiter set of a single ring; at most one entry per sender.
#[derive(Default)]
pub(crate) struct PendingSet {
    entries: Vec<PendingEntry>,
}

impl PendingSet {
    pub(crate) const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Park `domain` until `required` bytes fit. A second requirement from
    /// the same sender coalesces into the larger of the two.
    pub(crate) fn enqueue(&mut self, domain: DomainId, required: u32) -> Result<()> {
        if let Some(ent) = self.entries.iter_mut().find(|e| e.domain == domain) {
            if ent.required < required {
                ent.required = required;
            }
            return Ok(());
        }
        self.entries.try_reserve(1)?;
        self.entries.push(PendingEntry { domain, required });
        Ok(())
    }

    /// Drop any entry for `domain`.
    pub(crate) fn cancel(&mut self, domain: DomainId) {
        self.entries.retain(|e| e.domain != domain);
    }

    /// Move every entry satisfied by `available` payload bytes into `out`.
    pub(crate) fn harvest(&mut self, available: u32, out: &mut Vec<PendingEntry>) -> Result<()> {
        out.try_reserve(self.entries.len())?;
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].required <= available {
                out.push(self.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Signal and consume a harvested waiter list. Runs outside any ring lock.
pub(crate) fn drain(list: &mut Vec<PendingEntry>, mut signal: impl FnMut(DomainId)) {
    for ent in list.drain(..) {
        signal(ent.domain);
    }
}
