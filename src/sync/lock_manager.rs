// src/sync/lock_manager.rs
//! Rank-tagged locks and lock accounting
//!
//! This module wraps the spin primitives in rank-aware types and keeps a
//! global ledger of acquisitions, contentions, and currently-held counts per
//! rank. The ledger feeds the diagnostic state dump; correctness of the
//! ordering itself rests on the structural guarantees described in
//! [`crate::sync`].

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Lock ranks in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockRank {
    /// L1: global domain-existence lock (must be acquired first)
    Domains = 0,
    /// L2: per-domain ring-table lock
    RingTable = 1,
    /// L3: per-ring spinlock
    Ring = 2,
    /// Filter-table lock (orthogonal; last among write locks)
    Filter = 3,
}

const RANK_COUNT: usize = 4;

impl LockRank {
    /// Human-readable rank name for diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Domains => "L1/domains",
            Self::RingTable => "L2/ring-table",
            Self::Ring => "L3/ring",
            Self::Filter => "filter",
        }
    }
}

/// Global lock ledger
struct LockManager {
    /// Successful acquisitions per rank
    acquisitions: [AtomicU64; RANK_COUNT],
    /// Acquisitions that had to spin per rank
    contentions: [AtomicU64; RANK_COUNT],
    /// Guards currently alive per rank
    active: [AtomicU32; RANK_COUNT],
}

impl LockManager {
    const fn new() -> Self {
        Self {
            acquisitions: [const { AtomicU64::new(0) }; RANK_COUNT],
            contentions: [const { AtomicU64::new(0) }; RANK_COUNT],
            active: [const { AtomicU32::new(0) }; RANK_COUNT],
        }
    }

    fn note_acquire(&self, rank: LockRank, contended: bool) {
        let i = rank as usize;
        self.acquisitions[i].fetch_add(1, Ordering::Relaxed);
        if contended {
            self.contentions[i].fetch_add(1, Ordering::Relaxed);
        }
        self.active[i].fetch_add(1, Ordering::Relaxed);
    }

    fn note_release(&self, rank: LockRank) {
        self.active[rank as usize].fetch_sub(1, Ordering::Relaxed);
    }

    fn stats(&self) -> LockStats {
        let mut out = LockStats::default();
        for i in 0..RANK_COUNT {
            out.acquisitions[i] = self.acquisitions[i].load(Ordering::Relaxed);
            out.contentions[i] = self.contentions[i].load(Ordering::Relaxed);
            out.active[i] = self.active[i].load(Ordering::Relaxed);
        }
        out
    }
}

/// Global lock manager instance
static LOCK_MANAGER: LockManager = LockManager::new();

/// Lock statistics snapshot, indexed by [`LockRank`] discriminant.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockStats {
    /// Successful acquisitions per rank
    pub acquisitions: [u64; RANK_COUNT],
    /// Contended acquisitions per rank
    pub contentions: [u64; RANK_COUNT],
    /// Guards currently alive per rank
    pub active: [u32; RANK_COUNT],
}

/// Get a snapshot of the lock ledger.
#[must_use]
pub fn lock_stats() -> LockStats {
    LOCK_MANAGER.stats()
}

/// A reader/writer lock carrying its hierarchy rank.
pub struct RankedRwLock<T> {
    rank: LockRank,
    inner: spin::RwLock<T>,
}

impl<T> RankedRwLock<T> {
    /// Create a new lock at the given rank.
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self { rank, inner: spin::RwLock::new(value) }
    }

    /// Acquire shared access.
    pub fn read(&self) -> RankedReadGuard<'_, T> {
        let (guard, contended) = match self.inner.try_read() {
            Some(g) => (g, false),
            None => (self.inner.read(), true),
        };
        LOCK_MANAGER.note_acquire(self.rank, contended);
        RankedReadGuard { inner: guard, rank: self.rank }
    }

    /// Acquire exclusive access.
    pub fn write(&self) -> RankedWriteGuard<'_, T> {
        let (guard, contended) = match self.inner.try_write() {
            Some(g) => (g, false),
            None => (self.inner.write(), true),
        };
        LOCK_MANAGER.note_acquire(self.rank, contended);
        RankedWriteGuard { inner: guard, rank: self.rank }
    }
}

/// Shared guard for a [`RankedRwLock`].
pub struct RankedReadGuard<'a, T> {
    inner: spin::RwLockReadGuard<'a, T>,
    rank: LockRank,
}

impl<T> Deref for RankedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> Drop for RankedReadGuard<'_, T> {
    fn drop(&mut self) {
        LOCK_MANAGER.note_release(self.rank);
    }
}

/// Exclusive guard for a [`RankedRwLock`].
pub struct RankedWriteGuard<'a, T> {
    inner: spin::RwLockWriteGuard<'a, T>,
    rank: LockRank,
}

impl<T> Deref for RankedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for RankedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for RankedWriteGuard<'_, T> {
    fn drop(&mut self) {
        LOCK_MANAGER.note_release(self.rank);
    }
}

/// A spinlock carrying its hierarchy rank.
pub struct RankedSpinLock<T> {
    rank: LockRank,
    inner: spin::Mutex<T>,
}

impl<T> RankedSpinLock<T> {
    /// Create a new spinlock at the given rank.
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self { rank, inner: spin::Mutex::new(value) }
    }

    /// Consume the lock and return the protected value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    /// Acquire the lock.
    pub fn lock(&self) -> RankedSpinGuard<'_, T> {
        let (guard, contended) = match self.inner.try_lock() {
            Some(g) => (g, false),
            None => (self.inner.lock(), true),
        };
        LOCK_MANAGER.note_acquire(self.rank, contended);
        RankedSpinGuard { inner: guard, rank: self.rank }
    }
}

/// Guard for a [`RankedSpinLock`].
pub struct RankedSpinGuard<'a, T> {
    inner: spin::MutexGuard<'a, T>,
    rank: LockRank,
}

impl<T> Deref for RankedSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for RankedSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for RankedSpinGuard<'_, T> {
    fn drop(&mut self) {
        LOCK_MANAGER.note_release(self.rank);
    }
}
