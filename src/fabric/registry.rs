// src/fabric/registry.rs
//! Per-domain ring registry
//!
//! Each domain owns a fixed-size separate-chaining hash table of the rings
//! it has published, keyed by the full `(port, owner, partner)` identity.
//! Lookups by destination address fall back from the exact-partner ring to
//! a wildcard-partner ring; the exact match always wins.
//!
//! Registration validates the guest descriptor, pins the backing frames
//! (with no ring-table lock held, since pinning reads guest memory), and
//! only then inserts under the table's write lock, re-checking for a
//! duplicate id that may have raced in.

use alloc::vec::Vec;
use core::mem::offset_of;

use crate::abi::{
    roundup, Address, RingDesc, RingId, DOMID_ANY, MIN_RING_LEN, RING_HEADER_SIZE, RING_MAGIC,
};
use crate::errors::{Error, Result};
use crate::fabric::guest_mem;
use crate::fabric::mapper::RingMapping;
use crate::fabric::pending::PendingSet;
use crate::fabric::Fabric;
use crate::platform::{DomainId, EvtchnPort, GuestHandle};
use crate::sync::{LockRank, RankedRwLock, RankedSpinLock};

/// Number of hash buckets per domain.
pub(crate) const HTABLE_SIZE: usize = 32;

/// Mutable ring state, guarded by the ring's L3 lock.
pub(crate) struct RingState {
    /// Cached payload length, from the descriptor at registration.
    pub len: u32,
    /// Authoritative producer pointer, mirrored into guest memory after
    /// each insert.
    pub tx_ptr: u32,
    /// Pinned frames and lazy mappings.
    pub mapping: RingMapping,
    /// Parked senders.
    pub pending: PendingSet,
}

/// One registered ring.
pub(crate) struct RingInfo {
    /// Registry key; immutable for the ring's lifetime.
    pub id: RingId,
    /// L3.
    pub lock: RankedSpinLock<RingState>,
}

/// Per-domain fabric state. Existence is guarded by L1; contents by L2.
pub(crate) struct DomainState {
    /// L2 plus the table it protects.
    pub table: RankedRwLock<RingTable>,
    /// Pre-allocated wake-up port; immutable.
    pub evtchn_port: EvtchnPort,
}

impl DomainState {
    pub(crate) fn new(evtchn_port: EvtchnPort) -> Self {
        Self {
            table: RankedRwLock::new(LockRank::RingTable, RingTable::new()),
            evtchn_port,
        }
    }
}

fn hash_of(port: u32, owner: DomainId, partner: DomainId) -> usize {
    let mut h = (port >> 16) as u16;
    h ^= port as u16;
    h ^= owner;
    h ^= partner;
    h as usize & (HTABLE_SIZE - 1)
}

/// Canonical registry key: the owner field is forced to the caller's domain
/// id and padding is zeroed, whatever the guest supplied.
fn canonical_id(owner: DomainId, supplied: RingId) -> RingId {
    RingId::new(Address::new(owner, supplied.addr.port), supplied.partner)
}

/// The ring hash table of one domain.
pub(crate) struct RingTable {
    buckets: [Vec<RingInfo>; HTABLE_SIZE],
}

impl RingTable {
    pub(crate) fn new() -> Self {
        Self { buckets: core::array::from_fn(|_| Vec::new()) }
    }

    /// Exact lookup by full identity.
    pub(crate) fn find(&self, id: &RingId) -> Option<&RingInfo> {
        let bucket = &self.buckets[hash_of(id.addr.port, id.addr.domain, id.partner)];
        bucket.iter().find(|info| {
            info.id.addr.port == id.addr.port
                && info.id.addr.domain == id.addr.domain
                && info.id.partner == id.partner
        })
    }

    /// Destination lookup: the ring bound to `claimed_sender` if there is
    /// one, otherwise the wildcard-partner ring.
    pub(crate) fn find_by_addr(
        &self,
        addr: &Address,
        owner: DomainId,
        claimed_sender: DomainId,
    ) -> Option<&RingInfo> {
        let exact = RingId::new(Address::new(owner, addr.port), claimed_sender);
        if let Some(info) = self.find(&exact) {
            return Some(info);
        }
        self.find(&RingId::new(Address::new(owner, addr.port), DOMID_ANY))
    }

    /// Make room for one more ring in `id`'s bucket.
    fn reserve(&mut self, id: &RingId) -> Result<()> {
        self.buckets[hash_of(id.addr.port, id.addr.domain, id.partner)].try_reserve(1)?;
        Ok(())
    }

    /// Insert a ring whose bucket was reserved and whose id is not present.
    fn attach(&mut self, info: RingInfo) {
        debug_assert!(self.find(&info.id).is_none());
        let bucket = hash_of(info.id.addr.port, info.id.addr.domain, info.id.partner);
        self.buckets[bucket].push(info);
    }

    /// Detach and return the ring with this identity.
    pub(crate) fn remove(&mut self, id: &RingId) -> Option<RingInfo> {
        let bucket = &mut self.buckets[hash_of(id.addr.port, id.addr.domain, id.partner)];
        let index = bucket.iter().position(|info| {
            info.id.addr.port == id.addr.port
                && info.id.addr.domain == id.addr.domain
                && info.id.partner == id.partner
        })?;
        Some(bucket.swap_remove(index))
    }

    /// Detach every ring, for domain teardown.
    pub(crate) fn take_all(&mut self) -> Vec<RingInfo> {
        let mut all = Vec::new();
        for bucket in &mut self.buckets {
            all.append(bucket);
        }
        all
    }

    /// Iterate all registered rings.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &RingInfo> {
        self.buckets.iter().flat_map(|b| b.iter())
    }

    /// Number of registered rings.
    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

impl Fabric {
    /// Publish a ring for `domain`.
    ///
    /// `ring_hnd` addresses the page-aligned guest descriptor, `pfn_hnd` an
    /// array of `npage` frame numbers covering descriptor plus payload. The
    /// descriptor's owner field and a bogus `tx_ptr` are normalized and
    /// written back to the guest.
    ///
    /// # Errors
    ///
    /// `InvalidArg` for a misaligned handle, bad magic, bad length, or
    /// unusable frames; `Fault` for unreadable guest memory;
    /// `AlreadyExists` for a duplicate identity; `NoMemory` if bookkeeping
    /// cannot grow.
    pub fn register_ring(
        &self,
        domain: DomainId,
        ring_hnd: GuestHandle,
        pfn_hnd: GuestHandle,
        npage: u32,
    ) -> Result<()> {
        if !ring_hnd.is_page_aligned() {
            return Err(Error::InvalidArg);
        }

        let domains = self.domains.read();
        let dom = domains.get(&domain).ok_or(Error::InvalidArg)?;

        let mut desc: RingDesc = guest_mem::read_obj(self.platform(), domain, ring_hnd)?;
        if desc.magic != RING_MAGIC {
            return Err(Error::InvalidArg);
        }
        if desc.len < MIN_RING_LEN || roundup(u64::from(desc.len)) != u64::from(desc.len) {
            return Err(Error::InvalidArg);
        }

        let id = canonical_id(domain, desc.id);
        desc.id = id;
        guest_mem::write_obj(
            self.platform(),
            domain,
            ring_hnd.field(offset_of!(RingDesc, id)),
            &id,
        )?;

        // A bogus producer pointer is normalized rather than reset so a
        // resume-after-hibernate re-register keeps its position.
        if desc.tx_ptr >= desc.len || roundup(u64::from(desc.tx_ptr)) != u64::from(desc.tx_ptr) {
            desc.tx_ptr = desc.rx_ptr;
        }
        if desc.tx_ptr >= desc.len || roundup(u64::from(desc.tx_ptr)) != u64::from(desc.tx_ptr) {
            desc.tx_ptr = 0;
        }
        guest_mem::write_obj(
            self.platform(),
            domain,
            ring_hnd.field(offset_of!(RingDesc, tx_ptr)),
            &desc.tx_ptr,
        )?;

        if dom.table.read().find(&id).is_some() {
            return Err(Error::AlreadyExists);
        }

        // Frame acquisition copies guest memory, so it runs with only L1
        // held; the duplicate check is repeated under the write lock below.
        let region_bytes = u64::from(RING_HEADER_SIZE) + u64::from(desc.len);
        let mut mapping =
            RingMapping::acquire(self.platform(), domain, npage, pfn_hnd, region_bytes)?;

        let mut table = dom.table.write();
        if table.find(&id).is_some() {
            drop(table);
            mapping.release(self.platform());
            return Err(Error::AlreadyExists);
        }
        if let Err(e) = table.reserve(&id) {
            drop(table);
            mapping.release(self.platform());
            return Err(e);
        }
        table.attach(RingInfo {
            id,
            lock: RankedSpinLock::new(
                LockRank::Ring,
                RingState {
                    len: desc.len,
                    tx_ptr: desc.tx_ptr,
                    mapping,
                    pending: PendingSet::new(),
                },
            ),
        });
        drop(table);

        log::info!(
            "dom {domain}: registered ring port={:#x} partner={} len={} npage={npage}",
            id.addr.port,
            id.partner,
            desc.len,
        );
        Ok(())
    }

    /// Withdraw a ring previously published by `domain`.
    ///
    /// Parked senders are dropped without a wake-up, and the backing frames
    /// are unpinned.
    ///
    /// # Errors
    ///
    /// `InvalidArg` for a caller without fabric state or a bad descriptor;
    /// `Fault` for unreadable guest memory; `NotFound` if no such ring is
    /// registered.
    pub fn unregister_ring(&self, domain: DomainId, ring_hnd: GuestHandle) -> Result<()> {
        let domains = self.domains.read();
        let dom = domains.get(&domain).ok_or(Error::InvalidArg)?;

        let desc: RingDesc = guest_mem::read_obj(self.platform(), domain, ring_hnd)?;
        if desc.magic != RING_MAGIC {
            return Err(Error::InvalidArg);
        }

        let id = canonical_id(domain, desc.id);
        let info = dom.table.write().remove(&id).ok_or(Error::NotFound)?;

        let mut state = info.lock.into_inner();
        state.mapping.release(self.platform());

        log::info!(
            "dom {domain}: unregistered ring port={:#x} partner={}",
            id.addr.port,
            id.partner,
        );
        Ok(())
    }
}
