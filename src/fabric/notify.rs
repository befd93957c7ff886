// src/fabric/notify.rs
//! Wake-up notification path
//!
//! Two phases, both on behalf of the calling domain. First, every ring the
//! caller owns is scanned and parked senders whose requirement now fits are
//! woken. Second, an optional caller-supplied array of ring queries is
//! answered: for each destination ring the current space is reported
//! through flag bits, and the caller's waiter on that ring is armed or
//! cancelled to match.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::mem::offset_of;

use crate::abi::{RingData, RingDataEnt, RingDataFlags, RING_DATA_MAGIC};
use crate::errors::{Error, Result};
use crate::fabric::pending::{self, PendingEntry};
use crate::fabric::registry::DomainState;
use crate::fabric::ring;
use crate::fabric::{guest_mem, Fabric};
use crate::platform::{DomainId, GuestHandle};

impl Fabric {
    /// Drain the caller's satisfied waiters, then answer the optional
    /// space-report array at `ring_data` (null handle to skip).
    ///
    /// # Errors
    ///
    /// `NoDevice` if the caller has no fabric state; `Fault` for unreadable
    /// or unwritable guest memory; `InvalidArg` for a bad ring-data magic.
    pub fn notify(&self, caller: DomainId, ring_data: GuestHandle) -> Result<()> {
        let domains = self.domains.read();
        let dom = domains.get(&caller).ok_or(Error::NoDevice)?;

        let mut to_wake: Vec<PendingEntry> = Vec::new();
        {
            let table = dom.table.read();
            for info in table.iter() {
                let mut state = info.lock.lock();
                let space = ring::payload_space(self.platform(), &mut state);
                state.mapping.unmap_all(self.platform());
                if state.pending.harvest(space, &mut to_wake).is_err() {
                    // Out of memory for the wake list; the entries stay
                    // parked and the next notify tries again.
                    log::warn!("dom {caller}: waiter harvest skipped on ring {:#x}", info.id.addr.port);
                }
            }
        }
        pending::drain(&mut to_wake, |sender| self.signal_domain(&domains, sender));

        if !ring_data.is_null() {
            let header: RingData = guest_mem::read_obj(self.platform(), caller, ring_data)?;
            if header.magic != RING_DATA_MAGIC {
                return Err(Error::InvalidArg);
            }
            let entries = ring_data.offset(size_of::<RingData>() as u64);
            for index in 0..u64::from(header.nent) {
                self.fill_ring_data(&domains, caller, entries, index)?;
            }
        }

        Ok(())
    }

    /// Answer one space query and (re)arm or cancel the caller's waiter on
    /// the queried ring. Only the flags word is written back.
    fn fill_ring_data(
        &self,
        domains: &BTreeMap<DomainId, DomainState>,
        caller: DomainId,
        entries: GuestHandle,
        index: u64,
    ) -> Result<()> {
        let ent: RingDataEnt =
            guest_mem::read_obj_at(self.platform(), caller, entries, index)?;
        let mut flags = RingDataFlags::empty();

        if self.platform().domain_exists(ent.ring.domain) {
            if let Some(dst) = domains.get(&ent.ring.domain) {
                let table = dst.table.read();
                if let Some(info) = table.find_by_addr(&ent.ring, ent.ring.domain, caller) {
                    flags |= RingDataFlags::EXISTS;

                    let mut state = info.lock.lock();
                    let space = ring::payload_space(self.platform(), &mut state);
                    state.mapping.unmap_all(self.platform());
                    let empty_space = ring::max_payload_space(state.len);

                    if space >= ent.space_required {
                        state.pending.cancel(caller);
                        flags |= RingDataFlags::SUFFICIENT;
                    } else if state.pending.enqueue(caller, ent.space_required).is_ok() {
                        flags |= RingDataFlags::PENDING;
                    } else {
                        log::warn!(
                            "dom {caller}: could not arm waiter on {}:{:#x}",
                            ent.ring.domain,
                            ent.ring.port,
                        );
                    }
                    drop(state);

                    if space == empty_space {
                        flags |= RingDataFlags::EMPTY;
                    }
                }
            }
        }

        let flags_hnd = entries
            .index::<RingDataEnt>(index)
            .field(offset_of!(RingDataEnt, flags));
        guest_mem::write_obj(self.platform(), caller, flags_hnd, &flags.bits())
    }
}
