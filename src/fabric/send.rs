// src/fabric/send.rs
//! Send orchestration
//!
//! Filter, destination-ring lookup, insertion, waiter arming, and the
//! wake-up signal, in that order. The destination is signalled only after
//! the ring lock is released so its consumer can take the lock immediately.

use crate::abi::{Address, RingId};
use crate::errors::{Error, Result};
use crate::fabric::ring;
use crate::fabric::Fabric;
use crate::platform::{DomainId, GuestHandle};

impl Fabric {
    /// Send one gathered message from `sender` to the ring serving
    /// `dst_addr`.
    ///
    /// Returns the payload byte count on success. `src_addr` carries the
    /// sender's claimed endpoint; the domain recorded in the message header
    /// is always `sender` itself.
    ///
    /// # Errors
    ///
    /// `InvalidArg` if the sender has no fabric state; `ConnRefused` if the
    /// destination domain or ring is absent or the filter rejects the flow;
    /// `TooLarge`, `RingFull`, `Fault` from the insertion engine;
    /// `NoMemory` if a waiter could not be recorded.
    pub fn sendv(
        &self,
        sender: DomainId,
        src_addr: Address,
        dst_addr: Address,
        proto: u32,
        iovs: GuestHandle,
        niov: u32,
    ) -> Result<i64> {
        let domains = self.domains.read();
        if !domains.contains_key(&sender) {
            return Err(Error::InvalidArg);
        }

        // The source recorded on the wire is the sender itself; its partner
        // slot names the destination domain.
        let src_id = RingId::new(Address::new(sender, src_addr.port), dst_addr.domain);

        if !self.platform().domain_exists(dst_addr.domain) {
            return Err(Error::ConnRefused);
        }
        if !self.filter().check(&src_addr, &dst_addr) {
            log::warn!(
                "filter rejected {}:{} -> {}:{}",
                src_addr.domain,
                src_addr.port,
                dst_addr.domain,
                dst_addr.port,
            );
            return Err(Error::ConnRefused);
        }

        let dst = domains.get(&dst_addr.domain).ok_or(Error::ConnRefused)?;
        let table = dst.table.read();
        let info = table
            .find_by_addr(&dst_addr, dst_addr.domain, sender)
            .ok_or(Error::ConnRefused)?;

        let total = ring::iov_total(self.platform(), sender, iovs, niov)?;

        let result = {
            let mut state = info.lock.lock();
            match ring::insert(
                self.platform(),
                &mut state,
                &src_id,
                proto,
                sender,
                iovs,
                niov,
                total,
            ) {
                Err(Error::RingFull) => {
                    // Park the sender; it retries after its own notify
                    // wakes it.
                    state.pending.enqueue(sender, total as u32)?;
                    Err(Error::RingFull)
                }
                other => other,
            }
        };

        let sent = result?;
        drop(table);
        self.signal_domain(&domains, dst_addr.domain);
        Ok(sent as i64)
    }
}
