// src/fabric/mod.rs
//! The messaging fabric core
//!
//! [`Fabric`] ties the pieces together: the L1-guarded map of per-domain
//! states, the process-wide filter table, and the platform the whole crate
//! talks through. Domain lifecycle hooks live here; the send and notify
//! orchestration sit in their own submodules as `impl Fabric` blocks.

pub mod filter;
pub(crate) mod guest_mem;
pub(crate) mod mapper;
mod notify;
pub(crate) mod pending;
pub(crate) mod registry;
pub(crate) mod ring;
mod send;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::abi::FabricInfo;
use crate::errors::{Error, Result};
use crate::fabric::filter::FilterTable;
use crate::fabric::registry::DomainState;
use crate::platform::{DomainId, Platform};
use crate::sync::{lock_stats, LockRank, RankedRwLock};

/// The hypervisor-resident messaging fabric.
///
/// One instance exists for the lifetime of the hypervisor; see
/// [`crate::init`]. All methods are callable from any vCPU context.
pub struct Fabric {
    platform: Arc<dyn Platform>,
    /// L1: existence of each domain's state.
    domains: RankedRwLock<BTreeMap<DomainId, DomainState>>,
    filter: FilterTable,
}

impl Fabric {
    /// Build a fabric on top of the given platform.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            domains: RankedRwLock::new(LockRank::Domains, BTreeMap::new()),
            filter: FilterTable::new(),
        }
    }

    pub(crate) fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    /// The process-wide filter table.
    #[must_use]
    pub fn filter(&self) -> &FilterTable {
        &self.filter
    }

    /// Create fabric state for a new domain, allocating its wake-up port.
    ///
    /// Called once from the external domain-creation path.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the domain already has state; any platform error
    /// from the event-port allocation.
    pub fn domain_init(&self, domain: DomainId) -> Result<()> {
        let port = self.platform.alloc_event_port(domain)?;
        let mut domains = self.domains.write();
        if domains.contains_key(&domain) {
            drop(domains);
            self.platform.free_event_port(domain, port);
            return Err(Error::AlreadyExists);
        }
        domains.insert(domain, DomainState::new(port));
        drop(domains);
        log::info!("dom {domain}: fabric state created, evtchn port {port}");
        Ok(())
    }

    /// Tear down a dying domain's fabric state.
    ///
    /// Every owned ring is withdrawn first: parked senders are dropped
    /// without a wake-up and the backing frames are unpinned. A domain with
    /// no state is ignored.
    pub fn domain_destroy(&self, domain: DomainId) {
        let state = self.domains.write().remove(&domain);
        let Some(state) = state else { return };

        let mut rings = 0;
        let mut table = state.table.write();
        for info in table.take_all() {
            let mut ring = info.lock.into_inner();
            ring.mapping.release(self.platform());
            rings += 1;
        }
        drop(table);

        self.platform.free_event_port(domain, state.evtchn_port);
        log::info!("dom {domain}: fabric state destroyed, {rings} rings withdrawn");
    }

    /// ABI magics and the caller's event-channel port.
    ///
    /// # Errors
    ///
    /// `NoDevice` if the caller has no fabric state.
    pub fn info(&self, domain: DomainId) -> Result<FabricInfo> {
        let domains = self.domains.read();
        let dom = domains.get(&domain).ok_or(Error::NoDevice)?;
        Ok(FabricInfo::new(dom.evtchn_port))
    }

    /// Fire `target`'s event channel, if it has fabric state. A delivery
    /// failure is logged, not propagated; the waiter will be woken again by
    /// the next notify that finds space.
    pub(crate) fn signal_domain(
        &self,
        domains: &BTreeMap<DomainId, DomainState>,
        target: DomainId,
    ) {
        let Some(state) = domains.get(&target) else { return };
        if self.platform.signal(target, state.evtchn_port).is_err() {
            log::warn!("dom {target}: event channel signal failed, wake-up dropped");
        }
    }

    /// Log a diagnostic snapshot of every domain, ring, and the lock
    /// ledger. Wired to a debug key by the embedder.
    pub fn dump_state(&self) {
        let domains = self.domains.read();
        log::info!("fabric: {} domains", domains.len());
        for (id, state) in domains.iter() {
            let table = state.table.read();
            log::info!(" dom {id}: evtchn={} rings={}", state.evtchn_port, table.len());
            for info in table.iter() {
                let ring = info.lock.lock();
                log::info!(
                    "  ring port={:#x} partner={} len={} tx_ptr={} waiters={}",
                    info.id.addr.port,
                    info.id.partner,
                    ring.len,
                    ring.tx_ptr,
                    ring.pending.len(),
                );
            }
        }
        drop(domains);

        let stats = lock_stats();
        for rank in [LockRank::Domains, LockRank::RingTable, LockRank::Ring, LockRank::Filter] {
            let i = rank as usize;
            log::info!(
                " lock {}: acquired={} contended={} active={}",
                rank.as_str(),
                stats.acquisitions[i],
                stats.contentions[i],
                stats.active[i],
            );
        }
    }
}
