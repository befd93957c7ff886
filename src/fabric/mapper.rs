// src/fabric/mapper.rs
//! Pinned frame list and lazy page mappings for one ring
//!
//! A [`RingMapping`] owns the pinned guest frames backing a registered ring
//! and hands out temporary hypervisor mappings one page at a time. Frames
//! stay pinned for the whole lifetime of the ring; mappings are transient
//! and come from the platform's bounded pool, so every operation that maps
//! pages drops them again before returning.

use alloc::vec::Vec;

use crate::errors::{Error, Result};
use crate::fabric::guest_mem;
use crate::platform::{DomainId, FrameId, GuestHandle, MappedPage, Platform};

/// Frames and per-page mappings of one registered ring.
pub(crate) struct RingMapping {
    /// Pinned guest frames, in ring order.
    frames: Vec<FrameId>,
    /// Lazy mappings; `pages[i]` is `Some` while frame `i` is mapped.
    pages: Vec<Option<MappedPage>>,
}

impl RingMapping {
    /// Read `npage` frame numbers from the guest, pin each one, and build
    /// the mapping table.
    ///
    /// `region_bytes` is the full ring region (descriptor + payload); the
    /// frames must cover it. On any failure every frame pinned so far is
    /// released again.
    pub(crate) fn acquire(
        platform: &dyn Platform,
        domain: DomainId,
        npage: u32,
        pfn_tbl: GuestHandle,
        region_bytes: u64,
    ) -> Result<Self> {
        if npage == 0 || (u64::from(npage) * crate::abi::PAGE_SIZE as u64) < region_bytes {
            return Err(Error::InvalidArg);
        }

        let mut frames: Vec<FrameId> = Vec::new();
        frames.try_reserve_exact(npage as usize)?;
        let mut pages: Vec<Option<MappedPage>> = Vec::new();
        pages.try_reserve_exact(npage as usize)?;

        for i in 0..u64::from(npage) {
            let pfn: u64 = match guest_mem::read_obj_at(platform, domain, pfn_tbl, i) {
                Ok(pfn) => pfn,
                Err(e) => {
                    Self::unpin_list(platform, &frames);
                    return Err(e);
                }
            };
            match platform.pin_frame(domain, pfn) {
                Ok(frame) => {
                    frames.push(frame);
                    pages.push(None);
                }
                Err(e) => {
                    log::warn!("dom {domain}: frame {i} (pfn {pfn:#x}) rejected for ring use");
                    Self::unpin_list(platform, &frames);
                    return Err(e);
                }
            }
        }

        Ok(Self { frames, pages })
    }

    fn unpin_list(platform: &dyn Platform, frames: &[FrameId]) {
        for &frame in frames {
            platform.unpin_frame(frame);
        }
    }

    /// Number of frames backing the ring.
    pub(crate) fn npage(&self) -> usize {
        self.frames.len()
    }

    /// Map page `index`, or return the existing mapping.
    ///
    /// # Errors
    ///
    /// `Fault` for an out-of-range index or when the platform's mapping
    /// pool is exhausted; the ring stays valid and the caller may retry.
    pub(crate) fn map_page(&mut self, platform: &dyn Platform, index: usize) -> Result<MappedPage> {
        let frame = *self.frames.get(index).ok_or(Error::Fault)?;
        let slot = &mut self.pages[index];
        if let Some(page) = *slot {
            return Ok(page);
        }
        let page = platform.map_frame(frame).map_err(|_| Error::Fault)?;
        *slot = Some(page);
        Ok(page)
    }

    /// Return every live mapping to the platform pool. Frames stay pinned.
    ///
    /// Must be called with the owning ring's lock held.
    pub(crate) fn unmap_all(&mut self, platform: &dyn Platform) {
        for (i, slot) in self.pages.iter_mut().enumerate() {
            if let Some(page) = slot.take() {
                platform.unmap_frame(self.frames[i], page);
            }
        }
    }

    /// Unmap everything and drop the pin references. The mapping is empty
    /// afterwards; used on unregister and domain teardown.
    pub(crate) fn release(&mut self, platform: &dyn Platform) {
        self.unmap_all(platform);
        for frame in self.frames.drain(..) {
            platform.unpin_frame(frame);
        }
        self.pages.clear();
    }

    #[cfg(test)]
    pub(crate) fn empty_for_tests() -> Self {
        Self { frames: Vec::new(), pages: Vec::new() }
    }
}
