// src/fabric/ring.rs
//! Ring buffer insertion engine
//!
//! Appends one framed message (header plus gathered iovec payload) to a
//! guest-owned ring, or reports that it does not fit. The consumer pointer
//! is read fresh from guest memory on every attempt; the producer pointer is
//! the hypervisor's cached copy and is published to the guest only after the
//! payload bytes, behind a full fence. A guest therefore observes either the
//! ring as it was before the insert or the complete new message, never a
//! torn state.

use core::mem::offset_of;
use core::sync::atomic::{fence, Ordering};

use crate::abi::{
    roundup, Iov, MessageHeader, RingDesc, RingId, MSG_ALIGN, MSG_HEADER_SIZE, RING_HEADER_SIZE,
};
use crate::errors::{Error, Result};
use crate::fabric::guest_mem::{self, CopySrc};
use crate::fabric::registry::RingState;
use crate::platform::{DomainId, GuestHandle, Platform};

/// Hard cap on one gathered message (2 GiB).
pub(crate) const MAX_SEND_BYTES: u64 = 2 * 1024 * 1024 * 1024;

const TX_PTR_OFFSET: u32 = offset_of!(RingDesc, tx_ptr) as u32;
const RX_PTR_OFFSET: u32 = offset_of!(RingDesc, rx_ptr) as u32;

/// Payload bytes an insert can currently place, given fresh `rx`, the
/// cached `tx`, and the payload capacity `cap`.
///
/// An empty ring takes anything up to `cap - HDR`; otherwise one header and
/// one alignment slot are held back so the producer can never run the
/// pointers together.
const fn space_between(rx: u32, tx: u32, cap: u32) -> u32 {
    if rx == tx {
        return cap - MSG_HEADER_SIZE;
    }
    let mut sp = rx as i64 - tx as i64;
    if sp < 0 {
        sp += cap as i64;
    }
    sp -= (MSG_HEADER_SIZE + MSG_ALIGN) as i64;
    if sp < 0 { 0 } else { sp as u32 }
}

/// Payload bytes currently available in `ring`, reading the consumer
/// pointer from guest memory. An unreadable ring reports zero.
pub(crate) fn payload_space(platform: &dyn Platform, ring: &mut RingState) -> u32 {
    match guest_mem::read_ring_u32(platform, &mut ring.mapping, RX_PTR_OFFSET) {
        Ok(rx) => space_between(rx, ring.tx_ptr, ring.len),
        Err(_) => 0,
    }
}

/// The space an empty ring reports; also the largest payload it can take.
pub(crate) const fn max_payload_space(cap: u32) -> u32 {
    cap - MSG_HEADER_SIZE
}

/// Total payload length of a guest scatter list.
///
/// # Errors
///
/// `Fault` if an element cannot be read, `TooLarge` past the 2 GiB cap.
pub(crate) fn iov_total(
    platform: &dyn Platform,
    domain: DomainId,
    iovs: GuestHandle,
    niov: u32,
) -> Result<u64> {
    let mut total = 0u64;
    for i in 0..u64::from(niov) {
        let iov: Iov = guest_mem::read_obj_at(platform, domain, iovs, i)?;
        total += u64::from(iov.len);
        if total > MAX_SEND_BYTES {
            return Err(Error::TooLarge);
        }
    }
    Ok(total)
}

/// Append one message of `len` payload bytes gathered from `iovs`.
///
/// Returns the payload length on success. Must be called with the ring's
/// lock held; every page mapped along the way is dropped before returning.
///
/// # Errors
///
/// `TooLarge` if the message can never fit this ring, `RingFull` if it does
/// not fit right now, `Fault` on any guest memory failure. On error the
/// producer pointer is untouched and the logical ring state is unchanged.
pub(crate) fn insert(
    platform: &dyn Platform,
    ring: &mut RingState,
    src_id: &RingId,
    proto: u32,
    sender: DomainId,
    iovs: GuestHandle,
    niov: u32,
    len: u64,
) -> Result<u64> {
    let result = insert_inner(platform, ring, src_id, proto, sender, iovs, niov, len);
    ring.mapping.unmap_all(platform);
    result
}

#[allow(clippy::too_many_arguments)]
fn insert_inner(
    platform: &dyn Platform,
    ring: &mut RingState,
    src_id: &RingId,
    proto: u32,
    sender: DomainId,
    iovs: GuestHandle,
    niov: u32,
    len: u64,
) -> Result<u64> {
    let cap = ring.len;
    let required = roundup(len) + u64::from(MSG_HEADER_SIZE);
    if required >= u64::from(cap) {
        return Err(Error::TooLarge);
    }

    let desc = guest_mem::read_ring_desc(platform, &mut ring.mapping)?;
    let mut rx = desc.rx_ptr;
    let mut tx = ring.tx_ptr;

    if rx == tx && tx != 0 {
        // Drained but fragmented: pull both pointers back to the origin so
        // this message lands contiguously. The guest sees the ring go from
        // one empty encoding to the other.
        guest_mem::write_ring_u32(platform, &mut ring.mapping, TX_PTR_OFFSET, 0)?;
        guest_mem::write_ring_u32(platform, &mut ring.mapping, RX_PTR_OFFSET, 0)?;
        ring.tx_ptr = 0;
        tx = 0;
        rx = 0;
    }

    if u64::from(space_between(rx, tx, cap)) < required {
        return Err(Error::RingFull);
    }

    let header = MessageHeader {
        len: len as u32 + MSG_HEADER_SIZE,
        source: src_id.addr,
        message_type: proto,
    };
    guest_mem::copy_to_ring(
        platform,
        &mut ring.mapping,
        RING_HEADER_SIZE + tx,
        CopySrc::Bytes(guest_mem::as_bytes(&header)),
        MSG_HEADER_SIZE,
    )?;
    tx += MSG_HEADER_SIZE;
    if tx == cap {
        tx = 0;
    }

    // The scatter list is re-read while copying; holding each element to
    // the byte total computed for the admission check keeps a guest that
    // rewrites its iovecs mid-call from overrunning the space it was
    // granted.
    let mut budget = len;
    for i in 0..u64::from(niov) {
        let iov: Iov = guest_mem::read_obj_at(platform, sender, iovs, i)?;
        if u64::from(iov.len) > budget {
            return Err(Error::Fault);
        }
        budget -= u64::from(iov.len);

        let mut seg = GuestHandle(iov.base);
        let mut seg_len = iov.len;
        if !platform.guest_range_ok(sender, seg, seg_len as usize) {
            return Err(Error::Fault);
        }

        let head = cap - tx;
        if seg_len > head {
            guest_mem::copy_to_ring(
                platform,
                &mut ring.mapping,
                RING_HEADER_SIZE + tx,
                CopySrc::Guest { domain: sender, src: seg },
                head,
            )?;
            tx = 0;
            seg = seg.offset(u64::from(head));
            seg_len -= head;
        }
        guest_mem::copy_to_ring(
            platform,
            &mut ring.mapping,
            RING_HEADER_SIZE + tx,
            CopySrc::Guest { domain: sender, src: seg },
            seg_len,
        )?;
        tx += seg_len;
        if tx == cap {
            tx = 0;
        }
    }

    let mut tx = roundup(u64::from(tx)) as u32;
    if tx >= cap {
        tx -= cap;
    }

    // Publication barrier: the consumer must never observe the moved
    // producer pointer without the payload bytes that precede it.
    fence(Ordering::SeqCst);
    let committed = ring.tx_ptr;
    ring.tx_ptr = tx;
    if let Err(e) = guest_mem::write_ring_u32(platform, &mut ring.mapping, TX_PTR_OFFSET, tx) {
        ring.tx_ptr = committed;
        return Err(e);
    }

    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HDR: u32 = MSG_HEADER_SIZE;

    #[test]
    fn empty_ring_offers_all_but_one_header() {
        assert_eq!(space_between(0, 0, 4096), 4096 - HDR);
        assert_eq!(space_between(4080, 4080, 4096), 4096 - HDR);
    }

    #[test]
    fn occupied_ring_holds_back_header_and_alignment_slot() {
        // consumer behind producer
        assert_eq!(space_between(0, 128, 4096), 4096 - 128 - HDR - 16);
        // consumer ahead of producer (producer wrapped)
        assert_eq!(space_between(256, 128, 4096), 128 - HDR - 16);
        // adjacent pointers report nothing
        assert_eq!(space_between(144, 128, 4096), 0);
    }

    #[test]
    fn max_payload_matches_empty_space() {
        assert_eq!(max_payload_space(4096), space_between(0, 0, 4096));
    }
}
