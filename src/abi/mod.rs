// src/abi/mod.rs
//! Guest-visible wire ABI
//!
//! Every type in this module crosses the guest/hypervisor boundary as raw
//! bytes and is therefore `repr(C)` with an explicitly padded layout. The
//! interoperating guest driver hard-codes these offsets; layout changes are
//! ABI breaks. Compile-time assertions at the bottom of this file pin the
//! sizes and the offsets the guest relies on.

use core::mem::{offset_of, size_of};

/// Size of one guest page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Magic value a guest must place at the head of a ring before registering it.
pub const RING_MAGIC: u64 = 0xdf69_77f2_31ab_d910;

/// Magic value heading the ring-data block passed to the notify op.
pub const RING_DATA_MAGIC: u64 = 0xcce4_d30f_bc82_e92a;

/// Wildcard domain id: matches any domain in filter rules, and marks a ring
/// that accepts traffic from any sender.
pub const DOMID_ANY: u16 = 0x7ff4;

/// Wildcard port, valid only inside filter rules.
pub const PORT_ANY: u32 = 0xffff_ffff;

/// Messages and ring pointers are kept on 16-byte boundaries.
pub const MSG_ALIGN: u32 = 16;

/// Size of the in-ring message header.
pub const MSG_HEADER_SIZE: u32 = size_of::<MessageHeader>() as u32;

/// Size of the guest-visible ring descriptor; the payload area starts at
/// this offset so `rx_ptr`/`tx_ptr` stay on their own cache line.
pub const RING_HEADER_SIZE: u32 = size_of::<RingDesc>() as u32;

/// Smallest payload length a guest may register: room for one header plus
/// two aligned payload slots.
pub const MIN_RING_LEN: u32 = MSG_HEADER_SIZE + 2 * MSG_ALIGN;

/// Round `n` up to the next message-alignment boundary.
#[inline]
#[must_use]
pub const fn roundup(n: u64) -> u64 {
    (n + (MSG_ALIGN as u64 - 1)) & !(MSG_ALIGN as u64 - 1)
}

/// Marker for plain-bytes wire types.
///
/// # Safety
///
/// Implementors must be `repr(C)`, contain only integer fields (no
/// references, no niches), and accept any bit pattern as a valid value, so
/// that copying them to and from untrusted guest memory is sound.
pub unsafe trait Wire: Copy + 'static {}

/// A messaging endpoint: a port number within a domain.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Address {
    /// Port number, allocated by the guest.
    pub port: u32,
    /// Owning domain id.
    pub domain: u16,
    _pad: u16,
}

impl Address {
    /// Build an address from its parts.
    #[must_use]
    pub const fn new(domain: u16, port: u32) -> Self {
        Self { port, domain, _pad: 0 }
    }
}

/// Full identity of a ring within its owning domain.
///
/// Two rings may share an [`Address`] and differ only in `partner`; the
/// registry treats them as distinct.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingId {
    /// The ring's own address (`addr.domain` is the owner).
    pub addr: Address,
    /// The only domain allowed to send here, or [`DOMID_ANY`].
    pub partner: u16,
    _pad: [u16; 3],
}

impl RingId {
    /// Build a ring id from its parts.
    #[must_use]
    pub const fn new(addr: Address, partner: u16) -> Self {
        Self { addr, partner, _pad: [0; 3] }
    }
}

/// The guest-resident ring descriptor at offset 0 of the ring region.
///
/// The guest owns `rx_ptr`; the hypervisor owns `tx_ptr`. Both are byte
/// offsets into the payload area, which starts at [`RING_HEADER_SIZE`] and
/// is `len` bytes long.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RingDesc {
    /// Must equal [`RING_MAGIC`].
    pub magic: u64,
    /// Ring identity; the owner field is overwritten with the caller's
    /// domain id at registration.
    pub id: RingId,
    /// Consumer pointer, written by the guest.
    pub rx_ptr: u32,
    /// Producer pointer, written by the hypervisor.
    pub tx_ptr: u32,
    /// Payload length in bytes; a multiple of [`MSG_ALIGN`].
    pub len: u32,
    _pad: [u8; 28],
}

impl RingDesc {
    /// Build a descriptor the way a guest driver would before registering.
    #[must_use]
    pub const fn new(id: RingId, len: u32) -> Self {
        Self { magic: RING_MAGIC, id, rx_ptr: 0, tx_ptr: 0, len, _pad: [0; 28] }
    }
}

/// In-ring header preceding every message, padded to [`MSG_ALIGN`].
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MessageHeader {
    /// Message length including this header (payload bytes + 16).
    pub len: u32,
    /// Sender endpoint as recorded by the hypervisor.
    pub source: Address,
    /// Caller-chosen protocol tag; opaque to the fabric.
    pub message_type: u32,
}

/// One element of the scatter list handed to the send op.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Iov {
    /// Guest virtual address of the segment.
    pub base: u64,
    /// Segment length in bytes.
    pub len: u32,
    _pad: u32,
}

impl Iov {
    /// Build a scatter-list element.
    #[must_use]
    pub const fn new(base: u64, len: u32) -> Self {
        Self { base, len, _pad: 0 }
    }
}

/// Source/destination pair for the send op.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SendAddr {
    /// Claimed sender endpoint (the domain field is informational; the
    /// recorded source always carries the caller's real domain id).
    pub src: Address,
    /// Destination endpoint.
    pub dst: Address,
}

bitflags::bitflags! {
    /// Per-ring result flags written back by the notify space report.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RingDataFlags: u16 {
        /// The ring is completely empty.
        const EMPTY = 1 << 0;
        /// The ring exists and is visible to the caller.
        const EXISTS = 1 << 1;
        /// A waiter was (re)armed for the caller on this ring.
        const PENDING = 1 << 2;
        /// The requested space is available right now.
        const SUFFICIENT = 1 << 3;
    }
}

/// One entry of the notify space-report array.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RingDataEnt {
    /// Destination ring address to query.
    pub ring: Address,
    /// [`RingDataFlags`] bits, written back by the hypervisor.
    pub flags: u16,
    _pad: u16,
    /// Payload bytes the caller wants to send.
    pub space_required: u32,
    /// Reserved for the largest payload the ring can ever take; not
    /// currently written back.
    pub max_message_size: u32,
}

impl RingDataEnt {
    /// Build a query entry.
    #[must_use]
    pub const fn new(ring: Address, space_required: u32) -> Self {
        Self { ring, flags: 0, _pad: 0, space_required, max_message_size: 0 }
    }
}

/// Header of the notify ring-data block; `nent` entries follow immediately.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RingData {
    /// Must equal [`RING_DATA_MAGIC`].
    pub magic: u64,
    /// Number of [`RingDataEnt`] records following this header.
    pub nent: u32,
    _pad: u32,
}

impl RingData {
    /// Build a ring-data header.
    #[must_use]
    pub const fn new(nent: u32) -> Self {
        Self { magic: RING_DATA_MAGIC, nent, _pad: 0 }
    }
}

/// One firewall rule as exchanged with the guest.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TablesRule {
    /// Sender pattern; either field may be a wildcard.
    pub src: Address,
    /// Destination pattern; either field may be a wildcard.
    pub dst: Address,
    /// Non-zero to accept matching traffic, zero to reject it.
    pub accept: u32,
}

/// Header of the tables-list exchange block; rules are copied out right
/// after it.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TablesList {
    /// First rule to copy (0-based window start).
    pub start_rule: u32,
    /// In: capacity of the following array. Out: rules actually copied.
    pub nb_rules: u32,
}

/// Result block of the info op.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FabricInfo {
    /// [`RING_MAGIC`], so a driver can verify it speaks the same ABI.
    pub ring_magic: u64,
    /// [`RING_DATA_MAGIC`].
    pub data_magic: u64,
    /// The caller's pre-allocated event-channel port.
    pub evtchn: u32,
    _pad: u32,
}

impl FabricInfo {
    /// Build an info block.
    #[must_use]
    pub const fn new(evtchn: u32) -> Self {
        Self { ring_magic: RING_MAGIC, data_magic: RING_DATA_MAGIC, evtchn, _pad: 0 }
    }
}

// SAFETY: all of these are repr(C), integer-only, and valid for any bit
// pattern.
unsafe impl Wire for Address {}
unsafe impl Wire for RingId {}
unsafe impl Wire for RingDesc {}
unsafe impl Wire for MessageHeader {}
unsafe impl Wire for Iov {}
unsafe impl Wire for SendAddr {}
unsafe impl Wire for RingDataEnt {}
unsafe impl Wire for RingData {}
unsafe impl Wire for TablesRule {}
unsafe impl Wire for TablesList {}
unsafe impl Wire for FabricInfo {}
unsafe impl Wire for u64 {}
unsafe impl Wire for u32 {}
unsafe impl Wire for u16 {}

/// Hypercall command numbers.
///
/// Type-safe command numbers that replace raw integers at the dispatch
/// boundary. Append new commands at the end for ABI stability.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Publish a ring for the calling domain.
    RegisterRing = 1,
    /// Withdraw a previously published ring.
    UnregisterRing = 2,
    /// Send a gathered message to a destination ring.
    Sendv = 3,
    /// Drain waiters and optionally report per-ring space.
    Notify = 4,
    /// Insert a filter rule.
    TablesAdd = 5,
    /// Delete filter rules (by position, by match, or all).
    TablesDel = 6,
    /// Copy a window of the filter table out.
    TablesList = 7,
    /// Query ABI magics and the caller's event-channel port.
    Info = 8,
}

impl OpCode {
    /// Convert from the raw command word.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::RegisterRing),
            2 => Some(Self::UnregisterRing),
            3 => Some(Self::Sendv),
            4 => Some(Self::Notify),
            5 => Some(Self::TablesAdd),
            6 => Some(Self::TablesDel),
            7 => Some(Self::TablesList),
            8 => Some(Self::Info),
            _ => None,
        }
    }
}

// Layout pins. The guest driver hard-codes these.
const _: () = assert!(size_of::<Address>() == 8);
const _: () = assert!(size_of::<RingId>() == 16);
const _: () = assert!(size_of::<RingDesc>() == 64);
const _: () = assert!(offset_of!(RingDesc, rx_ptr) == 24);
const _: () = assert!(offset_of!(RingDesc, tx_ptr) == 28);
const _: () = assert!(offset_of!(RingDesc, len) == 32);
const _: () = assert!(size_of::<MessageHeader>() == 16);
const _: () = assert!(size_of::<Iov>() == 16);
const _: () = assert!(size_of::<RingData>() == 16);
const _: () = assert!(offset_of!(RingDataEnt, flags) == 8);
const _: () = assert!(size_of::<TablesRule>() == 20);
const _: () = assert!(size_of::<FabricInfo>() == 24);
