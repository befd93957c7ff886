// src/fabric/guest_mem.rs
//! Raw guest memory access
//!
//! The one module allowed to dereference guest-controlled memory. It exposes
//! typed, fallible copy helpers over two kinds of sources: plain guest
//! handles (hypercall argument buffers, resolved by the platform) and the
//! mapped pages of a ring region. The rest of the fabric, the insertion
//! engine included, performs no raw pointer arithmetic of its own.
//!
//! Ring offsets address the whole region (descriptor plus payload) and are
//! decomposed into a page index and an in-page offset here. The page index
//! wraps modulo the frame count, mirroring the behavior of the guest driver
//! side.

use core::mem::MaybeUninit;
use core::slice;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::abi::{RingDesc, Wire, PAGE_SHIFT, PAGE_SIZE};
use crate::errors::{Error, Result};
use crate::fabric::mapper::RingMapping;
use crate::platform::{DomainId, GuestHandle, Platform};

/// Read one `T` from a guest address space.
pub(crate) fn read_obj<T: Wire>(
    platform: &dyn Platform,
    domain: DomainId,
    src: GuestHandle,
) -> Result<T> {
    let mut value = MaybeUninit::<T>::uninit();
    // SAFETY: the byte view covers exactly the uninitialized T, and Wire
    // types are valid for any bit pattern once fully written.
    let bytes = unsafe {
        slice::from_raw_parts_mut(value.as_mut_ptr().cast::<u8>(), size_of::<T>())
    };
    platform.copy_from_guest(domain, src, bytes)?;
    // SAFETY: copy_from_guest filled all size_of::<T>() bytes.
    Ok(unsafe { value.assume_init() })
}

/// Read element `index` of a guest array of `T`.
pub(crate) fn read_obj_at<T: Wire>(
    platform: &dyn Platform,
    domain: DomainId,
    base: GuestHandle,
    index: u64,
) -> Result<T> {
    read_obj(platform, domain, base.index::<T>(index))
}

/// Write one `T` into a guest address space.
pub(crate) fn write_obj<T: Wire>(
    platform: &dyn Platform,
    domain: DomainId,
    dst: GuestHandle,
    value: &T,
) -> Result<()> {
    platform.copy_to_guest(domain, dst, as_bytes(value))
}

/// Byte view of a wire value.
pub(crate) fn as_bytes<T: Wire>(value: &T) -> &[u8] {
    // SAFETY: Wire types are plain integer aggregates; reading them as
    // bytes is always defined.
    unsafe { slice::from_raw_parts(core::ptr::from_ref(value).cast::<u8>(), size_of::<T>()) }
}

/// Where the bytes of a ring copy come from.
#[derive(Clone, Copy)]
pub(crate) enum CopySrc<'a> {
    /// Hypervisor-built bytes (message headers).
    Bytes(&'a [u8]),
    /// A validated range of a sender's address space.
    Guest {
        /// Sending domain.
        domain: DomainId,
        /// Start of the range.
        src: GuestHandle,
    },
}

/// Copy `len` bytes into the ring region at `offset`, crossing page
/// boundaries as needed.
pub(crate) fn copy_to_ring(
    platform: &dyn Platform,
    mapping: &mut RingMapping,
    offset: u32,
    src: CopySrc<'_>,
    len: u32,
) -> Result<()> {
    let npage = mapping.npage();
    if npage == 0 {
        return Err(Error::Fault);
    }
    if let CopySrc::Bytes(bytes) = src {
        debug_assert_eq!(bytes.len(), len as usize);
    }

    let mut page = (offset as usize >> PAGE_SHIFT) % npage;
    let mut offset = offset as usize & (PAGE_SIZE - 1);
    let mut copied = 0u32;
    let mut remaining = len;

    while remaining > 0 {
        let chunk = remaining.min((PAGE_SIZE - offset) as u32);
        let base = mapping.map_page(platform, page)?.as_ptr();
        // SAFETY: the mapping covers PAGE_SIZE writable bytes and
        // offset + chunk <= PAGE_SIZE; the ring lock gives us exclusive
        // hypervisor-side access.
        let dst = unsafe {
            slice::from_raw_parts_mut(base.as_ptr().add(offset), chunk as usize)
        };
        match src {
            CopySrc::Bytes(bytes) => {
                dst.copy_from_slice(&bytes[copied as usize..(copied + chunk) as usize]);
            }
            CopySrc::Guest { domain, src } => {
                platform.copy_from_guest(domain, src.offset(u64::from(copied)), dst)?;
            }
        }
        copied += chunk;
        remaining -= chunk;
        offset = 0;
        page = (page + 1) % npage;
    }

    Ok(())
}

/// Copy bytes out of the ring region at `offset` into `dst`.
pub(crate) fn copy_from_ring(
    platform: &dyn Platform,
    mapping: &mut RingMapping,
    offset: u32,
    dst: &mut [u8],
) -> Result<()> {
    let npage = mapping.npage();
    if npage == 0 {
        return Err(Error::Fault);
    }

    let mut page = (offset as usize >> PAGE_SHIFT) % npage;
    let mut offset = offset as usize & (PAGE_SIZE - 1);
    let mut copied = 0usize;

    while copied < dst.len() {
        let chunk = (dst.len() - copied).min(PAGE_SIZE - offset);
        let base = mapping.map_page(platform, page)?.as_ptr();
        // SAFETY: the mapping covers PAGE_SIZE bytes and
        // offset + chunk <= PAGE_SIZE.
        let src = unsafe { slice::from_raw_parts(base.as_ptr().add(offset), chunk) };
        dst[copied..copied + chunk].copy_from_slice(src);
        copied += chunk;
        offset = 0;
        page = (page + 1) % npage;
    }

    Ok(())
}

/// Read the guest-resident ring descriptor (page 0 of the region).
pub(crate) fn read_ring_desc(
    platform: &dyn Platform,
    mapping: &mut RingMapping,
) -> Result<RingDesc> {
    let mut desc = MaybeUninit::<RingDesc>::uninit();
    // SAFETY: the byte view covers exactly the uninitialized descriptor,
    // which is a Wire type.
    let bytes = unsafe {
        slice::from_raw_parts_mut(desc.as_mut_ptr().cast::<u8>(), size_of::<RingDesc>())
    };
    copy_from_ring(platform, mapping, 0, bytes)?;
    // SAFETY: copy_from_ring filled every byte.
    Ok(unsafe { desc.assume_init() })
}

/// Atomically load a `u32` header word at `offset` (page 0, 4-aligned).
pub(crate) fn read_ring_u32(
    platform: &dyn Platform,
    mapping: &mut RingMapping,
    offset: u32,
) -> Result<u32> {
    debug_assert!(offset as usize + 4 <= PAGE_SIZE && offset % 4 == 0);
    let base = mapping.map_page(platform, 0)?.as_ptr();
    // SAFETY: the word lies inside the mapped page and is 4-aligned; the
    // guest may race on it, which is why the access is atomic.
    let word = unsafe { &*base.as_ptr().add(offset as usize).cast::<AtomicU32>() };
    Ok(word.load(Ordering::Acquire))
}

/// Atomically store a `u32` header word at `offset` (page 0, 4-aligned).
///
/// Release ordering makes every prior payload write visible to a guest
/// that observes the new value.
pub(crate) fn write_ring_u32(
    platform: &dyn Platform,
    mapping: &mut RingMapping,
    offset: u32,
    value: u32,
) -> Result<()> {
    debug_assert!(offset as usize + 4 <= PAGE_SIZE && offset % 4 == 0);
    let base = mapping.map_page(platform, 0)?.as_ptr();
    // SAFETY: as in read_ring_u32.
    let word = unsafe { &*base.as_ptr().add(offset as usize).cast::<AtomicU32>() };
    word.store(value, Ordering::Release);
    Ok(())
}
