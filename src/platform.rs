// src/platform.rs
//! External collaborator contracts
//!
//! The fabric core never touches hypervisor machinery directly. Domain
//! lookup, event channels, frame pinning, temporary page mappings, and raw
//! guest-memory copies are all reached through the [`Platform`] trait, which
//! the embedding hypervisor implements once and hands to [`crate::init`].
//! Tests substitute a mock.

use core::ptr::NonNull;

use crate::abi::PAGE_SIZE;
use crate::errors::Result;

/// Guest virtual machine identifier.
pub type DomainId = u16;

/// Event-channel port number.
pub type EvtchnPort = u32;

/// Machine frame identifier, produced by [`Platform::pin_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameId(
    /// Raw machine frame number.
    pub u64,
);

/// An address in a guest's own address space, as passed in a hypercall
/// argument. Opaque to the core; only the platform can dereference it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestHandle(
    /// Raw guest virtual address.
    pub u64,
);

impl GuestHandle {
    /// The conventional null handle.
    pub const NULL: Self = Self(0);

    /// Whether this is the null handle.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether the handle is page-aligned.
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }

    /// Handle advanced by `bytes`.
    #[must_use]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Handle of element `index` of an array of `T` starting here.
    #[must_use]
    pub const fn index<T>(self, index: u64) -> Self {
        self.offset(index * size_of::<T>() as u64)
    }

    /// Handle of field at `offset` within a struct starting here.
    #[must_use]
    pub const fn field(self, offset: usize) -> Self {
        self.offset(offset as u64)
    }
}

/// A frame temporarily mapped into the hypervisor's address space.
///
/// The pointer covers exactly [`PAGE_SIZE`] bytes and stays valid until the
/// frame is passed back to [`Platform::unmap_frame`].
#[derive(Clone, Copy, Debug)]
pub struct MappedPage {
    ptr: NonNull<u8>,
}

impl MappedPage {
    /// Wrap a mapping produced by the platform.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a writable region of at least [`PAGE_SIZE`] bytes
    /// that remains valid until the mapping is returned to the platform.
    #[must_use]
    pub const unsafe fn new(ptr: NonNull<u8>) -> Self {
        Self { ptr }
    }

    /// Base pointer of the mapped page.
    #[must_use]
    pub const fn as_ptr(self) -> NonNull<u8> {
        self.ptr
    }
}

// SAFETY: a MappedPage is only dereferenced by the guest-memory module while
// the owning ring's lock is held, so cross-thread moves of the handle itself
// are sound.
unsafe impl Send for MappedPage {}
unsafe impl Sync for MappedPage {}

/// Hypervisor services the fabric depends on.
///
/// All methods are non-blocking apart from ordinary lock contention inside
/// the platform. Guest-memory operations return errors instead of sleeping
/// on faults.
pub trait Platform: Send + Sync {
    /// Whether `domain` currently exists (in any lifecycle state that can
    /// receive messages).
    fn domain_exists(&self, domain: DomainId) -> bool;

    /// Allocate the per-domain wake-up port.
    ///
    /// # Errors
    ///
    /// Returns an error if the event-channel space is exhausted.
    fn alloc_event_port(&self, domain: DomainId) -> Result<EvtchnPort>;

    /// Release a port allocated by [`Self::alloc_event_port`].
    fn free_event_port(&self, domain: DomainId, port: EvtchnPort);

    /// Fire `domain`'s event channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the port is no longer bound; callers log and
    /// continue.
    fn signal(&self, domain: DomainId, port: EvtchnPort) -> Result<()>;

    /// Translate guest frame number `pfn`, verify it is a writable page of
    /// `domain`, and take a pin reference on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is invalid or not writable by `domain`.
    fn pin_frame(&self, domain: DomainId, pfn: u64) -> Result<FrameId>;

    /// Drop a pin reference taken by [`Self::pin_frame`].
    fn unpin_frame(&self, frame: FrameId);

    /// Map a pinned frame into hypervisor address space.
    ///
    /// Mappings come from a shared bounded pool; exhaustion is transient
    /// and surfaces as a fault to the current operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping pool is exhausted.
    fn map_frame(&self, frame: FrameId) -> Result<MappedPage>;

    /// Return a mapping obtained from [`Self::map_frame`].
    fn unmap_frame(&self, frame: FrameId, page: MappedPage);

    /// Whether `[handle, handle + len)` is an addressable range of
    /// `domain`'s memory.
    fn guest_range_ok(&self, domain: DomainId, handle: GuestHandle, len: usize) -> bool;

    /// Copy bytes out of `domain`'s address space.
    ///
    /// # Errors
    ///
    /// Returns an error if any part of the source range faults.
    fn copy_from_guest(&self, domain: DomainId, src: GuestHandle, dst: &mut [u8]) -> Result<()>;

    /// Copy bytes into `domain`'s address space.
    ///
    /// # Errors
    ///
    /// Returns an error if any part of the destination range faults.
    fn copy_to_guest(&self, domain: DomainId, dst: GuestHandle, src: &[u8]) -> Result<()>;
}
