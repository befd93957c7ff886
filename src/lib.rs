// src/lib.rs
//! v4v: hypervisor-resident inter-domain messaging fabric
//!
//! Guest domains exchange byte streams through fixed-size, guest-supplied
//! ring buffers that the hypervisor writes into directly. This crate is the
//! hypervisor side: the ring registry, the insertion engine, the
//! pending-waiter bookkeeping, the send filter, and the hypercall surface
//! that ties them together.
//!
//! The crate owns no hypervisor machinery. Frame pinning, page mapping,
//! event channels, domain lookup, and raw guest-memory copies are reached
//! through the [`Platform`] trait the embedder supplies to [`init`]; the
//! external trap path then routes every fabric hypercall to [`do_op`].
//!
//! | cmd | args | result |
//! |-----|------|--------|
//! | `RegisterRing` | descriptor handle, pfn array handle, npage | 0 or errno |
//! | `UnregisterRing` | descriptor handle | 0 or errno |
//! | `Sendv` | send-addr handle, iovec handle, niov, proto | bytes sent or errno |
//! | `Notify` | ring-data handle (or null) | 0 or errno |
//! | `TablesAdd` | rule handle, -, position | 0 or errno |
//! | `TablesDel` | rule handle or null, -, position or `POSITION_NONE` | 0 or errno |
//! | `TablesList` | list handle | 0 or errno |
//! | `Info` | info-out handle | 0 or errno |

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(missing_docs))]

extern crate alloc;

pub mod abi;
pub mod errors;
pub mod fabric;
pub mod hypercall;
pub mod platform;
pub mod sync;

use alloc::sync::Arc;

pub use errors::{Error, OpResult, Result};
pub use fabric::filter::{FilterRule, FilterTable};
pub use fabric::Fabric;
pub use platform::{DomainId, EvtchnPort, FrameId, GuestHandle, MappedPage, Platform};

/// The process-wide fabric instance. Initialized once at hypervisor start;
/// there is no teardown, hypervisor uptime is process uptime.
static FABRIC: spin::Once<Fabric> = spin::Once::new();

/// Install the platform and bring up the fabric.
///
/// The first call wins; later calls return the existing instance and drop
/// their argument.
pub fn init(platform: Arc<dyn Platform>) -> &'static Fabric {
    FABRIC.call_once(|| Fabric::new(platform))
}

/// The global fabric, if [`init`] has run.
#[must_use]
pub fn instance() -> Option<&'static Fabric> {
    FABRIC.get()
}

/// Hypercall entry against the global fabric.
///
/// Returns `-ENOSYS` before [`init`] has run, mirroring an absent
/// subsystem.
pub fn do_op(
    caller: DomainId,
    cmd: u32,
    arg1: GuestHandle,
    arg2: GuestHandle,
    arg3: u32,
    arg4: u32,
) -> OpResult {
    match instance() {
        Some(fabric) => hypercall::op(fabric, caller, cmd, arg1, arg2, arg3, arg4),
        None => errors::ENOSYS,
    }
}
