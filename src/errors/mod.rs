// src/errors/mod.rs
//! Unified error types for the messaging fabric
//!
//! Every fallible path in the crate reports one of these kinds; the
//! hypercall layer folds them into Linux-compatible negative errno values.

use core::fmt;

/// Hypercall result type.
///
/// Non-negative values indicate success (often a byte count).
/// Negative values are errno codes (see constants below).
pub type OpResult = i64;

/// Success code
pub const SUCCESS: OpResult = 0;

// Error codes match Linux errno values for driver familiarity.

/// No such file or directory
pub const ENOENT: OpResult = -2;
/// Try again (resource temporarily unavailable)
pub const EAGAIN: OpResult = -11;
/// Out of memory
pub const ENOMEM: OpResult = -12;
/// Bad address (guest memory access failed)
pub const EFAULT: OpResult = -14;
/// File exists
pub const EEXIST: OpResult = -17;
/// No such device
pub const ENODEV: OpResult = -19;
/// Invalid argument
pub const EINVAL: OpResult = -22;
/// Function not implemented
pub const ENOSYS: OpResult = -38;
/// Message too long
pub const EMSGSIZE: OpResult = -90;
/// Connection refused
pub const ECONNREFUSED: OpResult = -111;

/// Error taxonomy of the fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed handle, misaligned ring, bad magic, out-of-range argument
    InvalidArg,
    /// Ring id not registered
    NotFound,
    /// Duplicate ring id
    AlreadyExists,
    /// Allocation failed
    NoMemory,
    /// Guest memory access failed
    Fault,
    /// Destination domain or ring absent, or the filter rejected the send
    ConnRefused,
    /// Transient: the message did not fit; retry after a wake-up
    RingFull,
    /// Message exceeds ring capacity or the 2 GiB cap
    TooLarge,
    /// The calling domain has no fabric state
    NoDevice,
}

impl Error {
    /// Convert to a hypercall result (negative errno)
    #[must_use]
    pub const fn to_errno(self) -> OpResult {
        match self {
            Self::InvalidArg => EINVAL,
            Self::NotFound => ENOENT,
            Self::AlreadyExists => EEXIST,
            Self::NoMemory => ENOMEM,
            Self::Fault => EFAULT,
            Self::ConnRefused => ECONNREFUSED,
            Self::RingFull => EAGAIN,
            Self::TooLarge => EMSGSIZE,
            Self::NoDevice => ENODEV,
        }
    }

    /// Returns a string representation of the error.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArg => "invalid argument",
            Self::NotFound => "ring not registered",
            Self::AlreadyExists => "ring already registered",
            Self::NoMemory => "out of memory",
            Self::Fault => "guest memory access failed",
            Self::ConnRefused => "destination refused",
            Self::RingFull => "ring full",
            Self::TooLarge => "message too large",
            Self::NoDevice => "no fabric state for domain",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<alloc::collections::TryReserveError> for Error {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        Self::NoMemory
    }
}

/// Result type alias for fabric operations
pub type Result<T> = core::result::Result<T, Error>;
