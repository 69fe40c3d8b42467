//! # MAGMA Core Types
//!
//! Fundamental type definitions used across the FIFO scheduling core.
//!
//! These types provide:
//! - Strong typing for GPU virtual addresses
//! - Distinct identifier types for TSGs, channels, runlists and syncpoints
//! - Size guarantees checked at compile time

use core::fmt;
use core::ops::Add;

use static_assertions::assert_eq_size;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// This is an address in the GPU's virtual address space.
/// It is NOT a CPU pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Low 32 bits, as carried in the first method word of a 40-bit address
    #[inline]
    pub const fn lo(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits
    #[inline]
    pub const fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// IDENTIFIERS
// =============================================================================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Create from a raw index
            #[inline]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            /// Get the raw value
            #[inline]
            pub const fn raw(self) -> u32 {
                self.0
            }

            /// Raw value as a table index
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Timeslice group identifier; index into the fixed TSG pool
    TsgId, "TsgId"
);

define_id!(
    /// Hardware channel identifier
    ChannelId, "ChannelId"
);

define_id!(
    /// Runlist identifier
    RunlistId, "RunlistId"
);

define_id!(
    /// Hardware syncpoint identifier (0 is never a valid allocation)
    SyncpointId, "SyncpointId"
);

define_id!(
    /// Owning process identifier
    ProcessId, "ProcessId"
);

impl TsgId {
    /// Sentinel stored in a channel that is not bound to any TSG
    pub const INVALID: Self = Self(u32::MAX);

    /// Whether this id names a TSG
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl SyncpointId {
    /// Returned by hosts that failed to allocate
    pub const INVALID: Self = Self(0);

    /// Whether this id names an allocated syncpoint
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Sub-context id of the default (VEID0) context
pub const DEFAULT_SUBCTX_ID: u32 = 0;

assert_eq_size!(GpuAddr, u64);
assert_eq_size!(TsgId, u32);
assert_eq_size!(ChannelId, u32);
assert_eq_size!(SyncpointId, u32);

// =============================================================================
// TESTS
// =============================================================================
