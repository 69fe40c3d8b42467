//! # MAGMA Scheduler
//!
//! Timeslice groups (TSGs) and the channel-binding protocol around them.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                               Fifo                                │
//! │  TSG pool (slot i == TsgId i) · in-use map · device MMU debug     │
//! │                                                                   │
//! │  ┌───────────────────────┐        ┌───────────────────────────┐   │
//! │  │          Tsg          │ 1    n │         Channel           │   │
//! │  │ runlist · domain      │───────▶│ tsgid · unserviceable     │   │
//! │  │ interleave · slice    │        │ ctxsw timeout · sync      │   │
//! │  │ members (RwLock)      │        └─────────────┬─────────────┘   │
//! │  └───────────┬───────────┘                      │                 │
//! │              │                                  ▼                 │
//! │              ▼                          magma-cmd-fence           │
//! │   FifoHal: RunlistOps · EngineOps · ChannelOps · GrOps · MmuDebug │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Error Contract
//!
//! - Bind failures leave the membership untouched.
//! - [`Error::Retry`](magma_core::Error::Retry) from unbind means nothing
//!   changed and the caller should try again.
//! - Any other unbind failure aborts the whole TSG; the channel is still
//!   removed and its TSG reference dropped.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod channel;
pub mod fifo;
pub mod hal;
pub mod tsg;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use channel::{Channel, ChannelParams, ChannelRef};
pub use fifo::Fifo;
pub use hal::{
    ChannelHwState, ChannelOps, DefaultEngine, EngineOps, FifoHal, GrCtx, GrOps, MmuDebugOps,
    ProfilerBinding, RunlistDomain, RunlistOps,
};
pub use tsg::{CtxswTimeoutStatus, SmErrorState, Tsg};
