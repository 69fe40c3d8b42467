//! # MAGMA Fence
//!
//! Completion primitives and per-channel synchronization for GPU command
//! submission.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                       Channel Sync Pipeline                       │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │ ChannelSync  │───▶│  Encoder     │───▶│  PrivCmdQueue    │     │
//! │  │ (wait/incr)  │    │ (host mthds) │    │  (cmd words)     │     │
//! │  └──────┬───────┘    └──────────────┘    └──────────────────┘     │
//! │         │                                                         │
//! │  ┌──────▼───────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │    Fence     │───▶│ Completion   │───▶│ Syncpoint unit / │     │
//! │  │              │    │ Point        │    │ Semaphore pool   │     │
//! │  └──────────────┘    └──────────────┘    └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Increment Flow
//!
//! 1. Reserve command words in the channel's private queue
//! 2. Encode the increment (optionally behind a wait-for-idle)
//! 3. Advance the channel's threshold
//! 4. Optionally wrap the completion point in an OS fence
//! 5. Optionally arm a completion interrupt

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod cmdbuf;
pub mod encoder;
pub mod fence;
pub mod os_fence;
pub mod semaphore;
pub mod soft;
pub mod sync;
pub mod syncpt;

// Re-exports
pub use cmdbuf::{PrivCmdEntry, PrivCmdQueue};
pub use encoder::{HostMethodEncoder, SyncCmdEncoder};
pub use fence::Fence;
pub use os_fence::{CompletionPoint, FenceFd, OsFence, OsFenceOps};
pub use semaphore::{HwSemaphore, SemaphorePool};
pub use soft::{SoftOsFence, SoftSyncpointHost};
pub use sync::{
    ChannelSync, CompletionSink, IncrCmd, SyncBackends, SyncCaps, SyncParams, WaitCmd,
};
pub use syncpt::{threshold_reached, SyncpointOps, SyncptNotifier};
