//! # MAGMA Core
//!
//! Foundational types shared by the MAGMA FIFO scheduling and fence crates.
//!
//! This crate provides:
//! - The error taxonomy every scheduling and fence operation reports
//! - Strongly typed identifiers (TSG, channel, runlist, syncpoint, process)
//! - GPU virtual addresses
//! - FIFO configuration and the channel error-notifier codes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      magma-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Error     │  │   Types     │  │   Config            │  │
//! │  │ (taxonomy,  │  │ (TsgId,     │  │ (FifoConfig,        │  │
//! │  │  retry)     │  │  GpuAddr)   │  │  ErrorNotifier)     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!          ▲                                      ▲
//!          │                                      │
//!   magma-cmd-fence                      magma-cmd-scheduler
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(test)]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod error;
pub mod notifier;
pub mod types;

// Re-exports for convenience
pub use config::{FifoConfig, InterleaveLevel};
pub use error::{Error, Result};
pub use notifier::ErrorNotifier;
pub use types::*;
