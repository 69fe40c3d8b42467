//! # Scheduler HAL
//!
//! Chip-specific collaborators the scheduler calls into. Each category is a
//! trait object injected at [`Fifo`](crate::Fifo) construction.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          FifoHal                             │
//! │                                                              │
//! │  RunlistOps    preempt / reload / add-remove / domains       │
//! │  EngineOps     optional TSG hooks, defaults in-trait         │
//! │  ChannelOps    per-channel hardware (enable, state, reset)   │
//! │  GrOps         SM count, graphics context allocation         │
//! │  MmuDebugOps   GPC and FB MMU debug-mode bits (optional)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`EngineOps`] hooks all have default bodies. A chip overrides only the
//! ones it needs; the defaults are the common implementations
//! ([`Tsg::disable_channels`], [`Tsg::check_hw_state`] and friends).

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use magma_core::{FifoConfig, InterleaveLevel, Result, RunlistId, TsgId};

use crate::channel::Channel;
use crate::tsg::Tsg;

// =============================================================================
// RUNLIST
// =============================================================================

/// Named scheduling partition of a runlist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunlistDomain {
    /// Domain name
    pub name: String,
    /// Runlist the domain belongs to
    pub runlist: RunlistId,
}

impl RunlistDomain {
    /// Name of the domain every TSG starts in
    pub const DEFAULT_NAME: &'static str = "(default)";

    /// Create a domain
    pub fn new(name: &str, runlist: RunlistId) -> Self {
        Self {
            name: String::from(name),
            runlist,
        }
    }
}

/// Runlist operations
pub trait RunlistOps: Send + Sync {
    /// Preempt a TSG off its engines
    ///
    /// Returns [`Error::Retry`](magma_core::Error::Retry) when the hardware
    /// is not ready to preempt.
    fn preempt_tsg(&self, tsg: &Tsg) -> Result<()>;

    /// Rebuild and resubmit a runlist domain
    fn reload(&self, runlist: RunlistId, domain: &RunlistDomain, wait: bool, flush: bool)
        -> Result<()>;

    /// Add or remove one channel's entry
    fn update_channel(&self, runlist: RunlistId, ch: &Channel, add: bool, wait: bool)
        -> Result<()>;

    /// Hardware limit of channels per TSG
    fn max_channels_per_tsg(&self) -> u32;

    /// Resolve a domain by runlist and name
    fn domain_lookup(&self, runlist: RunlistId, name: &str) -> Option<Arc<RunlistDomain>>;
}

// =============================================================================
// ENGINE
// =============================================================================

/// Optional engine-specific TSG hooks
pub trait EngineOps: Send + Sync {
    /// Called at the end of TSG open
    fn open(&self, _tsg: &Tsg) -> Result<()> {
        Ok(())
    }

    /// Called first during TSG release
    fn release(&self, _tsg: &Tsg) {}

    /// Allocate per-TSG engine method buffers
    fn init_eng_method_buffers(&self, _tsg: &Tsg) -> Result<()> {
        Ok(())
    }

    /// Free per-TSG engine method buffers
    fn deinit_eng_method_buffers(&self, _tsg: &Tsg) {}

    /// Engine part of channel bind; failure aborts the bind
    fn bind_channel(&self, _tsg: &Tsg, _ch: &Channel) -> Result<()> {
        Ok(())
    }

    /// Point a freshly bound channel at the TSG's method buffers
    fn bind_channel_eng_method_buffers(&self, _tsg: &Tsg, _ch: &Channel) {}

    /// Engine part of channel unbind
    fn unbind_channel(&self, _tsg: &Tsg, _ch: &Channel) -> Result<()> {
        Ok(())
    }

    /// Validate the hardware state of a channel leaving a busy TSG
    fn unbind_channel_check_hw_state(&self, tsg: &Tsg, ch: &Channel) -> Result<()> {
        tsg.check_hw_state(ch)
    }

    /// Reject the unbind while the channel still has work queued in hardware
    fn unbind_channel_check_hw_next(&self, _ch: &Channel, _state: &ChannelHwState) -> Result<()> {
        Ok(())
    }

    /// Clear engine-faulted state left behind by the leaving channel
    fn unbind_channel_check_eng_faulted(&self, _tsg: &Tsg, _ch: &Channel, _state: &ChannelHwState) {}

    /// Stop the TSG from being scheduled
    fn disable(&self, tsg: &Tsg) {
        tsg.disable_channels();
    }

    /// Let the TSG be scheduled again
    fn enable(&self, tsg: &Tsg) {
        tsg.enable_channels();
    }

    /// Program an interleave level
    fn set_interleave(&self, _tsg: &Tsg, _level: InterleaveLevel) -> Result<()> {
        Ok(())
    }

    /// Timeslice given to new TSGs
    fn default_timeslice_us(&self, config: &FifoConfig) -> u32 {
        config.timeslice_default_us
    }

    /// Recover a TSG and the engines it runs on
    fn recover(&self, tsg: &Tsg, verbose: bool) {
        log::warn!("tsg {}: recovery (verbose={})", tsg.tsgid(), verbose);
        tsg.abort(true);
    }
}

/// Engine table with every hook left at its default
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEngine;

impl EngineOps for DefaultEngine {}

// =============================================================================
// CHANNEL
// =============================================================================

/// Snapshot of a channel's hardware status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelHwState {
    /// Channel is enabled in hardware
    pub enabled: bool,
    /// Hardware has more work queued behind the current entry
    pub next: bool,
    /// Context must be reloaded before the TSG runs again
    pub ctx_reload: bool,
    /// Channel's engine is faulted
    pub eng_faulted: bool,
    /// Channel is currently on an engine
    pub busy: bool,
    /// Channel is blocked on a semaphore acquire
    pub pending_acquire: bool,
}

/// Per-channel hardware operations
pub trait ChannelOps: Send + Sync {
    /// Set the channel's enable bit
    fn enable(&self, ch: &Channel);

    /// Clear the channel's enable bit
    fn disable(&self, ch: &Channel);

    /// Unbind the channel's instance block
    fn clear(&self, ch: &Channel);

    /// Read the channel's status
    fn read_state(&self, ch: &Channel) -> ChannelHwState;

    /// Read the GPFIFO get pointer
    fn read_gp_get(&self, ch: &Channel) -> u32;

    /// Force the next schedule to reload the channel's context
    fn force_ctx_reload(&self, ch: &Channel);

    /// Clear faulted engine and PBDMA bits
    fn reset_faulted(&self, _ch: &Channel, _eng: bool, _pbdma: bool) {}

    /// Software clean-up after an abort
    fn abort_clean_up(&self, ch: &Channel) {
        ch.abort_clean_up();
    }
}

// =============================================================================
// GRAPHICS
// =============================================================================

/// Graphics context handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrCtx(pub u64);

/// Graphics engine operations
pub trait GrOps: Send + Sync {
    /// Number of SMs; zero until graphics init has run
    fn num_sm(&self) -> u32;

    /// Allocate a graphics context for a TSG
    fn alloc_gr_ctx(&self, tsgid: TsgId) -> Result<GrCtx>;

    /// Free a graphics context
    fn free_gr_ctx(&self, ctx: GrCtx);
}

// =============================================================================
// MMU DEBUG
// =============================================================================

/// MMU debug-mode bits
pub trait MmuDebugOps: Send + Sync {
    /// GPC MMU debug mode for the TSG owning `ch`
    fn set_gr_mmu_debug_mode(&self, ch: &Channel, enable: bool) -> Result<()>;

    /// Device-wide FB/HS MMU debug mode
    fn set_fb_mmu_debug_mode(&self, enable: bool);
}

// =============================================================================
// PROFILER
// =============================================================================

/// Profiler object bound to a TSG context
pub trait ProfilerBinding: Send + Sync {
    /// Detach from the TSG, which is being released
    fn unbind_context(&self, tsgid: TsgId);
}

// =============================================================================
// HAL TABLE
// =============================================================================

/// All collaborators of the scheduler
#[derive(Clone)]
pub struct FifoHal {
    /// Runlist operations
    pub runlist: Arc<dyn RunlistOps>,
    /// TSG hooks
    pub engine: Arc<dyn EngineOps>,
    /// Channel hardware
    pub channel: Arc<dyn ChannelOps>,
    /// Graphics engine
    pub gr: Arc<dyn GrOps>,
    /// MMU debug mode, absent on chips without it
    pub mmu_debug: Option<Arc<dyn MmuDebugOps>>,
}

impl fmt::Debug for FifoHal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoHal")
            .field("max_channels_per_tsg", &self.runlist.max_channels_per_tsg())
            .field("num_sm", &self.gr.num_sm())
            .field("mmu_debug", &self.mmu_debug.is_some())
            .finish()
    }
}
