//! # FIFO
//!
//! Owner of the fixed TSG pool. Slot `i` is TSG id `i`; a slot is handed
//! out by linear scan of an in-use map under one mutex. The pool has as
//! many slots as the device has channels, so it never needs to grow.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use magma_core::{ChannelId, Error, FifoConfig, ProcessId, Result, RunlistId, TsgId};
use spin::{Mutex, MutexGuard};

use crate::channel::{Channel, ChannelParams};
use crate::hal::FifoHal;
use crate::tsg::Tsg;

// =============================================================================
// SHARED CONTEXT
// =============================================================================

/// State every TSG of the device shares
pub(crate) struct FifoCtx {
    pub(crate) config: FifoConfig,
    pub(crate) hal: FifoHal,
    tsg_in_use: Mutex<Vec<bool>>,
    /// Device-wide MMU debug-mode count; also serializes all three levels
    mmu_debug_refcnt: Mutex<u32>,
}

impl FifoCtx {
    fn acquire_unused_tsg(&self) -> Option<TsgId> {
        let mut in_use = self.tsg_in_use.lock();
        let idx = in_use.iter().position(|used| !used)?;
        in_use[idx] = true;
        Some(TsgId::new(idx as u32))
    }

    pub(crate) fn release_used_tsg(&self, tsgid: TsgId) {
        if let Some(used) = self.tsg_in_use.lock().get_mut(tsgid.index()) {
            *used = false;
        }
    }

    pub(crate) fn is_in_use(&self, tsgid: TsgId) -> bool {
        self.tsg_in_use
            .lock()
            .get(tsgid.index())
            .copied()
            .unwrap_or(false)
    }

    pub(crate) fn mmu_debug_lock(&self) -> MutexGuard<'_, u32> {
        self.mmu_debug_refcnt.lock()
    }
}

// =============================================================================
// FIFO
// =============================================================================

/// TSG pool and device-level scheduling entry points
pub struct Fifo {
    ctx: Arc<FifoCtx>,
    tsgs: Vec<Arc<Tsg>>,
}

impl Fifo {
    /// Set up the pool for `config.num_channels` TSGs
    pub fn new(config: FifoConfig, hal: FifoHal) -> Result<Self> {
        config.validate()?;

        let num = config.num_channels;
        let ctx = Arc::new(FifoCtx {
            config,
            hal,
            tsg_in_use: Mutex::new(vec![false; num as usize]),
            mmu_debug_refcnt: Mutex::new(0),
        });

        let tsgs = (0..num)
            .map(|id| Arc::new(Tsg::new(TsgId::new(id), Arc::clone(&ctx))))
            .collect();

        log::info!("{}: fifo with {} tsg slots", ctx.config.name, num);

        Ok(Self { ctx, tsgs })
    }

    /// Configuration
    pub fn config(&self) -> &FifoConfig {
        &self.ctx.config
    }

    /// Collaborators
    pub fn hal(&self) -> &FifoHal {
        &self.ctx.hal
    }

    /// Pool size
    pub fn num_tsgs(&self) -> usize {
        self.tsgs.len()
    }

    /// Allocated slots
    pub fn tsgs_in_use(&self) -> usize {
        self.ctx.tsg_in_use.lock().iter().filter(|used| **used).count()
    }

    /// Device-wide MMU debug-mode count
    pub fn mmu_debug_mode_refcnt(&self) -> u32 {
        *self.ctx.mmu_debug_lock()
    }

    /// Open a TSG for `pid`
    ///
    /// The caller owns the returned reference and drops it with
    /// [`Tsg::put`].
    pub fn tsg_open(&self, pid: ProcessId) -> Result<Arc<Tsg>> {
        let Some(tsgid) = self.ctx.acquire_unused_tsg() else {
            log::warn!("{}: no free tsg", self.ctx.config.name);
            return Err(Error::ResourceExhausted);
        };

        let tsg = &self.tsgs[tsgid.index()];
        if let Err(e) = tsg.open_common(pid) {
            self.ctx.release_used_tsg(tsgid);
            log::error!("tsg {} open failed: {}", tsgid, e);
            return Err(e);
        }

        log::debug!("tsg opened {}", tsgid);
        Ok(Arc::clone(tsg))
    }

    /// Bounds-checked slot lookup
    pub fn check_and_get_from_id(&self, tsgid: TsgId) -> Option<&Arc<Tsg>> {
        self.tsgs.get(tsgid.index())
    }

    /// TSG a channel is bound to
    pub fn tsg_from_ch(&self, ch: &Channel) -> Option<&Arc<Tsg>> {
        let tsgid = ch.tsgid();
        if !tsgid.is_valid() {
            log::debug!("tsgid is invalid for chid: {}", ch.chid());
            return None;
        }
        self.check_and_get_from_id(tsgid)
    }

    /// Channel parameters carrying this device's defaults
    pub fn channel_params(&self, chid: ChannelId, runlist: RunlistId) -> ChannelParams {
        ChannelParams {
            dev_name: self.ctx.config.name,
            ctxsw_timeout_max_ms: self.ctx.config.ctxsw_timeout_max_ms(),
            ..ChannelParams::new(chid, runlist)
        }
    }

    // ===== Channel-addressed TSG operations =====

    /// Report `err_code` on every channel of `ch`'s TSG and recover it
    pub fn force_reset_ch(&self, ch: &Channel, err_code: u32, verbose: bool) -> Result<()> {
        let Some(tsg) = self.tsg_from_ch(ch) else {
            log::error!("chid: {} is not bound to tsg", ch.chid());
            return Err(Error::InvalidState);
        };

        tsg.set_error_notifier(err_code);
        self.ctx.hal.engine.recover(tsg, verbose);
        Ok(())
    }

    /// Count an MMU debug-mode request for `ch`
    pub fn set_mmu_debug_mode(&self, ch: &Channel, enable: bool) -> Result<()> {
        let tsg = self.tsg_from_ch(ch).ok_or(Error::InvalidState)?;
        tsg.set_mmu_debug_mode(ch, enable)
    }

    /// Mask SM exceptions on `ch`'s TSG
    pub fn set_sm_exception_type_mask(&self, ch: &Channel, mask: u32) -> Result<()> {
        let tsg = self.tsg_from_ch(ch).ok_or(Error::InvalidState)?;
        tsg.set_sm_exception_mask(mask);
        Ok(())
    }
}

impl fmt::Debug for Fifo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fifo")
            .field("name", &self.ctx.config.name)
            .field("tsgs", &self.num_tsgs())
            .field("in_use", &self.tsgs_in_use())
            .field("hal", &self.ctx.hal)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
