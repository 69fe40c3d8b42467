//! # Timeslice Groups
//!
//! A TSG is the hardware scheduling unit: a set of channels sharing one
//! context, one runlist entry, one interleave level and one timeslice.
//!
//! ## Lifecycle
//!
//! ```text
//!   Fifo::tsg_open ──▶ refcount 1 ──▶ bind_channel (+1 per channel)
//!                                          │
//!                           unbind_channel (-1) / put (-1)
//!                                          │
//!                            last put ──▶ release ──▶ slot free
//! ```
//!
//! ## Unbind
//!
//! ```text
//!   disable ─▶ preempt ─▶ [hw state check] ─▶ clear ─▶ runlist remove
//!      │          │              │                          │
//!      │       Retry ────────────┴──▶ re-enable, Err(Retry) │
//!      │       other ────────────┬──▶ teardown: abort TSG,  │
//!      │                         │    strip channel, put    │
//!   list remove ◀────────────────┼──────────────────────────┘
//!      │                         │
//!   enable ─▶ engine unbind ─────┘ (on failure)
//! ```
//!
//! The membership list is guarded by a reader-writer lock: bind and unbind
//! write, every broadcast walk reads.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use magma_core::{
    Error, ErrorNotifier, FifoConfig, InterleaveLevel, ProcessId, Result, RunlistId, TsgId,
};
use spin::{Mutex, MutexGuard, RwLock};
use static_assertions::assert_impl_all;

use crate::channel::Channel;
use crate::fifo::FifoCtx;
use crate::hal::{ChannelHwState, FifoHal, GrCtx, ProfilerBinding, RunlistDomain};

// =============================================================================
// SM ERROR STATE
// =============================================================================

/// Error state latched for one SM
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmErrorState {
    /// Global error status
    pub hww_global_esr: u32,
    /// Warp error status
    pub hww_warp_esr: u32,
    /// Program counter of the faulting warp
    pub hww_warp_esr_pc: u64,
    /// Global errors reported to the user
    pub hww_global_esr_report_mask: u32,
    /// Warp errors reported to the user
    pub hww_warp_esr_report_mask: u32,
}

// =============================================================================
// CTXSW TIMEOUT
// =============================================================================

/// Result of one context-switch timeout check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtxswTimeoutStatus {
    /// A channel went too long without progress; recover the TSG
    pub recover: bool,
    /// Dump debug state during recovery
    pub debug_dump: bool,
    /// Timeout to report
    pub ms: u32,
}

// =============================================================================
// TSG
// =============================================================================

struct TsgState {
    pid: ProcessId,
    runlist: Option<RunlistId>,
    rl_domain: Option<Arc<RunlistDomain>>,
    interleave: InterleaveLevel,
    timeslice_us: u32,
    gr_ctx: Option<GrCtx>,
    sm_error_states: Option<Vec<SmErrorState>>,
    profiler: Option<Arc<dyn ProfilerBinding>>,
}

impl TsgState {
    fn closed() -> Self {
        Self {
            pid: ProcessId::default(),
            runlist: None,
            rl_domain: None,
            interleave: InterleaveLevel::Low,
            timeslice_us: 0,
            gr_ctx: None,
            sm_error_states: None,
            profiler: None,
        }
    }
}

enum CommonUnbind {
    Unbound,
    Retry,
    Failed(Error),
}

/// Timeslice group
pub struct Tsg {
    tsgid: TsgId,
    ctx: Arc<FifoCtx>,
    refcount: AtomicU32,
    abortable: AtomicBool,
    ch_list: RwLock<Vec<Arc<Channel>>>,
    num_active_channels: AtomicU32,
    mmu_debug_mode_refcnt: AtomicU32,
    state: Mutex<TsgState>,
    sm_exception_mask: Mutex<u32>,
    ctx_init_lock: Mutex<()>,
}

assert_impl_all!(Tsg: Send, Sync);

impl Tsg {
    pub(crate) fn new(tsgid: TsgId, ctx: Arc<FifoCtx>) -> Self {
        Self {
            tsgid,
            ctx,
            refcount: AtomicU32::new(0),
            abortable: AtomicBool::new(true),
            ch_list: RwLock::new(Vec::new()),
            num_active_channels: AtomicU32::new(0),
            mmu_debug_mode_refcnt: AtomicU32::new(0),
            state: Mutex::new(TsgState::closed()),
            sm_exception_mask: Mutex::new(0),
            ctx_init_lock: Mutex::new(()),
        }
    }

    fn hal(&self) -> &FifoHal {
        &self.ctx.hal
    }

    fn config(&self) -> &FifoConfig {
        &self.ctx.config
    }

    // ===== Open / release =====

    /// Initialize a freshly acquired slot
    ///
    /// On failure everything allocated so far is released again; the slot
    /// itself is returned by the caller.
    pub(crate) fn open_common(&self, pid: ProcessId) -> Result<()> {
        let num_sm = self.hal().gr.num_sm();
        if num_sm == 0 {
            log::error!("tsg {}: no_of_sm not set, failed allocation", self.tsgid);
            return Err(Error::InvalidConfig);
        }

        self.alloc_sm_error_states(num_sm)?;

        let timeslice_us = self.default_timeslice_us();
        // provisional: re-resolved once the first channel names the runlist
        let rl_domain = self
            .hal()
            .runlist
            .domain_lookup(RunlistId::new(0), RunlistDomain::DEFAULT_NAME);

        {
            let mut state = self.state.lock();
            state.pid = pid;
            state.runlist = None;
            state.rl_domain = rl_domain;
            state.interleave = InterleaveLevel::Low;
            state.timeslice_us = timeslice_us;
        }
        self.num_active_channels.store(0, Ordering::Release);
        self.mmu_debug_mode_refcnt.store(0, Ordering::Release);
        self.abortable.store(true, Ordering::Release);
        *self.sm_exception_mask.lock() = 0;
        self.refcount.store(1, Ordering::Release);

        if let Err(e) = self.open_hw() {
            self.release_common();
            self.refcount.store(0, Ordering::Release);
            return Err(e);
        }

        Ok(())
    }

    fn open_hw(&self) -> Result<()> {
        let gr_ctx = self.hal().gr.alloc_gr_ctx(self.tsgid).map_err(|e| {
            log::error!("tsg {}: gr ctx alloc failed: {}", self.tsgid, e);
            e
        })?;
        self.state.lock().gr_ctx = Some(gr_ctx);

        let engine = &self.hal().engine;
        engine.init_eng_method_buffers(self).map_err(|e| {
            log::error!("tsg {}: init eng method bufs failed: {}", self.tsgid, e);
            e
        })?;
        engine.open(self).map_err(|e| {
            log::error!("tsg {}: fifo open failed: {}", self.tsgid, e);
            e
        })
    }

    /// Tear down everything `open_common` set up
    fn release_common(&self) {
        let hal = self.hal();
        hal.engine.release(self);

        let (gr_ctx, profiler) = {
            let mut state = self.state.lock();
            (state.gr_ctx.take(), state.profiler.take())
        };
        if let Some(gr_ctx) = gr_ctx {
            hal.gr.free_gr_ctx(gr_ctx);
        }

        hal.engine.deinit_eng_method_buffers(self);

        if let Some(prof) = profiler {
            prof.unbind_context(self.tsgid);
        }

        let mut state = self.state.lock();
        state.rl_domain = None;
        state.sm_error_states = None;
    }

    fn release(&self) {
        self.release_common();
        self.ctx.release_used_tsg(self.tsgid);
        log::debug!("tsg released {}", self.tsgid);
    }

    /// Take a reference
    pub fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference; the last one releases the TSG
    pub fn put(&self) {
        match self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
        {
            Ok(1) => self.release(),
            Ok(_) => {}
            Err(_) => log::warn!("tsg {}: put without reference", self.tsgid),
        }
    }

    // ===== Accessors =====

    /// TSG id; index of the slot in the pool
    pub fn tsgid(&self) -> TsgId {
        self.tsgid
    }

    /// Process that opened the TSG
    pub fn pid(&self) -> ProcessId {
        self.state.lock().pid
    }

    /// Outstanding references
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Whether the slot is allocated
    pub fn in_use(&self) -> bool {
        self.ctx.is_in_use(self.tsgid)
    }

    /// Number of bound channels
    pub fn channel_count(&self) -> usize {
        self.ch_list.read().len()
    }

    /// Snapshot of the bound channels
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.ch_list.read().clone()
    }

    /// Whether `ch` is a member
    pub fn contains(&self, ch: &Channel) -> bool {
        self.ch_list.read().iter().any(|c| c.chid() == ch.chid())
    }

    /// Bound channels that have a runlist entry
    pub fn num_active_channels(&self) -> u32 {
        self.num_active_channels.load(Ordering::Acquire)
    }

    /// Runlist, set by the first bound channel
    pub fn runlist(&self) -> Option<RunlistId> {
        self.state.lock().runlist
    }

    /// Current runlist domain
    pub fn domain(&self) -> Option<Arc<RunlistDomain>> {
        self.state.lock().rl_domain.clone()
    }

    /// Graphics context
    pub fn gr_ctx(&self) -> Option<GrCtx> {
        self.state.lock().gr_ctx
    }

    /// Current interleave level
    pub fn interleave_level(&self) -> InterleaveLevel {
        self.state.lock().interleave
    }

    /// Whether the TSG may be force-aborted
    pub fn is_abortable(&self) -> bool {
        self.abortable.load(Ordering::Acquire)
    }

    /// Allow or forbid force-abort
    pub fn set_abortable(&self, abortable: bool) {
        self.abortable.store(abortable, Ordering::Release);
    }

    /// MMU debug-mode requests held by the TSG's channels
    pub fn mmu_debug_mode_refcnt(&self) -> u32 {
        self.mmu_debug_mode_refcnt.load(Ordering::Acquire)
    }

    /// Lock serializing context init against profiler binding
    pub fn ctx_init_lock(&self) -> MutexGuard<'_, ()> {
        self.ctx_init_lock.lock()
    }

    // ===== Bind =====

    /// Add a channel to the TSG
    ///
    /// The first channel decides the TSG's runlist; later channels must
    /// agree with it. The channel is not runnable until it is added to
    /// the runlist.
    pub fn bind_channel(&self, ch: &Arc<Channel>) -> Result<()> {
        log::debug!("bind tsg:{} ch:{}", self.tsgid, ch.chid());
        let hal = self.hal();

        if ch.is_bound() {
            log::error!("ch {}: already bound to tsg {}", ch.chid(), ch.tsgid());
            return Err(Error::InvalidState);
        }

        if self.state.lock().rl_domain.is_none() {
            log::error!("tsg {}: no runlist domain", self.tsgid);
            return Err(Error::InvalidState);
        }

        let max = hal.runlist.max_channels_per_tsg();
        if self.channel_count() >= max as usize {
            log::warn!(
                "tsg {}: trying to bind more than the supported number ({}) of channels",
                self.tsgid,
                max
            );
            return Err(Error::ResourceExhausted);
        }

        ch.route_subctx();
        self.adopt_runlist(ch)?;

        hal.engine.bind_channel(self, ch).map_err(|e| {
            log::error!("tsg {}: engine bind of ch {} failed: {}", self.tsgid, ch.chid(), e);
            e
        })?;

        {
            let mut list = self.ch_list.write();
            if !ch.claim(self.tsgid) {
                drop(list);
                log::error!("ch {}: bound concurrently to tsg {}", ch.chid(), ch.tsgid());
                if let Err(e) = hal.engine.unbind_channel(self, ch) {
                    log::error!("tsg {}: engine unbind of ch {} failed: {}", self.tsgid, ch.chid(), e);
                }
                return Err(Error::InvalidState);
            }
            list.push(Arc::clone(ch));
            ch.set_serviceable();
        }

        hal.engine.bind_channel_eng_method_buffers(self, ch);
        self.get();

        Ok(())
    }

    fn adopt_runlist(&self, ch: &Channel) -> Result<()> {
        let pending_domain: Option<String> = {
            let state = self.state.lock();
            match state.runlist {
                Some(rl) if rl != ch.runlist() => {
                    log::error!(
                        "tsg {}: runlist mismatch, tsg runlist {} ch {} runlist {}",
                        self.tsgid,
                        rl,
                        ch.chid(),
                        ch.runlist()
                    );
                    return Err(Error::Mismatch);
                }
                Some(_) => None,
                None => state.rl_domain.as_ref().map(|d| d.name.clone()),
            }
        };

        let Some(name) = pending_domain else {
            return Ok(());
        };

        let domain = self.hal().runlist.domain_lookup(ch.runlist(), &name);
        if domain.is_none() {
            log::warn!(
                "tsg {}: domain {} not found on runlist {}",
                self.tsgid,
                name,
                ch.runlist()
            );
        }

        let mut state = self.state.lock();
        match state.runlist {
            None => {
                state.runlist = Some(ch.runlist());
                state.rl_domain = domain;
                Ok(())
            }
            Some(rl) if rl == ch.runlist() => Ok(()),
            Some(_) => Err(Error::Mismatch),
        }
    }

    /// Switch to another scheduling domain
    ///
    /// Not allowed while any channel has a runlist entry.
    pub fn bind_domain(&self, name: &str) -> Result<()> {
        if self.num_active_channels() != 0 {
            log::error!("tsg {}: domain change with active channels", self.tsgid);
            return Err(Error::InvalidState);
        }

        let Some(domain) = self.hal().runlist.domain_lookup(RunlistId::new(0), name) else {
            log::error!("tsg {}: rl domain not found ({})", self.tsgid, name);
            return Err(Error::NotFound);
        };

        self.state.lock().rl_domain = Some(domain);
        Ok(())
    }

    /// Add `ch` to, or remove it from, the runlist
    ///
    /// A no-op when the channel already is in the requested state.
    pub fn update_channel_runlist(&self, ch: &Channel, add: bool) -> Result<()> {
        let Some(runlist) = self.runlist() else {
            log::warn!("tsg {}: runlist update without a runlist", self.tsgid);
            return Err(Error::InvalidState);
        };

        if !ch.set_in_runlist(add) {
            return Ok(());
        }
        self.adjust_active(add);

        self.hal()
            .runlist
            .update_channel(runlist, ch, add, true)
            .map_err(|e| {
                ch.set_in_runlist(!add);
                self.adjust_active(!add);
                e
            })
    }

    fn adjust_active(&self, add: bool) {
        if add {
            self.num_active_channels.fetch_add(1, Ordering::AcqRel);
        } else {
            let _ = self.num_active_channels.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |n| n.checked_sub(1),
            );
        }
    }

    // ===== Unbind =====

    /// Remove a channel from the TSG
    ///
    /// Returns [`Error::Retry`] without side effects on the membership when
    /// the hardware is not ready, unless `force` is set. Any other failure
    /// aborts the whole TSG and strips the channel anyway. The channel's
    /// TSG reference is dropped on every path except the retry one. A
    /// channel that is not a member is rejected with [`Error::InvalidState`]
    /// and nothing changes.
    pub fn unbind_channel(&self, ch: &Channel, force: bool) -> Result<()> {
        log::debug!("unbind tsg:{} ch:{}", self.tsgid, ch.chid());
        if ch.tsgid() != self.tsgid {
            log::error!("ch {}: not bound to tsg {}", ch.chid(), self.tsgid);
            return Err(Error::InvalidState);
        }
        let engine = &self.hal().engine;

        let err = match self.unbind_channel_common(ch) {
            CommonUnbind::Retry if !force => return Err(Error::Retry),
            CommonUnbind::Unbound => match engine.unbind_channel(self, ch) {
                Ok(()) => {
                    self.put();
                    return Ok(());
                }
                Err(e) => {
                    // already off the list
                    let _ = ch.mark_error();
                    log::error!("tsg {}: unbind hal failed: {}", self.tsgid, e);
                    e
                }
            },
            CommonUnbind::Retry => {
                log::error!("tsg {}: forced unbind of busy ch {}", self.tsgid, ch.chid());
                self.engine_unbind_best_effort(ch);
                Error::Retry
            }
            CommonUnbind::Failed(e) => {
                log::error!("tsg {}: unbind common failed: {}", self.tsgid, e);
                self.engine_unbind_best_effort(ch);
                e
            }
        };

        Err(self.unbind_teardown(ch, err))
    }

    fn unbind_channel_common(&self, ch: &Channel) -> CommonUnbind {
        let hal = self.hal();
        let timed_out = ch.is_unserviceable();

        hal.engine.disable(self);

        if let Err(e) = hal.runlist.preempt_tsg(self) {
            return self.abandon_unbind(e, timed_out);
        }

        // a dead TSG has nothing to hand over
        if !timed_out && self.channel_count() > 1 {
            if let Err(e) = hal.engine.unbind_channel_check_hw_state(self, ch) {
                if !e.is_retryable() {
                    log::error!("ch {}: unbind hw state check failed: {}", ch.chid(), e);
                }
                return self.abandon_unbind(e, timed_out);
            }
        }

        hal.channel.clear(ch);

        if let Err(e) = self.update_channel_runlist(ch, false) {
            if !e.is_retryable() {
                log::error!("ch {}: remove from runlist failed: {}", ch.chid(), e);
            }
            return self.abandon_unbind(e, timed_out);
        }

        self.unwind_mmu_debug_mode(ch);

        {
            let mut list = self.ch_list.write();
            list.retain(|c| c.chid() != ch.chid());
            ch.clear_tsgid();
            // may have been re-enabled while still listed
            hal.channel.disable(ch);
        }

        if !timed_out {
            hal.engine.enable(self);
        }

        hal.channel.abort_clean_up(ch);

        CommonUnbind::Unbound
    }

    fn abandon_unbind(&self, err: Error, timed_out: bool) -> CommonUnbind {
        if !err.is_retryable() {
            return CommonUnbind::Failed(err);
        }
        if !timed_out {
            self.hal().engine.enable(self);
        }
        CommonUnbind::Retry
    }

    fn engine_unbind_best_effort(&self, ch: &Channel) {
        if let Err(e) = self.hal().engine.unbind_channel(self, ch) {
            log::error!("tsg {}: unbind hal failed: {}", self.tsgid, e);
        }
    }

    /// Abort the TSG and strip `ch` from it
    fn unbind_teardown(&self, ch: &Channel, err: Error) -> Error {
        log::error!(
            "ch {}: unbind failed, tearing down tsg {}",
            ch.chid(),
            self.tsgid
        );

        self.abort(true);
        self.hal().channel.clear(ch);

        if let Err(e) = self.update_channel_runlist(ch, false) {
            log::error!("ch {}: remove from runlist failed: {}", ch.chid(), e);
        }

        self.unwind_mmu_debug_mode(ch);

        {
            let mut list = self.ch_list.write();
            list.retain(|c| c.chid() != ch.chid());
            ch.clear_tsgid();
        }

        self.put();
        err
    }

    /// Default hardware-state validation of a leaving channel
    pub fn check_hw_state(&self, ch: &Channel) -> Result<()> {
        let hal = self.hal();
        let state = {
            let _list = self.ch_list.read();
            hal.channel.read_state(ch)
        };

        let result = hal.engine.unbind_channel_check_hw_next(ch, &state);
        self.check_ctx_reload(ch, &state);
        hal.engine.unbind_channel_check_eng_faulted(self, ch, &state);

        result
    }

    /// Move a pending context reload to another member
    pub fn check_ctx_reload(&self, ch: &Channel, state: &ChannelHwState) {
        if !state.ctx_reload {
            return;
        }

        let list = self.ch_list.read();
        if let Some(other) = list.iter().find(|c| c.chid() != ch.chid()) {
            self.hal().channel.force_ctx_reload(other);
        }
    }

    // ===== Enable / disable / abort =====

    /// Stop the TSG from being scheduled
    pub fn disable(&self) {
        self.hal().engine.disable(self);
    }

    /// Let the TSG be scheduled
    pub fn enable(&self) {
        self.hal().engine.enable(self);
    }

    /// Disable every member channel
    pub fn disable_channels(&self) {
        let hw = &self.hal().channel;
        for ch in self.ch_list.read().iter() {
            hw.disable(ch);
        }
    }

    /// Enable every member channel
    pub fn enable_channels(&self) {
        let hw = &self.hal().channel;
        for ch in self.ch_list.read().iter() {
            hw.enable(ch);
        }
    }

    /// Disable the TSG and fault all of its channels
    ///
    /// Membership is left alone; channels still unbind themselves.
    pub fn abort(&self, preempt: bool) {
        log::debug!("tsg {}: abort preempt={}", self.tsgid, preempt);
        let hal = self.hal();

        if !self.is_abortable() {
            log::warn!("tsg {}: abort of non-abortable tsg", self.tsgid);
        }

        hal.engine.disable(self);

        if preempt {
            // a failed preempt is caught by the ctxsw timeout
            if let Err(e) = hal.runlist.preempt_tsg(self) {
                log::debug!("tsg {}: preempt during abort failed: {}", self.tsgid, e);
            }
        }

        for ch in self.ch_list.read().iter() {
            if let Some(ch) = ch.get() {
                ch.set_unserviceable();
                hal.channel.abort_clean_up(&ch);
            }
        }
    }

    // ===== Broadcast =====

    /// Fault every member channel
    pub fn set_unserviceable(&self) {
        for ch in self.ch_list.read().iter() {
            if let Some(ch) = ch.get() {
                ch.set_unserviceable();
            }
        }
    }

    /// Wake waiters on every member channel
    pub fn wakeup_waiters(&self) {
        for ch in self.ch_list.read().iter() {
            if let Some(ch) = ch.get() {
                ch.wakeup_waiters();
            }
        }
    }

    /// Fault every member; whether any asked for a debug dump
    pub fn mark_error(&self) -> bool {
        let mut verbose = false;
        for ch in self.ch_list.read().iter() {
            if let Some(ch) = ch.get() {
                verbose |= ch.mark_error();
            }
        }
        verbose
    }

    /// Report an error notifier on every member
    ///
    /// Unknown codes are ignored.
    pub fn set_error_notifier(&self, code: u32) {
        let Some(notifier) = ErrorNotifier::from_raw(code) else {
            return;
        };

        for ch in self.ch_list.read().iter() {
            if let Some(ch) = ch.get() {
                ch.set_error_notifier(notifier);
            }
        }
    }

    /// Report an MMU fault on every member
    pub fn set_ctx_mmu_error(&self) {
        log::error!("TSG {} generated a mmu fault", self.tsgid);
        self.set_error_notifier(ErrorNotifier::FifoErrorMmuErrFlt.raw());
    }

    /// Set the accumulated ctxsw timeout of every member
    pub fn set_ctxsw_timeout_accumulated_ms(&self, ms: u32) {
        for ch in self.ch_list.read().iter() {
            if let Some(ch) = ch.get() {
                ch.set_ctxsw_timeout_accumulated_ms(ms);
            }
        }
    }

    /// Whether any member wants a debug dump on timeout
    pub fn ctxsw_timeout_debug_dump_state(&self) -> bool {
        self.ch_list
            .read()
            .iter()
            .any(|ch| ch.get().is_some_and(|ch| ch.ctxsw_timeout_debug_dump()))
    }

    /// Clear faulted engine and PBDMA bits on every member
    pub fn reset_faulted_eng_pbdma(&self, eng: bool, pbdma: bool) {
        log::info!("tsg {}: reset faulted eng and pbdma bits", self.tsgid);
        let hw = &self.hal().channel;
        for ch in self.ch_list.read().iter() {
            hw.reset_faulted(ch, eng, pbdma);
        }
    }

    // ===== Ctxsw timeout =====

    /// Account one ctxsw timeout period against the TSG
    ///
    /// Any member whose GPFIFO moved resets the clock of every member.
    /// Recovery is requested when a member exceeded its limit without
    /// progress. When neither happens the per-channel counters have
    /// already been advanced and nothing else changes.
    pub fn check_ctxsw_timeout(&self) -> CtxswTimeoutStatus {
        let config = self.config();
        let period = config.ctxsw_timeout_period_ms;
        let hw = &*self.hal().channel;

        let mut status = CtxswTimeoutStatus {
            recover: false,
            debug_dump: false,
            ms: period,
        };

        let list = self.ch_list.read();
        let mut progress_on = None;

        for ch in list.iter() {
            let Some(ch) = ch.get() else {
                continue;
            };
            let (recover, progress) =
                ch.update_and_check_ctxsw_timeout(hw, period, config.timeouts_enabled);
            if recover {
                status.recover = true;
                status.ms = ch.ctxsw_timeout_accumulated_ms();
                break;
            }
            if progress {
                progress_on = Some(ch.chid());
                break;
            }
        }

        if status.recover {
            status.debug_dump = list
                .iter()
                .any(|ch| ch.get().is_some_and(|ch| ch.ctxsw_timeout_debug_dump()));
        } else if let Some(chid) = progress_on {
            log::info!("progress on tsg={} ch={}", self.tsgid, chid);
            for ch in list.iter() {
                if let Some(ch) = ch.get() {
                    ch.set_ctxsw_timeout_accumulated_ms(period);
                }
            }
        }

        status
    }

    // ===== Scheduling parameters =====

    /// Set the runlist interleave level
    pub fn set_interleave(&self, level: u32) -> Result<()> {
        log::debug!("tsgid={} interleave={}", self.tsgid, level);

        let level = InterleaveLevel::from_raw(level)?;

        self.hal().engine.set_interleave(self, level).map_err(|e| {
            log::error!("set interleave failed tsgid={}: {}", self.tsgid, e);
            e
        })?;

        self.state.lock().interleave = level;
        self.reload_if_bound()
    }

    /// Set the timeslice within the regular bounds
    pub fn set_timeslice(&self, timeslice_us: u32) -> Result<()> {
        let max = self.config().timeslice_max_us;
        self.apply_timeslice(timeslice_us, max)
    }

    /// Set the timeslice within the debug bounds
    pub fn set_long_timeslice(&self, timeslice_us: u32) -> Result<()> {
        let max = self.config().dbg_timeslice_max_us;
        self.apply_timeslice(timeslice_us, max)
    }

    fn apply_timeslice(&self, timeslice_us: u32, max_us: u32) -> Result<()> {
        log::debug!("tsgid={} timeslice={} us", self.tsgid, timeslice_us);

        if timeslice_us < self.config().timeslice_min_us || timeslice_us > max_us {
            return Err(Error::InvalidArgument);
        }

        self.state.lock().timeslice_us = timeslice_us;
        self.reload_if_bound()
    }

    /// Current timeslice
    pub fn get_timeslice(&self) -> u32 {
        self.state.lock().timeslice_us
    }

    /// Timeslice new TSGs start with
    pub fn default_timeslice_us(&self) -> u32 {
        self.hal().engine.default_timeslice_us(self.config())
    }

    fn reload_if_bound(&self) -> Result<()> {
        let (runlist, domain) = {
            let state = self.state.lock();
            (state.runlist, state.rl_domain.clone())
        };

        // not bound yet; picked up when the first channel arrives
        match (runlist, domain) {
            (Some(runlist), Some(domain)) => self.hal().runlist.reload(runlist, &domain, true, true),
            _ => Ok(()),
        }
    }

    // ===== SM error states =====

    /// Allocate one error-state slot per SM
    pub fn alloc_sm_error_states(&self, num_sm: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.sm_error_states.is_some() {
            return Err(Error::InvalidState);
        }
        state.sm_error_states = Some(vec![SmErrorState::default(); num_sm as usize]);
        Ok(())
    }

    /// Latch the error state of one SM
    pub fn store_sm_error_state(&self, sm_id: u32, err: &SmErrorState) -> Result<()> {
        if sm_id >= self.hal().gr.num_sm() {
            log::error!("tsg {}: invalid sm id {}", self.tsgid, sm_id);
            return Err(Error::InvalidArgument);
        }

        let mut state = self.state.lock();
        let Some(slot) = state
            .sm_error_states
            .as_mut()
            .and_then(|s| s.get_mut(sm_id as usize))
        else {
            log::error!("tsg {}: invalid memory", self.tsgid);
            return Err(Error::OutOfMemory);
        };
        *slot = *err;
        Ok(())
    }

    /// Latched error state of one SM
    pub fn get_sm_error_state(&self, sm_id: u32) -> Option<SmErrorState> {
        if sm_id >= self.hal().gr.num_sm() {
            log::error!("tsg {}: invalid sm id {}", self.tsgid, sm_id);
            return None;
        }

        self.state
            .lock()
            .sm_error_states
            .as_ref()
            .and_then(|s| s.get(sm_id as usize))
            .copied()
    }

    /// SM exceptions masked from reporting
    pub fn sm_exception_mask(&self) -> u32 {
        *self.sm_exception_mask.lock()
    }

    /// Mask SM exceptions from reporting
    pub fn set_sm_exception_mask(&self, mask: u32) {
        *self.sm_exception_mask.lock() = mask;
    }

    // ===== Profiler =====

    /// Attach a profiler to the TSG context
    pub fn bind_profiler(&self, prof: Arc<dyn ProfilerBinding>) -> Result<()> {
        let _ctx = self.ctx_init_lock();
        let mut state = self.state.lock();
        if state.profiler.is_some() {
            return Err(Error::InvalidState);
        }
        state.profiler = Some(prof);
        Ok(())
    }

    /// Detach the profiler without notifying it
    pub fn unbind_profiler(&self) -> Option<Arc<dyn ProfilerBinding>> {
        let _ctx = self.ctx_init_lock();
        self.state.lock().profiler.take()
    }

    // ===== MMU debug mode =====

    /// Count one MMU debug-mode request for member `ch`
    ///
    /// Hardware is touched only when the TSG or device count moves
    /// between zero and non-zero.
    pub fn set_mmu_debug_mode(&self, ch: &Channel, enable: bool) -> Result<()> {
        if ch.tsgid() != self.tsgid {
            return Err(Error::InvalidState);
        }
        self.apply_mmu_debug_mode(ch, enable)
    }

    fn apply_mmu_debug_mode(&self, ch: &Channel, enable: bool) -> Result<()> {
        let Some(mmu) = self.hal().mmu_debug.as_ref() else {
            return Err(Error::NotSupported);
        };

        let mut fb_refcnt = self.ctx.mmu_debug_lock();

        let step = |v: u32| if enable { v.checked_add(1) } else { v.checked_sub(1) };
        let tsg_old = self.mmu_debug_mode_refcnt();
        let (Some(ch_new), Some(tsg_new), Some(fb_new)) =
            (step(ch.mmu_debug_mode_refcnt()), step(tsg_old), step(*fb_refcnt))
        else {
            log::warn!("ch {}: unbalanced mmu debug mode request", ch.chid());
            return Err(Error::InvalidState);
        };

        if (tsg_old == 0) != (tsg_new == 0) {
            mmu.set_gr_mmu_debug_mode(ch, tsg_new > 0).map_err(|e| {
                log::error!("set mmu debug mode failed: {}", e);
                e
            })?;
        }

        if (*fb_refcnt == 0) != (fb_new == 0) {
            mmu.set_fb_mmu_debug_mode(fb_new > 0);
        }

        ch.set_mmu_debug_mode_refcnt(ch_new);
        self.mmu_debug_mode_refcnt.store(tsg_new, Ordering::Release);
        *fb_refcnt = fb_new;

        Ok(())
    }

    fn unwind_mmu_debug_mode(&self, ch: &Channel) {
        while ch.mmu_debug_mode_refcnt() > 0 {
            if let Err(e) = self.apply_mmu_debug_mode(ch, false) {
                log::error!("disable mmu debug mode failed ch:{}: {}", ch.chid(), e);
                break;
            }
        }
    }
}

impl fmt::Debug for Tsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tsg")
            .field("tsgid", &self.tsgid)
            .field("refcount", &self.refcount())
            .field("channels", &self.channel_count())
            .field("active", &self.num_active_channels())
            .field("runlist", &self.runlist())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
