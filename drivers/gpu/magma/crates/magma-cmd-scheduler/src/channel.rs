//! # GPU Channel
//!
//! The scheduler's view of a hardware channel: its TSG binding, fault
//! state, context-switch timeout bookkeeping and its channel sync.

use alloc::sync::{Arc, Weak};
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use magma_cmd_fence::{ChannelSync, CompletionSink, PrivCmdQueue, SyncBackends, SyncParams};
use magma_core::config::DEFAULT_POLL_TIMEOUT_MS;
use magma_core::{ChannelId, ErrorNotifier, Result, RunlistId, TsgId, DEFAULT_SUBCTX_ID};
use spin::Mutex;
use static_assertions::assert_impl_all;

use crate::hal::ChannelOps;

// =============================================================================
// CHANNEL PARAMS
// =============================================================================

/// Channel creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ChannelParams {
    /// Hardware channel id
    pub chid: ChannelId,
    /// Runlist serving the channel's engine
    pub runlist: RunlistId,
    /// Sub-context (VEID)
    pub subctx_id: u32,
    /// Work is submitted directly from userspace
    pub usermode_submit: bool,
    /// Sync uses a client-managed syncpoint
    pub user_sync: bool,
    /// Device name, prefix of the sync's syncpoint name
    pub dev_name: &'static str,
    /// Address space id
    pub asid: Option<u32>,
    /// Ctxsw timeout a channel may accumulate without progress
    pub ctxsw_timeout_max_ms: u32,
}

impl ChannelParams {
    /// Kernel-submit channel on `runlist` in the default sub-context
    pub fn new(chid: ChannelId, runlist: RunlistId) -> Self {
        Self {
            chid,
            runlist,
            subctx_id: DEFAULT_SUBCTX_ID,
            usermode_submit: false,
            user_sync: false,
            dev_name: "gpu",
            asid: None,
            ctxsw_timeout_max_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct CtxswTimeout {
    accumulated_ms: u32,
    gp_get: u32,
    max_ms: u32,
    debug_dump: bool,
}

/// A hardware command submission queue
pub struct Channel {
    params: ChannelParams,
    tsgid: AtomicU32,
    refs: AtomicU32,
    dying: AtomicBool,
    unserviceable: AtomicBool,
    in_runlist: AtomicBool,
    runqueue_sel: AtomicU32,
    mmu_debug_mode_refcnt: AtomicU32,
    timeout: Mutex<CtxswTimeout>,
    error_notifier: Mutex<Option<ErrorNotifier>>,
    /// Bumped on every wakeup of notifier or semaphore waiters
    wq_generation: AtomicU32,
    updates: AtomicU32,
    sync: Mutex<Option<Arc<ChannelSync>>>,
}

assert_impl_all!(Channel: Send, Sync);

impl Channel {
    /// Create an unbound channel
    pub fn new(params: ChannelParams) -> Arc<Self> {
        Arc::new(Self {
            params,
            tsgid: AtomicU32::new(TsgId::INVALID.raw()),
            refs: AtomicU32::new(0),
            dying: AtomicBool::new(false),
            unserviceable: AtomicBool::new(false),
            in_runlist: AtomicBool::new(false),
            runqueue_sel: AtomicU32::new(0),
            mmu_debug_mode_refcnt: AtomicU32::new(0),
            timeout: Mutex::new(CtxswTimeout {
                accumulated_ms: 0,
                gp_get: 0,
                max_ms: params.ctxsw_timeout_max_ms,
                debug_dump: true,
            }),
            error_notifier: Mutex::new(None),
            wq_generation: AtomicU32::new(0),
            updates: AtomicU32::new(0),
            sync: Mutex::new(None),
        })
    }

    /// Channel id
    pub fn chid(&self) -> ChannelId {
        self.params.chid
    }

    /// Runlist of the channel's engine
    pub fn runlist(&self) -> RunlistId {
        self.params.runlist
    }

    /// Sub-context id
    pub fn subctx_id(&self) -> u32 {
        self.params.subctx_id
    }

    /// Whether userspace submits directly
    pub fn is_usermode_submit(&self) -> bool {
        self.params.usermode_submit
    }

    // ===== References =====

    /// Take a reference, unless the channel is being freed
    pub fn get(&self) -> Option<ChannelRef<'_>> {
        self.acquire().then(|| ChannelRef { ch: self })
    }

    fn acquire(&self) -> bool {
        if self.dying.load(Ordering::Acquire) {
            return false;
        }
        self.refs.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn release(&self) {
        if self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
            .is_err()
        {
            log::warn!("ch {}: put without reference", self.chid());
        }
    }

    /// Outstanding references
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Start freeing the channel
    ///
    /// No new references can be taken and the sync is dropped.
    pub fn close(&self) {
        self.dying.store(true, Ordering::Release);
        self.destroy_sync(true);
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    // ===== TSG binding =====

    /// TSG the channel is bound to, [`TsgId::INVALID`] when unbound
    pub fn tsgid(&self) -> TsgId {
        TsgId::new(self.tsgid.load(Ordering::Acquire))
    }

    /// Whether the channel is bound to a TSG
    pub fn is_bound(&self) -> bool {
        self.tsgid().is_valid()
    }

    /// Stamp an unbound channel with `tsgid`; `false` if already bound
    pub(crate) fn claim(&self, tsgid: TsgId) -> bool {
        self.tsgid
            .compare_exchange(
                TsgId::INVALID.raw(),
                tsgid.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn clear_tsgid(&self) {
        self.tsgid.store(TsgId::INVALID.raw(), Ordering::Release);
    }

    /// Run-queue selector used by the engine
    pub fn runqueue_sel(&self) -> u32 {
        self.runqueue_sel.load(Ordering::Relaxed)
    }

    pub(crate) fn route_subctx(&self) {
        if self.subctx_id() > DEFAULT_SUBCTX_ID {
            self.runqueue_sel.store(1, Ordering::Relaxed);
        }
    }

    /// Whether the channel has an entry in its runlist
    pub fn is_in_runlist(&self) -> bool {
        self.in_runlist.load(Ordering::Acquire)
    }

    /// Record runlist membership; returns whether it changed
    pub(crate) fn set_in_runlist(&self, add: bool) -> bool {
        self.in_runlist.swap(add, Ordering::AcqRel) != add
    }

    // ===== Fault state =====

    /// Mark the channel faulted; pending work fails fast
    pub fn set_unserviceable(&self) {
        self.unserviceable.store(true, Ordering::Release);
    }

    pub(crate) fn set_serviceable(&self) {
        self.unserviceable.store(false, Ordering::Release);
    }

    /// Whether the channel is faulted or timed out
    pub fn is_unserviceable(&self) -> bool {
        self.unserviceable.load(Ordering::Acquire)
    }

    /// Fault the channel and wake its waiters
    ///
    /// Returns whether a debug dump was requested for it.
    pub fn mark_error(&self) -> bool {
        let verbose = self.ctxsw_timeout_debug_dump();
        self.set_unserviceable();
        self.wakeup_waiters();
        verbose
    }

    /// Wake threads blocked on the channel's notifier or semaphore
    pub fn wakeup_waiters(&self) {
        self.wq_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of wakeups so far
    pub fn wakeup_count(&self) -> u32 {
        self.wq_generation.load(Ordering::Acquire)
    }

    /// Record the error reported to userspace
    pub fn set_error_notifier(&self, notifier: ErrorNotifier) {
        log::debug!("ch {}: error notifier {:?}", self.chid(), notifier);
        *self.error_notifier.lock() = Some(notifier);
    }

    /// Last error reported
    pub fn error_notifier(&self) -> Option<ErrorNotifier> {
        *self.error_notifier.lock()
    }

    /// Clean up after an abort: stale fences must not hang
    pub fn abort_clean_up(&self) {
        if !self.params.user_sync {
            return;
        }
        if let Some(sync) = self.sync() {
            sync.set_safe_state();
        }
    }

    // ===== Ctxsw timeout =====

    /// Timeout accumulated without progress
    pub fn ctxsw_timeout_accumulated_ms(&self) -> u32 {
        self.timeout.lock().accumulated_ms
    }

    pub(crate) fn set_ctxsw_timeout_accumulated_ms(&self, ms: u32) {
        self.timeout.lock().accumulated_ms = ms;
    }

    /// Whether a timeout on this channel dumps debug state
    pub fn ctxsw_timeout_debug_dump(&self) -> bool {
        self.timeout.lock().debug_dump
    }

    /// Enable or disable the debug dump on timeout
    pub fn set_ctxsw_timeout_debug_dump(&self, dump: bool) {
        self.timeout.lock().debug_dump = dump;
    }

    /// Account one ctxsw timeout period
    ///
    /// Returns `(recover, progress)`. Progress means the GPFIFO get
    /// pointer moved since the last check.
    pub(crate) fn update_and_check_ctxsw_timeout(
        &self,
        hw: &dyn ChannelOps,
        delta_ms: u32,
        timeouts_enabled: bool,
    ) -> (bool, bool) {
        let mut t = self.timeout.lock();
        let mut progress = false;

        if self.params.usermode_submit {
            t.accumulated_ms = t.accumulated_ms.saturating_add(delta_ms);
        } else {
            let gp_get = hw.read_gp_get(self);
            if gp_get == t.gp_get {
                t.accumulated_ms = t.accumulated_ms.saturating_add(delta_ms);
            } else {
                t.accumulated_ms = delta_ms;
                progress = true;
            }
            t.gp_get = gp_get;
        }

        (timeouts_enabled && t.accumulated_ms > t.max_ms, progress)
    }

    // ===== MMU debug =====

    /// MMU debug-mode requests held by this channel
    pub fn mmu_debug_mode_refcnt(&self) -> u32 {
        self.mmu_debug_mode_refcnt.load(Ordering::Acquire)
    }

    pub(crate) fn set_mmu_debug_mode_refcnt(&self, cnt: u32) {
        self.mmu_debug_mode_refcnt.store(cnt, Ordering::Release);
    }

    // ===== Sync =====

    /// The channel's sync, if created
    pub fn sync(&self) -> Option<Arc<ChannelSync>> {
        self.sync.lock().clone()
    }

    /// The channel's sync, created on first use
    pub fn sync_or_create(
        self: &Arc<Self>,
        backends: &SyncBackends,
        cmdbuf: Arc<PrivCmdQueue>,
    ) -> Result<Arc<ChannelSync>> {
        let mut slot = self.sync.lock();
        if let Some(sync) = slot.as_ref() {
            return Ok(Arc::clone(sync));
        }

        let params = SyncParams {
            chid: self.chid(),
            dev_name: self.params.dev_name,
            user_managed: self.params.user_sync,
            asid: self.params.asid,
        };
        let weak = Arc::downgrade(self);
        let sink: Weak<dyn CompletionSink> = weak;
        let sync = ChannelSync::create(&params, backends, cmdbuf, sink).map_err(|e| {
            log::error!("ch {}: failed to create sync: {}", self.chid(), e);
            e
        })?;

        *slot = Some(Arc::clone(&sync));
        Ok(sync)
    }

    /// Drop the channel's sync
    ///
    /// Fences still in flight keep the primitive allocated.
    pub fn destroy_sync(&self, set_safe_state: bool) {
        let sync = self.sync.lock().take();
        if let Some(sync) = sync {
            sync.destroy(set_safe_state);
        }
    }

    /// Completion passes run so far
    pub fn update_count(&self) -> u32 {
        self.updates.load(Ordering::Acquire)
    }
}

impl CompletionSink for Channel {
    fn chid(&self) -> ChannelId {
        self.params.chid
    }

    fn try_get(&self) -> bool {
        self.acquire()
    }

    fn put(&self) {
        self.release();
    }

    fn update(&self) {
        self.updates.fetch_add(1, Ordering::AcqRel);
        self.wakeup_waiters();
    }

    fn wake_semaphore_waiters(&self) {
        self.wakeup_waiters();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("chid", &self.chid())
            .field("tsgid", &self.tsgid())
            .field("runlist", &self.runlist())
            .field("unserviceable", &self.is_unserviceable())
            .field("refs", &self.refs())
            .finish()
    }
}

// =============================================================================
// CHANNEL REFERENCE
// =============================================================================

/// Scoped channel reference
#[derive(Debug)]
pub struct ChannelRef<'a> {
    ch: &'a Channel,
}

impl Deref for ChannelRef<'_> {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        self.ch
    }
}

impl Drop for ChannelRef<'_> {
    fn drop(&mut self) {
        self.ch.release();
    }
}

// =============================================================================
// TESTS
// =============================================================================
