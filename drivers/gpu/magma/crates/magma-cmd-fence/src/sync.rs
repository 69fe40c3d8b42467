//! # Channel Sync
//!
//! Per-channel generator of wait and increment commands. One `ChannelSync`
//! is bound to exactly one channel and is backed by exactly one primitive,
//! chosen at creation:
//!
//! ```text
//!                  ┌──────────────────────────┐
//!                  │       ChannelSync        │
//!                  │ wait_by_fd / increment / │
//!                  │ mark_progress / reset    │
//!                  └────────────┬─────────────┘
//!                ┌──────────────┴──────────────┐
//!        syncpoints present            no syncpoints
//!   ┌────────────▼───────────┐   ┌─────────────▼────────────┐
//!   │ Syncpoint              │   │ Semaphore                │
//!   │ id + max threshold     │   │ HwSemaphore + timeline   │
//!   └────────────────────────┘   └──────────────────────────┘
//! ```
//!
//! Increments on one sync are issued only from the channel's submission
//! path, so the threshold counter has a single writer. The completion
//! path only reads it.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use cfg_if::cfg_if;
use magma_core::{ChannelId, Error, GpuAddr, Result, SyncpointId};
use static_assertions::assert_impl_all;

use crate::cmdbuf::{PrivCmdEntry, PrivCmdQueue};
use crate::encoder::SyncCmdEncoder;
use crate::fence::Fence;
use crate::os_fence::{CompletionPoint, FenceFd, OsFence, OsFenceOps};
use crate::semaphore::{HwSemaphore, SemaphorePool};
use crate::syncpt::SyncpointOps;

// =============================================================================
// CAPABILITIES
// =============================================================================

bitflags! {
    /// Operations a channel sync supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncCaps: u32 {
        /// Wait on a raw syncpoint id/threshold
        const WAIT_SYNCPT = 1 << 0;
        /// Wait on an imported fence fd
        const WAIT_FD = 1 << 1;
        /// Emit increments
        const INCR = 1 << 2;
        /// Emit increments returned to userspace
        const INCR_USER = 1 << 3;
        /// Advance the threshold without a command
        const MARK_PROGRESS = 1 << 4;
        /// Snap the threshold to the hardware value
        const RESET = 1 << 5;
        /// Exposes a syncpoint id and address
        const SYNCPT_ID = 1 << 6;
        /// Can export OS fences
        const OS_FENCE = 1 << 7;
    }
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Channel-side hooks the sync calls back into
///
/// Held weakly: the channel owns its sync, never the other way round.
pub trait CompletionSink: Send + Sync {
    /// Channel id
    fn chid(&self) -> ChannelId;

    /// Take a channel reference; `false` once the channel is being freed
    fn try_get(&self) -> bool;

    /// Drop a reference taken with [`try_get`](Self::try_get)
    fn put(&self);

    /// Run completion processing for finished jobs
    fn update(&self);

    /// Wake threads blocked on the channel's semaphore
    fn wake_semaphore_waiters(&self);
}

/// Backends available on this device
#[derive(Clone)]
pub struct SyncBackends {
    /// Syncpoint unit, if the platform has one
    pub syncpt: Option<Arc<dyn SyncpointOps>>,
    /// Semaphore pool of the channel's address space
    pub sema_pool: Option<Arc<SemaphorePool>>,
    /// OS fence framework
    pub os_fence: Option<Arc<dyn OsFenceOps>>,
    /// Command encoder of the chip
    pub encoder: Arc<dyn SyncCmdEncoder>,
}

impl SyncBackends {
    /// Whether syncs will be syncpoint backed
    pub fn has_syncpoints(&self) -> bool {
        self.syncpt.is_some()
    }

    /// Whether userspace fences need the OS fence framework
    ///
    /// Semaphore fences have no id userspace can wait on directly.
    pub fn needs_sync_framework(&self) -> bool {
        !self.has_syncpoints()
    }
}

impl fmt::Debug for SyncBackends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncBackends")
            .field("syncpt", &self.syncpt.is_some())
            .field("sema_pool", &self.sema_pool)
            .field("os_fence", &self.os_fence.is_some())
            .field("encoder", &self.encoder.name())
            .finish()
    }
}

/// Creation parameters
#[derive(Debug, Clone, Copy)]
pub struct SyncParams {
    /// Owning channel
    pub chid: ChannelId,
    /// Device name, prefix of the syncpoint name
    pub dev_name: &'static str,
    /// Allocate a client-managed syncpoint (user syncpoint)
    pub user_managed: bool,
    /// Address space id, used to name the semaphore timeline
    pub asid: Option<u32>,
}

// =============================================================================
// COMMAND OUTPUTS
// =============================================================================

/// Wait commands generated for an imported fence
#[derive(Debug)]
pub struct WaitCmd {
    /// Command words, one wait slot per completion point
    pub entry: PrivCmdEntry,
    /// Number of wait slots
    pub num_waits: u32,
}

/// Increment command plus the fence it will signal
#[derive(Debug)]
pub struct IncrCmd {
    /// Command words
    pub entry: PrivCmdEntry,
    /// Completion handle
    pub fence: Fence,
}

// =============================================================================
// BACKENDS
// =============================================================================

struct SyncptBackend {
    host: Arc<dyn SyncpointOps>,
    id: SyncpointId,
    /// Highest value this channel has asked the hardware to reach
    max_thresh: AtomicU32,
    gpu_va: GpuAddr,
    ro_map_va: GpuAddr,
}

#[cfg(feature = "semaphore")]
struct SemaBackend {
    hw_sema: Arc<HwSemaphore>,
    has_timeline: bool,
}

enum Backend {
    Syncpt(SyncptBackend),
    #[cfg(feature = "semaphore")]
    Sema(SemaBackend),
}

// =============================================================================
// CHANNEL SYNC
// =============================================================================

/// Syncpoint- or semaphore-backed command generator of one channel
pub struct ChannelSync {
    chid: ChannelId,
    sink: Weak<dyn CompletionSink>,
    cmdbuf: Arc<PrivCmdQueue>,
    encoder: Arc<dyn SyncCmdEncoder>,
    os_fence: Option<Arc<dyn OsFenceOps>>,
    backend: Backend,
}

assert_impl_all!(ChannelSync: Send, Sync);
assert_impl_all!(Fence: Send, Sync);

impl ChannelSync {
    /// Create the sync of a channel
    ///
    /// Syncpoint backed when the platform has syncpoints, otherwise
    /// semaphore backed if built with the `semaphore` feature.
    pub fn create(
        params: &SyncParams,
        backends: &SyncBackends,
        cmdbuf: Arc<PrivCmdQueue>,
        sink: Weak<dyn CompletionSink>,
    ) -> Result<Arc<Self>> {
        let backend = match &backends.syncpt {
            Some(host) => Self::syncpt_backend(params, host)?,
            None => Self::sema_backend(params, backends)?,
        };

        Ok(Arc::new(Self {
            chid: params.chid,
            sink,
            cmdbuf,
            encoder: Arc::clone(&backends.encoder),
            os_fence: backends.os_fence.clone(),
            backend,
        }))
    }

    fn syncpt_backend(params: &SyncParams, host: &Arc<dyn SyncpointOps>) -> Result<Backend> {
        let id = if params.user_managed {
            let name = format!("{}_{}_user", params.dev_name, params.chid);
            host.alloc_client_managed(&name)
        } else {
            let name = format!("{}_{}", params.dev_name, params.chid);
            host.alloc_host_managed(params.chid, &name)
        };

        let Some(id) = id.filter(|id| id.is_valid()) else {
            log::error!("ch {}: failed to get free syncpt", params.chid);
            return Err(Error::ResourceExhausted);
        };

        let current = match host.read(id) {
            Ok(v) => v,
            Err(e) => {
                log::error!("ch {}: cannot read syncpt {}: {}", params.chid, id, e);
                host.release(id);
                return Err(e);
            }
        };

        log::debug!("ch {}: syncpt {} max={}", params.chid, id, current);

        Ok(Backend::Syncpt(SyncptBackend {
            host: Arc::clone(host),
            id,
            max_thresh: AtomicU32::new(current),
            gpu_va: host.gpu_va(id),
            ro_map_va: host.ro_map_gpu_va(),
        }))
    }

    cfg_if! {
        if #[cfg(feature = "semaphore")] {
            fn sema_backend(params: &SyncParams, backends: &SyncBackends) -> Result<Backend> {
                let Some(pool) = &backends.sema_pool else {
                    log::error!("ch {}: no semaphore pool", params.chid);
                    return Err(Error::NotSupported);
                };

                let hw_sema = pool.alloc()?;

                let has_timeline = match &backends.os_fence {
                    Some(os) => {
                        let asid = params.asid.map_or(-1, i64::from);
                        let name = format!("{}_ch{}_as{}", params.dev_name, params.chid, asid);
                        // hw_sema drops (and frees its slot) on the error path
                        os.init_timeline(params.chid, &name)?;
                        true
                    }
                    None => false,
                };

                log::debug!("ch {}: hw sema slot {}", params.chid, hw_sema.slot());

                Ok(Backend::Sema(SemaBackend {
                    hw_sema,
                    has_timeline,
                }))
            }
        } else {
            fn sema_backend(params: &SyncParams, _backends: &SyncBackends) -> Result<Backend> {
                log::error!("ch {}: no syncpoints and no semaphore support", params.chid);
                Err(Error::NotSupported)
            }
        }
    }

    /// Owning channel
    pub fn chid(&self) -> ChannelId {
        self.chid
    }

    /// Supported operations
    pub fn caps(&self) -> SyncCaps {
        let mut caps = SyncCaps::WAIT_FD
            | SyncCaps::INCR
            | SyncCaps::INCR_USER
            | SyncCaps::MARK_PROGRESS
            | SyncCaps::RESET;

        if matches!(self.backend, Backend::Syncpt(_)) {
            caps |= SyncCaps::WAIT_SYNCPT | SyncCaps::SYNCPT_ID;
        }
        if self.os_fence.is_some() {
            caps |= SyncCaps::OS_FENCE;
        }
        caps
    }

    /// Last value handed out to an increment
    pub fn threshold(&self) -> u32 {
        match &self.backend {
            Backend::Syncpt(sp) => sp.max_thresh.load(Ordering::Acquire),
            #[cfg(feature = "semaphore")]
            Backend::Sema(s) => s.hw_sema.next_value(),
        }
    }

    /// Syncpoint id; `None` for semaphore syncs
    pub fn syncpt_id(&self) -> Option<SyncpointId> {
        match &self.backend {
            Backend::Syncpt(sp) => Some(sp.id),
            #[cfg(feature = "semaphore")]
            Backend::Sema(_) => None,
        }
    }

    /// GPU address of the syncpoint shim; `None` for semaphore syncs
    pub fn syncpt_address(&self) -> Option<GpuAddr> {
        match &self.backend {
            Backend::Syncpt(sp) => Some(sp.gpu_va),
            #[cfg(feature = "semaphore")]
            Backend::Sema(_) => None,
        }
    }

    /// Hardware semaphore; `None` for syncpoint syncs
    pub fn hw_semaphore(&self) -> Option<&Arc<HwSemaphore>> {
        match &self.backend {
            Backend::Syncpt(_) => None,
            #[cfg(feature = "semaphore")]
            Backend::Sema(s) => Some(&s.hw_sema),
        }
    }

    fn alloc_cmd(&self, words: u32) -> Result<PrivCmdEntry> {
        self.cmdbuf.alloc(words).map_err(|e| {
            log::error!("ch {}: not enough priv cmd buffer space", self.chid);
            e
        })
    }

    // =========================================================================
    // Waits
    // =========================================================================

    /// Wait for a raw syncpoint threshold
    ///
    /// Returns `None` when the threshold has already been reached.
    pub fn wait_syncpt(&self, id: SyncpointId, thresh: u32) -> Result<Option<PrivCmdEntry>> {
        let sp = match &self.backend {
            Backend::Syncpt(sp) => sp,
            #[cfg(feature = "semaphore")]
            Backend::Sema(_) => {
                log::error!("ch {}: trying to use syncpoint synchronization", self.chid);
                return Err(Error::NotSupported);
            }
        };

        if !sp.host.is_valid(id) {
            return Err(Error::InvalidArgument);
        }

        if sp.host.is_expired(id, thresh) {
            return Ok(None);
        }

        let size = self.encoder.syncpt_wait_cmd_size();
        let mut entry = self.alloc_cmd(size)?;

        log::debug!("ch {}: wait sp {} thresh {} ro va {}", self.chid, id, thresh, sp.ro_map_va);
        self.encoder.add_syncpt_wait_cmd(&mut entry, 0, id, thresh, sp.ro_map_va);
        Ok(Some(entry))
    }

    fn wait_cmd_size(&self) -> u32 {
        match &self.backend {
            Backend::Syncpt(_) => self.encoder.syncpt_wait_cmd_size(),
            #[cfg(feature = "semaphore")]
            Backend::Sema(_) => self.encoder.sema_wait_cmd_size(),
        }
    }

    fn accepts(&self, point: &CompletionPoint) -> bool {
        match (&self.backend, point) {
            (Backend::Syncpt(_), CompletionPoint::Syncpoint { .. }) => true,
            #[cfg(feature = "semaphore")]
            (Backend::Sema(_), CompletionPoint::Semaphore { .. }) => true,
            _ => false,
        }
    }

    /// Wait for every completion point of an imported fence
    ///
    /// `max_wait_cmds == 0` means unbounded. A fence with no points yields
    /// `None`. Points already reached get a zero-filled slot so the slot
    /// count always matches the point count.
    pub fn wait_by_fd(&self, fd: FenceFd, max_wait_cmds: u32) -> Result<Option<WaitCmd>> {
        let Some(os) = &self.os_fence else {
            log::error!("ch {}: wait on fd {} without os fence support", self.chid, fd);
            return Err(Error::NotSupported);
        };

        let points = os.fdget(fd).map_err(|e| {
            log::error!("ch {}: bad fence fd {}: {}", self.chid, fd, e);
            Error::InvalidArgument
        })?;

        let num_waits = points.len() as u32;
        if max_wait_cmds != 0 && num_waits > max_wait_cmds {
            log::error!(
                "ch {}: fence fd {} has {} points, max {}",
                self.chid,
                fd,
                num_waits,
                max_wait_cmds
            );
            return Err(Error::InvalidArgument);
        }

        if num_waits == 0 {
            return Ok(None);
        }

        if let Some(bad) = points.iter().find(|p| !self.accepts(p)) {
            log::error!("ch {}: fence fd {} carries foreign point {:?}", self.chid, fd, bad);
            return Err(Error::InvalidArgument);
        }

        let size = self.wait_cmd_size();
        let mut entry = self.alloc_cmd(size * num_waits)?;

        for (pos, point) in points.iter().enumerate() {
            let off = pos as u32 * size;

            if point.is_expired() {
                entry.zero(off, size);
                continue;
            }

            match point {
                CompletionPoint::Syncpoint { id, thresh, .. } => {
                    let ro_va = match &self.backend {
                        Backend::Syncpt(sp) => sp.ro_map_va,
                        #[cfg(feature = "semaphore")]
                        Backend::Sema(_) => GpuAddr::null(),
                    };
                    self.encoder.add_syncpt_wait_cmd(&mut entry, off, *id, *thresh, ro_va);
                }
                CompletionPoint::Semaphore { sema, value } => {
                    self.encoder
                        .add_sema_cmd(&mut entry, off, sema.gpu_va(), *value, true, false);
                }
            }
        }

        Ok(Some(WaitCmd { entry, num_waits }))
    }

    // =========================================================================
    // Increments
    // =========================================================================

    /// Emit an increment for a kernel-internal job
    ///
    /// No wait-for-idle: the fence is not handed to userspace.
    pub fn increment(self: &Arc<Self>, register_irq: bool, need_user_fence: bool) -> Result<IncrCmd> {
        self.incr(false, register_irq, need_user_fence)
    }

    /// Emit an increment whose fence is returned to userspace
    ///
    /// `wfi` makes the engine idle before the increment so the fence
    /// cannot signal ahead of earlier work.
    pub fn increment_user(
        self: &Arc<Self>,
        wfi: bool,
        need_user_fence: bool,
        register_irq: bool,
    ) -> Result<IncrCmd> {
        self.incr(wfi, register_irq, need_user_fence)
    }

    fn incr(self: &Arc<Self>, wfi: bool, register_irq: bool, need_user_fence: bool) -> Result<IncrCmd> {
        match &self.backend {
            Backend::Syncpt(sp) => self.syncpt_incr(sp, wfi, register_irq, need_user_fence),
            #[cfg(feature = "semaphore")]
            Backend::Sema(s) => self.sema_incr(s, wfi, need_user_fence),
        }
    }

    fn syncpt_incr(
        self: &Arc<Self>,
        sp: &SyncptBackend,
        wfi: bool,
        register_irq: bool,
        need_user_fence: bool,
    ) -> Result<IncrCmd> {
        let mut entry = self.alloc_cmd(self.encoder.syncpt_incr_cmd_size(wfi))?;

        log::debug!("ch {}: incr sp {} gpu va {}", self.chid, sp.id, sp.gpu_va);
        self.encoder.add_syncpt_incr_cmd(&mut entry, wfi, sp.id, sp.gpu_va);

        let step = self.encoder.syncpt_incr_per_release();
        let thresh = sp.max_thresh.fetch_add(step, Ordering::AcqRel).wrapping_add(step);

        let point = CompletionPoint::Syncpoint {
            host: Arc::clone(&sp.host),
            id: sp.id,
            thresh,
        };

        let os_fence = match self.export(need_user_fence, &point) {
            Ok(f) => f,
            Err(e) => {
                sp.max_thresh.fetch_sub(step, Ordering::AcqRel);
                self.cmdbuf.free(entry);
                return Err(e);
            }
        };

        if register_irq {
            self.arm_completion_irq(sp, thresh);
        }

        Ok(IncrCmd {
            entry,
            fence: Fence::new(point, os_fence, Arc::clone(self)),
        })
    }

    #[cfg(feature = "semaphore")]
    fn sema_incr(self: &Arc<Self>, s: &SemaBackend, wfi: bool, need_user_fence: bool) -> Result<IncrCmd> {
        let mut entry = self.alloc_cmd(self.encoder.sema_incr_cmd_size())?;

        let value = s.hw_sema.prepare();
        self.encoder
            .add_sema_cmd(&mut entry, 0, s.hw_sema.gpu_va(), value, false, wfi);

        log::debug!("ch {}: sema release slot {} value {}", self.chid, s.hw_sema.slot(), value);

        let point = CompletionPoint::Semaphore {
            sema: Arc::clone(&s.hw_sema),
            value,
        };

        let os_fence = match self.export(need_user_fence, &point) {
            Ok(f) => f,
            Err(e) => {
                s.hw_sema.unprepare();
                self.cmdbuf.free(entry);
                return Err(e);
            }
        };

        Ok(IncrCmd {
            entry,
            fence: Fence::new(point, os_fence, Arc::clone(self)),
        })
    }

    fn export(
        &self,
        need_user_fence: bool,
        point: &CompletionPoint,
    ) -> Result<Option<(OsFence, Arc<dyn OsFenceOps>)>> {
        if !need_user_fence {
            return Ok(None);
        }

        let Some(os) = &self.os_fence else {
            log::error!("ch {}: user fence requested without os fence support", self.chid);
            return Err(Error::NotSupported);
        };

        let fence = os.create(self.chid, vec![point.clone()]).map_err(|e| {
            log::error!("ch {}: os fence create failed: {}", self.chid, e);
            e
        })?;
        Ok(Some((fence, Arc::clone(os))))
    }

    /// Arm a one-shot completion interrupt at `thresh`
    ///
    /// Holds a channel reference until the interrupt fires.
    fn arm_completion_irq(&self, sp: &SyncptBackend, thresh: u32) {
        let Some(sink) = self.sink.upgrade() else {
            log::warn!("ch {}: channel gone, no completion irq", self.chid);
            return;
        };

        if !sink.try_get() {
            log::warn!("ch {}: channel not referenceable, no completion irq", self.chid);
            return;
        }

        let weak = self.sink.clone();
        let notifier = Box::new(move || {
            if let Some(sink) = weak.upgrade() {
                sink.update();
                sink.put();
            }
        });

        if let Err(e) = sp.host.register_notifier(sp.id, thresh, notifier) {
            sink.put();
            log::warn!("ch {}: failed to set submit complete interrupt: {}", self.chid, e);
        }
    }

    /// Advance the threshold by one increment without emitting a command
    ///
    /// Used when the increment is part of a job the caller encodes itself.
    pub fn mark_progress(&self, register_irq: bool) {
        match &self.backend {
            Backend::Syncpt(sp) => {
                let step = self.encoder.syncpt_incr_per_release();
                let thresh = sp.max_thresh.fetch_add(step, Ordering::AcqRel).wrapping_add(step);
                if register_irq {
                    self.arm_completion_irq(sp, thresh);
                }
            }
            #[cfg(feature = "semaphore")]
            Backend::Sema(s) => {
                // completion is signalled by the shared semaphore interrupt
                s.hw_sema.prepare();
            }
        }
    }

    /// Snap the tracked threshold to the hardware value
    pub fn reset_to_current(&self) -> Result<()> {
        match &self.backend {
            Backend::Syncpt(sp) => {
                let current = sp.host.read(sp.id)?;
                log::debug!(
                    "ch {}: reset sp {} max {} -> {}",
                    self.chid,
                    sp.id,
                    sp.max_thresh.load(Ordering::Acquire),
                    current
                );
                sp.max_thresh.store(current, Ordering::Release);
            }
            #[cfg(feature = "semaphore")]
            Backend::Sema(s) => {
                if s.hw_sema.reset() {
                    if let Some(sink) = self.sink.upgrade() {
                        sink.wake_semaphore_waiters();
                    }
                }
            }
        }
        Ok(())
    }

    /// Put the primitive in a state where stale waiters cannot hang
    pub fn set_safe_state(&self) {
        match &self.backend {
            Backend::Syncpt(sp) => sp.host.set_safe_state(sp.id),
            #[cfg(feature = "semaphore")]
            Backend::Sema(_) => {}
        }
    }

    /// Drop the channel's reference, optionally entering safe state first
    ///
    /// The primitive is released once outstanding fences are gone too.
    pub fn destroy(self: Arc<Self>, set_safe_state: bool) {
        if set_safe_state {
            self.set_safe_state();
        }
        drop(self);
    }
}

impl Drop for ChannelSync {
    fn drop(&mut self) {
        match &self.backend {
            Backend::Syncpt(sp) => {
                let max = sp.max_thresh.load(Ordering::Acquire);
                log::debug!("ch {}: release sp {} at {}", self.chid, sp.id, max);
                sp.host.set_min(sp.id, max);
                sp.host.release(sp.id);
            }
            #[cfg(feature = "semaphore")]
            Backend::Sema(s) => {
                if s.has_timeline {
                    if let Some(os) = &self.os_fence {
                        if os.timeline_exists(self.chid) {
                            os.destroy_timeline(self.chid);
                        }
                    }
                }
                log::debug!("ch {}: release hw sema slot {}", self.chid, s.hw_sema.slot());
            }
        }
    }
}

impl fmt::Debug for ChannelSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ChannelSync");
        d.field("chid", &self.chid);
        match &self.backend {
            Backend::Syncpt(sp) => d.field("syncpt", &sp.id),
            #[cfg(feature = "semaphore")]
            Backend::Sema(s) => d.field("sema_slot", &s.hw_sema.slot()),
        };
        d.field("threshold", &self.threshold()).finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::HostMethodEncoder;
    use crate::soft::{SoftOsFence, SoftSyncpointHost};
    use core::sync::atomic::{AtomicBool, AtomicI32};

    struct TestSink {
        chid: ChannelId,
        refs: AtomicI32,
        updates: AtomicU32,
        wakeups: AtomicU32,
        referenceable: AtomicBool,
    }

    impl TestSink {
        fn new(chid: u32) -> Arc<Self> {
            Arc::new(Self {
                chid: ChannelId::new(chid),
                refs: AtomicI32::new(0),
                updates: AtomicU32::new(0),
                wakeups: AtomicU32::new(0),
                referenceable: AtomicBool::new(true),
            })
        }
    }

    impl CompletionSink for TestSink {
        fn chid(&self) -> ChannelId {
            self.chid
        }
        fn try_get(&self) -> bool {
            if self.referenceable.load(Ordering::SeqCst) {
                self.refs.fetch_add(1, Ordering::SeqCst);
                true
            } else {
                false
            }
        }
        fn put(&self) {
            self.refs.fetch_sub(1, Ordering::SeqCst);
        }
        fn update(&self) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        fn wake_semaphore_waiters(&self) {
            self.wakeups.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Rig {
        host: Arc<SoftSyncpointHost>,
        os: Arc<SoftOsFence>,
        pool: Arc<SemaphorePool>,
        cmdbuf: Arc<PrivCmdQueue>,
        sink: Arc<TestSink>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                host: Arc::new(SoftSyncpointHost::new(8)),
                os: Arc::new(SoftOsFence::new()),
                pool: SemaphorePool::new(GpuAddr::new(0x40_0000), 4),
                cmdbuf: Arc::new(PrivCmdQueue::new(GpuAddr::new(0x80_0000), 256)),
                sink: TestSink::new(3),
            }
        }

        fn backends(&self, syncpt: bool) -> SyncBackends {
            SyncBackends {
                syncpt: syncpt.then(|| Arc::clone(&self.host) as Arc<dyn SyncpointOps>),
                sema_pool: Some(Arc::clone(&self.pool)),
                os_fence: Some(Arc::clone(&self.os) as Arc<dyn OsFenceOps>),
                encoder: Arc::new(HostMethodEncoder::new()),
            }
        }

        fn params(&self) -> SyncParams {
            SyncParams {
                chid: ChannelId::new(3),
                dev_name: "gpu",
                user_managed: false,
                asid: Some(1),
            }
        }

        fn create(&self, syncpt: bool) -> Arc<ChannelSync> {
            let weak = Arc::downgrade(&self.sink);
            let sink: Weak<dyn CompletionSink> = weak;
            ChannelSync::create(&self.params(), &self.backends(syncpt), Arc::clone(&self.cmdbuf), sink).unwrap()
        }
    }

    #[test]
    fn test_create_prefers_syncpoints() {
        let rig = Rig::new();
        rig.host.set_value(SyncpointId::new(1), 40);
        let sync = rig.create(true);

        let id = sync.syncpt_id().unwrap();
        assert_eq!(rig.host.name(id).unwrap(), "gpu_3");
        assert_eq!(sync.threshold(), 40);
        assert!(sync.caps().contains(SyncCaps::WAIT_SYNCPT | SyncCaps::OS_FENCE));
        assert!(sync.hw_semaphore().is_none());
        assert!(!rig.backends(true).needs_sync_framework());
    }

    #[test]
    fn test_create_user_managed_name() {
        let rig = Rig::new();
        let params = SyncParams {
            user_managed: true,
            ..rig.params()
        };
        let weak = Arc::downgrade(&rig.sink);
        let sink: Weak<dyn CompletionSink> = weak;
        let sync = ChannelSync::create(&params, &rig.backends(true), Arc::clone(&rig.cmdbuf), sink).unwrap();
        let id = sync.syncpt_id().unwrap();
        assert_eq!(rig.host.name(id).unwrap(), "gpu_3_user");
        assert!(rig.host.is_client_managed(id));
    }

    #[test]
    fn test_create_fails_without_backends() {
        let rig = Rig::new();
        let backends = SyncBackends {
            syncpt: None,
            sema_pool: None,
            os_fence: None,
            encoder: Arc::new(HostMethodEncoder::new()),
        };
        let weak = Arc::downgrade(&rig.sink);
        let sink: Weak<dyn CompletionSink> = weak;
        let err = ChannelSync::create(&rig.params(), &backends, Arc::clone(&rig.cmdbuf), sink).unwrap_err();
        assert_eq!(err, Error::NotSupported);
    }

    #[test]
    fn test_thresholds_are_monotonic_across_wrap() {
        let rig = Rig::new();
        rig.host.set_value(SyncpointId::new(1), u32::MAX - 4);
        let sync = rig.create(true);

        let mut last = sync.threshold();
        let mut fences = alloc::vec::Vec::new();
        for _ in 0..6 {
            let incr = sync.increment(false, false).unwrap();
            let (_, thresh) = incr.fence.point().as_syncpt().unwrap();
            assert_eq!(thresh, last.wrapping_add(2));
            last = thresh;
            rig.cmdbuf.free(incr.entry);
            fences.push(incr.fence);
        }
        assert_eq!(last, (u32::MAX - 4).wrapping_add(12));
    }

    #[test]
    fn test_user_fence_failure_rolls_back() {
        let rig = Rig::new();
        let sync = rig.create(true);
        let before = sync.threshold();

        rig.os.fail_next_create();
        let err = sync.increment_user(true, true, false).unwrap_err();

        assert_eq!(err, Error::OutOfMemory);
        assert_eq!(sync.threshold(), before);
        assert_eq!(rig.cmdbuf.used(), 0);
    }

    #[test]
    fn test_cmdbuf_full_leaves_threshold() {
        let rig = Rig::new();
        let sync = rig.create(true);
        let _hog = rig.cmdbuf.alloc(rig.cmdbuf.capacity()).unwrap();

        assert_eq!(sync.increment(false, false).unwrap_err(), Error::CommandBufferFull);
        assert_eq!(sync.threshold(), 0);
    }

    #[test]
    fn test_wait_by_fd_round_trip() {
        let rig = Rig::new();
        let producer = rig.create(true);

        let mut fds = alloc::vec::Vec::new();
        let mut fences = alloc::vec::Vec::new();
        for _ in 0..3 {
            let incr = producer.increment_user(true, true, false).unwrap();
            fds.push(incr.fence.install_fd().unwrap());
            fences.push(incr.fence);
        }
        let merged = rig.os.merge(&fds).unwrap();

        let wait = producer.wait_by_fd(merged, 0).unwrap().unwrap();
        assert_eq!(wait.num_waits, 3);
        assert_eq!(wait.entry.size(), 3 * HostMethodEncoder::new().syncpt_wait_cmd_size());

        assert_eq!(producer.wait_by_fd(merged, 2).unwrap_err(), Error::InvalidArgument);
        assert!(producer.wait_by_fd(merged, 3).unwrap().is_some());
    }

    #[test]
    fn test_wait_by_fd_edge_cases() {
        let rig = Rig::new();
        let sync = rig.create(true);

        assert_eq!(sync.wait_by_fd(1234, 0).unwrap_err(), Error::InvalidArgument);

        let empty = rig.os.merge(&[]).unwrap();
        assert!(sync.wait_by_fd(empty, 1).unwrap().is_none());
        assert_eq!(rig.cmdbuf.used(), 0);
    }

    #[test]
    fn test_wait_by_fd_zero_fills_expired() {
        let rig = Rig::new();
        let sync = rig.create(true);
        let id = sync.syncpt_id().unwrap();

        let first = sync.increment_user(false, true, false).unwrap();
        let second = sync.increment_user(false, true, false).unwrap();
        let fd = rig
            .os
            .merge(&[first.fence.install_fd().unwrap(), second.fence.install_fd().unwrap()])
            .unwrap();

        // hardware reaches the first fence only
        rig.host.hw_incr(id, 2);
        assert!(first.fence.is_expired());
        assert!(!second.fence.is_expired());

        let wait = sync.wait_by_fd(fd, 0).unwrap().unwrap();
        let size = HostMethodEncoder::new().syncpt_wait_cmd_size() as usize;
        assert!(wait.entry.words()[..size].iter().all(|w| *w == 0));
        assert!(wait.entry.words()[size..].iter().any(|w| *w != 0));
    }

    #[test]
    fn test_completion_irq_balances_refs() {
        let rig = Rig::new();
        let sync = rig.create(true);
        let id = sync.syncpt_id().unwrap();

        let incr = sync.increment(true, false).unwrap();
        assert_eq!(rig.sink.refs.load(Ordering::SeqCst), 1);
        assert_eq!(rig.host.pending_notifiers(), 1);

        rig.host.hw_incr(id, 2);
        assert!(incr.fence.is_expired());
        assert_eq!(rig.sink.updates.load(Ordering::SeqCst), 1);
        assert_eq!(rig.sink.refs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_irq_for_dying_channel() {
        let rig = Rig::new();
        let sync = rig.create(true);
        rig.sink.referenceable.store(false, Ordering::SeqCst);

        sync.mark_progress(true);
        assert_eq!(rig.host.pending_notifiers(), 0);
        assert_eq!(sync.threshold(), 2);
    }

    #[test]
    fn test_reset_to_current_syncpt() {
        let rig = Rig::new();
        let sync = rig.create(true);
        let id = sync.syncpt_id().unwrap();

        sync.mark_progress(false);
        sync.mark_progress(false);
        rig.host.hw_incr(id, 2);
        sync.reset_to_current().unwrap();
        assert_eq!(sync.threshold(), 2);
    }

    #[test]
    fn test_wait_syncpt() {
        let rig = Rig::new();
        let sync = rig.create(true);
        let id = sync.syncpt_id().unwrap();

        assert_eq!(sync.wait_syncpt(SyncpointId::new(7), 1).unwrap_err(), Error::InvalidArgument);
        assert!(sync.wait_syncpt(id, 0).unwrap().is_none());
        let entry = sync.wait_syncpt(id, 5).unwrap().unwrap();
        assert_eq!(entry.words()[1], 5);
    }

    #[test]
    fn test_drop_releases_syncpt_after_fences() {
        let rig = Rig::new();
        let sync = rig.create(true);
        let id = sync.syncpt_id().unwrap();

        let incr = sync.increment(false, false).unwrap();
        sync.destroy(true);

        // the fence keeps the syncpoint alive
        assert!(rig.host.is_valid(id));
        assert!(rig.host.is_safe(id));

        drop(incr.fence);
        assert!(!rig.host.is_valid(id));
        assert_eq!(rig.host.read(id).unwrap(), 2);
    }

    #[cfg(feature = "semaphore")]
    #[test]
    fn test_semaphore_backend() {
        let rig = Rig::new();
        let sync = rig.create(false);

        assert!(sync.syncpt_id().is_none());
        assert!(sync.syncpt_address().is_none());
        assert!(!sync.caps().contains(SyncCaps::WAIT_SYNCPT));
        assert_eq!(rig.os.timeline_name(ChannelId::new(3)).unwrap(), "gpu_ch3_as1");
        assert_eq!(sync.wait_syncpt(SyncpointId::new(1), 1).unwrap_err(), Error::NotSupported);

        let incr = sync.increment_user(true, true, true).unwrap();
        let sema = Arc::clone(sync.hw_semaphore().unwrap());
        assert!(!incr.fence.is_expired());
        rig.pool.hw_release(sema.slot(), 1);
        assert!(incr.fence.is_expired());
    }

    #[cfg(feature = "semaphore")]
    #[test]
    fn test_semaphore_rollback_and_reset() {
        let rig = Rig::new();
        let sync = rig.create(false);

        rig.os.fail_next_create();
        assert!(sync.increment_user(false, true, false).is_err());
        assert_eq!(sync.threshold(), 0);

        sync.mark_progress(false);
        sync.mark_progress(false);
        assert_eq!(sync.threshold(), 2);

        sync.reset_to_current().unwrap();
        assert_eq!(rig.sink.wakeups.load(Ordering::SeqCst), 1);
        assert_eq!(sync.hw_semaphore().unwrap().read(), 0);
        assert_eq!(sync.threshold(), 0);

        // already in sync with memory
        sync.reset_to_current().unwrap();
        assert_eq!(rig.sink.wakeups.load(Ordering::SeqCst), 1);
    }

    #[cfg(feature = "semaphore")]
    #[test]
    fn test_semaphore_destroy_frees_slot_and_timeline() {
        let rig = Rig::new();
        let sync = rig.create(false);
        assert_eq!(rig.pool.slots_in_use(), 1);

        sync.destroy(true);
        assert_eq!(rig.pool.slots_in_use(), 0);
        assert!(!rig.os.timeline_exists(ChannelId::new(3)));
    }

    #[cfg(feature = "semaphore")]
    #[test]
    fn test_semaphore_rejects_syncpoint_fd() {
        let rig = Rig::new();
        let producer = rig.create(true);
        let incr = producer.increment_user(false, true, false).unwrap();
        let fd = incr.fence.install_fd().unwrap();

        let weak = Arc::downgrade(&rig.sink);
        let sink: Weak<dyn CompletionSink> = weak;
        let params = SyncParams {
            chid: ChannelId::new(4),
            ..rig.params()
        };
        let consumer = ChannelSync::create(&params, &rig.backends(false), Arc::clone(&rig.cmdbuf), sink).unwrap();
        assert_eq!(consumer.wait_by_fd(fd, 0).unwrap_err(), Error::InvalidArgument);
    }
}
