//! Recording HAL implementations for unit tests.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use magma_core::{ChannelId, Error, FifoConfig, InterleaveLevel, Result, RunlistId, TsgId};
use spin::Mutex;

use crate::channel::{Channel, ChannelParams};
use crate::fifo::Fifo;
use crate::hal::{
    ChannelHwState, ChannelOps, EngineOps, FifoHal, GrCtx, GrOps, MmuDebugOps, ProfilerBinding,
    RunlistDomain, RunlistOps,
};
use crate::tsg::Tsg;

fn take(slot: &Mutex<Option<Error>>) -> Result<()> {
    match slot.lock().take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// =============================================================================
// RUNLIST
// =============================================================================

pub(crate) struct MockRunlist {
    max_channels: AtomicU32,
    domains: Mutex<Vec<Arc<RunlistDomain>>>,
    preempt_err: Mutex<Option<Error>>,
    update_err: Mutex<Option<Error>>,
    preempts: AtomicU32,
    reloads: AtomicU32,
    updates: Mutex<Vec<(ChannelId, bool)>>,
}

impl MockRunlist {
    pub(crate) fn new() -> Self {
        let domains = (0..4)
            .map(|rl| Arc::new(RunlistDomain::new(RunlistDomain::DEFAULT_NAME, RunlistId::new(rl))))
            .collect();
        Self {
            max_channels: AtomicU32::new(16),
            domains: Mutex::new(domains),
            preempt_err: Mutex::new(None),
            update_err: Mutex::new(None),
            preempts: AtomicU32::new(0),
            reloads: AtomicU32::new(0),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_max_channels_per_tsg(&self, max: u32) {
        self.max_channels.store(max, Ordering::SeqCst);
    }

    pub(crate) fn add_domain(&self, name: &str, runlist: RunlistId) {
        self.domains.lock().push(Arc::new(RunlistDomain::new(name, runlist)));
    }

    pub(crate) fn remove_domain(&self, runlist: RunlistId, name: &str) {
        self.domains
            .lock()
            .retain(|d| !(d.runlist == runlist && d.name == name));
    }

    pub(crate) fn fail_next_preempt(&self, err: Error) {
        *self.preempt_err.lock() = Some(err);
    }

    pub(crate) fn fail_next_update(&self, err: Error) {
        *self.update_err.lock() = Some(err);
    }

    pub(crate) fn preempts(&self) -> u32 {
        self.preempts.load(Ordering::SeqCst)
    }

    pub(crate) fn reloads(&self) -> u32 {
        self.reloads.load(Ordering::SeqCst)
    }

    pub(crate) fn updates(&self) -> Vec<(ChannelId, bool)> {
        self.updates.lock().clone()
    }
}

impl RunlistOps for MockRunlist {
    fn preempt_tsg(&self, _tsg: &Tsg) -> Result<()> {
        self.preempts.fetch_add(1, Ordering::SeqCst);
        take(&self.preempt_err)
    }

    fn reload(&self, _runlist: RunlistId, _domain: &RunlistDomain, _wait: bool, _flush: bool)
        -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update_channel(&self, _runlist: RunlistId, ch: &Channel, add: bool, _wait: bool)
        -> Result<()> {
        take(&self.update_err)?;
        self.updates.lock().push((ch.chid(), add));
        Ok(())
    }

    fn max_channels_per_tsg(&self) -> u32 {
        self.max_channels.load(Ordering::SeqCst)
    }

    fn domain_lookup(&self, runlist: RunlistId, name: &str) -> Option<Arc<RunlistDomain>> {
        self.domains
            .lock()
            .iter()
            .find(|d| d.runlist == runlist && d.name == name)
            .cloned()
    }
}

// =============================================================================
// ENGINE
// =============================================================================

#[derive(Default)]
pub(crate) struct MockEngine {
    open_err: Mutex<Option<Error>>,
    bind_err: Mutex<Option<Error>>,
    unbind_err: Mutex<Option<Error>>,
    hw_next_err: Mutex<Option<Error>>,
    interleave_err: Mutex<Option<Error>>,
    bind_race: Mutex<Option<TsgId>>,
    tsg_enabled: AtomicBool,
    releases: AtomicU32,
    unbinds: AtomicU32,
    hw_state_checks: AtomicU32,
    method_buffer_binds: AtomicU32,
    recoveries: AtomicU32,
}

impl MockEngine {
    pub(crate) fn fail_next_open(&self, err: Error) {
        *self.open_err.lock() = Some(err);
    }

    pub(crate) fn fail_next_bind(&self, err: Error) {
        *self.bind_err.lock() = Some(err);
    }

    /// Stamp the channel with `tsgid` during the next bind hook, as a
    /// concurrent bind to another TSG would
    pub(crate) fn race_next_bind(&self, tsgid: TsgId) {
        *self.bind_race.lock() = Some(tsgid);
    }

    pub(crate) fn fail_next_unbind(&self, err: Error) {
        *self.unbind_err.lock() = Some(err);
    }

    pub(crate) fn fail_next_hw_next(&self, err: Error) {
        *self.hw_next_err.lock() = Some(err);
    }

    pub(crate) fn fail_next_interleave(&self, err: Error) {
        *self.interleave_err.lock() = Some(err);
    }

    /// State left by the last enable/disable
    pub(crate) fn tsg_enabled(&self) -> bool {
        self.tsg_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn releases(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }

    pub(crate) fn unbinds(&self) -> u32 {
        self.unbinds.load(Ordering::SeqCst)
    }

    pub(crate) fn hw_state_checks(&self) -> u32 {
        self.hw_state_checks.load(Ordering::SeqCst)
    }

    pub(crate) fn method_buffer_binds(&self) -> u32 {
        self.method_buffer_binds.load(Ordering::SeqCst)
    }

    pub(crate) fn recoveries(&self) -> u32 {
        self.recoveries.load(Ordering::SeqCst)
    }
}

impl EngineOps for MockEngine {
    fn open(&self, _tsg: &Tsg) -> Result<()> {
        take(&self.open_err)
    }

    fn release(&self, _tsg: &Tsg) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn bind_channel(&self, _tsg: &Tsg, ch: &Channel) -> Result<()> {
        if let Some(other) = self.bind_race.lock().take() {
            ch.claim(other);
        }
        take(&self.bind_err)
    }

    fn bind_channel_eng_method_buffers(&self, _tsg: &Tsg, _ch: &Channel) {
        self.method_buffer_binds.fetch_add(1, Ordering::SeqCst);
    }

    fn unbind_channel(&self, _tsg: &Tsg, _ch: &Channel) -> Result<()> {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
        take(&self.unbind_err)
    }

    fn unbind_channel_check_hw_state(&self, tsg: &Tsg, ch: &Channel) -> Result<()> {
        self.hw_state_checks.fetch_add(1, Ordering::SeqCst);
        tsg.check_hw_state(ch)
    }

    fn unbind_channel_check_hw_next(&self, _ch: &Channel, _state: &ChannelHwState) -> Result<()> {
        take(&self.hw_next_err)
    }

    fn disable(&self, tsg: &Tsg) {
        self.tsg_enabled.store(false, Ordering::SeqCst);
        tsg.disable_channels();
    }

    fn enable(&self, tsg: &Tsg) {
        self.tsg_enabled.store(true, Ordering::SeqCst);
        tsg.enable_channels();
    }

    fn set_interleave(&self, _tsg: &Tsg, _level: InterleaveLevel) -> Result<()> {
        take(&self.interleave_err)
    }

    fn recover(&self, tsg: &Tsg, _verbose: bool) {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        tsg.abort(true);
    }
}

// =============================================================================
// CHANNEL HW
// =============================================================================

#[derive(Default)]
pub(crate) struct MockChannelHw {
    enabled: Mutex<BTreeMap<u32, bool>>,
    gp_get: Mutex<BTreeMap<u32, u32>>,
    states: Mutex<BTreeMap<u32, ChannelHwState>>,
    cleared: Mutex<Vec<ChannelId>>,
    ctx_reloads: Mutex<Vec<ChannelId>>,
    faults_reset: Mutex<Vec<ChannelId>>,
}

impl MockChannelHw {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_gp_get(&self, chid: ChannelId, value: u32) {
        self.gp_get.lock().insert(chid.raw(), value);
    }

    pub(crate) fn set_state(&self, chid: ChannelId, state: ChannelHwState) {
        self.states.lock().insert(chid.raw(), state);
    }

    pub(crate) fn is_enabled(&self, chid: ChannelId) -> bool {
        self.enabled.lock().get(&chid.raw()).copied().unwrap_or(false)
    }

    pub(crate) fn was_cleared(&self, chid: ChannelId) -> bool {
        self.cleared.lock().contains(&chid)
    }

    pub(crate) fn ctx_reloads(&self) -> Vec<ChannelId> {
        self.ctx_reloads.lock().clone()
    }

    pub(crate) fn faults_reset(&self) -> Vec<ChannelId> {
        self.faults_reset.lock().clone()
    }
}

impl ChannelOps for MockChannelHw {
    fn enable(&self, ch: &Channel) {
        self.enabled.lock().insert(ch.chid().raw(), true);
    }

    fn disable(&self, ch: &Channel) {
        self.enabled.lock().insert(ch.chid().raw(), false);
    }

    fn clear(&self, ch: &Channel) {
        self.cleared.lock().push(ch.chid());
    }

    fn read_state(&self, ch: &Channel) -> ChannelHwState {
        let mut state = self.states.lock().get(&ch.chid().raw()).copied().unwrap_or_default();
        state.enabled = self.is_enabled(ch.chid());
        state
    }

    fn read_gp_get(&self, ch: &Channel) -> u32 {
        self.gp_get.lock().get(&ch.chid().raw()).copied().unwrap_or(0)
    }

    fn force_ctx_reload(&self, ch: &Channel) {
        self.ctx_reloads.lock().push(ch.chid());
    }

    fn reset_faulted(&self, ch: &Channel, _eng: bool, _pbdma: bool) {
        self.faults_reset.lock().push(ch.chid());
    }
}

// =============================================================================
// GR
// =============================================================================

pub(crate) struct MockGr {
    num_sm: AtomicU32,
    next: AtomicU64,
    live: AtomicU32,
}

impl MockGr {
    pub(crate) fn new(num_sm: u32) -> Self {
        Self {
            num_sm: AtomicU32::new(num_sm),
            next: AtomicU64::new(1),
            live: AtomicU32::new(0),
        }
    }

    pub(crate) fn set_num_sm(&self, num_sm: u32) {
        self.num_sm.store(num_sm, Ordering::SeqCst);
    }

    pub(crate) fn num_sm_value(&self) -> u32 {
        self.num_sm.load(Ordering::SeqCst)
    }

    /// Contexts allocated and not yet freed
    pub(crate) fn live(&self) -> u32 {
        self.live.load(Ordering::SeqCst)
    }
}

impl GrOps for MockGr {
    fn num_sm(&self) -> u32 {
        self.num_sm_value()
    }

    fn alloc_gr_ctx(&self, _tsgid: TsgId) -> Result<GrCtx> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(GrCtx(self.next.fetch_add(1, Ordering::SeqCst)))
    }

    fn free_gr_ctx(&self, _ctx: GrCtx) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// MMU DEBUG / PROFILER
// =============================================================================

#[derive(Default)]
pub(crate) struct MockMmuDebug {
    gr_writes: Mutex<Vec<bool>>,
    fb_writes: Mutex<Vec<bool>>,
}

impl MockMmuDebug {
    pub(crate) fn gr_writes(&self) -> Vec<bool> {
        self.gr_writes.lock().clone()
    }

    pub(crate) fn fb_writes(&self) -> Vec<bool> {
        self.fb_writes.lock().clone()
    }
}

impl MmuDebugOps for MockMmuDebug {
    fn set_gr_mmu_debug_mode(&self, _ch: &Channel, enable: bool) -> Result<()> {
        self.gr_writes.lock().push(enable);
        Ok(())
    }

    fn set_fb_mmu_debug_mode(&self, enable: bool) {
        self.fb_writes.lock().push(enable);
    }
}

#[derive(Default)]
pub(crate) struct MockProfiler {
    unbinds: AtomicU32,
}

impl MockProfiler {
    pub(crate) fn unbinds(&self) -> u32 {
        self.unbinds.load(Ordering::SeqCst)
    }
}

impl ProfilerBinding for MockProfiler {
    fn unbind_context(&self, _tsgid: TsgId) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// RIG
// =============================================================================

/// A fifo wired to fresh mocks
pub(crate) struct TestRig {
    pub(crate) runlist: Arc<MockRunlist>,
    pub(crate) engine: Arc<MockEngine>,
    pub(crate) channel_hw: Arc<MockChannelHw>,
    pub(crate) gr: Arc<MockGr>,
    pub(crate) mmu: Arc<MockMmuDebug>,
    pub(crate) fifo: Fifo,
}

impl TestRig {
    pub(crate) fn new(pool: u32) -> Self {
        Self::build(pool, true)
    }

    pub(crate) fn without_mmu_debug(pool: u32) -> Self {
        Self::build(pool, false)
    }

    fn build(pool: u32, mmu_debug: bool) -> Self {
        let runlist = Arc::new(MockRunlist::new());
        let engine = Arc::new(MockEngine::default());
        let channel_hw = Arc::new(MockChannelHw::new());
        let gr = Arc::new(MockGr::new(4));
        let mmu = Arc::new(MockMmuDebug::default());

        let hal = FifoHal {
            runlist: runlist.clone(),
            engine: engine.clone(),
            channel: channel_hw.clone(),
            gr: gr.clone(),
            mmu_debug: if mmu_debug {
                Some(mmu.clone() as Arc<dyn MmuDebugOps>)
            } else {
                None
            },
        };
        let config = FifoConfig {
            name: "test-gpu",
            ..FifoConfig::with_channels(pool)
        };
        let fifo = Fifo::new(config, hal).unwrap();

        Self {
            runlist,
            engine,
            channel_hw,
            gr,
            mmu,
            fifo,
        }
    }

    pub(crate) fn channel(&self, chid: u32, runlist: u32) -> Arc<Channel> {
        self.channel_with(|_| {}, chid, runlist)
    }

    pub(crate) fn channel_with(
        &self,
        tweak: impl FnOnce(&mut ChannelParams),
        chid: u32,
        runlist: u32,
    ) -> Arc<Channel> {
        let mut params = self
            .fifo
            .channel_params(ChannelId::new(chid), RunlistId::new(runlist));
        tweak(&mut params);
        Channel::new(params)
    }
}
