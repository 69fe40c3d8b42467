//! # Software Sync Backends
//!
//! In-memory syncpoint unit and OS fence table. They stand in for the
//! host1x driver and the sync_file framework when running without
//! hardware (unit tests, simulation): counters only move when someone
//! calls [`SoftSyncpointHost::hw_incr`], which plays the GPU's part.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use magma_core::{ChannelId, Error, GpuAddr, Result, SyncpointId};
use spin::Mutex;

use crate::os_fence::{CompletionPoint, FenceFd, OsFence, OsFenceOps};
use crate::syncpt::{threshold_reached, SyncpointOps, SyncptNotifier};

/// Bytes between two syncpoint shim slots
const SYNCPT_SHIM_STRIDE: u64 = 0x1000;

// =============================================================================
// SOFT SYNCPOINT HOST
// =============================================================================

#[derive(Debug, Default)]
struct SoftSyncpt {
    name: String,
    in_use: bool,
    client_managed: bool,
    safe: bool,
    value: u32,
}

struct PendingNotifier {
    id: SyncpointId,
    thresh: u32,
    notifier: SyncptNotifier,
}

#[derive(Default)]
struct HostState {
    syncpts: Vec<SoftSyncpt>,
    pending: Vec<PendingNotifier>,
}

/// Syncpoint unit simulated in memory
pub struct SoftSyncpointHost {
    shim_base: GpuAddr,
    ro_map: GpuAddr,
    state: Mutex<HostState>,
}

impl SoftSyncpointHost {
    /// Create a unit with ids `1..num`; id 0 is never handed out
    pub fn new(num: u32) -> Self {
        Self {
            shim_base: GpuAddr::new(0x1_0000_0000),
            ro_map: GpuAddr::new(0x2_0000_0000),
            state: Mutex::new(HostState {
                syncpts: (0..num).map(|_| SoftSyncpt::default()).collect(),
                pending: Vec::new(),
            }),
        }
    }

    fn alloc(&self, name: &str, client_managed: bool) -> Option<SyncpointId> {
        let mut state = self.state.lock();
        let (idx, sp) = state
            .syncpts
            .iter_mut()
            .enumerate()
            .skip(1)
            .find(|(_, sp)| !sp.in_use)?;

        sp.in_use = true;
        sp.client_managed = client_managed;
        sp.safe = false;
        sp.name = name.to_string();
        Some(SyncpointId::new(idx as u32))
    }

    /// Preset a counter, as if hardware had been running before
    pub fn set_value(&self, id: SyncpointId, value: u32) {
        if let Some(sp) = self.state.lock().syncpts.get_mut(id.index()) {
            sp.value = value;
        }
    }

    /// Increment a counter by `n` and fire every notifier it passes
    pub fn hw_incr(&self, id: SyncpointId, n: u32) {
        let fired = {
            let mut state = self.state.lock();
            let Some(sp) = state.syncpts.get_mut(id.index()) else {
                return;
            };
            sp.value = sp.value.wrapping_add(n);
            let value = sp.value;

            let (fired, pending): (Vec<_>, Vec<_>) = state
                .pending
                .drain(..)
                .partition(|p| p.id == id && threshold_reached(value, p.thresh));
            state.pending = pending;
            fired
        };

        // run outside the lock; notifiers call back into channel code
        for p in fired {
            (p.notifier)();
        }
    }

    /// Name given at allocation
    pub fn name(&self, id: SyncpointId) -> Option<String> {
        let state = self.state.lock();
        state
            .syncpts
            .get(id.index())
            .filter(|sp| sp.in_use)
            .map(|sp| sp.name.clone())
    }

    /// Whether the id was allocated client managed
    pub fn is_client_managed(&self, id: SyncpointId) -> bool {
        let state = self.state.lock();
        state.syncpts.get(id.index()).is_some_and(|sp| sp.client_managed)
    }

    /// Whether the syncpoint was put in safe state
    pub fn is_safe(&self, id: SyncpointId) -> bool {
        let state = self.state.lock();
        state.syncpts.get(id.index()).is_some_and(|sp| sp.safe)
    }

    /// Notifiers armed and not yet fired
    pub fn pending_notifiers(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Allocated ids
    pub fn in_use(&self) -> usize {
        self.state.lock().syncpts.iter().filter(|sp| sp.in_use).count()
    }
}

impl SyncpointOps for SoftSyncpointHost {
    fn alloc_host_managed(&self, _chid: ChannelId, name: &str) -> Option<SyncpointId> {
        self.alloc(name, false)
    }

    fn alloc_client_managed(&self, name: &str) -> Option<SyncpointId> {
        self.alloc(name, true)
    }

    fn release(&self, id: SyncpointId) {
        let mut state = self.state.lock();
        if let Some(sp) = state.syncpts.get_mut(id.index()) {
            sp.in_use = false;
        }
        state.pending.retain(|p| p.id != id);
    }

    fn is_valid(&self, id: SyncpointId) -> bool {
        id.is_valid() && self.state.lock().syncpts.get(id.index()).is_some_and(|sp| sp.in_use)
    }

    fn read(&self, id: SyncpointId) -> Result<u32> {
        let state = self.state.lock();
        state
            .syncpts
            .get(id.index())
            .map(|sp| sp.value)
            .ok_or(Error::InvalidArgument)
    }

    fn set_min(&self, id: SyncpointId, value: u32) {
        if let Some(sp) = self.state.lock().syncpts.get_mut(id.index()) {
            sp.value = value;
        }
    }

    fn set_safe_state(&self, id: SyncpointId) {
        if let Some(sp) = self.state.lock().syncpts.get_mut(id.index()) {
            sp.safe = true;
        }
    }

    fn gpu_va(&self, id: SyncpointId) -> GpuAddr {
        self.shim_base.offset(u64::from(id.raw()) * SYNCPT_SHIM_STRIDE)
    }

    fn ro_map_gpu_va(&self) -> GpuAddr {
        self.ro_map
    }

    fn register_notifier(&self, id: SyncpointId, thresh: u32, notifier: SyncptNotifier) -> Result<()> {
        let mut state = self.state.lock();
        let Some(sp) = state.syncpts.get(id.index()).filter(|sp| sp.in_use) else {
            return Err(Error::InvalidArgument);
        };

        if threshold_reached(sp.value, thresh) {
            drop(state);
            notifier();
            return Ok(());
        }

        state.pending.push(PendingNotifier { id, thresh, notifier });
        Ok(())
    }
}

impl fmt::Debug for SoftSyncpointHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SoftSyncpointHost")
            .field("syncpts", &state.syncpts)
            .field("pending", &state.pending.len())
            .finish()
    }
}

// =============================================================================
// SOFT OS FENCE
// =============================================================================

#[derive(Debug)]
struct FenceObject {
    handle: OsFence,
    points: Vec<CompletionPoint>,
    refs: u32,
}

#[derive(Debug, Default)]
struct FenceTable {
    next_handle: u64,
    next_fd: FenceFd,
    fences: Vec<FenceObject>,
    fds: Vec<(FenceFd, OsFence)>,
    timelines: Vec<(ChannelId, String)>,
}

impl FenceTable {
    fn insert(&mut self, points: Vec<CompletionPoint>) -> OsFence {
        self.next_handle += 1;
        let handle = OsFence(self.next_handle);
        self.fences.push(FenceObject {
            handle,
            points,
            refs: 1,
        });
        handle
    }

    fn get(&mut self, handle: OsFence) -> Option<&mut FenceObject> {
        self.fences.iter_mut().find(|f| f.handle == handle)
    }

    fn install(&mut self, handle: OsFence) -> Result<FenceFd> {
        let obj = self.get(handle).ok_or(Error::InvalidArgument)?;
        obj.refs += 1;
        self.next_fd += 1;
        let fd = self.next_fd;
        self.fds.push((fd, handle));
        Ok(fd)
    }

    fn put(&mut self, handle: OsFence) {
        let Some(pos) = self.fences.iter().position(|f| f.handle == handle) else {
            log::warn!("soft os fence: put of unknown fence {:?}", handle);
            return;
        };
        let obj = &mut self.fences[pos];
        obj.refs -= 1;
        if obj.refs == 0 {
            self.fences.remove(pos);
        }
    }
}

/// sync_file style fence table simulated in memory
#[derive(Debug, Default)]
pub struct SoftOsFence {
    table: Mutex<FenceTable>,
    fail_create: AtomicBool,
}

impl SoftOsFence {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next [`OsFenceOps::create`] fail with `OutOfMemory`
    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::Release);
    }

    /// Merge the fences behind `fds` into a new fence exported as a new fd
    pub fn merge(&self, fds: &[FenceFd]) -> Result<FenceFd> {
        let mut points = Vec::new();
        for fd in fds {
            points.extend(self.fdget(*fd)?);
        }

        let mut table = self.table.lock();
        let handle = table.insert(points);
        let fd = table.install(handle)?;
        // the fd now holds the only reference
        table.put(handle);
        Ok(fd)
    }

    /// Close a file descriptor
    pub fn close_fd(&self, fd: FenceFd) {
        let mut table = self.table.lock();
        if let Some(pos) = table.fds.iter().position(|(f, _)| *f == fd) {
            let (_, handle) = table.fds.remove(pos);
            table.put(handle);
        }
    }

    /// Fence objects still referenced
    pub fn live_fences(&self) -> usize {
        self.table.lock().fences.len()
    }

    /// Name a channel's timeline was created with
    pub fn timeline_name(&self, chid: ChannelId) -> Option<String> {
        let table = self.table.lock();
        table
            .timelines
            .iter()
            .find(|(c, _)| *c == chid)
            .map(|(_, name)| name.clone())
    }
}

impl OsFenceOps for SoftOsFence {
    fn create(&self, _chid: ChannelId, points: Vec<CompletionPoint>) -> Result<OsFence> {
        if self.fail_create.swap(false, Ordering::AcqRel) {
            return Err(Error::OutOfMemory);
        }
        Ok(self.table.lock().insert(points))
    }

    fn install_fd(&self, fence: OsFence) -> Result<FenceFd> {
        self.table.lock().install(fence)
    }

    fn fdget(&self, fd: FenceFd) -> Result<Vec<CompletionPoint>> {
        let mut table = self.table.lock();
        let handle = table
            .fds
            .iter()
            .find(|(f, _)| *f == fd)
            .map(|(_, h)| *h)
            .ok_or(Error::InvalidArgument)?;
        let obj = table.get(handle).ok_or(Error::InvalidArgument)?;
        Ok(obj.points.clone())
    }

    fn put(&self, fence: OsFence) {
        self.table.lock().put(fence);
    }

    fn init_timeline(&self, chid: ChannelId, name: &str) -> Result<()> {
        let mut table = self.table.lock();
        if table.timelines.iter().any(|(c, _)| *c == chid) {
            return Err(Error::InvalidState);
        }
        table.timelines.push((chid, name.to_string()));
        Ok(())
    }

    fn destroy_timeline(&self, chid: ChannelId) {
        self.table.lock().timelines.retain(|(c, _)| *c != chid);
    }

    fn timeline_exists(&self, chid: ChannelId) -> bool {
        self.table.lock().timelines.iter().any(|(c, _)| *c == chid)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicU32;

    #[test]
    fn test_host_never_hands_out_zero() {
        let host = SoftSyncpointHost::new(3);
        let a = host.alloc_host_managed(ChannelId::new(0), "gpu_0").unwrap();
        let b = host.alloc_client_managed("gpu_1_user").unwrap();
        assert_eq!((a.raw(), b.raw()), (1, 2));
        assert!(host.alloc_host_managed(ChannelId::new(2), "gpu_2").is_none());
        assert!(host.is_client_managed(b));
        assert!(!host.is_valid(SyncpointId::INVALID));
    }

    #[test]
    fn test_notifier_fires_on_threshold() {
        let host = SoftSyncpointHost::new(2);
        let id = host.alloc_host_managed(ChannelId::new(0), "gpu_0").unwrap();
        let hits = Arc::new(AtomicU32::new(0));

        let h = Arc::clone(&hits);
        host.register_notifier(id, 2, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        host.hw_incr(id, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        host.hw_incr(id, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(host.pending_notifiers(), 0);
    }

    #[test]
    fn test_fence_refs() {
        let os = SoftOsFence::new();
        let f = os.create(ChannelId::new(0), Vec::new()).unwrap();
        let fd = os.install_fd(f).unwrap();
        os.put(f);
        assert_eq!(os.live_fences(), 1);
        assert!(os.fdget(fd).unwrap().is_empty());
        os.close_fd(fd);
        assert_eq!(os.live_fences(), 0);
        assert_eq!(os.fdget(fd).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn test_injected_create_failure_is_one_shot() {
        let os = SoftOsFence::new();
        os.fail_next_create();
        assert_eq!(os.create(ChannelId::new(0), Vec::new()), Err(Error::OutOfMemory));
        assert!(os.create(ChannelId::new(0), Vec::new()).is_ok());
    }
}
