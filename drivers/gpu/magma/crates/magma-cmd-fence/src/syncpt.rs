//! # Syncpoint Host Interface
//!
//! Syncpoints are 32-bit hardware counters owned by the host1x-style
//! syncpoint unit. Hardware increments them; software waits for them to
//! reach a threshold. Counters wrap at 2^32, so every comparison goes
//! through [`threshold_reached`].

use alloc::boxed::Box;

use magma_core::{ChannelId, GpuAddr, Result, SyncpointId};

/// One-shot callback fired once a syncpoint passes a threshold
pub type SyncptNotifier = Box<dyn FnOnce() + Send>;

/// Whether counter value `current` has reached `thresh`
///
/// Wrap-aware: values within 2^31 behind `current` count as reached.
#[inline]
pub const fn threshold_reached(current: u32, thresh: u32) -> bool {
    (current.wrapping_sub(thresh) as i32) >= 0
}

/// Syncpoint unit operations consumed by the channel sync
pub trait SyncpointOps: Send + Sync {
    /// Allocate a syncpoint incremented only by this channel's engine
    fn alloc_host_managed(&self, chid: ChannelId, name: &str) -> Option<SyncpointId>;

    /// Allocate a syncpoint whose max value is tracked by the client
    fn alloc_client_managed(&self, name: &str) -> Option<SyncpointId>;

    /// Return an id to the unit
    fn release(&self, id: SyncpointId);

    /// Whether `id` names an allocated syncpoint
    fn is_valid(&self, id: SyncpointId) -> bool;

    /// Current hardware value
    fn read(&self, id: SyncpointId) -> Result<u32>;

    /// Force the hardware value to `value`
    fn set_min(&self, id: SyncpointId, value: u32);

    /// Put the syncpoint in a state where stale waiters cannot hang
    fn set_safe_state(&self, id: SyncpointId);

    /// GPU address of the syncpoint's shim buffer, used by increments
    fn gpu_va(&self, id: SyncpointId) -> GpuAddr;

    /// GPU address of the read-only mapping of all syncpoints
    fn ro_map_gpu_va(&self) -> GpuAddr;

    /// Arm `notifier` to run once `id` reaches `thresh`
    fn register_notifier(&self, id: SyncpointId, thresh: u32, notifier: SyncptNotifier) -> Result<()>;

    /// Whether `thresh` has already been reached
    fn is_expired(&self, id: SyncpointId, thresh: u32) -> bool {
        match self.read(id) {
            Ok(current) => threshold_reached(current, thresh),
            Err(_) => false,
        }
    }
}
