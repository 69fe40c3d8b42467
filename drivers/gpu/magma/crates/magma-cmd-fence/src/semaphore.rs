//! # GPU Semaphores
//!
//! Semaphores are 32-bit cells in GPU-visible memory. A channel owns one
//! cell (its hardware semaphore); release commands make the GPU write an
//! increasing value into it, acquire commands make the GPU poll it.
//!
//! ```text
//!   SemaphorePool (one page, N slots)
//!   ┌────────┬────────┬────────┬─────
//!   │ slot 0 │ slot 1 │ slot 2 │ ...
//!   └────────┴────────┴────────┴─────
//!        ▲        ▲
//!   HwSemaphore  HwSemaphore        (one per channel)
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use magma_core::{Error, GpuAddr, Result};
use spin::Mutex;

use crate::syncpt::threshold_reached;

/// Bytes reserved per semaphore slot
pub const SEMAPHORE_SLOT_SIZE: u64 = 16;

// =============================================================================
// SEMAPHORE POOL
// =============================================================================

/// Pool of semaphore cells shared by the channels of an address space
#[derive(Debug)]
pub struct SemaphorePool {
    /// GPU address of slot 0
    base: GpuAddr,
    /// Cell contents as the GPU sees them
    cells: Vec<AtomicU32>,
    /// Slot allocation map
    in_use: Mutex<Vec<bool>>,
}

impl SemaphorePool {
    /// Create a pool of `slots` cells at `base`
    pub fn new(base: GpuAddr, slots: usize) -> Arc<Self> {
        Arc::new(Self {
            base,
            cells: (0..slots).map(|_| AtomicU32::new(0)).collect(),
            in_use: Mutex::new(alloc::vec![false; slots]),
        })
    }

    /// Allocate a hardware semaphore
    pub fn alloc(self: &Arc<Self>) -> Result<Arc<HwSemaphore>> {
        let mut in_use = self.in_use.lock();

        let Some(slot) = in_use.iter().position(|used| !used) else {
            log::error!("semaphore pool exhausted: {} slots", in_use.len());
            return Err(Error::ResourceExhausted);
        };

        in_use[slot] = true;
        self.cells[slot].store(0, Ordering::Release);

        Ok(Arc::new(HwSemaphore {
            pool: Arc::clone(self),
            slot,
            next_value: AtomicU32::new(0),
        }))
    }

    fn free(&self, slot: usize) {
        if let Some(used) = self.in_use.lock().get_mut(slot) {
            *used = false;
        }
    }

    /// Number of allocated slots
    pub fn slots_in_use(&self) -> usize {
        self.in_use.lock().iter().filter(|used| **used).count()
    }

    /// Current value of a cell
    pub fn read(&self, slot: usize) -> u32 {
        self.cells.get(slot).map_or(0, |c| c.load(Ordering::Acquire))
    }

    /// Write a cell as the GPU would on a release
    pub fn hw_release(&self, slot: usize, value: u32) {
        if let Some(cell) = self.cells.get(slot) {
            cell.store(value, Ordering::Release);
        }
    }

    /// GPU address of a slot
    pub fn slot_gpu_va(&self, slot: usize) -> GpuAddr {
        self.base.offset(slot as u64 * SEMAPHORE_SLOT_SIZE)
    }
}

// =============================================================================
// HARDWARE SEMAPHORE
// =============================================================================

/// A channel's semaphore cell plus the next value it will be released to
#[derive(Debug)]
pub struct HwSemaphore {
    pool: Arc<SemaphorePool>,
    slot: usize,
    next_value: AtomicU32,
}

impl HwSemaphore {
    /// Slot index in the pool
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// GPU address of the cell
    pub fn gpu_va(&self) -> GpuAddr {
        self.pool.slot_gpu_va(self.slot)
    }

    /// Value currently in memory
    pub fn read(&self) -> u32 {
        self.pool.read(self.slot)
    }

    /// Highest value handed out to a release so far
    pub fn next_value(&self) -> u32 {
        self.next_value.load(Ordering::Acquire)
    }

    /// Reserve the value the next release command will write
    pub fn prepare(&self) -> u32 {
        self.next_value.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Give back the value reserved by the last [`prepare`](Self::prepare)
    pub(crate) fn unprepare(&self) {
        self.next_value.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether the cell has reached `value`
    pub fn is_released(&self, value: u32) -> bool {
        threshold_reached(self.read(), value)
    }

    /// Snap `next_value` back to the value in memory
    ///
    /// Values reserved but never released are forgotten. Returns whether
    /// the tracked value moved, in which case waiters should be woken.
    pub fn reset(&self) -> bool {
        let current = self.read();
        let old = self.next_value.swap(current, Ordering::AcqRel);
        if old == current {
            return false;
        }

        log::debug!("hw sema slot {}: next {} -> {}", self.slot, old, current);
        true
    }
}

impl Drop for HwSemaphore {
    fn drop(&mut self) {
        self.pool.free(self.slot);
    }
}

// =============================================================================
// TESTS
// =============================================================================
