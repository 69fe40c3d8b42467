//! # Sync Command Encoder
//!
//! Encodes syncpoint and semaphore wait/increment commands into private
//! command entries. The sizes reported here are what the channel sync uses
//! to reserve queue space, so `add_*` must never write past them.

use magma_core::{GpuAddr, SyncpointId};

use crate::cmdbuf::PrivCmdEntry;

// =============================================================================
// ENCODER TRAIT
// =============================================================================

/// Per-chip encoding of the host sync methods
pub trait SyncCmdEncoder: Send + Sync {
    /// Words needed for one syncpoint wait
    fn syncpt_wait_cmd_size(&self) -> u32;

    /// Emit a wait for `id >= thresh` at word `off` of `cmd`
    fn add_syncpt_wait_cmd(
        &self,
        cmd: &mut PrivCmdEntry,
        off: u32,
        id: SyncpointId,
        thresh: u32,
        gpu_va: GpuAddr,
    );

    /// Words needed for one syncpoint increment
    fn syncpt_incr_cmd_size(&self, wfi: bool) -> u32;

    /// Emit a syncpoint increment, optionally preceded by a wait-for-idle
    fn add_syncpt_incr_cmd(&self, cmd: &mut PrivCmdEntry, wfi: bool, id: SyncpointId, gpu_va: GpuAddr);

    /// How far a single increment command advances the syncpoint
    fn syncpt_incr_per_release(&self) -> u32;

    /// Words needed for one semaphore acquire
    fn sema_wait_cmd_size(&self) -> u32;

    /// Words needed for one semaphore release
    fn sema_incr_cmd_size(&self) -> u32;

    /// Emit a semaphore acquire (`acquire`) or release at word `off`
    fn add_sema_cmd(
        &self,
        cmd: &mut PrivCmdEntry,
        off: u32,
        gpu_va: GpuAddr,
        value: u32,
        acquire: bool,
        wfi: bool,
    );

    /// Get encoder name
    fn name(&self) -> &'static str;
}

// =============================================================================
// HOST METHODS
// =============================================================================

/// Host class method offsets (bytes)
pub mod method {
    /// Semaphore address, high bits
    pub const SEMAPHORE_A: u32 = 0x0010;
    /// Semaphore address, low bits
    pub const SEMAPHORE_B: u32 = 0x0014;
    /// Semaphore payload
    pub const SEMAPHORE_C: u32 = 0x0018;
    /// Semaphore operation
    pub const SEMAPHORE_D: u32 = 0x001c;
    /// Non-stalling interrupt
    pub const NON_STALL_INT: u32 = 0x0020;
    /// Syncpoint payload
    pub const SYNCPOINT_A: u32 = 0x0070;
    /// Syncpoint operation
    pub const SYNCPOINT_B: u32 = 0x0074;
    /// Wait for idle
    pub const WFI: u32 = 0x0078;
}

const SYNCPT_OP_WAIT: u32 = 0;
const SYNCPT_OP_INCR: u32 = 1;
const SYNCPT_WAIT_SWITCH_EN: u32 = 1 << 4;

const SEMA_OP_RELEASE: u32 = 0x2;
const SEMA_OP_ACQ_GEQ: u32 = 0x4;
const SEMA_ACQ_SWITCH_EN: u32 = 1 << 12;
const SEMA_RELEASE_WFI_DIS: u32 = 1 << 20;
const SEMA_RELEASE_SIZE_4BYTE: u32 = 1 << 24;

/// Incrementing method header for a single data word
#[inline]
pub const fn method_header(method: u32, subch: u32) -> u32 {
    (1 << 29) | (1 << 16) | (subch << 13) | (method >> 2)
}

// =============================================================================
// HOST METHOD ENCODER
// =============================================================================

/// Encoder emitting host-class methods as header/data pairs
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMethodEncoder {
    /// Subchannel the host methods are sent on
    subch: u32,
}

impl HostMethodEncoder {
    /// Create encoder
    pub const fn new() -> Self {
        Self { subch: 0 }
    }

    fn push(&self, cmd: &mut PrivCmdEntry, pos: &mut u32, method: u32, data: u32) {
        cmd.write(*pos, method_header(method, self.subch));
        cmd.write(*pos + 1, data);
        *pos += 2;
    }
}

impl SyncCmdEncoder for HostMethodEncoder {
    fn syncpt_wait_cmd_size(&self) -> u32 {
        4
    }

    fn add_syncpt_wait_cmd(
        &self,
        cmd: &mut PrivCmdEntry,
        off: u32,
        id: SyncpointId,
        thresh: u32,
        _gpu_va: GpuAddr,
    ) {
        let mut pos = off;
        self.push(cmd, &mut pos, method::SYNCPOINT_A, thresh);
        self.push(
            cmd,
            &mut pos,
            method::SYNCPOINT_B,
            (id.raw() << 8) | SYNCPT_OP_WAIT | SYNCPT_WAIT_SWITCH_EN,
        );
    }

    fn syncpt_incr_cmd_size(&self, wfi: bool) -> u32 {
        if wfi {
            8
        } else {
            6
        }
    }

    fn add_syncpt_incr_cmd(&self, cmd: &mut PrivCmdEntry, wfi: bool, id: SyncpointId, _gpu_va: GpuAddr) {
        let mut pos = 0;
        if wfi {
            self.push(cmd, &mut pos, method::WFI, 0);
        }
        self.push(cmd, &mut pos, method::SYNCPOINT_A, 0);
        // two increments: one for the host, one for the engine idle
        for _ in 0..self.syncpt_incr_per_release() {
            self.push(cmd, &mut pos, method::SYNCPOINT_B, (id.raw() << 8) | SYNCPT_OP_INCR);
        }
    }

    fn syncpt_incr_per_release(&self) -> u32 {
        2
    }

    fn sema_wait_cmd_size(&self) -> u32 {
        8
    }

    fn sema_incr_cmd_size(&self) -> u32 {
        10
    }

    fn add_sema_cmd(
        &self,
        cmd: &mut PrivCmdEntry,
        off: u32,
        gpu_va: GpuAddr,
        value: u32,
        acquire: bool,
        wfi: bool,
    ) {
        let mut pos = off;
        self.push(cmd, &mut pos, method::SEMAPHORE_A, gpu_va.hi() & 0xff);
        self.push(cmd, &mut pos, method::SEMAPHORE_B, gpu_va.lo());
        self.push(cmd, &mut pos, method::SEMAPHORE_C, value);

        if acquire {
            self.push(cmd, &mut pos, method::SEMAPHORE_D, SEMA_OP_ACQ_GEQ | SEMA_ACQ_SWITCH_EN);
        } else {
            let mut op = SEMA_OP_RELEASE | SEMA_RELEASE_SIZE_4BYTE;
            if !wfi {
                op |= SEMA_RELEASE_WFI_DIS;
            }
            self.push(cmd, &mut pos, method::SEMAPHORE_D, op);
            self.push(cmd, &mut pos, method::NON_STALL_INT, 0);
        }
    }

    fn name(&self) -> &'static str {
        "host"
    }
}

// =============================================================================
// TESTS
// =============================================================================
