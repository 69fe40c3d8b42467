//! # FIFO Configuration
//!
//! Device-wide constants consumed by the TSG scheduler: pool size,
//! timeslice bounds and context-switch watchdog periods.

use core::fmt;

use crate::error::{Error, Result};

// =============================================================================
// TIMESLICE CONSTANTS
// =============================================================================

/// Default TSG timeslice (1024us)
pub const TIMESLICE_DEFAULT_US: u32 = 128 << 3;
/// Smallest timeslice accepted from userspace
pub const TIMESLICE_MIN_US: u32 = 1000;
/// Largest timeslice accepted from userspace
pub const TIMESLICE_MAX_US: u32 = 50_000;
/// Largest timeslice accepted through the long (debug) setter
pub const DBG_TIMESLICE_MAX_US: u32 = 4_000_000;

/// Period of the context-switch timeout interrupt
pub const CTXSW_TIMEOUT_PERIOD_MS: u32 = 100;
/// Default poll timeout, also the per-channel ctxsw accumulation limit
pub const DEFAULT_POLL_TIMEOUT_MS: u32 = 3000;

// =============================================================================
// INTERLEAVE LEVEL
// =============================================================================

/// Runlist interleave level of a TSG
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u32)]
pub enum InterleaveLevel {
    /// Scheduled once per runlist pass
    #[default]
    Low = 0,
    /// Interleaved with the low level entries
    Medium = 1,
    /// Interleaved with every other entry
    High = 2,
}

impl InterleaveLevel {
    /// Number of interleave levels
    pub const COUNT: usize = 3;

    /// Decode a raw level as passed in from userspace
    pub const fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Low),
            1 => Ok(Self::Medium),
            2 => Ok(Self::High),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Raw value
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for InterleaveLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

// =============================================================================
// FIFO CONFIG
// =============================================================================

/// FIFO scheduling configuration
#[derive(Debug, Clone)]
pub struct FifoConfig {
    /// Device name, used to label syncpoints
    pub name: &'static str,
    /// Number of hardware channels; also the TSG pool size
    pub num_channels: u32,
    /// Timeslice applied at TSG open when the engine has no default
    pub timeslice_default_us: u32,
    /// Lower timeslice bound
    pub timeslice_min_us: u32,
    /// Upper timeslice bound
    pub timeslice_max_us: u32,
    /// Upper bound for the long timeslice setter
    pub dbg_timeslice_max_us: u32,
    /// Context-switch timeout interrupt period
    pub ctxsw_timeout_period_ms: u32,
    /// Poll timeout; ctxsw accumulation limit per channel
    pub poll_timeout_ms: u32,
    /// Whether watchdog timeouts are enforced
    pub timeouts_enabled: bool,
}

impl Default for FifoConfig {
    fn default() -> Self {
        Self {
            name: "gpu",
            num_channels: 512,
            timeslice_default_us: TIMESLICE_DEFAULT_US,
            timeslice_min_us: TIMESLICE_MIN_US,
            timeslice_max_us: TIMESLICE_MAX_US,
            dbg_timeslice_max_us: DBG_TIMESLICE_MAX_US,
            ctxsw_timeout_period_ms: CTXSW_TIMEOUT_PERIOD_MS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            timeouts_enabled: true,
        }
    }
}

impl FifoConfig {
    /// Config with a given channel count, everything else default
    pub fn with_channels(num_channels: u32) -> Self {
        Self {
            num_channels,
            ..Self::default()
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.num_channels == 0 {
            log::error!("fifo config: zero channels");
            return Err(Error::InvalidConfig);
        }

        if self.timeslice_min_us > self.timeslice_max_us
            || self.timeslice_max_us > self.dbg_timeslice_max_us
        {
            log::error!(
                "fifo config: bad timeslice bounds min={} max={} dbg_max={}",
                self.timeslice_min_us,
                self.timeslice_max_us,
                self.dbg_timeslice_max_us
            );
            return Err(Error::InvalidConfig);
        }

        if self.ctxsw_timeout_period_ms == 0 {
            log::error!("fifo config: zero ctxsw timeout period");
            return Err(Error::InvalidConfig);
        }

        Ok(())
    }

    /// Per-channel ctxsw accumulation limit
    ///
    /// Unbounded when timeouts are disabled.
    pub fn ctxsw_timeout_max_ms(&self) -> u32 {
        if self.timeouts_enabled {
            self.poll_timeout_ms
        } else {
            u32::MAX
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
