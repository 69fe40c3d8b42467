//! # Channel Error Notifiers
//!
//! Codes written into a channel's error notifier when the scheduler gives
//! up on it. Userspace reads them back to learn why its channel died.

/// Error notifier code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorNotifier {
    /// Context-switch watchdog fired
    FifoErrorIdleTimeout = 0,
    /// Unhandled software method
    GrErrorSwMethod = 1,
    /// Software notify error
    GrErrorSwNotify = 2,
    /// Graphics exception
    GrException = 3,
    /// Graphics semaphore timeout
    GrSemaphoreTimeout = 4,
    /// Illegal notify
    GrIllegalNotify = 5,
    /// MMU fault
    FifoErrorMmuErrFlt = 6,
    /// PBDMA error
    PbdmaError = 7,
    /// Unimplemented FECS firmware method
    FecsErrUnimpFirmwareMethod = 8,
    /// Reset channel verification error
    ResetChannelVerifError = 9,
    /// Pushbuffer CRC mismatch
    PbdmaPushbufferCrcMismatch = 10,
}

impl ErrorNotifier {
    /// Highest code accepted
    pub const MAX: u32 = Self::PbdmaPushbufferCrcMismatch as u32;

    /// Decode a raw code; `None` above [`Self::MAX`]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::FifoErrorIdleTimeout,
            1 => Self::GrErrorSwMethod,
            2 => Self::GrErrorSwNotify,
            3 => Self::GrException,
            4 => Self::GrSemaphoreTimeout,
            5 => Self::GrIllegalNotify,
            6 => Self::FifoErrorMmuErrFlt,
            7 => Self::PbdmaError,
            8 => Self::FecsErrUnimpFirmwareMethod,
            9 => Self::ResetChannelVerifError,
            10 => Self::PbdmaPushbufferCrcMismatch,
            _ => return None,
        })
    }

    /// Raw code
    pub const fn raw(self) -> u32 {
        self as u32
    }
}
