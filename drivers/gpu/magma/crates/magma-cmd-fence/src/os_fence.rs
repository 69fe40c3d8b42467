//! # Completion Points and OS Fences
//!
//! A [`CompletionPoint`] is one "this counter reached that value" condition,
//! backed by either a syncpoint or a semaphore. The OS fence framework
//! bundles one or more points into an object that can be exported to other
//! processes as a file descriptor and imported back.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use magma_core::{ChannelId, Result, SyncpointId};

use crate::semaphore::HwSemaphore;
use crate::syncpt::SyncpointOps;

// =============================================================================
// COMPLETION POINT
// =============================================================================

/// A single hardware completion condition
#[derive(Clone)]
pub enum CompletionPoint {
    /// Syncpoint `id` reaching `thresh`
    Syncpoint {
        /// Unit the syncpoint lives in
        host: Arc<dyn SyncpointOps>,
        /// Syncpoint id
        id: SyncpointId,
        /// Threshold value
        thresh: u32,
    },
    /// Semaphore cell reaching `value`
    Semaphore {
        /// The cell
        sema: Arc<HwSemaphore>,
        /// Expected value
        value: u32,
    },
}

impl CompletionPoint {
    /// Whether the condition holds right now
    pub fn is_expired(&self) -> bool {
        match self {
            Self::Syncpoint { host, id, thresh } => host.is_expired(*id, *thresh),
            Self::Semaphore { sema, value } => sema.is_released(*value),
        }
    }

    /// Syncpoint id and threshold, if syncpoint backed
    pub fn as_syncpt(&self) -> Option<(SyncpointId, u32)> {
        match self {
            Self::Syncpoint { id, thresh, .. } => Some((*id, *thresh)),
            Self::Semaphore { .. } => None,
        }
    }

    /// Whether two points name the same condition
    pub fn same_condition(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Syncpoint { id: a, thresh: ta, .. },
                Self::Syncpoint { id: b, thresh: tb, .. },
            ) => a == b && ta == tb,
            (Self::Semaphore { sema: a, value: va }, Self::Semaphore { sema: b, value: vb }) => {
                Arc::ptr_eq(a, b) && va == vb
            }
            _ => false,
        }
    }
}

impl fmt::Debug for CompletionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syncpoint { id, thresh, .. } => f
                .debug_struct("Syncpoint")
                .field("id", id)
                .field("thresh", thresh)
                .finish(),
            Self::Semaphore { sema, value } => f
                .debug_struct("Semaphore")
                .field("slot", &sema.slot())
                .field("value", value)
                .finish(),
        }
    }
}

// =============================================================================
// OS FENCE FRAMEWORK
// =============================================================================

/// Handle of an OS fence object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsFence(pub u64);

/// Fence file descriptor
pub type FenceFd = i32;

/// OS fence framework (sync_file / nvhost fences)
pub trait OsFenceOps: Send + Sync {
    /// Wrap `points` into a new fence object holding one reference
    fn create(&self, chid: ChannelId, points: Vec<CompletionPoint>) -> Result<OsFence>;

    /// Export a fence as a file descriptor
    fn install_fd(&self, fence: OsFence) -> Result<FenceFd>;

    /// Import a file descriptor and return its completion points
    fn fdget(&self, fd: FenceFd) -> Result<Vec<CompletionPoint>>;

    /// Drop a reference on a fence object
    fn put(&self, fence: OsFence);

    /// Create the per-channel timeline used by semaphore fences
    fn init_timeline(&self, chid: ChannelId, name: &str) -> Result<()>;

    /// Destroy a channel's timeline
    fn destroy_timeline(&self, chid: ChannelId);

    /// Whether a channel's timeline exists
    fn timeline_exists(&self, chid: ChannelId) -> bool;
}
