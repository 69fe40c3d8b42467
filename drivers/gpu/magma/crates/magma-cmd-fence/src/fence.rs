//! # Fences
//!
//! A fence is produced by a channel-sync increment and names the single
//! completion point that increment will reach. It holds a reference on the
//! channel sync, so the syncpoint or semaphore stays allocated for as long
//! as anyone may still wait on it, even after the channel is closed.

use alloc::sync::Arc;
use core::fmt;

use magma_core::{Error, Result};

use crate::os_fence::{CompletionPoint, FenceFd, OsFence, OsFenceOps};
use crate::sync::ChannelSync;

/// Immutable completion handle
pub struct Fence {
    point: CompletionPoint,
    os_fence: Option<(OsFence, Arc<dyn OsFenceOps>)>,
    sync: Arc<ChannelSync>,
}

impl Fence {
    pub(crate) fn new(
        point: CompletionPoint,
        os_fence: Option<(OsFence, Arc<dyn OsFenceOps>)>,
        sync: Arc<ChannelSync>,
    ) -> Self {
        Self {
            point,
            os_fence,
            sync,
        }
    }

    /// The completion point
    pub fn point(&self) -> &CompletionPoint {
        &self.point
    }

    /// Whether the hardware has passed the completion point
    pub fn is_expired(&self) -> bool {
        self.point.is_expired()
    }

    /// OS fence object, if one was requested
    pub fn os_fence(&self) -> Option<OsFence> {
        self.os_fence.as_ref().map(|(f, _)| *f)
    }

    /// Export the OS fence as a file descriptor
    pub fn install_fd(&self) -> Result<FenceFd> {
        match &self.os_fence {
            Some((fence, ops)) => ops.install_fd(*fence),
            None => Err(Error::InvalidState),
        }
    }

    /// Channel sync this fence keeps alive
    pub fn sync(&self) -> &Arc<ChannelSync> {
        &self.sync
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if let Some((fence, ops)) = self.os_fence.take() {
            ops.put(fence);
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("point", &self.point)
            .field("os_fence", &self.os_fence())
            .field("chid", &self.sync.chid())
            .finish()
    }
}
