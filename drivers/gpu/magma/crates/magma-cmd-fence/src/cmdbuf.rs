//! # Private Command Queue
//!
//! Per-channel ring of driver-generated command words. Wait and increment
//! commands emitted by the channel sync are carved out of this ring and
//! referenced from the GPFIFO next to the user's own push buffers.
//!
//! Allocations are released in submission order when jobs complete. The
//! most recent allocation may also be handed back early, which is how a
//! failed increment rolls its command words back.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use magma_core::{Error, GpuAddr, Result};
use spin::Mutex;

// =============================================================================
// COMMAND ENTRY
// =============================================================================

/// A block of command words reserved in a [`PrivCmdQueue`]
#[derive(Debug, PartialEq, Eq)]
pub struct PrivCmdEntry {
    /// Offset into the queue, in words
    off: u32,
    /// GPU address of the first word
    gva: GpuAddr,
    /// CPU copy of the command words
    words: Vec<u32>,
}

impl PrivCmdEntry {
    /// Offset into the queue, in words
    pub fn off(&self) -> u32 {
        self.off
    }

    /// GPU address of the entry
    pub fn gva(&self) -> GpuAddr {
        self.gva
    }

    /// Length in words
    pub fn size(&self) -> u32 {
        self.words.len() as u32
    }

    /// Encoded command words
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Write a word at `pos` (relative to the entry start)
    ///
    /// Out-of-range writes are dropped and logged; encoders size their
    /// entries up front so this only trips on an encoder bug.
    pub fn write(&mut self, pos: u32, word: u32) {
        match self.words.get_mut(pos as usize) {
            Some(slot) => *slot = word,
            None => log::error!(
                "priv cmd write past entry: pos={} size={}",
                pos,
                self.words.len()
            ),
        }
    }

    /// Zero `len` words starting at `pos`, leaving a no-op slot
    pub fn zero(&mut self, pos: u32, len: u32) {
        let start = (pos as usize).min(self.words.len());
        let end = (pos as usize + len as usize).min(self.words.len());
        self.words[start..end].fill(0);
    }
}

// =============================================================================
// QUEUE
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Span {
    off: u32,
    len: u32,
}

impl Span {
    fn end(self) -> u32 {
        self.off + self.len
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Outstanding allocations, oldest first. The write position is the
    /// end of the newest one.
    inflight: VecDeque<Span>,
}

/// Ring of command words owned by one channel
#[derive(Debug)]
pub struct PrivCmdQueue {
    /// GPU address of word 0
    base: GpuAddr,
    /// Capacity in words
    size: u32,
    state: Mutex<QueueState>,
}

impl PrivCmdQueue {
    /// Create a queue of `size` words mapped at `base`
    pub fn new(base: GpuAddr, size: u32) -> Self {
        Self {
            base,
            size,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Capacity in words
    pub fn capacity(&self) -> u32 {
        self.size
    }

    /// Words currently reserved
    pub fn used(&self) -> u32 {
        self.state.lock().inflight.iter().map(|s| s.len).sum()
    }

    /// Number of outstanding entries
    pub fn inflight(&self) -> usize {
        self.state.lock().inflight.len()
    }

    /// Reserve `words` contiguous words
    ///
    /// An entry never straddles the end of the ring; the tail is skipped
    /// and the allocation restarts at word 0 when it does not fit.
    pub fn alloc(&self, words: u32) -> Result<PrivCmdEntry> {
        if words == 0 {
            return Err(Error::InvalidArgument);
        }

        let mut state = self.state.lock();

        let off = match (state.inflight.front().copied(), state.inflight.back().copied()) {
            (Some(head), Some(tail)) => {
                let put = tail.end();
                if tail.off < head.off {
                    // wrapped: free space is between put and head
                    (head.off - put >= words).then_some(put)
                } else if self.size - put >= words {
                    Some(put)
                } else {
                    (head.off >= words).then_some(0)
                }
            }
            _ => (self.size >= words).then_some(0),
        };

        let Some(off) = off else {
            log::warn!(
                "priv cmd queue full: want={} used={} size={}",
                words,
                state.inflight.iter().map(|s| s.len).sum::<u32>(),
                self.size
            );
            return Err(Error::CommandBufferFull);
        };

        state.inflight.push_back(Span { off, len: words });

        Ok(PrivCmdEntry {
            off,
            gva: self.base.offset(u64::from(off) * 4),
            words: vec![0; words as usize],
        })
    }

    /// Return an entry to the queue
    ///
    /// Freeing the newest entry rolls the write position back; freeing
    /// any other entry just releases its span.
    pub fn free(&self, entry: PrivCmdEntry) {
        let mut state = self.state.lock();

        let Some(pos) = state.inflight.iter().position(|s| s.off == entry.off) else {
            log::error!("priv cmd free of unknown entry off={}", entry.off);
            return;
        };

        state.inflight.remove(pos);
    }
}

// =============================================================================
// TESTS
// =============================================================================
