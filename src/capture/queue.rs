//! The pending capture queue.
//!
//! In-flight capture buffers live in exactly one of two ordered lists:
//! `pending` (being filled, head first) or `finished` (awaiting delivery).
//! Ownership transfers between lists only while the session lock is held;
//! no mixing or delivery work ever happens under that lock.
//!
//! Bookkeeping allocation is drawn from a bounded pool so a runaway client
//! cannot grow the queue without limit; exhaustion is reported as
//! `ResourceExhausted` rather than an abort.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::CaptureError;
use crate::event::CompletionCallback;
use crate::packet::CapturePacket;

/// Bounded allocator for pending-buffer bookkeeping.
///
/// A slot is held for the whole life of a [`PendingCaptureBuffer`] and
/// returns to the pool when the buffer is dropped (after delivery or
/// discard).
#[derive(Debug)]
pub(crate) struct BufferPool {
    available: AtomicUsize,
}

impl BufferPool {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            available: AtomicUsize::new(capacity),
        })
    }

    /// Acquires one slot, failing with `ResourceExhausted` when the pool is
    /// empty.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Result<PoolSlot, CaptureError> {
        let mut current = self.available.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(CaptureError::ResourceExhausted {
                    resource: "pending capture buffer pool",
                });
            }
            match self.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(PoolSlot { pool: self.clone() }),
                Err(observed) => current = observed,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.available.load(Ordering::SeqCst)
    }
}

/// A held pool slot; returns itself on drop.
#[derive(Debug)]
pub(crate) struct PoolSlot {
    pool: Arc<BufferPool>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.available.fetch_add(1, Ordering::AcqRel);
    }
}

/// One in-flight capture buffer.
pub(crate) struct PendingCaptureBuffer {
    /// First frame of the region within the payload buffer.
    pub offset_frames: u32,
    /// Requested length in frames.
    pub num_frames: u32,
    /// Frames mixed so far; never exceeds `num_frames`.
    pub filled_frames: u32,
    /// Monotonic nanoseconds of the first mixed frame; `None` until the
    /// buffer first reaches the mixer.
    pub capture_timestamp: Option<i64>,
    /// Set when this buffer is not timeline-continuous with its
    /// predecessor.
    pub discontinuous: bool,
    /// Detects a buffer flushed out from under the mixer mid-pass.
    pub sequence_number: u64,
    /// Invoked on delivery instead of the session-wide packet callback.
    pub completion: Option<CompletionCallback>,
    _slot: PoolSlot,
}

impl PendingCaptureBuffer {
    pub(crate) fn packet(&self) -> CapturePacket {
        CapturePacket {
            offset_frames: self.offset_frames,
            num_frames: self.filled_frames,
            timestamp: self.capture_timestamp,
            discontinuous: self.discontinuous,
            sequence_number: self.sequence_number,
        }
    }
}

impl std::fmt::Debug for PendingCaptureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCaptureBuffer")
            .field("offset_frames", &self.offset_frames)
            .field("num_frames", &self.num_frames)
            .field("filled_frames", &self.filled_frames)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

/// The two ordered buffer lists plus the sequence counter.
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub pending: VecDeque<PendingCaptureBuffer>,
    pub finished: Vec<PendingCaptureBuffer>,
    next_sequence: u64,
}

impl QueueState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a new pending buffer, assigning its sequence number.
    ///
    /// Returns `(sequence_number, pending_was_empty)`; an empty-to-nonempty
    /// transition is the caller's cue to wake the mixing loop.
    pub(crate) fn push_pending(
        &mut self,
        slot: PoolSlot,
        offset_frames: u32,
        num_frames: u32,
        completion: Option<CompletionCallback>,
    ) -> (u64, bool) {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        let was_empty = self.pending.is_empty();
        self.pending.push_back(PendingCaptureBuffer {
            offset_frames,
            num_frames,
            filled_frames: 0,
            capture_timestamp: None,
            discontinuous: false,
            sequence_number,
            completion,
            _slot: slot,
        });
        (sequence_number, was_empty)
    }

    /// Takes the entire finished list for delivery. Never blocks.
    pub(crate) fn take_finished(&mut self) -> Vec<PendingCaptureBuffer> {
        std::mem::take(&mut self.finished)
    }

    /// Moves every buffer (finished first, then pending in order) into the
    /// finished list for a flush delivery.
    ///
    /// Returns `true` if anything was moved.
    pub(crate) fn flush_all_to_finished(&mut self) -> bool {
        if self.pending.is_empty() && self.finished.is_empty() {
            return false;
        }
        self.finished.extend(self.pending.drain(..));
        true
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.finished.is_empty()
    }
}
