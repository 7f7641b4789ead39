//! Deferred release of transient GPU buffers.
//!
//! Staging buffers handed back by volume uploads must outlive the command
//! buffer that copies from them. The queue keeps each buffer until
//! `frames_in_flight` further frames have started, by which time the frame
//! fences guarantee the copy has retired.

use crate::error::Result;
use crate::memory::{GpuAllocator, GpuBuffer};
use multivol_core::FRAME_COUNT;
use std::collections::VecDeque;

/// A buffer pending deletion.
struct PendingDeletion {
    buffer: GpuBuffer,
    frame_queued: u64,
}

/// Queue for deferred buffer deletions.
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
    frames_in_flight: u64,
}

impl Default for DeferredDeletionQueue {
    fn default() -> Self {
        Self::new(FRAME_COUNT)
    }
}

/// Whether a buffer queued at `frame_queued` can no longer be referenced by
/// GPU work when frame `current` starts.
const fn is_retired(frame_queued: u64, current: u64, frames_in_flight: u64) -> bool {
    frame_queued + frames_in_flight <= current
}

impl DeferredDeletionQueue {
    /// Create a queue keeping buffers alive for `frames_in_flight` frames.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight: frames_in_flight as u64,
        }
    }

    /// Queue a buffer for deferred deletion.
    pub fn queue(&mut self, buffer: GpuBuffer, frame_number: u64) {
        self.pending.push_back(PendingDeletion {
            buffer,
            frame_queued: frame_number,
        });
    }

    /// Free buffers that are safe to delete at the start of `current_frame_number`.
    pub fn process(
        &mut self,
        allocator: &mut GpuAllocator,
        current_frame_number: u64,
    ) -> Result<usize> {
        let mut freed = 0;
        // Frame numbers are non-decreasing, so only the front can mature.
        while let Some(front) = self.pending.front() {
            if !is_retired(front.frame_queued, current_frame_number, self.frames_in_flight) {
                break;
            }
            if let Some(mut pending) = self.pending.pop_front() {
                allocator.free_buffer(&mut pending.buffer)?;
                freed += 1;
            }
        }
        if freed > 0 {
            tracing::debug!(freed, remaining = self.pending.len(), "released upload buffers");
        }
        Ok(freed)
    }

    /// Free everything immediately. Call only after the device is idle.
    pub fn flush(&mut self, allocator: &mut GpuAllocator) -> Result<()> {
        while let Some(mut pending) = self.pending.pop_front() {
            allocator.free_buffer(&mut pending.buffer)?;
        }
        Ok(())
    }

    /// Get the number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_survive_a_full_frame_ring() {
        let n = FRAME_COUNT as u64;
        assert!(!is_retired(10, 10, n));
        assert!(!is_retired(10, 10 + n - 1, n));
        assert!(is_retired(10, 10 + n, n));
    }

    #[test]
    fn empty_queue_has_nothing_pending() {
        let queue = DeferredDeletionQueue::default();
        assert_eq!(queue.pending_count(), 0);
    }
}
