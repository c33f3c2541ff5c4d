//! Bounded in-flight frame list for one (pipe, channel)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;

use crate::capture::frame::{FrameShared, YuvFrameHandle};
use crate::ChannelKey;

/// A frame currently lent out to observers. Owns the hardware buffer, so
/// removing the entry is what returns it to the pipe.
#[derive(Debug)]
pub(crate) struct QueueEntry {
    pub(crate) frame: Arc<FrameShared>,
    pub(crate) handle: YuvFrameHandle,
}

impl QueueEntry {
    fn sequence(&self) -> u64 {
        self.frame.meta.sequence
    }
}

/// Outcome of [`FrameQueue::release`]
#[derive(Debug)]
pub(crate) enum Released {
    /// Entry removed; dropping it returns the hardware buffer
    Returned(QueueEntry),
    /// Multiplexed frame still referenced elsewhere
    StillReferenced(u32),
    /// No entry with that sequence (already released or cleared)
    NotFound,
}

#[derive(Default)]
struct Stats {
    frames_queued: AtomicUsize,
    frames_dropped: AtomicUsize,
    frames_released: AtomicUsize,
}

/// Point-in-time counters for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub in_flight: usize,
    pub queued: usize,
    pub dropped: usize,
    pub released: usize,
}

/// Mutex-protected list of in-flight frames.
///
/// The lock only ever covers list operations; entries leave the critical
/// section before their hardware buffer is released.
pub struct FrameQueue {
    key: ChannelKey,
    depth: usize,
    entries: Mutex<VecDeque<QueueEntry>>,
    stats: CachePadded<Stats>,
}

impl FrameQueue {
    pub fn new(key: ChannelKey, depth: usize) -> Self {
        Self {
            key,
            depth,
            entries: Mutex::new(VecDeque::with_capacity(depth)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> ChannelKey {
        self.key
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Append a new frame. When the queue is already at depth the new entry is
    /// handed back untouched (the newest frame is the one dropped).
    pub(crate) fn push(&self, entry: QueueEntry) -> Result<usize, QueueEntry> {
        let mut entries = self.lock();
        if entries.len() >= self.depth {
            drop(entries);
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(entry);
        }
        entries.push_back(entry);
        let len = entries.len();
        drop(entries);
        self.stats.frames_queued.fetch_add(1, Ordering::Relaxed);
        Ok(len)
    }

    /// Release protocol: locate the entry for `sequence`; a non-multiplexed
    /// entry, or one whose reference count drops to zero, is removed.
    pub(crate) fn release(&self, sequence: u64) -> Released {
        let mut entries = self.lock();
        let Some(pos) = entries.iter().position(|e| e.sequence() == sequence) else {
            return Released::NotFound;
        };

        let frame = &entries[pos].frame;
        if frame.multiplex {
            let remaining = frame.dec_ref();
            if remaining > 0 {
                return Released::StillReferenced(remaining);
            }
        }

        match entries.remove(pos) {
            Some(entry) => {
                drop(entries);
                self.stats.frames_released.fetch_add(1, Ordering::Relaxed);
                Released::Returned(entry)
            }
            None => Released::NotFound,
        }
    }

    /// Take every in-flight entry out of the queue
    pub(crate) fn drain(&self) -> Vec<QueueEntry> {
        let drained: Vec<_> = self.lock().drain(..).collect();
        self.stats
            .frames_released
            .fetch_add(drained.len(), Ordering::Relaxed);
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            in_flight: self.len(),
            queued: self.stats.frames_queued.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            released: self.stats.frames_released.load(Ordering::Relaxed),
        }
    }
}
