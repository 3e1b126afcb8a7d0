//! Prioritized interrupt queue.
//!
//! Devices enqueue (level, vector) pairs from whatever thread completes
//! their I/O; the CPU drains the queue at instruction boundaries when the
//! PSW priority permits. Entries are unique per (level, vector) and
//! dispatch within a level is FIFO by insertion.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

/// Shared handle to the interrupt queue.
///
/// Cloning is cheap; every clone refers to the same queue. Device
/// threads hold a clone for enqueueing, the CPU holds one for draining.
#[derive(Debug, Clone, Default)]
pub struct InterruptQueue {
    inner: Arc<Mutex<BTreeMap<u8, VecDeque<u16>>>>,
}

impl InterruptQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an interrupt at `level` (1-7) with the given vector.
    ///
    /// A (level, vector) pair that is already pending is not queued
    /// again: interrupts are edge-triggered.
    pub fn queue(&self, level: u8, vector: u16) {
        let mut levels = self.lock();
        let pending = levels.entry(level & 7).or_default();
        if !pending.contains(&vector) {
            pending.push_back(vector);
        }
    }

    /// Pop the next dispatchable vector: the highest level strictly above
    /// `spl`, FIFO within the level.
    pub fn take_pending(&self, spl: u16) -> Option<(u8, u16)> {
        let mut levels = self.lock();
        let level = *levels
            .keys()
            .next_back()
            .filter(|&&level| u16::from(level) > spl)?;
        let pending = levels.get_mut(&level)?;
        let vector = pending.pop_front()?;
        if pending.is_empty() {
            levels.remove(&level);
        }
        Some((level, vector))
    }

    /// Is any interrupt above `spl` pending?
    #[must_use]
    pub fn pending_above(&self, spl: u16) -> bool {
        self.lock()
            .keys()
            .next_back()
            .is_some_and(|&level| u16::from(level) > spl)
    }

    /// Drop every queued interrupt (bus reset).
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u8, VecDeque<u16>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
