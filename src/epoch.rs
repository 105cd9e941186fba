//! The epoch manager: one global counter plus per-thread protected epochs.
//!
//! The driver thread forwards the global epoch at a fixed interval. A thread
//! that wants to read epoch-protected data enters its slot (through an
//! [`EpochGuard`](crate::EpochGuard)), publishing the epoch it observed;
//! cleaners compute the minimum over all entered slots and release only
//! garbage retired strictly before that floor.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::MAX_THREAD_NUM;

/// Marks a slot whose thread is not inside an epoch guard.
const INACTIVE_EPOCH: usize = usize::MAX;

struct EpochSlot {
    /// The epoch the owning thread observed when it entered, or
    /// `INACTIVE_EPOCH`.
    current: AtomicUsize,
    /// Re-entrancy count; touched only by the owning thread.
    entered: AtomicUsize,
}

pub(crate) struct EpochManager {
    global: CachePadded<AtomicUsize>,
    slots: Box<[CachePadded<EpochSlot>]>,
}

impl EpochManager {
    pub(crate) fn new() -> Self {
        Self {
            global: CachePadded::new(AtomicUsize::new(1)),
            slots: (0..MAX_THREAD_NUM)
                .map(|_| {
                    CachePadded::new(EpochSlot {
                        current: AtomicUsize::new(INACTIVE_EPOCH),
                        entered: AtomicUsize::new(0),
                    })
                })
                .collect(),
        }
    }

    /// Advances the global epoch. Called only by the driver thread.
    pub(crate) fn forward_global_epoch(&self) {
        self.global.fetch_add(1, Ordering::SeqCst);
    }

    /// The current global epoch; used to stamp retirements.
    pub(crate) fn current_epoch(&self) -> usize {
        self.global.load(Ordering::Acquire)
    }

    /// The protected epoch: the minimum epoch any entered thread observed,
    /// or the global epoch if no thread is entered.
    pub(crate) fn min_epoch(&self) -> usize {
        let mut min = self.global.load(Ordering::SeqCst);
        for slot in self.slots.iter() {
            let current = slot.current.load(Ordering::Acquire);
            if current < min {
                min = current;
            }
        }
        min
    }

    pub(crate) fn enter(&self, id: usize) {
        let slot = &self.slots[id];
        if slot.entered.fetch_add(1, Ordering::Relaxed) == 0 {
            slot.current
                .store(self.global.load(Ordering::SeqCst), Ordering::SeqCst);
        }
    }

    pub(crate) fn leave(&self, id: usize) {
        let slot = &self.slots[id];
        if slot.entered.fetch_sub(1, Ordering::Relaxed) == 1 {
            slot.current.store(INACTIVE_EPOCH, Ordering::Release);
        }
    }
}
