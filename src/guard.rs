//! Scoped protection of epoch-managed garbage.

use std::fmt;
use std::marker::PhantomData;

use crate::epoch::EpochManager;
use crate::thread_id;

/// Keeps the creating thread entered in its epoch slot.
///
/// While a guard is alive, nothing retired at or after the epoch it observed
/// can be released. Guards are re-entrant: nested guards on the same thread
/// keep the outermost observation pinned. A guard must be dropped on the
/// thread that created it, so it is neither `Send` nor `Sync`.
#[must_use]
pub struct EpochGuard<'a> {
    manager: &'a EpochManager,
    id: usize,
    _not_send: PhantomData<*mut ()>,
}

impl<'a> EpochGuard<'a> {
    pub(crate) fn new(manager: &'a EpochManager) -> Self {
        let id = thread_id::current_thread_id();
        manager.enter(id);
        Self {
            manager,
            id,
            _not_send: PhantomData,
        }
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.manager.leave(self.id);
    }
}

impl fmt::Debug for EpochGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("EpochGuard { .. }")
    }
}
