//! Dense thread identifiers with liveness tokens.
//!
//! Every thread that touches the collector claims one slot in
//! `0..MAX_THREAD_NUM` on first use and holds it until the thread exits. A
//! slot's liveness is an `Arc` token kept in thread-local storage; the `Weak`
//! handle returned by [`heartbeat`] expires exactly when the owning thread is
//! gone, which lets cleaners reclaim the whole chain of a dead thread. Each
//! claim also gets a process-unique generation so that a list header bound by
//! a previous holder of the same ID can tell the difference.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::MAX_THREAD_NUM;

struct Slot {
    token: Mutex<Weak<()>>,
}

fn slots() -> &'static [Slot] {
    static SLOTS: OnceLock<Vec<Slot>> = OnceLock::new();
    SLOTS.get_or_init(|| {
        (0..MAX_THREAD_NUM)
            .map(|_| Slot {
                token: Mutex::new(Weak::new()),
            })
            .collect()
    })
}

struct LocalId {
    id: usize,
    generation: u64,
    // Keeps the heartbeat alive until the thread exits.
    token: Arc<()>,
}

thread_local! {
    static LOCAL_ID: RefCell<Option<LocalId>> = const { RefCell::new(None) };
}

fn claim() -> LocalId {
    static GENERATION: AtomicU64 = AtomicU64::new(1);
    for (id, slot) in slots().iter().enumerate() {
        let mut token = slot.token.lock().unwrap();
        if token.strong_count() == 0 {
            let alive = Arc::new(());
            *token = Arc::downgrade(&alive);
            return LocalId {
                id,
                generation: GENERATION.fetch_add(1, Ordering::Relaxed),
                token: alive,
            };
        }
    }
    panic!("thread capacity exhausted: more than {MAX_THREAD_NUM} live threads");
}

fn with_local<R>(f: impl FnOnce(&LocalId) -> R) -> R {
    LOCAL_ID.with(|cell| {
        let mut local = cell.borrow_mut();
        let local = local.get_or_insert_with(claim);
        f(local)
    })
}

/// The dense identifier of the current thread.
pub(crate) fn current_thread_id() -> usize {
    with_local(|local| local.id)
}

/// The generation under which the current thread claimed its identifier.
/// Never zero, and never repeated across claims.
pub(crate) fn current_generation() -> u64 {
    with_local(|local| local.generation)
}

/// A liveness handle for the current thread; expires when the thread exits.
pub(crate) fn heartbeat() -> Weak<()> {
    with_local(|local| Arc::downgrade(&local.token))
}
