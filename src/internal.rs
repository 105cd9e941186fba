//! The per-thread garbage machinery: durable/volatile buffer nodes, the
//! crash-consistent chain operations, recovery, and the list header.
//!
//! # Buffer nodes
//!
//! Retired handles accumulate in fixed-capacity buffer nodes that are split
//! in two. The *durable half* ([`DurableList`]) lives in the pool and holds
//! the retired handles plus the `next`/`tmp` links that keep the chain
//! reachable across crashes. The *volatile half* ([`VolatileList`]) lives on
//! the heap and holds the indices and epoch stamps that change on every
//! operation; it is rebuilt from scratch when a thread binds after a restart,
//! so it is never persisted. The durable half owns its volatile half through
//! a boxed back-pointer, and both are torn down together when a node is
//! popped.
//!
//! # Index discipline
//!
//! Within a node, `begin <= mid <= end` partitions the slots: `[0, begin)`
//! have been released, `[begin, mid)` are destructed pages awaiting reuse,
//! and `[mid, end)` are pending garbage. Only the owning mutator advances
//! `end`; only collectors advance `mid`; `begin` is advanced by the reuse
//! path in the head node and by collectors elsewhere.
//!
//! # Crash consistency
//!
//! Every durable mutation that changes reachability is followed by a persist
//! of exactly the affected cache line, and the two-word swap in
//! [`DurableList::exchange_head`] leaves enough state behind for
//! [`DurableList::release_all_garbages`] to finish or undo it: a `tmp` slot
//! equal to its `head`/`next` partner means the swing never landed, any other
//! non-null `tmp` is an unfinished free.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr::{self, addr_of, addr_of_mut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, Weak};

use crossbeam_utils::Backoff;

use crate::error::Result;
use crate::pool::{self, Oid, Pool};
use crate::target::TargetSpec;
use crate::thread_id;
use crate::{BUFFER_SIZE, TMP_FIELD_NUM};

/// Set on a volatile `next` word once the reuse consumer has taken the
/// hand-off for that node.
const USED_BIT: usize = 1 << 63;

/// The per-thread durable root: scratch slots for allocation-in-flight
/// safety, the chain head, and the swap scratch.
///
/// `head` and `tmp_head` are adjacent so a single persist covers the
/// head-swing in [`DurableList::exchange_head`]; the trailing pad keeps that
/// property for every entry of a densely packed TLF array.
#[repr(C)]
pub(crate) struct TlsFields {
    pub(crate) tmp_oids: [Oid; TMP_FIELD_NUM],
    pub(crate) head: Oid,
    pub(crate) tmp_head: Oid,
    _pad: [u64; 2],
}

const _: () = assert!(mem::size_of::<TlsFields>() == 256);

impl TlsFields {
    /// Whether any scratch slot holds exactly this handle. Recovery uses this
    /// to avoid freeing an allocation the owning thread still holds in a
    /// scratch slot.
    pub(crate) fn has_same_oid(&self, oid: Oid) -> bool {
        self.tmp_oids.iter().any(|tmp| *tmp == oid)
    }
}

/// Collects the non-null scratch slots of one TLF, or `None` if all are
/// clean.
///
/// # Safety
///
/// `tls` must point to a mapped `TlsFields` record.
pub(crate) unsafe fn remaining_fields(tls: *mut TlsFields) -> Option<[*mut Oid; TMP_FIELD_NUM]> {
    let mut dirty = false;
    let mut out = [ptr::null_mut(); TMP_FIELD_NUM];
    for (i, slot) in out.iter_mut().enumerate() {
        // SAFETY: per the contract, `tls` is valid for reads.
        let field = unsafe { addr_of_mut!((*tls).tmp_oids[i]) };
        if unsafe { !(*field).is_null() } {
            *slot = field;
            dirty = true;
        }
    }
    dirty.then_some(out)
}

/// The volatile half of a buffer node.
#[repr(align(64))]
pub(crate) struct VolatileList {
    /// First slot that has not been released.
    begin: AtomicUsize,
    /// First slot that has not been destructed.
    mid: AtomicUsize,
    /// Epoch stamped on each retirement.
    epochs: [AtomicUsize; BUFFER_SIZE],
    /// One past the last retired slot.
    end: AtomicUsize,
    /// Address of the next durable node, tagged with `USED_BIT` once the
    /// reuse consumer has moved on.
    next: AtomicUsize,
}

impl VolatileList {
    fn new() -> Self {
        Self {
            begin: AtomicUsize::new(0),
            mid: AtomicUsize::new(0),
            epochs: std::array::from_fn(|_| AtomicUsize::new(0)),
            end: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn empty(&self) -> bool {
        let end = self.end.load(Ordering::Relaxed);
        end - self.begin.load(Ordering::Relaxed) == 0 && end < BUFFER_SIZE
    }
}

/// The durable half of a buffer node. All-zero bytes are a valid (empty)
/// node, so nodes come straight out of `zalloc`.
#[repr(C)]
pub(crate) struct DurableList {
    /// Back-pointer to the volatile half. Meaningless after a restart;
    /// recovery clears it before touching the node.
    dram: UnsafeCell<*mut VolatileList>,
    _pad: u64,
    next: UnsafeCell<Oid>,
    tmp: UnsafeCell<Oid>,
    slots: [UnsafeCell<Oid>; BUFFER_SIZE],
}

// With the allocator header in front, a node occupies exactly one 4 KiB
// stretch and `next`/`tmp` share the first cache line.
const _: () = assert!(mem::size_of::<DurableList>() + pool::BLOCK_HEADER_SIZE == 4096);

impl DurableList {
    pub(crate) fn dram(&self) -> *mut VolatileList {
        // SAFETY: written only by the binding thread under the header mutex
        // or by recovery before any sharing; see the field docs.
        unsafe { *self.dram.get() }
    }

    pub(crate) unsafe fn set_dram(&self, dram: *mut VolatileList) {
        unsafe { *self.dram.get() = dram }
    }

    pub(crate) fn next_ptr(&self) -> *mut Oid {
        self.next.get()
    }

    pub(crate) fn tmp_ptr(&self) -> *mut Oid {
        self.tmp.get()
    }

    /// Moves the handle at `garbage` into slot `pos`.
    ///
    /// After the call the caller's slot is durably null, so a crash cannot
    /// leave the handle reachable from two places.
    ///
    /// # Safety
    ///
    /// `pos` is owned by the calling mutator and `garbage` points to a valid
    /// slot.
    pub(crate) unsafe fn add_garbage(&self, pos: usize, garbage: *mut Oid) {
        unsafe {
            let slot = self.slots[pos].get();
            *slot = *garbage;
            pool::persist(slot, mem::size_of::<Oid>());
            (*garbage).off = 0;
            pool::persist(addr_of!((*garbage).off), mem::size_of::<u64>());
        }
    }

    /// Moves the handle in slot `pos` out to `out_page`.
    ///
    /// At every crash point exactly one of the slot and `out_page` owns the
    /// handle.
    ///
    /// # Safety
    ///
    /// `pos` holds a destructed page and `out_page` points to a valid slot.
    pub(crate) unsafe fn reuse_page(&self, pos: usize, out_page: *mut Oid) {
        unsafe {
            let slot = self.slots[pos].get();
            *out_page = *slot;
            pool::persist(out_page, mem::size_of::<Oid>());
            (*slot).off = 0;
            pool::persist(addr_of!((*slot).off), mem::size_of::<u64>());
        }
    }

    /// Returns slot `pos` to the allocator.
    ///
    /// # Safety
    ///
    /// The slot's handle must not be owned elsewhere.
    pub(crate) unsafe fn release_garbage(&self, pos: usize) {
        unsafe { pool::free(self.slots[pos].get()) }
    }

    /// Runs the finalizer on the object in slot `pos`. No durable mutation.
    ///
    /// # Safety
    ///
    /// The slot must hold a live object of the type `drop_fn` expects, and
    /// the finalizer must not have run for it since the last retirement.
    pub(crate) unsafe fn destruct_garbage(&self, pos: usize, drop_fn: unsafe fn(*mut u8)) {
        unsafe { drop_fn(pool::direct(*self.slots[pos].get())) }
    }

    /// Allocates the successor node and links it durably.
    ///
    /// # Safety
    ///
    /// Only the owning mutator may call this, and only once per node.
    pub(crate) unsafe fn create_next(&self, pool: &Pool) -> Result<*mut DurableList> {
        unsafe {
            pool.zalloc(self.next.get(), mem::size_of::<DurableList>())?;
            Ok(pool::direct(*self.next.get()).cast())
        }
    }

    /// Pops `list` off the front of a chain: copy `head` into `tmp`, swing
    /// `head` to the successor, persist both with one call, then drop the
    /// volatile half and free the node through `tmp`.
    ///
    /// # Safety
    ///
    /// `*head` must reference `list`, and `tmp` must be the slot immediately
    /// after `head` (both layouts guarantee they share a cache line).
    pub(crate) unsafe fn exchange_head(
        list: *mut DurableList,
        head: *mut Oid,
        tmp: *mut Oid,
    ) -> *mut DurableList {
        unsafe {
            let dram = (*list).dram();
            let next_off = (*(*list).next.get()).off;
            *tmp = *head;
            (*head).off = next_off;
            pool::persist(head, 2 * mem::size_of::<Oid>());
            if !dram.is_null() {
                drop(Box::from_raw(dram));
            }
            pool::free(tmp);
            pool::direct(*head).cast()
        }
    }

    /// Recovery: frees every handle still reachable from `tls` and leaves the
    /// TLF with a null head.
    ///
    /// Interrupted swaps are finished first (a `tmp` equal to its partner
    /// never landed and is nulled; any other non-null `tmp` is an unfinished
    /// free). Handles that also sit in a scratch slot are skipped: the owning
    /// thread's allocation path still owns them. No finalizers run.
    ///
    /// # Safety
    ///
    /// `tls` must point to a mapped `TlsFields` record, and no mutator may
    /// touch it until this returns.
    pub(crate) unsafe fn release_all_garbages(tls: *mut TlsFields) {
        unsafe {
            let head = addr_of_mut!((*tls).head);
            if (*head).is_null() {
                return;
            }
            let tmp_head = addr_of_mut!((*tls).tmp_head);
            if !(*tmp_head).is_null() {
                if *tmp_head == *head {
                    *tmp_head = Oid::NULL;
                    pool::persist(tmp_head, mem::size_of::<Oid>());
                } else {
                    pool::free(tmp_head);
                }
            }

            let mut buf = pool::direct(*head).cast::<DurableList>();
            loop {
                (*buf).set_dram(ptr::null_mut());
                let tmp = (*buf).tmp.get();
                if !(*tmp).is_null() {
                    if *tmp == *(*buf).next.get() {
                        *tmp = Oid::NULL;
                        pool::persist(tmp, mem::size_of::<Oid>());
                    } else {
                        pool::free(tmp);
                    }
                }
                for pos in 0..BUFFER_SIZE {
                    let slot = (*buf).slots[pos].get();
                    if (*slot).is_null() || (*tls).has_same_oid(*slot) {
                        continue;
                    }
                    pool::free(slot);
                }
                if (*(*buf).next.get()).is_null() {
                    break;
                }
                buf = Self::exchange_head(buf, head, tmp_head);
            }
            pool::free(head);
        }
    }
}

/// Destructs obsolete garbage along a chain without releasing pages, so they
/// stay available for reuse. Fully reused nodes are popped; a full node whose
/// reuse hand-off was never taken is rescued out of the reuse chain (at most
/// one candidate is tracked at a time) and released.
///
/// # Safety
///
/// Caller holds the header mutex; `list_oid`/`tmp_oid` reference the chain's
/// durable cursor as described on [`DurableList::exchange_head`].
pub(crate) unsafe fn destruct_chain(
    mut list_oid: *mut Oid,
    protected_epoch: usize,
    mut tmp_oid: *mut Oid,
    spec: &TargetSpec,
) {
    let mut reuse_head: *mut VolatileList = ptr::null_mut();
    unsafe {
        loop {
            let pmem = pool::direct(*list_oid).cast::<DurableList>();
            let dram = (*pmem).dram();

            // Destruct obsolete garbage.
            let end_pos = (*dram).end.load(Ordering::Acquire);
            let mut mid_pos = (*dram).mid.load(Ordering::Relaxed);
            while mid_pos < end_pos
                && (*dram).epochs[mid_pos].load(Ordering::Relaxed) < protected_epoch
            {
                if let Some(drop_fn) = spec.drop_fn {
                    (*pmem).destruct_garbage(mid_pos, drop_fn);
                }
                mid_pos += 1;
            }
            (*dram).mid.store(mid_pos, Ordering::Release);
            if mid_pos < BUFFER_SIZE {
                break;
            }

            // Check whether the node can be released.
            let pos = (*dram).begin.load(Ordering::Acquire);
            if pos > 0 {
                reuse_head = ptr::null_mut();
                if pos == BUFFER_SIZE {
                    DurableList::exchange_head(pmem, list_oid, tmp_oid);
                    continue;
                }
            } else {
                if !reuse_head.is_null() && (*reuse_head).begin.load(Ordering::Relaxed) == 0 {
                    let cur = (*reuse_head).next.load(Ordering::Relaxed);
                    let next = (*dram).next.load(Ordering::Relaxed);
                    if cur & USED_BIT == 0
                        && (*reuse_head)
                            .next
                            .compare_exchange(cur, next, Ordering::Release, Ordering::Relaxed)
                            .is_ok()
                    {
                        // The predecessor now skips this node in the reuse
                        // chain, so no consumer can reach it anymore.
                        for pos in pos..BUFFER_SIZE {
                            (*pmem).release_garbage(pos);
                        }
                        DurableList::exchange_head(pmem, list_oid, tmp_oid);
                        continue;
                    }
                }
                reuse_head = dram;
            }
            list_oid = (*pmem).next_ptr();
            tmp_oid = (*pmem).tmp_ptr();
        }
    }
}

/// Releases garbage along a chain unconditionally: destructed pages are
/// returned to the allocator, pending garbage below the protected epoch is
/// finalized and released, and drained nodes are popped.
///
/// # Safety
///
/// Same contract as [`destruct_chain`].
pub(crate) unsafe fn clear_chain(
    list_oid: *mut Oid,
    protected_epoch: usize,
    tmp_oid: *mut Oid,
    spec: &TargetSpec,
) {
    unsafe {
        loop {
            let pmem = pool::direct(*list_oid).cast::<DurableList>();
            let dram = (*pmem).dram();

            let mid_pos = (*dram).mid.load(Ordering::Relaxed);
            let mut pos = (*dram).begin.load(Ordering::Relaxed);
            while pos < mid_pos {
                (*pmem).release_garbage(pos);
                pos += 1;
            }
            let end_pos = (*dram).end.load(Ordering::Acquire);
            while pos < end_pos && (*dram).epochs[pos].load(Ordering::Relaxed) < protected_epoch {
                if let Some(drop_fn) = spec.drop_fn {
                    (*pmem).destruct_garbage(pos, drop_fn);
                }
                (*pmem).release_garbage(pos);
                pos += 1;
            }
            (*dram).begin.store(pos, Ordering::Relaxed);
            (*dram).mid.store(pos, Ordering::Relaxed);
            if pos < BUFFER_SIZE {
                break;
            }

            DurableList::exchange_head(pmem, list_oid, tmp_oid);
        }
    }
}

/// Binds one thread slot's chain to a live OS thread and exposes the mutator
/// and collector entry points for it.
///
/// The mutator fast path is a single acquire load of the bind generation;
/// everything structural happens under `mtx`, which collectors only
/// `try_lock`.
pub(crate) struct ListHeader {
    /// Generation of the claim this header is bound to; zero when unbound.
    bound_generation: AtomicU64,
    /// Liveness of the bound thread.
    heartbeat: UnsafeCell<Weak<()>>,
    /// Reuse cursor (dequeue side).
    cli_head: UnsafeCell<*mut DurableList>,
    /// Retire cursor (enqueue side).
    cli_tail: UnsafeCell<*mut DurableList>,
    pool: UnsafeCell<Option<Pool>>,
    tls: UnsafeCell<*mut TlsFields>,
    /// Durable cursor for collectors: the TLF's head and swap scratch.
    gc_head: UnsafeCell<*mut Oid>,
    gc_tmp: UnsafeCell<*mut Oid>,
    mtx: Mutex<()>,
}

// SAFETY: `cli_head`/`cli_tail` are accessed lock-free only by the bound
// thread; every other field is written during construction, under `mtx`, or
// (for the teardown paths) while the bound thread is provably absent. The
// raw pointers target the pool mapping, which outlives the header.
unsafe impl Send for ListHeader {}
unsafe impl Sync for ListHeader {}

impl ListHeader {
    pub(crate) fn new() -> Self {
        Self {
            bound_generation: AtomicU64::new(0),
            heartbeat: UnsafeCell::new(Weak::new()),
            cli_head: UnsafeCell::new(ptr::null_mut()),
            cli_tail: UnsafeCell::new(ptr::null_mut()),
            pool: UnsafeCell::new(None),
            tls: UnsafeCell::new(ptr::null_mut()),
            gc_head: UnsafeCell::new(ptr::null_mut()),
            gc_tmp: UnsafeCell::new(ptr::null_mut()),
            mtx: Mutex::new(()),
        }
    }

    /// Attaches the header to its pool and TLF record.
    ///
    /// # Safety
    ///
    /// Must be called before the header is shared, with `tls` pointing at a
    /// mapped `TlsFields` record that recovery has already processed.
    pub(crate) unsafe fn set_pmem_info(&self, pool: Pool, tls: *mut TlsFields) {
        unsafe {
            *self.pool.get() = Some(pool);
            *self.tls.get() = tls;
        }
    }

    unsafe fn assign_current_thread_if_needed(&self) -> Result<()> {
        if self.bound_generation.load(Ordering::Acquire) == thread_id::current_generation() {
            return Ok(());
        }

        let _bind = self.mtx.lock().unwrap();
        unsafe {
            let tls = *self.tls.get();
            let gc_head = addr_of_mut!((*tls).head);
            let gc_tmp = addr_of_mut!((*tls).tmp_head);
            *self.gc_head.get() = gc_head;
            *self.gc_tmp.get() = gc_tmp;

            if (*gc_head).is_null() {
                let pool = (*self.pool.get())
                    .as_ref()
                    .expect("list header is not attached to a pool");
                pool.zalloc(gc_head, mem::size_of::<DurableList>())?;
            }
            let tail = pool::direct(*gc_head).cast::<DurableList>();
            let stale = (*tail).dram();
            if !stale.is_null() {
                // A previous holder of this slot died before its chain
                // drained; its volatile half is ours to replace now.
                drop(Box::from_raw(stale));
            }
            (*tail).set_dram(Box::into_raw(Box::new(VolatileList::new())));
            *self.cli_tail.get() = tail;
            *self.cli_head.get() = tail;
            *self.heartbeat.get() = thread_id::heartbeat();
        }
        self.bound_generation
            .store(thread_id::current_generation(), Ordering::Release);
        Ok(())
    }

    /// The address of scratch slot `i` of the calling thread's TLF.
    ///
    /// # Safety
    ///
    /// `i < TMP_FIELD_NUM`; the caller is the thread this header serves.
    pub(crate) unsafe fn tmp_field(&self, i: usize) -> Result<*mut Oid> {
        unsafe {
            self.assign_current_thread_if_needed()?;
            let tls = *self.tls.get();
            Ok(addr_of_mut!((*tls).tmp_oids[i]))
        }
    }

    /// Appends the handle at `garbage` to the chain, stamped with `epoch`.
    /// The caller's slot is durably null on return.
    ///
    /// # Safety
    ///
    /// The caller is the thread this header serves and `garbage` points to a
    /// valid slot holding a retired handle.
    pub(crate) unsafe fn add_garbage(&self, epoch: usize, garbage: *mut Oid) -> Result<()> {
        unsafe {
            self.assign_current_thread_if_needed()?;
            let tail_slot = self.cli_tail.get();
            let pmem = *tail_slot;
            let dram = (*pmem).dram();

            let pos = (*dram).end.load(Ordering::Relaxed);
            (*dram).epochs[pos].store(epoch, Ordering::Relaxed);
            (*pmem).add_garbage(pos, garbage);
            if pos == BUFFER_SIZE - 1 {
                let pool = (*self.pool.get())
                    .as_ref()
                    .expect("list header is not attached to a pool");
                let new_tail = (*pmem).create_next(pool)?;
                (*new_tail).set_dram(Box::into_raw(Box::new(VolatileList::new())));
                (*dram).next.store(new_tail as usize, Ordering::Relaxed);
                *tail_slot = new_tail;
            }
            (*dram).end.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    /// Hands out a destructed page if one is ready, leaving `out_page`
    /// untouched otherwise.
    ///
    /// # Safety
    ///
    /// The caller is the thread this header serves and `out_page` points to a
    /// valid, null slot.
    pub(crate) unsafe fn get_page_if_possible(&self, out_page: *mut Oid) -> Result<()> {
        unsafe {
            self.assign_current_thread_if_needed()?;
            let head_slot = self.cli_head.get();
            let pmem = *head_slot;
            let dram = (*pmem).dram();

            let pos = (*dram).begin.load(Ordering::Relaxed);
            let mid_pos = (*dram).mid.load(Ordering::Acquire);
            if pos == mid_pos {
                return Ok(());
            }

            (*pmem).reuse_page(pos, out_page);
            if pos == BUFFER_SIZE - 1 {
                // Tell the collector this node's hand-off was consumed, then
                // move on to the successor.
                let backoff = Backoff::new();
                let mut next = (*dram).next.load(Ordering::Acquire);
                loop {
                    match (*dram).next.compare_exchange_weak(
                        next,
                        next | USED_BIT,
                        Ordering::Relaxed,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => {
                            next = actual;
                            backoff.snooze();
                        }
                    }
                }
                *head_slot = next as *mut DurableList;
            }
            (*dram).begin.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    /// Collector entry point: destruct or release garbage retired before
    /// `protected_epoch`, and tear the binding down once the owning thread is
    /// dead and the chain is empty.
    pub(crate) fn clear_garbage(&self, protected_epoch: usize, spec: &TargetSpec) {
        let Ok(_sweep) = self.mtx.try_lock() else {
            return;
        };
        unsafe {
            let gc_head = *self.gc_head.get();
            if gc_head.is_null() || (*gc_head).is_null() {
                return;
            }
            let gc_tmp = *self.gc_tmp.get();
            let alive = (*self.heartbeat.get()).strong_count() > 0;

            if spec.reuse_pages && alive {
                destruct_chain(gc_head, protected_epoch, gc_tmp, spec);
            } else {
                clear_chain(gc_head, protected_epoch, gc_tmp, spec);
            }

            let head = pool::direct(*gc_head).cast::<DurableList>();
            let dram = (*head).dram();
            if alive || !(*dram).empty() {
                return;
            }
            drop(Box::from_raw(dram));
            (*head).set_dram(ptr::null_mut());
            *self.cli_tail.get() = ptr::null_mut();
            *self.cli_head.get() = ptr::null_mut();
            pool::free(gc_head);
            self.bound_generation.store(0, Ordering::Release);
        }
    }

    /// Forcibly releases everything in the chain and unbinds. Used at engine
    /// teardown, when no mutator may call in anymore.
    pub(crate) fn drain(&self, spec: &TargetSpec) {
        let _sweep = self.mtx.lock().unwrap();
        unsafe {
            let gc_head = *self.gc_head.get();
            if gc_head.is_null() || (*gc_head).is_null() {
                return;
            }
            clear_chain(gc_head, usize::MAX, *self.gc_tmp.get(), spec);

            let head = pool::direct(*gc_head).cast::<DurableList>();
            let dram = (*head).dram();
            if !dram.is_null() {
                drop(Box::from_raw(dram));
                (*head).set_dram(ptr::null_mut());
            }
            *self.cli_tail.get() = ptr::null_mut();
            *self.cli_head.get() = ptr::null_mut();
            pool::free(gc_head);
            self.bound_generation.store(0, Ordering::Release);
        }
    }
}
