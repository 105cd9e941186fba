//! The reclamation engine: construction and recovery, the mutator API, and
//! the driver/cleaner threads.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use log::debug;

use crate::epoch::EpochManager;
use crate::error::{Error, ErrorKind, Result};
use crate::guard::EpochGuard;
use crate::internal::{self, DurableList, ListHeader, TlsFields};
use crate::pool::{self, Oid, Pool};
use crate::target::{describe, GcTarget, GcTargets, Sealed, TargetSpec};
use crate::thread_id;
use crate::{DEFAULT_GC_THREAD_NUM, MAX_THREAD_NUM, TMP_FIELD_NUM};

struct TargetLists {
    spec: TargetSpec,
    tls_base: *mut TlsFields,
    headers: Box<[CachePadded<ListHeader>]>,
}

struct GcInner {
    pool: Pool,
    epochs: EpochManager,
    gc_interval: Duration,
    gc_thread_num: usize,
    is_running: AtomicBool,
    targets: Box<[TargetLists]>,
    index_of: HashMap<TypeId, usize>,
}

// SAFETY: the raw TLF pointers target the pool mapping, which `pool` keeps
// alive for as long as the inner state exists; all shared mutation behind
// them is synchronized by the list headers.
unsafe impl Send for GcInner {}
unsafe impl Sync for GcInner {}

/// An epoch-based garbage collector for persistent memory.
///
/// The engine owns (or creates) a pool that holds its bookkeeping: one
/// thread-local durable record per thread slot and per target, chained buffer
/// nodes of retired handles, and a root array tying it together. Opening a
/// pool that already contains bookkeeping runs recovery first, so garbage
/// that was in flight during a crash is released before any mutator runs.
///
/// `Ts` is a tuple of [`GcTarget`] profiles; [`DefaultTarget`] is always
/// available in addition.
///
/// [`DefaultTarget`]: crate::DefaultTarget
///
/// # Examples
///
/// ```no_run
/// use pmem_epoch::{DefaultTarget, EpochBasedGc};
///
/// let mut gc = EpochBasedGc::<()>::new(
///     "/mnt/pmem/my_gc",
///     1 << 26,
///     "my_layout",
///     100_000,
///     1,
/// )?;
/// gc.start_gc();
///
/// let garbage = gc.tmp_field::<DefaultTarget>(0)?;
/// // ... allocate into `garbage`, publish, unlink, then:
/// unsafe { gc.add_garbage::<DefaultTarget>(garbage)? };
/// # Ok::<(), pmem_epoch::Error>(())
/// ```
pub struct EpochBasedGc<Ts: GcTargets = ()> {
    inner: Arc<GcInner>,
    gc_thread: Option<JoinHandle<()>>,
    _marker: PhantomData<Ts>,
}

impl<Ts: GcTargets> EpochBasedGc<Ts> {
    /// Opens (or creates) the pool at `path` and prepares the engine.
    ///
    /// Recovery runs here: every thread slot with a leftover chain is drained
    /// before any list header is handed out. Garbage collection itself does
    /// not start until [`start_gc`](Self::start_gc).
    pub fn new(
        path: impl AsRef<Path>,
        pool_size: usize,
        layout: &str,
        gc_interval_micro: u64,
        gc_thread_num: usize,
    ) -> Result<Self> {
        let pool = Pool::open_or_create(path, layout, pool_size)?;

        let mut descriptors = vec![describe::<crate::DefaultTarget>()];
        Ts::descriptors(&mut descriptors);

        let root = pool.root(descriptors.len() * mem::size_of::<Oid>())?;
        let root_base = pool::direct(root).cast::<Oid>();

        let mut index_of = HashMap::with_capacity(descriptors.len());
        let mut targets = Vec::with_capacity(descriptors.len());
        for (pos, descriptor) in descriptors.iter().enumerate() {
            if index_of.insert(descriptor.type_id, pos).is_some() {
                return Err(Error::new(ErrorKind::InvalidArgument)
                    .with_message("duplicate GC target type"));
            }

            // SAFETY: `root_base` addresses `descriptors.len()` slots and the
            // engine is not shared until construction finishes.
            unsafe {
                let root_slot = root_base.add(pos);
                if (*root_slot).is_null() {
                    pool.zalloc(
                        root_slot,
                        (MAX_THREAD_NUM + 1) * mem::size_of::<TlsFields>(),
                    )?;
                }
                let tls_base = pool::direct(*root_slot).cast::<TlsFields>();

                let mut recovered = 0;
                for i in 0..MAX_THREAD_NUM {
                    let tls = tls_base.add(i);
                    if !(*tls).head.is_null() {
                        DurableList::release_all_garbages(tls);
                        recovered += 1;
                    }
                }
                if recovered > 0 {
                    debug!("recovered {recovered} leftover garbage chains for target {pos}");
                }

                let headers: Box<[CachePadded<ListHeader>]> = (0..MAX_THREAD_NUM)
                    .map(|i| {
                        let header = ListHeader::new();
                        header.set_pmem_info(pool.clone(), tls_base.add(i));
                        CachePadded::new(header)
                    })
                    .collect();
                targets.push(TargetLists {
                    spec: descriptor.spec,
                    tls_base,
                    headers,
                });
            }
        }

        Ok(Self {
            inner: Arc::new(GcInner {
                pool,
                epochs: EpochManager::new(),
                gc_interval: Duration::from_micros(gc_interval_micro),
                gc_thread_num: gc_thread_num.max(DEFAULT_GC_THREAD_NUM),
                is_running: AtomicBool::new(false),
                targets: targets.into_boxed_slice(),
                index_of,
            }),
            gc_thread: None,
            _marker: PhantomData,
        })
    }

    /// The pool this engine stores its bookkeeping in.
    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    /// Creates a guard that protects garbage retired from now on for as long
    /// as it lives.
    pub fn create_epoch_guard(&self) -> EpochGuard<'_> {
        EpochGuard::new(&self.inner.epochs)
    }

    /// The address of the calling thread's scratch slot `i` for target `X`.
    ///
    /// The slot is durable and owned by the calling thread; allocating into
    /// it keeps the allocation reachable for host-side recovery if the
    /// process dies before the object is installed anywhere.
    pub fn tmp_field<X: GcTarget>(&self, i: usize) -> Result<*mut Oid> {
        if i >= TMP_FIELD_NUM {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_message(format!("scratch index {i} out of range")));
        }
        let lists = self.target_lists::<X>()?;
        // SAFETY: the header belongs to the calling thread's slot.
        unsafe { lists.headers[thread_id::current_thread_id()].tmp_field(i) }
    }

    /// Retires the handle in the slot at `garbage` under target `X`. The slot
    /// is durably null when this returns.
    ///
    /// # Safety
    ///
    /// `garbage` must point to a valid durable slot holding a handle that has
    /// been unlinked from every shared structure, and the handle's object
    /// must stay untouched by the caller from here on.
    pub unsafe fn add_garbage<X: GcTarget>(&self, garbage: *mut Oid) -> Result<()> {
        let lists = self.target_lists::<X>()?;
        let epoch = self.inner.epochs.current_epoch();
        unsafe { lists.headers[thread_id::current_thread_id()].add_garbage(epoch, garbage) }
    }

    /// Stores a reusable page for target `X` into `out_page` if one exists;
    /// leaves it untouched otherwise.
    ///
    /// Only valid for targets with `REUSE_PAGES`; the returned page's
    /// finalizer has already run and the caller durably owns it.
    ///
    /// # Safety
    ///
    /// `out_page` must point to a valid, null slot.
    pub unsafe fn get_page_if_possible<X: GcTarget>(&self, out_page: *mut Oid) -> Result<()> {
        let lists = self.target_lists::<X>()?;
        if !lists.spec.reuse_pages {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_message("target does not reuse pages"));
        }
        unsafe { lists.headers[thread_id::current_thread_id()].get_page_if_possible(out_page) }
    }

    /// A snapshot of every thread slot's dirty scratch slots for target `X`.
    ///
    /// The host uses this after a restart to finish or roll back allocations
    /// that were in flight when the process died.
    pub fn unreleased_fields<X: GcTarget>(&self) -> Result<Vec<[*mut Oid; TMP_FIELD_NUM]>> {
        let lists = self.target_lists::<X>()?;
        let mut out = Vec::new();
        for i in 0..MAX_THREAD_NUM {
            // SAFETY: the TLF array stays mapped for the engine's lifetime.
            if let Some(fields) = unsafe { internal::remaining_fields(lists.tls_base.add(i)) } {
                out.push(fields);
            }
        }
        Ok(out)
    }

    /// Starts the driver and cleaner threads.
    ///
    /// Returns `false` if collection was already running.
    pub fn start_gc(&mut self) -> bool {
        if self.inner.is_running.load(Ordering::Relaxed) {
            return false;
        }
        self.inner.is_running.store(true, Ordering::Relaxed);
        debug!(
            "starting gc: interval {:?}, {} cleaner(s)",
            self.inner.gc_interval, self.inner.gc_thread_num
        );
        let inner = Arc::clone(&self.inner);
        self.gc_thread = Some(thread::spawn(move || run_gc(inner)));
        true
    }

    /// Stops collection, joins the driver and cleaners, and force-drains
    /// every chain.
    ///
    /// Returns `false` if collection was not running.
    pub fn stop_gc(&mut self) -> bool {
        if !self.inner.is_running.load(Ordering::Relaxed) {
            return false;
        }
        self.inner.is_running.store(false, Ordering::Relaxed);
        if let Some(gc_thread) = self.gc_thread.take() {
            let _ = gc_thread.join();
        }
        self.destroy_garbage_lists();
        debug!("stopped gc");
        true
    }

    fn target_lists<X: GcTarget>(&self) -> Result<&TargetLists> {
        let index = self
            .inner
            .index_of
            .get(&TypeId::of::<X>())
            .copied()
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidArgument).with_message("unregistered GC target")
            })?;
        Ok(&self.inner.targets[index])
    }

    fn destroy_garbage_lists(&self) {
        for target in self.inner.targets.iter() {
            for header in target.headers.iter() {
                header.drain(&target.spec);
            }
        }
    }
}

#[cfg(test)]
impl<Ts: GcTargets> EpochBasedGc<Ts> {
    /// Tears the engine down without draining anything, as if the process had
    /// died: the pool closes with every chain still in place and the volatile
    /// halves are leaked.
    pub(crate) fn simulate_crash(self) {
        assert!(!self.inner.is_running.load(Ordering::Relaxed));
        let mut this = mem::ManuallyDrop::new(self);
        // SAFETY: the fields are read out exactly once and `Drop` never runs.
        unsafe {
            std::ptr::drop_in_place(&mut this.gc_thread);
            drop(std::ptr::read(&this.inner));
        }
    }
}

impl<Ts: GcTargets> Drop for EpochBasedGc<Ts> {
    /// Stops collection if it is running and force-drains any remaining
    /// garbage. The pool root and the thread-local records stay allocated:
    /// they belong to the pool, not to this engine instance.
    fn drop(&mut self) {
        self.stop_gc();
        self.destroy_garbage_lists();
    }
}

impl<Ts: GcTargets> fmt::Debug for EpochBasedGc<Ts> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("EpochBasedGc { .. }")
    }
}

fn run_gc(inner: Arc<GcInner>) {
    let mut cleaners = Vec::with_capacity(inner.gc_thread_num);
    for _ in 0..inner.gc_thread_num {
        let inner = Arc::clone(&inner);
        cleaners.push(thread::spawn(move || {
            let mut wake = Instant::now() + inner.gc_interval;
            while inner.is_running.load(Ordering::Relaxed) {
                let protected_epoch = inner.epochs.min_epoch();
                for target in inner.targets.iter() {
                    for header in target.headers.iter() {
                        header.clear_garbage(protected_epoch, &target.spec);
                    }
                }
                sleep_until(wake);
                wake += inner.gc_interval;
            }
        }));
    }

    // Manage the global epoch.
    let mut wake = Instant::now() + inner.gc_interval;
    while inner.is_running.load(Ordering::Relaxed) {
        sleep_until(wake);
        wake += inner.gc_interval;
        inner.epochs.forward_global_epoch();
    }

    for cleaner in cleaners {
        let _ = cleaner.join();
    }
}

fn sleep_until(wake: Instant) {
    let now = Instant::now();
    if wake > now {
        thread::sleep(wake - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::direct;
    use crate::DefaultTarget;
    use crossbeam_utils::thread as cb_thread;
    use rand::Rng;
    use std::ptr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Mutex, Weak};

    const THREAD_NUM: usize = 4;
    const GARBAGE_NUM_LARGE: usize = 100_000;
    const GARBAGE_NUM_SMALL: usize = 10_000;
    const GC_INTERVAL_MICRO: u64 = 1_000;
    const POOL_SIZE: usize = 64 << 20;
    const LAYOUT: &str = "gc_on_pmem_test";

    struct SharedPtrTarget;
    impl GcTarget for SharedPtrTarget {
        type Garbage = Arc<u64>;
        const REUSE_PAGES: bool = true;
    }

    type Gc = EpochBasedGc<(SharedPtrTarget,)>;

    struct Fixture {
        dir: tempfile::TempDir,
        data_pool: Pool,
        gc: Option<Gc>,
        allocs: AtomicUsize,
    }

    fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let data_pool = Pool::create(dir.path().join("data"), "gc_test_data", POOL_SIZE).unwrap();
        let mut gc = Gc::new(
            dir.path().join("gc"),
            POOL_SIZE,
            LAYOUT,
            GC_INTERVAL_MICRO,
            THREAD_NUM,
        )
        .unwrap();
        gc.start_gc();
        Fixture {
            dir,
            data_pool,
            gc: Some(gc),
            allocs: AtomicUsize::new(0),
        }
    }

    fn add_garbage(fixture: &Fixture, garbage_num: usize) -> Vec<Weak<u64>> {
        let gc = fixture.gc.as_ref().unwrap();
        let mut references = Vec::with_capacity(garbage_num);
        unsafe {
            let garbage = gc.tmp_field::<SharedPtrTarget>(0).unwrap();
            for _ in 0..garbage_num {
                gc.get_page_if_possible::<SharedPtrTarget>(garbage).unwrap();
                if (*garbage).is_null() {
                    fixture
                        .data_pool
                        .alloc(garbage, mem::size_of::<Arc<u64>>())
                        .unwrap();
                    fixture.allocs.fetch_add(1, Ordering::Relaxed);
                }
                let shared = Arc::new(0u64);
                references.push(Arc::downgrade(&shared));
                ptr::write(direct(*garbage).cast::<Arc<u64>>(), shared);
                gc.add_garbage::<SharedPtrTarget>(garbage).unwrap();
            }
        }
        references
    }

    fn test_gc(fixture: &Fixture, thread_num: usize, garbage_num: usize) -> Vec<Weak<u64>> {
        cb_thread::scope(|scope| {
            let handles: Vec<_> = (0..thread_num)
                .map(|_| scope.spawn(move |_| add_garbage(fixture, garbage_num)))
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        })
        .unwrap()
    }

    fn assert_all_expired(references: &[Weak<u64>]) {
        for reference in references {
            assert_eq!(reference.strong_count(), 0);
        }
    }

    fn verify_destructor(thread_num: usize) {
        let mut fixture = setup();
        let references = test_gc(&fixture, thread_num, GARBAGE_NUM_LARGE);

        // The destructor waits for everything to be freed.
        fixture.gc = None;

        assert_all_expired(&references);
        assert_eq!(fixture.data_pool.allocated_objects(), 0);
    }

    fn verify_stop_gc(thread_num: usize) {
        let mut fixture = setup();
        let references = test_gc(&fixture, thread_num, GARBAGE_NUM_LARGE);

        assert!(fixture.gc.as_mut().unwrap().stop_gc());

        assert_all_expired(&references);
        assert_eq!(fixture.data_pool.allocated_objects(), 0);
    }

    fn verify_epoch_guard(thread_num: usize) {
        let mut fixture = setup();
        let ready = AtomicBool::new(false);
        let release = AtomicBool::new(false);

        let fixture_ref = &fixture;
        let ready_ref = &ready;
        let release_ref = &release;
        let references = cb_thread::scope(|scope| {
            scope.spawn(move |_| {
                let _guard = fixture_ref.gc.as_ref().unwrap().create_epoch_guard();
                ready_ref.store(true, Ordering::SeqCst);
                while !release_ref.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            });
            while !ready.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }

            let references = test_gc(fixture_ref, thread_num, GARBAGE_NUM_LARGE);

            // Nothing retired while the guard lives may be freed.
            for reference in &references {
                assert!(reference.strong_count() > 0);
            }

            release.store(true, Ordering::SeqCst);
            references
        })
        .unwrap();

        assert!(fixture.gc.as_mut().unwrap().stop_gc());
        assert_all_expired(&references);
        assert_eq!(fixture.data_pool.allocated_objects(), 0);
    }

    #[test]
    fn destructor_with_single_thread_releases_all_garbage() {
        verify_destructor(1);
    }

    #[test]
    fn destructor_with_multi_threads_releases_all_garbage() {
        verify_destructor(THREAD_NUM);
    }

    #[test]
    fn stop_gc_with_single_thread_releases_all_garbage() {
        verify_stop_gc(1);
    }

    #[test]
    fn stop_gc_with_multi_threads_releases_all_garbage() {
        verify_stop_gc(THREAD_NUM);
    }

    #[test]
    fn epoch_guard_with_single_thread_protects_garbage() {
        verify_epoch_guard(1);
    }

    #[test]
    fn epoch_guard_with_multi_threads_protects_garbage() {
        verify_epoch_guard(THREAD_NUM);
    }

    #[test]
    fn reuse_page_if_possible_with_multi_threads_releases_pages_only_once() {
        let mut fixture = setup();
        let slots: Vec<Mutex<Oid>> = (0..THREAD_NUM).map(|_| Mutex::new(Oid::NULL)).collect();

        // Bind this thread's header up front, so the leftover pass below does
        // not land on a slot recycled from one of the workers.
        let _ = fixture
            .gc
            .as_ref()
            .unwrap()
            .tmp_field::<SharedPtrTarget>(0)
            .unwrap();

        let fixture_ref = &fixture;
        let slots_ref = &slots;
        let references: Vec<Weak<u64>> = cb_thread::scope(|scope| {
            let fixture = fixture_ref;
            let slots = slots_ref;
            let handles: Vec<_> = (0..THREAD_NUM)
                .map(|_| {
                    scope.spawn(move |_| {
                        let gc = fixture.gc.as_ref().unwrap();
                        let mut rng = rand::thread_rng();
                        let mut references = Vec::with_capacity(GARBAGE_NUM_LARGE);
                        unsafe {
                            let garbage = gc.tmp_field::<SharedPtrTarget>(0).unwrap();
                            for i in 0..GARBAGE_NUM_LARGE {
                                let _guard = gc.create_epoch_guard();

                                // Prepare a page for embedding.
                                gc.get_page_if_possible::<SharedPtrTarget>(garbage).unwrap();
                                if (*garbage).is_null() {
                                    fixture
                                        .data_pool
                                        .alloc(garbage, mem::size_of::<Arc<u64>>())
                                        .unwrap();
                                    fixture.allocs.fetch_add(1, Ordering::Relaxed);
                                }
                                let shared = Arc::new(i as u64);
                                references.push(Arc::downgrade(&shared));
                                ptr::write(direct(*garbage).cast::<Arc<u64>>(), shared);

                                // Embed the page, taking out the previous
                                // occupant.
                                {
                                    let mut slot =
                                        slots[rng.gen_range(0..slots.len())].lock().unwrap();
                                    let old = *slot;
                                    *slot = *garbage;
                                    *garbage = old;
                                }

                                if !(*garbage).is_null() {
                                    gc.add_garbage::<SharedPtrTarget>(garbage).unwrap();
                                }
                            }
                        }
                        references
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        })
        .unwrap();

        // Retire the pages still embedded in the shared array.
        {
            let gc = fixture.gc.as_ref().unwrap();
            for slot in &slots {
                let mut oid = slot.lock().unwrap();
                if !oid.is_null() {
                    unsafe { gc.add_garbage::<SharedPtrTarget>(&mut *oid).unwrap() };
                }
            }
        }

        assert!(fixture.gc.as_mut().unwrap().stop_gc());
        assert_all_expired(&references);
        assert_eq!(fixture.data_pool.allocated_objects(), 0);

        // Reuse must keep the allocator traffic well below one call per
        // iteration.
        let total = THREAD_NUM * GARBAGE_NUM_LARGE;
        assert!(fixture.allocs.load(Ordering::Relaxed) < total);
    }

    #[test]
    fn run_gc_multiple_times_with_same_pool() {
        let mut fixture = setup();
        for _ in 0..2 {
            let references = test_gc(&fixture, THREAD_NUM, GARBAGE_NUM_SMALL);
            fixture.gc = None;
            assert_all_expired(&references);
            assert_eq!(fixture.data_pool.allocated_objects(), 0);

            // Reuse the same pool file for the next engine.
            let mut gc = Gc::new(
                fixture.dir.path().join("gc"),
                POOL_SIZE,
                LAYOUT,
                GC_INTERVAL_MICRO,
                THREAD_NUM,
            )
            .unwrap();
            gc.start_gc();
            fixture.gc = Some(gc);
        }
    }

    #[test]
    fn default_target_releases_without_finalizers() {
        let dir = tempfile::tempdir().unwrap();
        let data_pool = Pool::create(dir.path().join("data"), "gc_test_data", POOL_SIZE).unwrap();
        let mut gc = EpochBasedGc::<()>::new(
            dir.path().join("gc"),
            POOL_SIZE,
            LAYOUT,
            GC_INTERVAL_MICRO,
            1,
        )
        .unwrap();
        gc.start_gc();

        unsafe {
            let garbage = gc.tmp_field::<DefaultTarget>(0).unwrap();
            for _ in 0..GARBAGE_NUM_SMALL {
                data_pool.alloc(garbage, 24).unwrap();
                gc.add_garbage::<DefaultTarget>(garbage).unwrap();
            }
        }

        assert!(gc.stop_gc());
        assert_eq!(data_pool.allocated_objects(), 0);
    }

    #[test]
    fn unreleased_fields_report_dirty_scratch_slots() {
        let fixture = setup();
        let gc = fixture.gc.as_ref().unwrap();

        assert!(gc.unreleased_fields::<SharedPtrTarget>().unwrap().is_empty());

        let garbage = gc.tmp_field::<SharedPtrTarget>(3).unwrap();
        unsafe { fixture.data_pool.alloc(garbage, 16).unwrap() };

        let dirty = gc.unreleased_fields::<SharedPtrTarget>().unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0][3], garbage);

        unsafe { pool::free(garbage) };
        assert!(gc.unreleased_fields::<SharedPtrTarget>().unwrap().is_empty());
    }

    #[test]
    fn invalid_arguments_are_reported() {
        let fixture = setup();
        let gc = fixture.gc.as_ref().unwrap();

        let err = gc.tmp_field::<SharedPtrTarget>(TMP_FIELD_NUM).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // DefaultTarget never reuses pages.
        let mut out = Oid::NULL;
        let err = unsafe { gc.get_page_if_possible::<DefaultTarget>(&mut out) }.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // A target the engine was not built over is rejected.
        struct Unregistered;
        impl GcTarget for Unregistered {
            type Garbage = ();
            const REUSE_PAGES: bool = false;
        }
        let err = gc.tmp_field::<Unregistered>(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let mut fixture = setup();
        let gc = fixture.gc.as_mut().unwrap();
        // setup() already started collection.
        assert!(!gc.start_gc());
        assert!(gc.stop_gc());
        assert!(!gc.stop_gc());
        assert!(gc.start_gc());
    }

    #[test]
    fn recovery_releases_garbage_left_by_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("data");
        let gc_path = dir.path().join("gc");
        let data_pool = Pool::create(&data_path, "gc_test_data", POOL_SIZE).unwrap();

        // Retire a few nodes' worth of garbage, then "crash": tear the pool
        // down with the chains still in place.
        {
            let gc = Gc::new(&gc_path, POOL_SIZE, LAYOUT, GC_INTERVAL_MICRO, 1).unwrap();
            unsafe {
                let garbage = gc.tmp_field::<SharedPtrTarget>(0).unwrap();
                for _ in 0..crate::BUFFER_SIZE * 4 {
                    data_pool.alloc(garbage, 16).unwrap();
                    gc.add_garbage::<SharedPtrTarget>(garbage).unwrap();
                }
            }
            assert_eq!(
                data_pool.allocated_objects(),
                (crate::BUFFER_SIZE * 4) as u64
            );
            gc.simulate_crash();
        }

        // Reopening the pool runs recovery before anything else.
        let gc = Gc::new(&gc_path, POOL_SIZE, LAYOUT, GC_INTERVAL_MICRO, 1).unwrap();
        assert_eq!(data_pool.allocated_objects(), 0);

        // Mutator operations proceed normally afterwards.
        unsafe {
            let garbage = gc.tmp_field::<SharedPtrTarget>(0).unwrap();
            data_pool.alloc(garbage, 16).unwrap();
            gc.add_garbage::<SharedPtrTarget>(garbage).unwrap();
        }
        drop(gc);
        assert_eq!(data_pool.allocated_objects(), 0);
    }
}
