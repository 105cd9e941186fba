//! File-backed persistent object pools and durable object handles.
//!
//! A pool is a memory-mapped file holding a fixed header page followed by a
//! heap of blocks. Objects are addressed by [`Oid`] handles (pool UUID plus
//! byte offset) that stay valid across process restarts; [`direct`] resolves
//! a handle to a mapped address through a process-global registry of open
//! pools, so handles work regardless of which pool they were allocated from.
//!
//! Allocation and free both go through a caller-provided *durable slot*: an
//! `Oid` field that lives in persistent memory (or, for transient callers, in
//! DRAM). [`Pool::alloc`] commits the block before writing the slot, and
//! [`free`] nulls the slot before recycling the block, so a crash at any
//! point can leak a block but can never double-free one or leave a slot
//! pointing at recycled storage.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::{self, addr_of};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, ErrorKind, Result};

/// The smallest pool a [`Pool::create`] call accepts.
pub const MIN_POOL_SIZE: usize = 1 << 20;

/// Bytes the allocator prepends to every block.
pub(crate) const BLOCK_HEADER_SIZE: usize = 16;

const POOL_MAGIC: [u8; 8] = *b"PMEPOCH\0";
const POOL_VERSION: u32 = 1;
const POOL_HEADER_SIZE: usize = 4096;
const LAYOUT_LEN: usize = 64;
const BLOCK_ALIGN: u64 = 16;

const BLOCK_FREE: u64 = 0;
const BLOCK_LIVE: u64 = 1;
const BLOCK_ROOT: u64 = 2;

/// A durable reference to a block of persistent memory.
///
/// The null handle has a zero offset; [`Oid::is_null`] is the only state a
/// caller can observe without an open pool. Handles compare equal only when
/// both the pool UUID and the offset match.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct Oid {
    pub(crate) pool_uuid: u64,
    pub(crate) off: u64,
}

impl Oid {
    /// The null handle.
    pub const NULL: Oid = Oid {
        pool_uuid: 0,
        off: 0,
    };

    /// Returns `true` if this handle does not refer to a block.
    #[inline]
    pub fn is_null(self) -> bool {
        self.off == 0
    }
}

#[repr(C)]
struct PoolHeader {
    magic: [u8; 8],
    version: u32,
    _reserved: u32,
    uuid: u64,
    capacity: u64,
    heap_top: u64,
    root: Oid,
    layout: [u8; LAYOUT_LEN],
}

#[repr(C)]
struct BlockHeader {
    size: u64,
    state: u64,
}

struct Heap {
    top: u64,
    // Rounded block size -> block offsets, rebuilt from a header scan on open.
    free: HashMap<u64, Vec<u64>>,
}

struct PoolInner {
    file: File,
    mmap: MmapMut,
    base: *mut u8,
    len: usize,
    uuid: u64,
    path: PathBuf,
    heap: Mutex<Heap>,
    live: AtomicU64,
}

// SAFETY: the mapping is owned by this struct for its whole lifetime and all
// mutation of shared offsets goes through `heap`'s mutex or through the
// single-writer disciplines documented by the callers in `internal`.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

/// An open persistent memory pool.
///
/// Cloning a `Pool` is cheap and shares the underlying mapping; the file is
/// unmapped and unlocked when the last clone drops.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("path", &self.inner.path)
            .field("uuid", &format_args!("{:#x}", self.inner.uuid))
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Creates a new pool file of `size` bytes tagged with `layout`.
    ///
    /// Fails with [`ErrorKind::PoolUnavailable`] if the file already exists,
    /// cannot be locked, or cannot be mapped.
    pub fn create(path: impl AsRef<Path>, layout: &str, size: usize) -> Result<Pool> {
        let path = path.as_ref();
        if size < MIN_POOL_SIZE {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_message(format!("pool size must be at least {MIN_POOL_SIZE} bytes")));
        }
        let layout = encode_layout(layout)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| pool_io_error(e, path))?;
        file.set_len(size as u64)
            .map_err(|e| pool_io_error(e, path))?;
        lock_pool_file(&file, path)?;
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| pool_io_error(e, path))?;
        let base = mmap.as_mut_ptr();

        let uuid = new_uuid();
        let header = PoolHeader {
            magic: POOL_MAGIC,
            version: POOL_VERSION,
            _reserved: 0,
            uuid,
            capacity: size as u64,
            heap_top: POOL_HEADER_SIZE as u64,
            root: Oid::NULL,
            layout,
        };
        // SAFETY: the mapping is at least MIN_POOL_SIZE bytes long.
        unsafe { ptr::write(base.cast::<PoolHeader>(), header) };
        persist(base, POOL_HEADER_SIZE);

        debug!("created pool {} ({} bytes)", path.display(), size);
        Ok(Self::register(PoolInner {
            file,
            mmap,
            base,
            len: size,
            uuid,
            path: path.to_path_buf(),
            heap: Mutex::new(Heap {
                top: POOL_HEADER_SIZE as u64,
                free: HashMap::new(),
            }),
            live: AtomicU64::new(0),
        }))
    }

    /// Opens an existing pool file, validating its header against `layout`.
    ///
    /// The block headers are scanned to rebuild the volatile free lists and
    /// the live-object count; a malformed heap reports
    /// [`ErrorKind::RecoveryCorrupt`].
    pub fn open(path: impl AsRef<Path>, layout: &str) -> Result<Pool> {
        let path = path.as_ref();
        let layout = encode_layout(layout)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| pool_io_error(e, path))?;
        let len = file
            .metadata()
            .map_err(|e| pool_io_error(e, path))?
            .len() as usize;
        if len < POOL_HEADER_SIZE {
            return Err(corrupt("pool file shorter than its header", path));
        }
        lock_pool_file(&file, path)?;
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| pool_io_error(e, path))?;
        let base = mmap.as_mut_ptr();

        // SAFETY: the mapping covers at least the header page.
        let header = unsafe { &*base.cast::<PoolHeader>() };
        if header.magic != POOL_MAGIC {
            return Err(corrupt("bad pool magic", path));
        }
        if header.version != POOL_VERSION {
            return Err(corrupt("unsupported pool version", path));
        }
        if header.capacity != len as u64 {
            return Err(corrupt("pool capacity does not match file size", path));
        }
        if header.layout != layout {
            return Err(Error::new(ErrorKind::PoolUnavailable)
                .with_message("pool layout mismatch")
                .with_path(path));
        }

        let (free, live) = scan_heap(base, header.heap_top, len as u64, path)?;
        debug!(
            "opened pool {} ({} live objects)",
            path.display(),
            live
        );
        Ok(Self::register(PoolInner {
            file,
            mmap,
            base,
            len,
            uuid: header.uuid,
            path: path.to_path_buf(),
            heap: Mutex::new(Heap {
                top: header.heap_top,
                free,
            }),
            live: AtomicU64::new(live),
        }))
    }

    /// Opens `path` if it exists and creates it otherwise.
    pub fn open_or_create(path: impl AsRef<Path>, layout: &str, size: usize) -> Result<Pool> {
        if path.as_ref().exists() {
            Self::open(path, layout)
        } else {
            Self::create(path, layout, size)
        }
    }

    fn register(inner: PoolInner) -> Pool {
        let inner = Arc::new(inner);
        registry()
            .write()
            .unwrap()
            .insert(inner.uuid, Arc::downgrade(&inner));
        Pool { inner }
    }

    /// Returns the pool's root object, allocating a zeroed block of `size`
    /// bytes on first use. The root handle is stored durably in the pool
    /// header and survives restarts.
    pub fn root(&self, size: usize) -> Result<Oid> {
        let inner = &*self.inner;
        let mut heap = inner.heap.lock().unwrap();
        // SAFETY: the header page is always mapped.
        let header = unsafe { &mut *inner.base.cast::<PoolHeader>() };
        if header.root.is_null() {
            let payload = inner.alloc_block(&mut heap, round_up(size as u64), BLOCK_ROOT)?;
            header.root = Oid {
                pool_uuid: inner.uuid,
                off: payload,
            };
            persist(addr_of!(header.root), std::mem::size_of::<Oid>());
        } else {
            // SAFETY: the stored root offset was produced by alloc_block.
            let block = unsafe {
                &*inner
                    .base
                    .add(header.root.off as usize - BLOCK_HEADER_SIZE)
                    .cast::<BlockHeader>()
            };
            if block.size < round_up(size as u64) {
                return Err(corrupt("root object smaller than requested", &inner.path));
            }
        }
        Ok(header.root)
    }

    /// Allocates `size` bytes and stores the resulting handle into `oid`,
    /// persisting the slot.
    ///
    /// # Safety
    ///
    /// `oid` must point to a valid, writable `Oid` slot.
    pub unsafe fn alloc(&self, oid: *mut Oid, size: usize) -> Result<()> {
        let payload = {
            let mut heap = self.inner.heap.lock().unwrap();
            self.inner
                .alloc_block(&mut heap, round_up(size as u64), BLOCK_LIVE)?
        };
        unsafe {
            *oid = Oid {
                pool_uuid: self.inner.uuid,
                off: payload,
            };
        }
        persist(oid, std::mem::size_of::<Oid>());
        Ok(())
    }

    /// Like [`Pool::alloc`] but zeroes the block before publishing it.
    ///
    /// # Safety
    ///
    /// `oid` must point to a valid, writable `Oid` slot.
    pub unsafe fn zalloc(&self, oid: *mut Oid, size: usize) -> Result<()> {
        let rsize = round_up(size as u64);
        let payload = {
            let mut heap = self.inner.heap.lock().unwrap();
            self.inner.alloc_block(&mut heap, rsize, BLOCK_LIVE)?
        };
        unsafe {
            let addr = self.inner.base.add(payload as usize);
            ptr::write_bytes(addr, 0, rsize as usize);
            persist(addr, rsize as usize);
            *oid = Oid {
                pool_uuid: self.inner.uuid,
                off: payload,
            };
        }
        persist(oid, std::mem::size_of::<Oid>());
        Ok(())
    }

    /// The number of live (non-root) objects currently allocated.
    pub fn allocated_objects(&self) -> u64 {
        self.inner.live.load(Ordering::Relaxed)
    }
}

impl PoolInner {
    fn alloc_block(&self, heap: &mut Heap, rsize: u64, state: u64) -> Result<u64> {
        if let Some(list) = heap.free.get_mut(&rsize) {
            if let Some(block) = list.pop() {
                // SAFETY: `block` came from a prior allocation below heap_top.
                unsafe {
                    let hdr = self.base.add(block as usize).cast::<BlockHeader>();
                    (*hdr).state = state;
                    persist(addr_of!((*hdr).state), 8);
                }
                if state == BLOCK_LIVE {
                    self.live.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(block + BLOCK_HEADER_SIZE as u64);
            }
        }

        let block = heap.top;
        if block + BLOCK_HEADER_SIZE as u64 + rsize > self.len as u64 {
            return Err(Error::new(ErrorKind::AllocFailed)
                .with_message(format!("pool exhausted allocating {rsize} bytes"))
                .with_path(&self.path));
        }
        // SAFETY: the range [block, block + 16 + rsize) is inside the mapping.
        unsafe {
            let hdr = self.base.add(block as usize).cast::<BlockHeader>();
            (*hdr).size = rsize;
            (*hdr).state = state;
            // The block header must be durable before heap_top publishes it,
            // so a scan after a crash never walks into an unwritten header.
            persist(hdr, BLOCK_HEADER_SIZE);
            heap.top = block + BLOCK_HEADER_SIZE as u64 + rsize;
            let header = &mut *self.base.cast::<PoolHeader>();
            header.heap_top = heap.top;
            persist(addr_of!(header.heap_top), 8);
        }
        if state == BLOCK_LIVE {
            self.live.fetch_add(1, Ordering::Relaxed);
        }
        Ok(block + BLOCK_HEADER_SIZE as u64)
    }

    fn release_block(&self, payload_off: u64) {
        let mut heap = self.heap.lock().unwrap();
        let block = payload_off - BLOCK_HEADER_SIZE as u64;
        // SAFETY: `payload_off` was produced by alloc_block in this pool.
        let size = unsafe {
            let hdr = self.base.add(block as usize).cast::<BlockHeader>();
            debug_assert_eq!((*hdr).state, BLOCK_LIVE);
            (*hdr).state = BLOCK_FREE;
            persist(addr_of!((*hdr).state), 8);
            (*hdr).size
        };
        heap.free.entry(size).or_default().push(block);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        registry().write().unwrap().remove(&self.uuid);
        let _ = self.mmap.flush();
        let _ = self.file.unlock();
        debug!("closed pool {}", self.path.display());
    }
}

/// Resolves a handle to its mapped address.
///
/// Returns a null pointer for the null handle and for handles whose pool is
/// not currently open.
pub fn direct(oid: Oid) -> *mut u8 {
    if oid.is_null() {
        return ptr::null_mut();
    }
    match lookup(oid.pool_uuid) {
        // SAFETY: offsets handed out by the allocator stay inside the mapping.
        Some(pool) => unsafe { pool.base.add(oid.off as usize) },
        None => ptr::null_mut(),
    }
}

/// Frees the block referenced by the slot at `oid`.
///
/// The slot is nulled and persisted *before* the block is recycled, so
/// re-running an interrupted free after a crash is harmless. Freeing a null
/// slot is a no-op.
///
/// # Safety
///
/// `oid` must point to a valid, writable `Oid` slot, and the referenced block
/// must not be freed through any other slot.
pub unsafe fn free(oid: *mut Oid) {
    let target = unsafe { *oid };
    if target.is_null() {
        return;
    }
    unsafe {
        (*oid).off = 0;
    }
    persist(unsafe { addr_of!((*oid).off) }, 8);
    match lookup(target.pool_uuid) {
        Some(pool) => pool.release_block(target.off),
        None => warn!(
            "freed handle {:#x}+{:#x} into a pool that is no longer open",
            target.pool_uuid, target.off
        ),
    }
}

/// Orders all prior stores to durable locations before any later ones.
///
/// With the `strict-persist` feature the affected mapping range is also
/// msynced; addresses outside any open pool (for example DRAM slots used as
/// free targets) are fenced only.
#[inline]
pub fn persist<T>(addr: *const T, len: usize) {
    fence(Ordering::SeqCst);
    #[cfg(feature = "strict-persist")]
    strict_persist(addr.cast::<u8>(), len);
    #[cfg(not(feature = "strict-persist"))]
    let _ = (addr, len);
}

#[cfg(feature = "strict-persist")]
fn strict_persist(addr: *const u8, len: usize) {
    let registry = registry().read().unwrap();
    for weak in registry.values() {
        if let Some(pool) = weak.upgrade() {
            let base = pool.base as usize;
            let a = addr as usize;
            if a >= base && a + len <= base + pool.len {
                let _ = pool.mmap.flush_range(a - base, len);
                return;
            }
        }
    }
}

fn registry() -> &'static RwLock<HashMap<u64, Weak<PoolInner>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<u64, Weak<PoolInner>>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

fn lookup(uuid: u64) -> Option<Arc<PoolInner>> {
    registry().read().unwrap().get(&uuid)?.upgrade()
}

fn scan_heap(
    base: *mut u8,
    heap_top: u64,
    capacity: u64,
    path: &Path,
) -> Result<(HashMap<u64, Vec<u64>>, u64)> {
    if heap_top < POOL_HEADER_SIZE as u64 || heap_top > capacity {
        return Err(corrupt("heap top outside the pool", path));
    }
    let mut free: HashMap<u64, Vec<u64>> = HashMap::new();
    let mut live = 0;
    let mut off = POOL_HEADER_SIZE as u64;
    while off < heap_top {
        // SAFETY: off stays below heap_top, which was validated above.
        let (size, state) = unsafe {
            let hdr = &*base.add(off as usize).cast::<BlockHeader>();
            (hdr.size, hdr.state)
        };
        if size == 0 || size % BLOCK_ALIGN != 0 || off + BLOCK_HEADER_SIZE as u64 + size > heap_top
        {
            return Err(corrupt("malformed block header", path));
        }
        match state {
            BLOCK_FREE => free.entry(size).or_default().push(off),
            BLOCK_LIVE => live += 1,
            BLOCK_ROOT => {}
            _ => return Err(corrupt("unknown block state", path)),
        }
        off += BLOCK_HEADER_SIZE as u64 + size;
    }
    Ok((free, live))
}

fn round_up(size: u64) -> u64 {
    let size = size.max(1);
    (size + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

fn encode_layout(layout: &str) -> Result<[u8; LAYOUT_LEN]> {
    let bytes = layout.as_bytes();
    if bytes.is_empty() || bytes.len() >= LAYOUT_LEN {
        return Err(Error::new(ErrorKind::InvalidArgument)
            .with_message(format!("layout name must be 1..{LAYOUT_LEN} bytes")));
    }
    let mut out = [0; LAYOUT_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn lock_pool_file(file: &File, path: &Path) -> Result<()> {
    file.try_lock_exclusive().map_err(|e| {
        Error::new(ErrorKind::PoolUnavailable)
            .with_message("pool is locked by another process")
            .with_path(path)
            .with_source(e)
    })
}

fn pool_io_error(e: io::Error, path: &Path) -> Error {
    Error::new(ErrorKind::PoolUnavailable)
        .with_message(e.to_string())
        .with_path(path)
        .with_source(e)
}

fn corrupt(message: &str, path: &Path) -> Error {
    Error::new(ErrorKind::RecoveryCorrupt)
        .with_message(message)
        .with_path(path)
}

fn new_uuid() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let salt = COUNTER.fetch_add(1, Ordering::Relaxed);
    // Never zero: a zero uuid would make valid handles look null-ish.
    (nanos ^ (u64::from(std::process::id()) << 32) ^ (salt << 56)) | 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pool(name: &str) -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::create(dir.path().join(name), "pool_test", MIN_POOL_SIZE).unwrap();
        (dir, pool)
    }

    #[test]
    fn create_then_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");

        let mut slot = Oid::NULL;
        let uuid;
        {
            let pool = Pool::create(&path, "pool_test", MIN_POOL_SIZE).unwrap();
            uuid = pool.inner.uuid;
            unsafe { pool.alloc(&mut slot, 64).unwrap() };
            assert_eq!(pool.allocated_objects(), 1);
        }

        let pool = Pool::open(&path, "pool_test").unwrap();
        assert_eq!(pool.inner.uuid, uuid);
        assert_eq!(pool.allocated_objects(), 1);
        assert!(!direct(slot).is_null());
        unsafe { free(&mut slot) };
        assert!(slot.is_null());
        assert_eq!(pool.allocated_objects(), 0);
    }

    #[test]
    fn open_rejects_wrong_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");
        drop(Pool::create(&path, "layout_a", MIN_POOL_SIZE).unwrap());

        let err = Pool::open(&path, "layout_b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolUnavailable);
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");
        {
            let pool = Pool::create(&path, "pool_test", MIN_POOL_SIZE).unwrap();
            // SAFETY: scribbling over our own mapping in a test.
            unsafe { ptr::write_bytes(pool.inner.base, 0xAA, 8) };
        }
        let err = Pool::open(&path, "pool_test").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RecoveryCorrupt);
    }

    #[test]
    fn freed_blocks_are_recycled_by_size() {
        let (_dir, pool) = temp_pool("pool");
        let mut a = Oid::NULL;
        unsafe { pool.alloc(&mut a, 48).unwrap() };
        let first = a;
        unsafe { free(&mut a) };
        unsafe { pool.alloc(&mut a, 48).unwrap() };
        assert_eq!(a, first);
        unsafe { free(&mut a) };
    }

    #[test]
    fn zalloc_zeroes_recycled_blocks() {
        let (_dir, pool) = temp_pool("pool");
        let mut slot = Oid::NULL;
        unsafe {
            pool.alloc(&mut slot, 32).unwrap();
            ptr::write_bytes(direct(slot), 0xFF, 32);
            free(&mut slot);
            pool.zalloc(&mut slot, 32).unwrap();
            let data = std::slice::from_raw_parts(direct(slot), 32);
            assert!(data.iter().all(|&b| b == 0));
            free(&mut slot);
        }
    }

    #[test]
    fn root_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");
        let first;
        {
            let pool = Pool::create(&path, "pool_test", MIN_POOL_SIZE).unwrap();
            first = pool.root(128).unwrap();
            assert!(!first.is_null());
            assert_eq!(pool.root(128).unwrap(), first);
            // The root is not a regular object.
            assert_eq!(pool.allocated_objects(), 0);
        }
        let pool = Pool::open(&path, "pool_test").unwrap();
        assert_eq!(pool.root(128).unwrap(), first);
    }

    #[test]
    fn direct_and_free_route_across_pools() {
        let (_dir_a, pool_a) = temp_pool("a");
        let (_dir_b, pool_b) = temp_pool("b");

        let mut from_a = Oid::NULL;
        let mut from_b = Oid::NULL;
        unsafe {
            pool_a.alloc(&mut from_a, 16).unwrap();
            pool_b.alloc(&mut from_b, 16).unwrap();
        }
        assert_ne!(from_a.pool_uuid, from_b.pool_uuid);
        unsafe {
            // Both frees resolve their owning pool through the registry.
            free(&mut from_a);
            free(&mut from_b);
        }
        assert_eq!(pool_a.allocated_objects(), 0);
        assert_eq!(pool_b.allocated_objects(), 0);
    }

    #[test]
    fn direct_of_null_is_null() {
        assert!(direct(Oid::NULL).is_null());
    }

    #[test]
    fn alloc_failure_reports_kind() {
        let (_dir, pool) = temp_pool("pool");
        let mut slot = Oid::NULL;
        let err = unsafe { pool.alloc(&mut slot, MIN_POOL_SIZE * 2) }.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AllocFailed);
        assert!(slot.is_null());
    }
}
