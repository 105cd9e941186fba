//! Epoch-based memory reclamation for persistent memory.
//!
//! Concurrent data structures whose nodes live in persistent (byte-
//! addressable non-volatile) memory face the usual reclamation problem,
//! that a removed node may still be read by another thread, plus one of
//! their own: the bookkeeping that says "this node is garbage" must survive
//! a crash, or restart leaks the node forever. This crate provides an
//! engine that solves both at once. Client threads retire durable handles
//! after unlinking them; the engine guarantees that a handle is finalized
//! and released only once no epoch guard can still protect it, and that
//! after a crash the pool reopens with every in-flight retirement either
//! finished or safely restarted.
//!
//! # Handles and pools
//!
//! Storage is managed by memory-mapped [`Pool`]s. An [`Oid`] names a block
//! by pool UUID and offset and stays valid across restarts; [`direct`]
//! resolves it to a mapped address and [`free`] returns it to its pool.
//! Allocation and free always go through a durable slot so that no crash
//! point leaves a block reachable from two places or from none that
//! recovery can see.
//!
//! # Retiring and epochs
//!
//! Each thread owns, per reclamation target, a chain of fixed-capacity
//! buffer nodes. Retirement appends to the chain's tail without locking and
//! stamps the current epoch. A driver thread forwards the global epoch at a
//! fixed interval, and cleaner threads sweep every chain, finalizing and
//! releasing garbage retired strictly before the *protected epoch*, the
//! minimum epoch observed by any live [`EpochGuard`].
//!
//! # Page reuse
//!
//! A target may opt into page reuse: finalized pages stay in the chain and
//! [`EpochBasedGc::get_page_if_possible`] hands them back to the owning
//! thread instead of touching the allocator, which turns the retire/allocate
//! cycle of hot structures into pointer traffic within one chain.
//!
//! # Crash consistency
//!
//! The durable half of every buffer node carries only what recovery needs:
//! the retired handles and the `next`/`tmp` links. All index state is
//! volatile and rebuilt on restart. The three durable transitions (retire,
//! take-reusable, pop-head) each persist one cache line and leave enough
//! state to disambiguate every crash point; reopening a pool drains
//! leftover chains before any mutator may enter.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod collector;
mod epoch;
mod error;
mod guard;
mod internal;
mod pool;
mod target;
mod thread_id;

pub use crate::collector::EpochBasedGc;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::guard::EpochGuard;
pub use crate::pool::{direct, free, persist, Oid, Pool, MIN_POOL_SIZE};
pub use crate::target::{DefaultTarget, GcTarget, GcTargets};

/// Retired handles per buffer node. With the allocator header, one node
/// occupies exactly 4 KiB.
pub const BUFFER_SIZE: usize = 252;

/// Durable scratch slots per thread and target.
pub const TMP_FIELD_NUM: usize = 13;

/// The maximum number of concurrently live threads the engine supports.
pub const MAX_THREAD_NUM: usize = 256;

/// The default driver interval in microseconds.
pub const DEFAULT_GC_INTERVAL_MICRO: u64 = 100_000;

/// The default number of cleaner threads.
pub const DEFAULT_GC_THREAD_NUM: usize = 1;
