//! Queue-based MCS locks for shared-memory engines: a writer/writer mutex
//! with guest mode, a classical reader/writer queue lock, and an extended
//! reader/writer queue lock whose waiters can time out and cancel.
//!
//! These are the record- and page-level locks of a main-memory database
//! core. They differ from general-purpose lock crates in two ways:
//!
//! - **No pointers, no allocation.** Queue nodes ("blocks") live in
//!   per-thread slabs and are named by a 16-bit index; a queue position is a
//!   32-bit *tail word* packing `(thread id, block index)`. Lock words are
//!   plain 4- or 8-byte atomics with a fixed wire layout, so they can sit
//!   inside record headers in shared memory.
//! - **Storage is injected.** The algorithms reach blocks through the
//!   [`adaptor::BlockAdaptor`] capability trait. Production engines back it
//!   with their own memory; [`adaptor::LockArena`] is a ready-made heap
//!   backing used by the tests and by smaller embedders.
//!
//! The lock drivers never block in the OS, never log, and never allocate.
//! Waiters spin on words local to their own blocks, with a pluggable
//! [`relax::Relax`] policy ([`relax::SpinYield`] by default).
//!
//! ## Flavours
//!
//! | Type | Protocol | Cancellation |
//! |---|---|---|
//! | [`WwLock`] + [`Ww`] | MCS mutex, FIFO, plus anonymous *guest* holders | no |
//! | [`RwLock`] + [`SimpleRw`] | reader/writer MCS, parallel readers | no |
//! | [`RwLock`] + [`ExtendedRw`] | reader/writer MCS with a leaving protocol | timeout & explicit cancel |
//!
//! The extended flavour exists for non-canonical lock ordering: when
//! transactions may acquire locks in conflicting orders, a waiter must be
//! able to give up after a while instead of deadlocking. Cancellation is
//! cooperative — the leaving waiter splices itself out of the wait queue
//! without stopping the world.
//!
//! ## Example
//!
//! ```
//! use mcsrw::{ExtendedRw, ExtendedRwBlock, LockArena, RwLock, Timeout, Acquire};
//!
//! let arena: LockArena<ExtendedRwBlock> = LockArena::new(2, 16);
//! let lock = RwLock::new();
//!
//! let t1: ExtendedRw<_> = ExtendedRw::new(arena.thread(1));
//! let t2: ExtendedRw<_> = ExtendedRw::new(arena.thread(2));
//!
//! let held = t1.acquire_writer(&lock);
//!
//! // A second thread would rather give up than deadlock.
//! assert_eq!(t2.acquire_writer_timed(&lock, Timeout::Spins(100)), Acquire::Cancelled);
//!
//! t1.release_writer(&lock, held);
//! assert!(!lock.is_locked());
//! ```
//!
//! ## Contracts
//!
//! Usage violations — releasing a lock you do not hold, reusing a block
//! whose release has not completed, recursive acquisition, two OS threads
//! sharing one thread id — are *not* detected at runtime in release builds;
//! debug builds assert on the ones that are locally checkable. A thread may
//! wait on at most one [`WwLock`] at a time (the hand-off runs through a
//! per-thread flag), and a thread parked for a reader/writer lock must keep
//! its newest block the waiting one.

mod cfg;
mod spin;

pub mod adaptor;
pub mod block;
pub mod extended;
pub mod relax;
pub mod rw;
pub mod simple;
pub mod tail;
pub mod ww;

pub use adaptor::{ArenaThread, BlockAdaptor, LockArena};
pub use block::{ExtendedRwBlock, SimpleRwBlock, WwBlock};
pub use extended::{Acquire, ExtendedRw, Timeout};
pub use rw::{AsyncAcquire, RwLock};
pub use simple::SimpleRw;
pub use tail::{BlockIndex, ThreadId};
pub use ww::{Ww, WwLock};
