//! The reader/writer lock word.
//!
//! Eight bytes in shared memory: `[tail:32 | next_writer:16 | nreaders:16]`
//! in ascending address order on little-endian targets. The word is a single
//! atomic `u64` so that the try paths can inspect and replace all three
//! fields in one compare-and-swap; the per-field operations below are RMWs
//! on the same word, so they compose with the whole-word CAS.
//!
//! A sub-field CAS fails only when *its* field differs from the expected
//! value; concurrent churn on the other fields retries internally. This
//! matters: several protocol steps take a failed tail CAS as proof that a
//! successor has enqueued.

use core::sync::atomic::Ordering::{AcqRel, Acquire};

use crate::cfg::atomic::AtomicU64;
use crate::tail::ThreadId;

/// Outcome of an asynchronous acquire: the attempt's block stays enqueued
/// (or immediately granted) and must be driven to completion with the
/// matching `retry_*_async` / `cancel_*_async` calls, or released if
/// `granted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncAcquire {
    /// Whether the lock was granted on the spot.
    pub granted: bool,
    /// The block backing this attempt.
    pub block: crate::tail::BlockIndex,
}

const TAIL_MASK: u64 = 0x0000_0000_FFFF_FFFF;
const NEXT_WRITER_SHIFT: u32 = 32;
const NEXT_WRITER_MASK: u64 = 0x0000_FFFF_0000_0000;
const NREADERS_SHIFT: u32 = 48;
const NREADERS_UNIT: u64 = 1 << NREADERS_SHIFT;

/// A reader/writer MCS lock word, shared by the simple and the extended
/// protocol drivers.
///
/// The all-zero word is the unheld, queue-empty state.
#[derive(Debug)]
#[repr(transparent)]
pub struct RwLock {
    word: AtomicU64,
}

impl RwLock {
    /// Creates an unheld lock word.
    #[cfg(not(all(loom, test)))]
    pub const fn new() -> Self {
        Self { word: AtomicU64::new(0) }
    }

    /// Creates an unheld lock word (Loom build, non-const).
    #[cfg(all(loom, test))]
    pub fn new() -> Self {
        Self { word: AtomicU64::new(0) }
    }

    /// The raw 64-bit image of the word.
    pub fn raw(&self) -> u64 {
        self.word.load(Acquire)
    }

    /// The queue tail, `0` when no acquire attempt is enqueued.
    pub fn tail(&self) -> u32 {
        (self.raw() & TAIL_MASK) as u32
    }

    /// The writer parked for the readers to drain, `0` when none.
    pub fn next_writer(&self) -> ThreadId {
        ((self.raw() & NEXT_WRITER_MASK) >> NEXT_WRITER_SHIFT) as ThreadId
    }

    /// The active-reader count.
    pub fn nreaders(&self) -> u16 {
        (self.raw() >> NREADERS_SHIFT) as u16
    }

    /// Whether any holder or waiter is present.
    pub fn is_locked(&self) -> bool {
        self.raw() != 0
    }

    pub(crate) const fn compose(tail: u32, next_writer: ThreadId, nreaders: u16) -> u64 {
        tail as u64 | ((next_writer as u64) << NEXT_WRITER_SHIFT) | ((nreaders as u64) << NREADERS_SHIFT)
    }

    pub(crate) const fn tail_of(word: u64) -> u32 {
        (word & TAIL_MASK) as u32
    }

    pub(crate) const fn next_writer_of(word: u64) -> ThreadId {
        ((word & NEXT_WRITER_MASK) >> NEXT_WRITER_SHIFT) as ThreadId
    }

    pub(crate) const fn nreaders_of(word: u64) -> u16 {
        (word >> NREADERS_SHIFT) as u16
    }

    /// Whole-word CAS backing the try paths.
    pub(crate) fn cas_raw(&self, expected: u64, desired: u64) -> bool {
        self.word.compare_exchange(expected, desired, AcqRel, Acquire).is_ok()
    }

    /// Atomically replaces the tail, returning the previous tail.
    pub(crate) fn swap_tail(&self, tail: u32) -> u32 {
        let mut cur = self.word.load(Acquire);
        loop {
            let new = (cur & !TAIL_MASK) | tail as u64;
            match self.word.compare_exchange_weak(cur, new, AcqRel, Acquire) {
                Ok(_) => return (cur & TAIL_MASK) as u32,
                Err(observed) => cur = observed,
            }
        }
    }

    /// CAS on the tail field. Fails only when the tail differs from
    /// `expected`.
    pub(crate) fn cas_tail(&self, expected: u32, desired: u32) -> bool {
        let mut cur = self.word.load(Acquire);
        loop {
            if (cur & TAIL_MASK) as u32 != expected {
                return false;
            }
            let new = (cur & !TAIL_MASK) | desired as u64;
            match self.word.compare_exchange_weak(cur, new, AcqRel, Acquire) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    pub(crate) fn set_next_writer(&self, id: ThreadId) {
        self.swap_next_writer(id);
    }

    /// Atomically replaces the next-writer field, returning the previous
    /// value.
    pub(crate) fn swap_next_writer(&self, id: ThreadId) -> ThreadId {
        let mut cur = self.word.load(Acquire);
        loop {
            let new = (cur & !NEXT_WRITER_MASK) | ((id as u64) << NEXT_WRITER_SHIFT);
            match self.word.compare_exchange_weak(cur, new, AcqRel, Acquire) {
                Ok(_) => return ((cur & NEXT_WRITER_MASK) >> NEXT_WRITER_SHIFT) as ThreadId,
                Err(observed) => cur = observed,
            }
        }
    }

    /// CAS on the next-writer field. Fails only when the field differs from
    /// `expected`.
    pub(crate) fn cas_next_writer(&self, expected: ThreadId, desired: ThreadId) -> bool {
        let mut cur = self.word.load(Acquire);
        loop {
            if ((cur & NEXT_WRITER_MASK) >> NEXT_WRITER_SHIFT) as ThreadId != expected {
                return false;
            }
            let new = (cur & !NEXT_WRITER_MASK) | ((desired as u64) << NEXT_WRITER_SHIFT);
            match self.word.compare_exchange_weak(cur, new, AcqRel, Acquire) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Bumps the active-reader count, returning the previous count.
    pub(crate) fn increment_nreaders(&self) -> u16 {
        (self.word.fetch_add(NREADERS_UNIT, AcqRel) >> NREADERS_SHIFT) as u16
    }

    /// Drops the active-reader count, returning the previous count.
    pub(crate) fn decrement_nreaders(&self) -> u16 {
        (self.word.fetch_sub(NREADERS_UNIT, AcqRel) >> NREADERS_SHIFT) as u16
    }
}

#[cfg(not(all(loom, test)))]
impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::RwLock;

    #[test]
    fn layout() {
        assert_eq!(core::mem::size_of::<RwLock>(), 8);
        assert_eq!(core::mem::align_of::<RwLock>(), 8);
    }

    #[test]
    fn field_round_trips() {
        let word = RwLock::compose(0x0001_0002, 7, 3);
        assert_eq!(RwLock::tail_of(word), 0x0001_0002);
        assert_eq!(RwLock::next_writer_of(word), 7);
        assert_eq!(RwLock::nreaders_of(word), 3);
    }

    #[test]
    fn wire_image_is_little_endian_field_order() {
        // [tail:32 | next_writer:16 | nreaders:16] in ascending addresses.
        let word = RwLock::compose(0x0001_0002, 0x0304, 0x0506).to_le_bytes();
        assert_eq!(word, [0x02, 0x00, 0x01, 0x00, 0x04, 0x03, 0x06, 0x05]);
    }

    #[test]
    fn tail_ops_ignore_other_fields() {
        let lock = RwLock::new();
        assert_eq!(lock.increment_nreaders(), 0);
        assert_eq!(lock.swap_tail(0x0002_0001), 0);
        assert_eq!(lock.tail(), 0x0002_0001);
        assert_eq!(lock.nreaders(), 1);

        assert!(!lock.cas_tail(0xBEEF, 0));
        assert!(lock.cas_tail(0x0002_0001, 0));
        assert_eq!(lock.tail(), 0);
        assert_eq!(lock.nreaders(), 1);
        assert_eq!(lock.decrement_nreaders(), 1);
        assert!(!lock.is_locked());
    }

    #[test]
    fn next_writer_ops() {
        let lock = RwLock::new();
        lock.set_next_writer(5);
        assert_eq!(lock.next_writer(), 5);
        assert_eq!(lock.swap_next_writer(6), 5);
        assert!(!lock.cas_next_writer(5, 0));
        assert!(lock.cas_next_writer(6, 0));
        assert!(!lock.is_locked());
    }
}
