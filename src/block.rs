//! Queue-node blocks.
//!
//! Each block backs exactly one acquire attempt and lives in its owner
//! thread's slab inside the shared arena. The lock drivers never take
//! references to a block across a blocking wait boundary other than through
//! these atomic fields, so every field that a foreign thread can observe is
//! an atomic word and nothing here is wider than the declared sub-word.

use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crate::cfg::atomic::{AtomicU16, AtomicU32, AtomicU64};
use crate::tail::{self, BlockIndex, ThreadId};

/// Queue node of the writer/writer lock: the successor's tail word, or `0`
/// while no successor has linked itself behind this block.
#[derive(Debug)]
#[repr(transparent)]
pub struct WwBlock {
    successor: AtomicU32,
}

impl WwBlock {
    #[cfg(not(all(loom, test)))]
    pub(crate) const fn new() -> Self {
        Self { successor: AtomicU32::new(0) }
    }

    #[cfg(all(loom, test))]
    pub(crate) fn new() -> Self {
        Self { successor: AtomicU32::new(0) }
    }

    pub(crate) fn clear_successor(&self) {
        self.successor.store(0, Release);
    }

    pub(crate) fn set_successor(&self, id: ThreadId, block: BlockIndex) {
        self.successor.store(tail::combine(id, block), Release);
    }

    pub(crate) fn has_successor(&self) -> bool {
        self.successor.load(Acquire) != 0
    }

    /// The successor's tail word. Only meaningful once [`has_successor`]
    /// returned `true`.
    ///
    /// [`has_successor`]: WwBlock::has_successor
    pub(crate) fn successor(&self) -> u32 {
        self.successor.load(Acquire)
    }
}

impl Default for WwBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue node of the simple reader/writer lock.
///
/// The 16-bit state word packs `[state:8 | successor_class:8]`. The state
/// byte carries the block's own role and blocked/finalized bits; the
/// successor-class byte is written by the *successor* while registering, so
/// the two halves have distinct writers and every mixed transition goes
/// through a CAS on the whole word.
#[derive(Debug)]
pub struct SimpleRwBlock {
    state: AtomicU16,
    successor_thread_id: AtomicU16,
    successor_block_index: AtomicU16,
}

impl SimpleRwBlock {
    const ROLE_READER: u16 = 0x01;
    const ROLE_WRITER: u16 = 0x02;
    const BLOCKED: u16 = 0x04;
    const FINALIZED: u16 = 0x08;

    const SUCC_READER: u16 = 0x01;
    const SUCC_WRITER: u16 = 0x02;
    const SUCC_NONE: u16 = 0x03;

    /// State word of a still-blocked reader that nobody registered behind.
    pub(crate) const BLOCKED_READER_NO_SUCC: u16 =
        (Self::ROLE_READER | Self::BLOCKED) << 8 | Self::SUCC_NONE;

    /// State word of a still-blocked reader with a reader registered behind.
    pub(crate) const BLOCKED_READER_READER_SUCC: u16 =
        (Self::ROLE_READER | Self::BLOCKED) << 8 | Self::SUCC_READER;

    #[cfg(not(all(loom, test)))]
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU16::new(0),
            successor_thread_id: AtomicU16::new(0),
            successor_block_index: AtomicU16::new(0),
        }
    }

    #[cfg(all(loom, test))]
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU16::new(0),
            successor_thread_id: AtomicU16::new(0),
            successor_block_index: AtomicU16::new(0),
        }
    }

    fn init(&self, role: u16) {
        self.successor_thread_id.store(0, Relaxed);
        self.successor_block_index.store(0, Relaxed);
        self.state.store((role | Self::BLOCKED) << 8 | Self::SUCC_NONE, Release);
    }

    pub(crate) fn init_reader(&self) {
        self.init(Self::ROLE_READER);
    }

    pub(crate) fn init_writer(&self) {
        self.init(Self::ROLE_WRITER);
    }

    fn state_byte(&self) -> u16 {
        self.state.load(Acquire) >> 8
    }

    pub(crate) fn is_reader(&self) -> bool {
        self.state_byte() & Self::ROLE_READER != 0
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.state_byte() & Self::BLOCKED != 0
    }

    pub(crate) fn is_granted(&self) -> bool {
        !self.is_blocked()
    }

    /// Clears the blocked bit, leaving every other bit alone. A successor may
    /// be concurrently CASing the whole word to register itself, hence the
    /// RMW rather than a store.
    pub(crate) fn unblock(&self) {
        self.state.fetch_and(!(Self::BLOCKED << 8), AcqRel);
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.state_byte() & Self::FINALIZED != 0
    }

    pub(crate) fn set_finalized(&self) {
        self.state.fetch_or(Self::FINALIZED << 8, AcqRel);
    }

    fn successor_class(&self) -> u16 {
        self.state.load(Acquire) & 0xFF
    }

    pub(crate) fn has_reader_successor(&self) -> bool {
        self.successor_class() == Self::SUCC_READER
    }

    pub(crate) fn has_writer_successor(&self) -> bool {
        self.successor_class() == Self::SUCC_WRITER
    }

    pub(crate) fn set_successor_class_writer(&self) {
        // Preserve the concurrently-updated state byte.
        let mut cur = self.state.load(Acquire);
        loop {
            let new = (cur & 0xFF00) | Self::SUCC_WRITER;
            match self.state.compare_exchange_weak(cur, new, AcqRel, Acquire) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    /// One-shot CAS on the whole state word.
    pub(crate) fn cas_state(&self, expected: u16, desired: u16) -> bool {
        self.state.compare_exchange(expected, desired, AcqRel, Acquire).is_ok()
    }

    /// Publishes the successor's locator without touching the class bits.
    /// The block index is written last: readiness is defined by it alone.
    pub(crate) fn set_successor(&self, id: ThreadId, block: BlockIndex) {
        self.successor_thread_id.store(id, Relaxed);
        self.successor_block_index.store(block, Release);
    }

    pub(crate) fn successor_thread_id(&self) -> ThreadId {
        self.successor_thread_id.load(Acquire)
    }

    pub(crate) fn successor_block_index(&self) -> BlockIndex {
        self.successor_block_index.load(Acquire)
    }

    pub(crate) fn successor_is_ready(&self) -> bool {
        self.successor_block_index.load(Acquire) != 0
    }
}

impl Default for SimpleRwBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue node of the extended (cancellable) reader/writer lock: two 64-bit
/// words, each packing `[id:32 | flags:32]`.
///
/// `pred` names the predecessor this block waits on; its flag half holds the
/// granted bit plus the block's fixed role, so the role survives the id
/// half being exchanged and CASed throughout the leaving protocol. `next`
/// names the successor and carries the block's own protocol state.
///
/// Sub-word updates are CAS loops over the containing word, which keeps
/// every transition that pairs an id with a flag observation atomic.
#[derive(Debug)]
#[repr(C)]
pub struct ExtendedRwBlock {
    pred: AtomicU64,
    next: AtomicU64,
}

impl ExtendedRwBlock {
    /// `pred` id sentinel: the predecessor already passed the lock over; the
    /// pred link is gone and the grant flag is about to arrive (or has).
    pub const PRED_ACQUIRED: u32 = u32::MAX;

    /// `next` id sentinel: the successor is mid-cancel; its fields must not
    /// be dereferenced until it finishes and installs a replacement.
    pub const SUCC_LEAVING: u32 = u32::MAX;

    /// `next` id sentinel: the successor was already handled; release must
    /// not poke anyone.
    pub const SUCC_NONE: u32 = u32::MAX - 1;

    const PRED_GRANTED: u64 = 0x1;
    const PRED_ROLE_READER: u64 = 0x2;

    pub(crate) const LEAVING: u32 = 0b001;
    pub(crate) const GRANTED: u32 = 0b010;
    pub(crate) const STATE_MASK: u32 = 0b011;
    pub(crate) const BUSY: u32 = 0b100;
    pub(crate) const SUCC_CLASS_READER: u32 = 0b01000;
    pub(crate) const SUCC_CLASS_WRITER: u32 = 0b10000;
    pub(crate) const SUCC_CLASS_MASK: u32 = 0b11000;

    /// `next` flag image of a waiting block nobody registered behind.
    pub(crate) const WAITING_NO_SUCC: u32 = 0;

    /// `next` flag image of a waiting block with a reader registered behind.
    pub(crate) const WAITING_READER_SUCC: u32 = Self::SUCC_CLASS_READER;

    #[cfg(not(all(loom, test)))]
    pub(crate) const fn new() -> Self {
        Self { pred: AtomicU64::new(0), next: AtomicU64::new(0) }
    }

    #[cfg(all(loom, test))]
    pub(crate) fn new() -> Self {
        Self { pred: AtomicU64::new(0), next: AtomicU64::new(0) }
    }

    pub(crate) fn init_reader(&self) {
        self.next.store(0, Relaxed);
        self.pred.store(Self::PRED_ROLE_READER, Release);
    }

    pub(crate) fn init_writer(&self) {
        self.next.store(0, Relaxed);
        self.pred.store(0, Release);
    }

    pub(crate) fn is_reader(&self) -> bool {
        self.pred.load(Acquire) & Self::PRED_ROLE_READER != 0
    }

    pub(crate) fn pred_id(&self) -> u32 {
        (self.pred.load(Acquire) >> 32) as u32
    }

    pub(crate) fn pred_granted(&self) -> bool {
        self.pred.load(Acquire) & Self::PRED_GRANTED != 0
    }

    pub(crate) fn pred_waiting(&self) -> bool {
        !self.pred_granted()
    }

    pub(crate) fn set_pred_granted(&self) {
        self.pred.fetch_or(Self::PRED_GRANTED, AcqRel);
    }

    pub(crate) fn set_pred_id(&self, id: u32) {
        self.swap_pred_id(id);
    }

    /// Atomically replaces the pred id half, returning the previous id.
    pub(crate) fn swap_pred_id(&self, id: u32) -> u32 {
        let mut cur = self.pred.load(Acquire);
        loop {
            let new = ((id as u64) << 32) | (cur & 0xFFFF_FFFF);
            match self.pred.compare_exchange_weak(cur, new, AcqRel, Acquire) {
                Ok(_) => return (cur >> 32) as u32,
                Err(observed) => cur = observed,
            }
        }
    }

    /// CAS on the pred id half. Fails only when the id half differs from
    /// `expected`; a concurrent change to the flag half retries internally.
    pub(crate) fn cas_pred_id(&self, expected: u32, desired: u32) -> bool {
        let mut cur = self.pred.load(Acquire);
        loop {
            if (cur >> 32) as u32 != expected {
                return false;
            }
            let new = ((desired as u64) << 32) | (cur & 0xFFFF_FFFF);
            match self.pred.compare_exchange_weak(cur, new, AcqRel, Acquire) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    pub(crate) fn next(&self) -> u64 {
        self.next.load(Acquire)
    }

    pub(crate) fn next_id(&self) -> u32 {
        (self.next.load(Acquire) >> 32) as u32
    }

    pub(crate) fn next_flags(&self) -> u32 {
        self.next.load(Acquire) as u32
    }

    /// Atomically replaces the next id half, preserving concurrent flag
    /// updates.
    pub(crate) fn set_next_id(&self, id: u32) {
        let mut cur = self.next.load(Acquire);
        loop {
            let new = ((id as u64) << 32) | (cur & 0xFFFF_FFFF);
            match self.next.compare_exchange_weak(cur, new, AcqRel, Acquire) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    pub(crate) fn cas_next(&self, expected: u64, desired: u64) -> bool {
        self.next.compare_exchange(expected, desired, AcqRel, Acquire).is_ok()
    }

    /// CAS on the whole next word that reports the observed value on failure.
    pub(crate) fn cas_next_val(&self, expected: u64, desired: u64) -> u64 {
        match self.next.compare_exchange(expected, desired, AcqRel, Acquire) {
            Ok(observed) | Err(observed) => observed,
        }
    }

    pub(crate) fn next_granted(&self) -> bool {
        self.next_flags() & Self::GRANTED != 0
    }

    pub(crate) fn next_waiting(&self) -> bool {
        self.next_flags() & Self::STATE_MASK == 0
    }

    pub(crate) fn next_leaving(&self) -> bool {
        self.next_flags() & Self::STATE_MASK == Self::LEAVING
    }

    pub(crate) fn next_leaving_granted(&self) -> bool {
        self.next_flags() & Self::STATE_MASK == (Self::LEAVING | Self::GRANTED)
    }

    pub(crate) fn next_busy(&self) -> bool {
        self.next_flags() & Self::BUSY != 0
    }

    /// Waiting becomes direct-granted; leaving becomes leaving-granted.
    pub(crate) fn set_next_granted(&self) {
        self.next.fetch_or(Self::GRANTED as u64, AcqRel);
    }

    pub(crate) fn set_next_leaving(&self) {
        self.next.fetch_or(Self::LEAVING as u64, AcqRel);
    }

    pub(crate) fn set_next_busy(&self) {
        self.next.fetch_or(Self::BUSY as u64, AcqRel);
    }

    pub(crate) fn set_next_busy_granted(&self) {
        self.next.fetch_or((Self::BUSY | Self::GRANTED) as u64, AcqRel);
    }

    pub(crate) fn clear_next_busy(&self) {
        self.next.fetch_and(!(Self::BUSY as u64), AcqRel);
    }

    pub(crate) fn has_successor(&self) -> bool {
        self.next_flags() & Self::SUCC_CLASS_MASK != 0
    }

    pub(crate) fn has_reader_successor(&self) -> bool {
        self.next_flags() & Self::SUCC_CLASS_MASK == Self::SUCC_CLASS_READER
    }

    pub(crate) fn has_writer_successor(&self) -> bool {
        self.next_flags() & Self::SUCC_CLASS_MASK == Self::SUCC_CLASS_WRITER
    }

    pub(crate) fn set_reader_successor(&self) {
        self.next.fetch_or(Self::SUCC_CLASS_READER as u64, AcqRel);
    }

    pub(crate) fn set_writer_successor(&self) {
        self.next.fetch_or(Self::SUCC_CLASS_WRITER as u64, AcqRel);
    }

    pub(crate) fn clear_successor_class(&self) {
        self.next.fetch_and(!(Self::SUCC_CLASS_MASK as u64), AcqRel);
    }
}

impl Default for ExtendedRwBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{ExtendedRwBlock, SimpleRwBlock, WwBlock};

    #[test]
    fn ww_layout() {
        assert_eq!(core::mem::size_of::<WwBlock>(), 4);
    }

    #[test]
    fn ww_successor() {
        let block = WwBlock::new();
        assert!(!block.has_successor());
        block.set_successor(3, 7);
        assert!(block.has_successor());
        assert_eq!(block.successor(), 0x0003_0007);
        block.clear_successor();
        assert!(!block.has_successor());
    }

    #[test]
    fn simple_state_words() {
        let block = SimpleRwBlock::new();
        block.init_reader();
        assert!(block.is_reader());
        assert!(block.is_blocked());
        assert!(!block.is_finalized());
        assert!(!block.has_reader_successor());
        assert!(!block.has_writer_successor());

        assert!(block
            .cas_state(SimpleRwBlock::BLOCKED_READER_NO_SUCC, SimpleRwBlock::BLOCKED_READER_READER_SUCC));
        assert!(block.has_reader_successor());

        block.unblock();
        assert!(block.is_granted());
        // The successor class must survive the unblock.
        assert!(block.has_reader_successor());

        block.set_finalized();
        assert!(block.is_finalized());
    }

    #[test]
    fn simple_successor_readiness() {
        let block = SimpleRwBlock::new();
        block.init_writer();
        assert!(!block.is_reader());
        assert!(!block.successor_is_ready());
        block.set_successor_class_writer();
        assert!(block.has_writer_successor());
        block.set_successor(0, 9);
        assert!(block.successor_is_ready());
        assert_eq!(block.successor_block_index(), 9);
    }

    #[test]
    fn extended_layout() {
        assert_eq!(core::mem::size_of::<ExtendedRwBlock>(), 16);
        assert_eq!(core::mem::align_of::<ExtendedRwBlock>(), 8);
    }

    #[test]
    fn extended_pred_word() {
        let block = ExtendedRwBlock::new();
        block.init_reader();
        assert!(block.is_reader());
        assert!(block.pred_waiting());
        assert_eq!(block.pred_id(), 0);

        block.set_pred_id(0x0001_0002);
        assert_eq!(block.pred_id(), 0x0001_0002);
        // The role and grant flags live below the id and must be untouched.
        assert!(block.is_reader());
        assert!(block.pred_waiting());

        assert!(!block.cas_pred_id(0xDEAD, 0));
        assert!(block.cas_pred_id(0x0001_0002, ExtendedRwBlock::PRED_ACQUIRED));
        assert_eq!(block.pred_id(), ExtendedRwBlock::PRED_ACQUIRED);

        block.set_pred_granted();
        assert!(block.pred_granted());
        assert!(block.is_reader());

        assert_eq!(block.swap_pred_id(0), ExtendedRwBlock::PRED_ACQUIRED);
        assert!(block.pred_granted());
    }

    #[test]
    fn extended_next_word() {
        let block = ExtendedRwBlock::new();
        block.init_writer();
        assert!(!block.is_reader());
        assert!(block.next_waiting());
        assert!(!block.next_busy());
        assert!(!block.has_successor());

        block.set_writer_successor();
        assert!(block.has_writer_successor());
        block.set_next_id(0x0002_0001);
        assert_eq!(block.next_id(), 0x0002_0001);
        assert!(block.has_writer_successor());

        block.set_next_leaving();
        assert!(block.next_leaving());
        block.set_next_granted();
        assert!(block.next_leaving_granted());
        assert!(block.next_granted());

        block.set_next_busy();
        assert!(block.next_busy());
        block.clear_next_busy();
        assert!(!block.next_busy());

        block.clear_successor_class();
        assert!(!block.has_successor());
        assert_eq!(block.next_id(), 0x0002_0001);
    }

    #[test]
    fn extended_next_word_cas() {
        let block = ExtendedRwBlock::new();
        block.init_reader();

        // Register a reader successor the way an arriving reader does.
        let expected = ExtendedRwBlock::WAITING_NO_SUCC as u64;
        let desired = ExtendedRwBlock::WAITING_READER_SUCC as u64;
        assert_eq!(block.cas_next_val(expected, desired), expected);
        assert!(block.has_reader_successor());

        // A second registration attempt must observe the first.
        assert_eq!(block.cas_next_val(expected, desired), desired);
    }
}
