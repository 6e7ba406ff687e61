//! Block storage behind the lock algorithms.
//!
//! The protocol drivers never own queue nodes; they reach them through the
//! [`BlockAdaptor`] capability set. That keeps the algorithms independent of
//! where the per-thread slabs actually live — an engine places them in its
//! NUMA-partitioned shared memory, the tests place them in a [`LockArena`]
//! on the heap — and both run the exact same code.

use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use crate::block::WwBlock;
use crate::cfg::atomic::{AtomicBool, AtomicU16};
use crate::tail::{self, BlockIndex, ThreadId};

/// Capabilities the lock drivers require from their block storage.
///
/// A value of this type is a *per-thread* handle: `my`-flavoured methods act
/// on the calling thread's slab, `other`-flavoured ones dereference foreign
/// blocks published through a tail word. All returned references point at
/// atomic-field structs, so foreign access is always mediated by atomics.
pub trait BlockAdaptor {
    /// The reader/writer block flavour this storage holds.
    type Rw;

    /// The calling thread's id. Never `0`.
    fn thread_id(&self) -> ThreadId;

    /// The calling thread's most recently issued block index.
    fn cur_block(&self) -> BlockIndex;

    /// Another thread's most recently issued block index.
    fn cur_block_of(&self, id: ThreadId) -> BlockIndex;

    /// Mints a fresh block index for one acquire attempt. Non-zero and
    /// monotone until the owner resets it.
    fn issue_new_block(&self) -> BlockIndex;

    /// The calling thread's writer/writer block at `block`.
    fn ww_my_block(&self, block: BlockIndex) -> &WwBlock;

    /// A foreign writer/writer block.
    fn ww_other_block(&self, id: ThreadId, block: BlockIndex) -> &WwBlock;

    /// The calling thread's reader/writer block at `block`.
    fn rw_my_block(&self, block: BlockIndex) -> &Self::Rw;

    /// A foreign reader/writer block.
    fn rw_other_block(&self, id: ThreadId, block: BlockIndex) -> &Self::Rw;

    /// Decodes a tail word into the block it names.
    fn rw_tail_block(&self, tail_word: u32) -> &Self::Rw {
        self.rw_other_block(tail::thread_of(tail_word), tail::block_of(tail_word))
    }

    /// The calling thread's personal waiting flag (one per thread, not per
    /// block; used by the writer/writer hand-off).
    fn me_waiting(&self) -> &AtomicBool;

    /// Another thread's waiting flag.
    fn other_waiting(&self, id: ThreadId) -> &AtomicBool;
}

struct Slot<B> {
    waiting: AtomicBool,
    cur_block: AtomicU16,
    ww: Box<[WwBlock]>,
    rw: Box<[B]>,
}

/// Heap-backed block storage for a fixed set of threads.
///
/// Thread ids run `1..=threads`; block indexes run `1..=blocks_per_thread`.
/// Index `0` of every slab exists but is never handed out, so a zero
/// half-word in any packed value keeps meaning *none*.
pub struct LockArena<B> {
    slots: Box<[Slot<B>]>,
}

impl<B: Default> LockArena<B> {
    /// Builds an arena for `threads` threads, each with `blocks_per_thread`
    /// usable blocks.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is `0` or `u16::MAX` (the all-ones thread id is
    /// reserved for the guest sentinel), or if `blocks_per_thread` is `0`.
    pub fn new(threads: ThreadId, blocks_per_thread: BlockIndex) -> Self {
        assert!(threads > 0 && threads < ThreadId::MAX, "invalid thread count");
        assert!(blocks_per_thread > 0, "invalid block count");
        let slot = |_| Slot {
            waiting: AtomicBool::new(false),
            cur_block: AtomicU16::new(0),
            ww: (0..=blocks_per_thread as usize).map(|_| WwBlock::new()).collect(),
            rw: (0..=blocks_per_thread as usize).map(|_| B::default()).collect(),
        };
        Self { slots: (0..threads as usize).map(slot).collect() }
    }
}

impl<B> LockArena<B> {
    /// The number of threads this arena serves.
    pub fn threads(&self) -> ThreadId {
        self.slots.len() as ThreadId
    }

    /// The per-thread block capacity.
    pub fn blocks_per_thread(&self) -> BlockIndex {
        (self.slots[0].ww.len() - 1) as BlockIndex
    }

    /// Hands out the adaptor for thread `id`.
    ///
    /// The caller is responsible for giving each OS thread its own id; two
    /// threads sharing an id break every contract downstream.
    ///
    /// # Panics
    ///
    /// Panics if `id` is `0` or past the arena's thread count.
    pub fn thread(&self, id: ThreadId) -> ArenaThread<'_, B> {
        assert!(id > 0 && id as usize <= self.slots.len(), "thread id out of range");
        ArenaThread { arena: self, id }
    }

    fn slot(&self, id: ThreadId) -> &Slot<B> {
        debug_assert!(id > 0);
        &self.slots[id as usize - 1]
    }
}

/// One thread's handle into a [`LockArena`].
pub struct ArenaThread<'a, B> {
    arena: &'a LockArena<B>,
    id: ThreadId,
}

impl<B> Clone for ArenaThread<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for ArenaThread<'_, B> {}

impl<'a, B> ArenaThread<'a, B> {
    fn my_slot(&self) -> &'a Slot<B> {
        self.arena.slot(self.id)
    }

    /// Mints a block index unless the slab (or the 16-bit encoding) is
    /// exhausted.
    pub fn try_issue_new_block(&self) -> Option<BlockIndex> {
        let slot = self.my_slot();
        if slot.cur_block.load(Relaxed) as usize >= slot.ww.len() - 1 {
            return None;
        }
        Some(slot.cur_block.fetch_add(1, AcqRel) + 1)
    }

    /// Rewinds the block counter so indexes can be reissued.
    ///
    /// Only legal while this thread holds no locks and has no acquire
    /// attempt pending: an outstanding block must never be reused before its
    /// release completes.
    pub fn reset_blocks(&self) {
        self.my_slot().cur_block.store(0, Relaxed);
    }
}

impl<'a, B> BlockAdaptor for ArenaThread<'a, B> {
    type Rw = B;

    fn thread_id(&self) -> ThreadId {
        self.id
    }

    fn cur_block(&self) -> BlockIndex {
        self.my_slot().cur_block.load(Acquire)
    }

    fn cur_block_of(&self, id: ThreadId) -> BlockIndex {
        self.arena.slot(id).cur_block.load(Acquire)
    }

    fn issue_new_block(&self) -> BlockIndex {
        self.try_issue_new_block().expect("block indexes exhausted")
    }

    fn ww_my_block(&self, block: BlockIndex) -> &WwBlock {
        debug_assert!(block > 0 && block <= self.cur_block());
        &self.my_slot().ww[block as usize]
    }

    fn ww_other_block(&self, id: ThreadId, block: BlockIndex) -> &WwBlock {
        debug_assert!(block > 0);
        &self.arena.slot(id).ww[block as usize]
    }

    fn rw_my_block(&self, block: BlockIndex) -> &B {
        debug_assert!(block > 0 && block <= self.cur_block());
        &self.my_slot().rw[block as usize]
    }

    fn rw_other_block(&self, id: ThreadId, block: BlockIndex) -> &B {
        debug_assert!(block > 0);
        &self.arena.slot(id).rw[block as usize]
    }

    fn me_waiting(&self) -> &AtomicBool {
        &self.my_slot().waiting
    }

    fn other_waiting(&self, id: ThreadId) -> &AtomicBool {
        &self.arena.slot(id).waiting
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{BlockAdaptor, LockArena};
    use crate::block::ExtendedRwBlock;
    use crate::tail;

    #[test]
    fn issues_monotone_indexes() {
        let arena: LockArena<ExtendedRwBlock> = LockArena::new(2, 8);
        let me = arena.thread(1);
        assert_eq!(me.cur_block(), 0);
        assert_eq!(me.issue_new_block(), 1);
        assert_eq!(me.issue_new_block(), 2);
        assert_eq!(me.cur_block(), 2);
        assert_eq!(me.cur_block_of(2), 0);
        me.reset_blocks();
        assert_eq!(me.issue_new_block(), 1);
    }

    #[test]
    fn exhaustion_is_detectable() {
        let arena: LockArena<ExtendedRwBlock> = LockArena::new(1, 2);
        let me = arena.thread(1);
        assert_eq!(me.try_issue_new_block(), Some(1));
        assert_eq!(me.try_issue_new_block(), Some(2));
        assert_eq!(me.try_issue_new_block(), None);
    }

    #[test]
    fn dereferences_foreign_blocks() {
        let arena: LockArena<ExtendedRwBlock> = LockArena::new(3, 4);
        let t1 = arena.thread(1);
        let t2 = arena.thread(2);
        let block = t2.issue_new_block();
        let theirs = t2.rw_my_block(block);
        theirs.init_writer();

        let mine = t1.rw_tail_block(tail::combine(2, block));
        assert!(core::ptr::eq(theirs, mine));
        assert!(!mine.is_reader());
    }

    #[test]
    #[should_panic(expected = "thread id out of range")]
    fn rejects_thread_zero() {
        let arena: LockArena<ExtendedRwBlock> = LockArena::new(1, 1);
        let _ = arena.thread(0);
    }
}
