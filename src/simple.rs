//! The simple reader/writer MCS lock.
//!
//! Classical Mellor-Crummey/Scott fair reader/writer queueing: consecutive
//! readers chain their grants so they hold in parallel, a writer parked
//! behind the last reader is published through the lock word's `next_writer`
//! field. Waits cannot be cancelled; the extended flavour in
//! [`crate::extended`] exists for that.

use core::marker::PhantomData;

use crate::adaptor::BlockAdaptor;
use crate::block::SimpleRwBlock;
use crate::relax::{Relax, SpinYield};
use crate::rw::{AsyncAcquire, RwLock};
use crate::spin::spin_until;
use crate::tail::{self, BlockIndex};

/// Protocol driver for [`RwLock`] over [`SimpleRwBlock`] storage, bound to
/// one thread's [`BlockAdaptor`].
pub struct SimpleRw<A, R = SpinYield> {
    adaptor: A,
    relax: PhantomData<R>,
}

impl<A, R> SimpleRw<A, R>
where
    A: BlockAdaptor<Rw = SimpleRwBlock>,
    R: Relax,
{
    /// Wraps a per-thread adaptor handle.
    pub fn new(adaptor: A) -> Self {
        Self { adaptor, relax: PhantomData }
    }

    /// The underlying adaptor handle.
    pub fn adaptor(&self) -> &A {
        &self.adaptor
    }

    /// Acquires `lock` in shared mode, spinning until granted.
    pub fn acquire_reader(&self, lock: &RwLock) -> BlockIndex {
        debug_assert!(self.adaptor.cur_block() < BlockIndex::MAX);
        let id = self.adaptor.thread_id();
        let block_index = self.adaptor.issue_new_block();
        debug_assert!(block_index > 0);
        let my_block = self.adaptor.rw_my_block(block_index);
        my_block.init_reader();
        debug_assert!(my_block.is_blocked() && my_block.is_reader());
        debug_assert!(!my_block.successor_is_ready());

        let my_tail = tail::combine(id, block_index);
        let pred_tail = lock.swap_tail(my_tail);
        if pred_tail == 0 {
            lock.increment_nreaders();
            // Reader successors will see they don't need to wait.
            my_block.unblock();
        } else {
            let pred_block = self.adaptor.rw_tail_block(pred_tail);
            if !pred_block.is_reader()
                || pred_block.cas_state(
                    SimpleRwBlock::BLOCKED_READER_NO_SUCC,
                    SimpleRwBlock::BLOCKED_READER_READER_SUCC,
                )
            {
                // A writer, or a reader that is itself still waiting. The
                // class bits and the locator fields have distinct writers,
                // so the locator can be published blindly.
                pred_block.set_successor(id, block_index);
                spin_until::<R, _>(|| my_block.is_granted());
            } else {
                // The predecessor is an active reader; join it.
                debug_assert!(!pred_block.is_blocked());
                lock.increment_nreaders();
                pred_block.set_successor(id, block_index);
                my_block.unblock();
            }
        }
        self.finalize_reader(lock, my_block);
        debug_assert!(my_block.is_finalized());
        block_index
    }

    /// Releases a shared hold on `lock`.
    pub fn release_reader(&self, lock: &RwLock, block_index: BlockIndex) {
        let id = self.adaptor.thread_id();
        debug_assert!(block_index > 0 && block_index <= self.adaptor.cur_block());
        let my_block = self.adaptor.rw_my_block(block_index);
        debug_assert!(my_block.is_finalized());

        let my_tail = tail::combine(id, block_index);
        if my_block.successor_is_ready() || !lock.cas_tail(my_tail, 0) {
            // Someone is installing themselves behind us. Checking the class
            // bits is not enough: they only say a successor registered, not
            // that its locator fields have landed.
            spin_until::<R, _>(|| my_block.successor_is_ready());
            if my_block.has_writer_successor() {
                lock.swap_next_writer(my_block.successor_thread_id());
            }
        }

        if lock.decrement_nreaders() == 1 {
            // Last reader out wakes the parked writer, if any.
            let next_writer = lock.next_writer();
            if next_writer != 0 && lock.nreaders() == 0 && lock.cas_next_writer(next_writer, 0) {
                // A thread waits on one lock at a time, so its newest block
                // is the waiting one.
                let next_block = self.adaptor.cur_block_of(next_writer);
                let writer_block = self.adaptor.rw_other_block(next_writer, next_block);
                debug_assert!(writer_block.is_blocked());
                debug_assert!(!writer_block.is_reader());
                writer_block.unblock();
            }
        }
    }

    /// Acquires `lock` in exclusive mode, spinning until granted.
    pub fn acquire_writer(&self, lock: &RwLock) -> BlockIndex {
        debug_assert!(self.adaptor.cur_block() < BlockIndex::MAX);
        let id = self.adaptor.thread_id();
        let block_index = self.adaptor.issue_new_block();
        debug_assert!(block_index > 0);
        let my_block = self.adaptor.rw_my_block(block_index);
        my_block.init_writer();
        debug_assert!(my_block.is_blocked() && !my_block.is_reader());
        debug_assert!(!my_block.successor_is_ready());

        let my_tail = tail::combine(id, block_index);
        let pred_tail = lock.swap_tail(my_tail);
        debug_assert_ne!(pred_tail, my_tail);
        if pred_tail == 0 {
            debug_assert_eq!(lock.next_writer(), 0);
            lock.swap_next_writer(id);
            if lock.nreaders() == 0 && lock.swap_next_writer(0) == id {
                // No readers slipped in; the lock is ours.
                my_block.unblock();
                return block_index;
            }
        } else {
            let pred_block = self.adaptor.rw_tail_block(pred_tail);
            pred_block.set_successor_class_writer();
            pred_block.set_successor(id, block_index);
        }
        spin_until::<R, _>(|| my_block.is_granted());
        block_index
    }

    /// Releases an exclusive hold on `lock`.
    pub fn release_writer(&self, lock: &RwLock, block_index: BlockIndex) {
        let id = self.adaptor.thread_id();
        debug_assert!(block_index > 0 && block_index <= self.adaptor.cur_block());
        let my_block = self.adaptor.rw_my_block(block_index);

        let my_tail = tail::combine(id, block_index);
        if my_block.successor_is_ready() || !lock.cas_tail(my_tail, 0) {
            spin_until::<R, _>(|| my_block.successor_is_ready());
            let successor_block = self
                .adaptor
                .rw_other_block(my_block.successor_thread_id(), my_block.successor_block_index());
            debug_assert!(successor_block.is_blocked());
            if successor_block.is_reader() {
                lock.increment_nreaders();
            }
            successor_block.unblock();
        }
    }

    /// Takes `lock` in shared mode only if that needs no waiting. Never
    /// enqueues on failure.
    pub fn try_acquire_reader(&self, lock: &RwLock) -> Option<BlockIndex> {
        let block_index = self.adaptor.issue_new_block();
        let granted = self.retry_reader_async(lock, block_index);
        #[cfg(debug_assertions)]
        if granted {
            let my_block = self.adaptor.rw_my_block(block_index);
            debug_assert!(my_block.is_finalized());
            debug_assert!(my_block.is_granted());
        }
        granted.then_some(block_index)
    }

    /// Takes `lock` in exclusive mode only if it is completely free. Never
    /// enqueues on failure.
    pub fn try_acquire_writer(&self, lock: &RwLock) -> Option<BlockIndex> {
        let block_index = self.adaptor.issue_new_block();
        self.retry_writer_async(lock, block_index).then_some(block_index)
    }

    /// Asynchronous shared acquire. In this flavour there is no queueing
    /// retry: the attempt either lands instantly or stays un-enqueued, and
    /// [`retry_reader_async`] simply tries again from scratch.
    ///
    /// [`retry_reader_async`]: SimpleRw::retry_reader_async
    pub fn acquire_reader_async(&self, lock: &RwLock) -> AsyncAcquire {
        let block = self.adaptor.issue_new_block();
        AsyncAcquire { granted: self.retry_reader_async(lock, block), block }
    }

    /// Asynchronous exclusive acquire; see [`acquire_reader_async`].
    ///
    /// [`acquire_reader_async`]: SimpleRw::acquire_reader_async
    pub fn acquire_writer_async(&self, lock: &RwLock) -> AsyncAcquire {
        let block = self.adaptor.issue_new_block();
        AsyncAcquire { granted: self.retry_writer_async(lock, block), block }
    }

    /// Retries a pending shared acquire without blocking.
    pub fn retry_reader_async(&self, lock: &RwLock, block_index: BlockIndex) -> bool {
        let id = self.adaptor.thread_id();
        // Judge the whole lock word at once, then claim it with one CAS.
        //
        // Retrying the CAS in a loop here would deadlock two threads that
        // hold each other's lock in opposite roles out of canonical order;
        // a failed attempt must surface to the caller instead.
        let word = lock.raw();
        if RwLock::next_writer_of(word) != 0 {
            return false;
        }
        let pred_tail = RwLock::tail_of(word);
        if pred_tail != 0 {
            let pred_block = self.adaptor.rw_tail_block(pred_tail);
            if !(pred_block.is_granted() && pred_block.is_reader()) {
                return false;
            }
        }
        let desired = RwLock::compose(
            tail::combine(id, block_index),
            0,
            RwLock::nreaders_of(word) + 1,
        );
        let my_block = self.adaptor.rw_my_block(block_index);
        my_block.init_reader();
        if lock.cas_raw(word, desired) {
            if pred_tail != 0 {
                self.adaptor.rw_tail_block(pred_tail).set_successor(id, block_index);
            }
            my_block.unblock();
            self.finalize_reader(lock, my_block);
            return true;
        }
        false
    }

    /// Retries a pending exclusive acquire without blocking.
    pub fn retry_writer_async(&self, lock: &RwLock, block_index: BlockIndex) -> bool {
        let id = self.adaptor.thread_id();
        let my_block = self.adaptor.rw_my_block(block_index);
        my_block.init_writer();
        let desired = RwLock::compose(tail::combine(id, block_index), 0, 0);
        my_block.unblock();
        lock.cas_raw(0, desired)
    }

    /// No-op: this flavour never leaves an attempt enqueued, so there is
    /// nothing to withdraw.
    pub fn cancel_reader_async(&self, _lock: &RwLock, _block_index: BlockIndex) {}

    /// No-op; see [`cancel_reader_async`].
    ///
    /// [`cancel_reader_async`]: SimpleRw::cancel_reader_async
    pub fn cancel_writer_async(&self, _lock: &RwLock, _block_index: BlockIndex) {}

    /// Completes a shared acquire: a reader that just got granted passes the
    /// grant on to a chained reader successor, which is what lets readers
    /// run in parallel.
    fn finalize_reader(&self, lock: &RwLock, my_block: &SimpleRwBlock) {
        debug_assert!(!my_block.is_finalized());
        if my_block.has_reader_successor() {
            spin_until::<R, _>(|| my_block.successor_is_ready());
            let successor_block = self
                .adaptor
                .rw_other_block(my_block.successor_thread_id(), my_block.successor_block_index());
            lock.increment_nreaders();
            successor_block.unblock();
        }
        my_block.set_finalized();
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::SimpleRw;
    use crate::adaptor::LockArena;
    use crate::block::SimpleRwBlock;
    use crate::relax::Spin;
    use crate::rw::RwLock;
    use crate::tail;

    use std::sync::atomic::{AtomicI32, Ordering};
    use std::thread;

    type Arena = LockArena<SimpleRwBlock>;

    fn driver(arena: &Arena, id: u16) -> SimpleRw<crate::adaptor::ArenaThread<'_, SimpleRwBlock>, Spin> {
        SimpleRw::new(arena.thread(id))
    }

    #[test]
    fn reader_round_trip() {
        let arena = Arena::new(1, 4);
        let rw = driver(&arena, 1);
        let lock = RwLock::new();

        let block = rw.acquire_reader(&lock);
        assert_eq!(lock.nreaders(), 1);
        assert_eq!(lock.tail(), tail::combine(1, block));
        rw.release_reader(&lock, block);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn writer_round_trip() {
        let arena = Arena::new(1, 4);
        let rw = driver(&arena, 1);
        let lock = RwLock::new();

        let block = rw.acquire_writer(&lock);
        assert_eq!(lock.tail(), tail::combine(1, block));
        assert_eq!(lock.nreaders(), 0);
        assert_eq!(lock.next_writer(), 0);
        rw.release_writer(&lock, block);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn readers_chain_in_parallel() {
        let arena = Arena::new(3, 4);
        let (r1, r2, r3) = (driver(&arena, 1), driver(&arena, 2), driver(&arena, 3));
        let lock = RwLock::new();

        let b1 = r1.acquire_reader(&lock);
        let b2 = r2.acquire_reader(&lock);
        let b3 = r3.acquire_reader(&lock);
        assert_eq!(lock.nreaders(), 3);
        assert_eq!(lock.tail(), tail::combine(3, b3));

        r1.release_reader(&lock, b1);
        r2.release_reader(&lock, b2);
        r3.release_reader(&lock, b3);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn try_reader_fails_against_writer() {
        let arena = Arena::new(2, 4);
        let (w, r) = (driver(&arena, 1), driver(&arena, 2));
        let lock = RwLock::new();

        let wb = w.acquire_writer(&lock);
        let before = lock.raw();
        assert_eq!(r.try_acquire_reader(&lock), None);
        assert_eq!(lock.raw(), before);
        w.release_writer(&lock, wb);
    }

    #[test]
    fn try_writer_needs_empty_word() {
        let arena = Arena::new(2, 4);
        let (r, w) = (driver(&arena, 1), driver(&arena, 2));
        let lock = RwLock::new();

        let rb = r.acquire_reader(&lock);
        assert_eq!(w.try_acquire_writer(&lock), None);
        r.release_reader(&lock, rb);

        let wb = w.try_acquire_writer(&lock).unwrap();
        w.release_writer(&lock, wb);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn try_reader_joins_granted_reader() {
        let arena = Arena::new(2, 4);
        let (r1, r2) = (driver(&arena, 1), driver(&arena, 2));
        let lock = RwLock::new();

        let b1 = r1.acquire_reader(&lock);
        let b2 = r2.try_acquire_reader(&lock).unwrap();
        assert_eq!(lock.nreaders(), 2);

        r1.release_reader(&lock, b1);
        r2.release_reader(&lock, b2);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn async_writer_retries_from_scratch() {
        let arena = Arena::new(2, 4);
        let (r, w) = (driver(&arena, 1), driver(&arena, 2));
        let lock = RwLock::new();

        let rb = r.acquire_reader(&lock);
        let pending = w.acquire_writer_async(&lock);
        assert!(!pending.granted);
        assert!(!w.retry_writer_async(&lock, pending.block));

        r.release_reader(&lock, rb);
        assert!(w.retry_writer_async(&lock, pending.block));
        w.release_writer(&lock, pending.block);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn writer_waits_for_readers() {
        let arena = Arena::new(2, 8);
        let lock = RwLock::new();
        let occupancy = AtomicI32::new(0);

        thread::scope(|s| {
            let (arena, lock, occupancy) = (&arena, &lock, &occupancy);
            s.spawn(move || {
                let r = driver(arena, 1);
                for _ in 0..4 {
                    let block = r.acquire_reader(lock);
                    let seen = occupancy.fetch_add(1, Ordering::AcqRel);
                    assert!(seen >= 0);
                    occupancy.fetch_sub(1, Ordering::AcqRel);
                    r.release_reader(lock, block);
                }
            });
            s.spawn(move || {
                let w = driver(arena, 2);
                for _ in 0..4 {
                    let block = w.acquire_writer(lock);
                    assert_eq!(occupancy.fetch_sub(1000, Ordering::AcqRel), 0);
                    occupancy.fetch_add(1000, Ordering::AcqRel);
                    w.release_writer(lock, block);
                }
            });
        });

        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn contended_mix_preserves_exclusion() {
        const READERS: u16 = 3;
        const WRITERS: u16 = 2;
        const ITERS: u16 = 300;

        let arena = Arena::new(READERS + WRITERS, ITERS);
        let lock = RwLock::new();
        let occupancy = AtomicI32::new(0);

        thread::scope(|s| {
            for id in 1..=READERS {
                let (arena, lock, occupancy) = (&arena, &lock, &occupancy);
                s.spawn(move || {
                    let r = driver(arena, id);
                    for _ in 0..ITERS {
                        let block = r.acquire_reader(lock);
                        assert!(occupancy.fetch_add(1, Ordering::AcqRel) >= 0);
                        occupancy.fetch_sub(1, Ordering::AcqRel);
                        r.release_reader(lock, block);
                    }
                });
            }
            for id in READERS + 1..=READERS + WRITERS {
                let (arena, lock, occupancy) = (&arena, &lock, &occupancy);
                s.spawn(move || {
                    let w = driver(arena, id);
                    for _ in 0..ITERS {
                        let block = w.acquire_writer(lock);
                        assert_eq!(occupancy.fetch_sub(1000, Ordering::AcqRel), 0);
                        occupancy.fetch_add(1000, Ordering::AcqRel);
                        w.release_writer(lock, block);
                    }
                });
            }
        });

        assert_eq!(lock.raw(), 0);
    }
}
