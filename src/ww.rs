//! The writer/writer MCS lock.
//!
//! One 32-bit word naming the queue tail. Waiters spin on their thread's
//! personal waiting flag rather than on a per-block field, so a thread may
//! wait on at most one writer/writer lock at a time. A reserved all-ones
//! word lets *guests* — threads with no block slab at hand — take the lock
//! by occupying the word itself; guests and queued waiters interleave
//! without knowing about each other beyond that sentinel.

use core::marker::PhantomData;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Release};

use crate::adaptor::BlockAdaptor;
use crate::cfg::atomic::AtomicU32;
use crate::relax::{Relax, SpinYield};
use crate::spin::spin_until;
use crate::tail::{self, BlockIndex};

/// A writer/writer MCS lock word: `0` when free, the holder's or tail
/// waiter's tail word when held, [`GUEST`] when held anonymously.
///
/// [`GUEST`]: WwLock::GUEST
#[derive(Debug)]
#[repr(transparent)]
pub struct WwLock {
    tail: AtomicU32,
}

impl WwLock {
    /// The anonymous-holder sentinel.
    pub const GUEST: u32 = u32::MAX;

    /// Creates a free lock word.
    #[cfg(not(all(loom, test)))]
    pub const fn new() -> Self {
        Self { tail: AtomicU32::new(0) }
    }

    /// Creates a free lock word (Loom build, non-const).
    #[cfg(all(loom, test))]
    pub fn new() -> Self {
        Self { tail: AtomicU32::new(0) }
    }

    /// The raw 32-bit image of the word.
    pub fn raw(&self) -> u32 {
        self.tail.load(Acquire)
    }

    /// Whether any holder (queued or guest) is present.
    pub fn is_locked(&self) -> bool {
        self.raw() != 0
    }

    fn swap(&self, tail: u32) -> u32 {
        self.tail.swap(tail, AcqRel)
    }

    fn cas(&self, expected: u32, desired: u32) -> bool {
        self.tail.compare_exchange(expected, desired, AcqRel, Acquire).is_ok()
    }

    fn cas_weak(&self, expected: u32, desired: u32) -> bool {
        self.tail.compare_exchange_weak(expected, desired, AcqRel, Acquire).is_ok()
    }

    fn reset(&self, tail: u32) {
        self.tail.store(tail, Release);
    }
}

#[cfg(not(all(loom, test)))]
impl Default for WwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Protocol driver for [`WwLock`], bound to one thread's [`BlockAdaptor`].
pub struct Ww<A, R = SpinYield> {
    adaptor: A,
    relax: PhantomData<R>,
}

impl<A: BlockAdaptor, R: Relax> Ww<A, R> {
    /// Wraps a per-thread adaptor handle.
    pub fn new(adaptor: A) -> Self {
        Self { adaptor, relax: PhantomData }
    }

    /// The underlying adaptor handle.
    pub fn adaptor(&self) -> &A {
        &self.adaptor
    }

    /// Acquires `lock`, spinning until granted. Returns the block index to
    /// pass to [`release`].
    ///
    /// [`release`]: Ww::release
    pub fn acquire(&self, lock: &WwLock) -> BlockIndex {
        debug_assert!(!self.adaptor.me_waiting().load(Acquire));
        let block_index = self.adaptor.issue_new_block();
        debug_assert!(block_index > 0);
        self.adaptor.ww_my_block(block_index).clear_successor();
        self.adaptor.me_waiting().store(true, Release);
        let id = self.adaptor.thread_id();
        let desired = tail::combine(id, block_index);

        // The tail word we enqueue. Normally just our own block, but stealing
        // the word from a guest can leave a whole group of waiters chained
        // behind us; the group then re-enqueues as one unit with us at its
        // head.
        let mut group_tail = desired;
        let pred = loop {
            if lock.raw() == WwLock::GUEST {
                spin_until::<R, _>(|| lock.raw() != WwLock::GUEST);
            }
            debug_assert!(group_tail != 0 && group_tail != WwLock::GUEST);
            let pred = lock.swap(group_tail);
            debug_assert_ne!(pred, group_tail);
            debug_assert_ne!(pred, desired);
            if pred == 0 {
                self.adaptor.me_waiting().store(false, Release);
                return block_index;
            } else if pred == WwLock::GUEST {
                // Took the word from under a guest; hand it back and retry
                // with whatever tail has accumulated meanwhile.
                group_tail = lock.swap(WwLock::GUEST);
                debug_assert!(group_tail != 0 && group_tail != WwLock::GUEST);
            } else {
                break pred;
            }
        };

        let pred_block = self.adaptor.ww_other_block(tail::thread_of(pred), tail::block_of(pred));
        debug_assert!(!pred_block.has_successor());
        pred_block.set_successor(id, block_index);
        spin_until::<R, _>(|| !self.adaptor.me_waiting().load(Acquire));
        block_index
    }

    /// Releases `lock`, handing it to the next queued waiter if any.
    ///
    /// `block_index` must be the value the matching [`acquire`] (or
    /// [`initial`]) returned; releasing a lock this thread does not hold is
    /// undefined.
    ///
    /// [`acquire`]: Ww::acquire
    /// [`initial`]: Ww::initial
    pub fn release(&self, lock: &WwLock, block_index: BlockIndex) {
        debug_assert!(!self.adaptor.me_waiting().load(Acquire));
        debug_assert!(lock.is_locked());
        debug_assert!(block_index > 0 && block_index <= self.adaptor.cur_block());
        let id = self.adaptor.thread_id();
        let myself = tail::combine(id, block_index);
        let block = self.adaptor.ww_my_block(block_index);
        if !block.has_successor() {
            if lock.cas(myself, 0) {
                return;
            }
            // Someone has swapped themselves in but not linked yet.
            spin_until::<R, _>(|| block.has_successor());
        }
        let successor = block.successor();
        debug_assert_ne!(tail::thread_of(successor), id);
        debug_assert!(self.adaptor.other_waiting(tail::thread_of(successor)).load(Acquire));
        self.adaptor.other_waiting(tail::thread_of(successor)).store(false, Release);
    }

    /// Pre-seeds a free `lock` as held by this thread, returning the block
    /// index to release it with. No contention may exist yet.
    pub fn initial(&self, lock: &WwLock) -> BlockIndex {
        debug_assert!(!self.adaptor.me_waiting().load(Acquire));
        debug_assert!(!lock.is_locked());
        let block_index = self.adaptor.issue_new_block();
        debug_assert!(block_index > 0);
        self.adaptor.ww_my_block(block_index).clear_successor();
        lock.reset(tail::combine(self.adaptor.thread_id(), block_index));
        block_index
    }
}

/// Acquires `lock` without a queue block, by occupying the guest sentinel.
///
/// Guests have no [`BlockAdaptor`] and no block slab at all, so this is a
/// free function: any thread can call it against a lock word it can reach.
pub fn guest_acquire<R: Relax>(lock: &WwLock) {
    spin_until::<R, _>(|| lock.cas_weak(0, WwLock::GUEST));
}

/// Releases a guest hold on `lock`.
pub fn guest_release<R: Relax>(lock: &WwLock) {
    debug_assert!(lock.is_locked());
    spin_until::<R, _>(|| lock.cas_weak(WwLock::GUEST, 0));
}

/// Pre-seeds a free `lock` as held by a guest.
pub fn guest_initial(lock: &WwLock) {
    debug_assert!(!lock.is_locked());
    lock.reset(WwLock::GUEST);
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{guest_acquire, guest_initial, guest_release, Ww, WwLock};
    use crate::adaptor::LockArena;
    use crate::block::SimpleRwBlock;
    use crate::relax::Spin;
    use crate::tail;

    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
    use std::thread;

    type Arena = LockArena<SimpleRwBlock>;

    #[test]
    fn layout() {
        assert_eq!(core::mem::size_of::<WwLock>(), 4);
    }

    #[test]
    fn uncontended_acquire_release() {
        let arena = Arena::new(1, 4);
        let ww: Ww<_, Spin> = Ww::new(arena.thread(1));
        let lock = WwLock::new();

        let block = ww.acquire(&lock);
        assert_eq!(lock.raw(), tail::combine(1, block));
        ww.release(&lock, block);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn initial_seeds_held() {
        let arena = Arena::new(1, 4);
        let ww: Ww<_, Spin> = Ww::new(arena.thread(1));
        let lock = WwLock::new();

        let block = ww.initial(&lock);
        assert!(lock.is_locked());
        ww.release(&lock, block);
        assert!(!lock.is_locked());
    }

    #[test]
    fn guest_round_trip() {
        // Guests need no adaptor, no arena, no blocks.
        let lock = WwLock::new();

        guest_acquire::<Spin>(&lock);
        assert_eq!(lock.raw(), WwLock::GUEST);
        guest_release::<Spin>(&lock);
        assert_eq!(lock.raw(), 0);

        guest_initial(&lock);
        assert_eq!(lock.raw(), WwLock::GUEST);
        guest_release::<Spin>(&lock);
        assert!(!lock.is_locked());
    }

    #[test]
    fn contended_handoff_is_exclusive() {
        const THREADS: u16 = 4;
        const ITERS: u16 = 400;

        let arena = Arena::new(THREADS, ITERS);
        let lock = WwLock::new();
        let inside = AtomicI32::new(0);
        let total = AtomicU32::new(0);

        thread::scope(|s| {
            for id in 1..=THREADS {
                let (arena, lock, inside, total) = (&arena, &lock, &inside, &total);
                s.spawn(move || {
                    let ww: Ww<_, Spin> = Ww::new(arena.thread(id));
                    for _ in 0..ITERS {
                        let block = ww.acquire(lock);
                        assert_eq!(inside.fetch_add(1, Ordering::AcqRel), 0);
                        total.fetch_add(1, Ordering::Relaxed);
                        assert_eq!(inside.fetch_sub(1, Ordering::AcqRel), 1);
                        ww.release(lock, block);
                    }
                });
            }
        });

        assert_eq!(lock.raw(), 0);
        assert_eq!(total.load(Ordering::Relaxed), THREADS as u32 * ITERS as u32);
    }

    #[test]
    fn guests_and_queued_waiters_coexist() {
        const ITERS: u16 = 200;

        // Only the queued thread gets a slab; the guest runs bare.
        let arena = Arena::new(1, ITERS);
        let lock = WwLock::new();
        let inside = AtomicI32::new(0);

        thread::scope(|s| {
            let (arena, lock, inside) = (&arena, &lock, &inside);
            s.spawn(move || {
                let ww: Ww<_, Spin> = Ww::new(arena.thread(1));
                for _ in 0..ITERS {
                    let block = ww.acquire(lock);
                    assert_eq!(inside.fetch_add(1, Ordering::AcqRel), 0);
                    assert_eq!(inside.fetch_sub(1, Ordering::AcqRel), 1);
                    ww.release(lock, block);
                }
            });
            s.spawn(move || {
                for _ in 0..ITERS {
                    guest_acquire::<Spin>(lock);
                    assert_eq!(inside.fetch_add(1, Ordering::AcqRel), 0);
                    assert_eq!(inside.fetch_sub(1, Ordering::AcqRel), 1);
                    guest_release::<Spin>(lock);
                }
            });
        });

        assert_eq!(lock.raw(), 0);
    }
}

#[cfg(all(loom, test))]
mod loom_test {
    use super::{Ww, WwLock};
    use crate::adaptor::LockArena;
    use crate::block::SimpleRwBlock;
    use crate::relax::Spin;

    use loom::cell::UnsafeCell;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn two_threads_are_exclusive() {
        loom::model(|| {
            let arena = Arc::new(LockArena::<SimpleRwBlock>::new(2, 2));
            let lock = Arc::new(WwLock::new());
            let data = Arc::new(UnsafeCell::new(0u32));

            let handles: Vec<_> = (1..=2u16)
                .map(|id| {
                    let (arena, lock, data) = (Arc::clone(&arena), Arc::clone(&lock), Arc::clone(&data));
                    thread::spawn(move || {
                        let ww: Ww<_, Spin> = Ww::new(arena.thread(id));
                        let block = ww.acquire(&lock);
                        data.with_mut(|p| unsafe { *p += 1 });
                        ww.release(&lock, block);
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(lock.raw(), 0);
            assert_eq!(data.with(|p| unsafe { *p }), 2);
        });
    }
}
