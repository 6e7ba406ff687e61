//! The extended reader/writer MCS lock: fair queueing like the simple
//! flavour, plus the ability of any waiter to *give up*.
//!
//! Giving up is what makes this the hard one. A waiter that times out (or is
//! cancelled through the async surface) must splice itself out of a
//! doubly-linked queue whose links live in other threads' blocks, while the
//! predecessor may simultaneously be granting, releasing, or cancelling
//! itself. The protocol resolves every such race through the two packed
//! per-block words ([`ExtendedRwBlock`]): a leaving waiter first claims its
//! own pred link (so nobody can grant through it anymore), freezes its
//! successor's registration, detaches from the predecessor with a CAS that
//! publishes the [`SUCC_LEAVING`] sentinel, and finally either shrinks the
//! queue tail or re-links predecessor and successor directly. Whoever loses
//! one of those CASes re-reads the state and follows the winner.
//!
//! [`SUCC_LEAVING`]: ExtendedRwBlock::SUCC_LEAVING

use core::marker::PhantomData;

use crate::adaptor::BlockAdaptor;
use crate::block::ExtendedRwBlock;
use crate::relax::{Relax, SpinYield};
use crate::rw::{AsyncAcquire, RwLock};
use crate::spin::{spin_until, spin_while_budget};
use crate::tail::{self, BlockIndex};

/// How long an acquire is willing to wait before it withdraws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Do not wait at all: if the lock is not granted on the spot, leave the
    /// attempt enqueued and report [`Acquire::Requested`].
    Immediate,
    /// Spin this many checks, then run the cancellation protocol. The budget
    /// counts local spins, not wall-clock time.
    Spins(u32),
    /// Wait until granted.
    Never,
}

/// Outcome of a timed acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The lock is held; release it with this block.
    Granted(BlockIndex),
    /// The attempt is enqueued but not granted. The block belongs to the
    /// queue until a `retry_*_async` succeeds or a `cancel_*_async` runs.
    Requested(BlockIndex),
    /// The attempt withdrew; the thread holds nothing.
    Cancelled,
}

/// Internal grant status, mirroring the three lock-level outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    Ok,
    Requested,
    Cancelled,
}

/// Protocol driver for [`RwLock`] over [`ExtendedRwBlock`] storage, bound to
/// one thread's [`BlockAdaptor`].
pub struct ExtendedRw<A, R = SpinYield> {
    adaptor: A,
    relax: PhantomData<R>,
}

impl<A, R> ExtendedRw<A, R>
where
    A: BlockAdaptor<Rw = ExtendedRwBlock>,
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
        let block_index = self.adaptor.issue_new_block();
        let grant = self.reader_lock(lock, block_index, Timeout::Never);
        debug_assert_eq!(grant, Grant::Ok);
        #[cfg(debug_assertions)]
        {
            let my_block = self.adaptor.rw_my_block(block_index);
            debug_assert!(my_block.pred_granted());
            debug_assert!(my_block.next_granted());
        }
        block_index
    }

    /// Acquires `lock` in exclusive mode, spinning until granted.
    pub fn acquire_writer(&self, lock: &RwLock) -> BlockIndex {
        let block_index = self.adaptor.issue_new_block();
        let grant = self.writer_lock(lock, block_index, Timeout::Never);
        debug_assert_eq!(grant, Grant::Ok);
        #[cfg(debug_assertions)]
        {
            let my_block = self.adaptor.rw_my_block(block_index);
            debug_assert!(my_block.pred_granted());
            debug_assert!(my_block.next_granted());
        }
        block_index
    }

    /// Acquires `lock` in shared mode, giving up once `timeout` expires.
    pub fn acquire_reader_timed(&self, lock: &RwLock, timeout: Timeout) -> Acquire {
        let block_index = self.adaptor.issue_new_block();
        match self.reader_lock(lock, block_index, timeout) {
            Grant::Ok => Acquire::Granted(block_index),
            Grant::Requested => Acquire::Requested(block_index),
            Grant::Cancelled => Acquire::Cancelled,
        }
    }

    /// Acquires `lock` in exclusive mode, giving up once `timeout` expires.
    pub fn acquire_writer_timed(&self, lock: &RwLock, timeout: Timeout) -> Acquire {
        let block_index = self.adaptor.issue_new_block();
        match self.writer_lock(lock, block_index, timeout) {
            Grant::Ok => Acquire::Granted(block_index),
            Grant::Requested => Acquire::Requested(block_index),
            Grant::Cancelled => Acquire::Cancelled,
        }
    }

    /// Takes `lock` in shared mode only if one CAS suffices: the word is
    /// empty or its tail is a granted reader with no writer parked. Never
    /// enqueues on failure.
    pub fn try_acquire_reader(&self, lock: &RwLock) -> Option<BlockIndex> {
        let id = self.adaptor.thread_id();
        let block_index = self.adaptor.issue_new_block();

        let word = lock.raw();
        if RwLock::next_writer_of(word) != 0 {
            return None;
        }
        let pred_tail = RwLock::tail_of(word);
        if pred_tail != 0 {
            let pred_block = self.adaptor.rw_tail_block(pred_tail);
            if !(pred_block.pred_granted() && pred_block.is_reader()) {
                return None;
            }
        }
        let my_tail = tail::combine(id, block_index);
        let desired = RwLock::compose(my_tail, 0, RwLock::nreaders_of(word) + 1);
        let my_block = self.adaptor.rw_my_block(block_index);
        my_block.init_reader();
        if !lock.cas_raw(word, desired) {
            return None;
        }
        if pred_tail != 0 {
            // The granted tail reader must not wait for us on release.
            self.adaptor.rw_tail_block(pred_tail).set_next_id(ExtendedRwBlock::SUCC_NONE);
        }
        my_block.set_pred_granted();
        let grant = self.finish_reader_acquire(lock, my_block, my_tail);
        debug_assert_eq!(grant, Grant::Ok);
        debug_assert!(my_block.pred_granted() && my_block.next_granted());
        Some(block_index)
    }

    /// Takes `lock` in exclusive mode only if it is completely free. Never
    /// enqueues on failure.
    pub fn try_acquire_writer(&self, lock: &RwLock) -> Option<BlockIndex> {
        let id = self.adaptor.thread_id();
        let block_index = self.adaptor.issue_new_block();
        let my_block = self.adaptor.rw_my_block(block_index);
        my_block.init_writer();
        my_block.set_pred_granted();
        my_block.set_next_granted();
        let desired = RwLock::compose(tail::combine(id, block_index), 0, 0);
        lock.cas_raw(0, desired).then_some(block_index)
    }

    /// Releases a shared hold on `lock`.
    pub fn release_reader(&self, lock: &RwLock, block_index: BlockIndex) {
        let id = self.adaptor.thread_id();
        let my_tail = tail::combine(id, block_index);
        let my_block = self.adaptor.rw_my_block(block_index);

        // Readers can still join through the granted flag, but a successor
        // must not cancel out from under the hand-off below.
        debug_assert!(my_block.next_granted());
        my_block.set_next_busy();
        spin_until::<R, _>(|| my_block.next_id() != ExtendedRwBlock::SUCC_LEAVING);

        let mut next_id = my_block.next_id();
        while next_id == 0 {
            if lock.cas_tail(my_tail, 0) {
                // Truly nobody behind us.
                self.finish_reader_release(lock);
                return;
            }
            next_id = my_block.next_id();
        }
        debug_assert_ne!(next_id, ExtendedRwBlock::SUCC_LEAVING);
        if next_id != ExtendedRwBlock::SUCC_NONE {
            let succ_block = self.adaptor.rw_tail_block(next_id);
            debug_assert!(my_block.has_successor());
            debug_assert!(!succ_block.pred_granted());
            if succ_block.is_reader() {
                // A cancelled successor may have re-linked this one here.
                lock.increment_nreaders();
                while !succ_block.cas_pred_id(my_tail, ExtendedRwBlock::PRED_ACQUIRED) {}
                succ_block.set_pred_granted();
            } else {
                debug_assert!(my_block.has_writer_successor());
                debug_assert_eq!(lock.next_writer(), 0);
                lock.set_next_writer(tail::thread_of(next_id));
                // Then tell the writer it no longer has a pred link.
                spin_until::<R, _>(|| succ_block.cas_pred_id(my_tail, 0));
            }
        }
        self.finish_reader_release(lock);
    }

    /// Releases an exclusive hold on `lock`.
    pub fn release_writer(&self, lock: &RwLock, block_index: BlockIndex) {
        let id = self.adaptor.thread_id();
        let my_tail = tail::combine(id, block_index);
        let my_block = self.adaptor.rw_my_block(block_index);

        debug_assert!(my_block.pred_granted());
        debug_assert!(my_block.next_granted());
        debug_assert_eq!(lock.nreaders(), 0);
        debug_assert_eq!(lock.next_writer(), 0);
        my_block.set_next_busy();
        spin_until::<R, _>(|| my_block.next_id() != ExtendedRwBlock::SUCC_LEAVING);

        let mut next_id = my_block.next_id();
        while next_id == 0 {
            if lock.cas_tail(my_tail, 0) {
                return;
            }
            next_id = my_block.next_id();
        }
        debug_assert!(my_block.has_successor());
        debug_assert_ne!(next_id, ExtendedRwBlock::SUCC_LEAVING);
        debug_assert_ne!(next_id, ExtendedRwBlock::SUCC_NONE);

        let succ_block = self.adaptor.rw_tail_block(next_id);
        debug_assert!(!succ_block.pred_granted());
        debug_assert_ne!(succ_block.pred_id(), ExtendedRwBlock::PRED_ACQUIRED);
        // The successor may be installing its pred link right now; once this
        // lands it can no longer cancel.
        while !succ_block.cas_pred_id(my_tail, ExtendedRwBlock::PRED_ACQUIRED) {
            debug_assert_eq!(my_block.next_id(), next_id);
        }
        if succ_block.is_reader() {
            lock.increment_nreaders();
        }
        succ_block.set_pred_granted();
    }

    /// Asynchronous shared acquire: enqueues and reports without waiting.
    pub fn acquire_reader_async(&self, lock: &RwLock) -> AsyncAcquire {
        let block_index = self.adaptor.issue_new_block();
        let grant = self.reader_lock(lock, block_index, Timeout::Immediate);
        debug_assert_ne!(grant, Grant::Cancelled);
        AsyncAcquire { granted: grant == Grant::Ok, block: block_index }
    }

    /// Asynchronous exclusive acquire: enqueues and reports without waiting.
    pub fn acquire_writer_async(&self, lock: &RwLock) -> AsyncAcquire {
        let block_index = self.adaptor.issue_new_block();
        let grant = self.writer_lock(lock, block_index, Timeout::Immediate);
        debug_assert_ne!(grant, Grant::Cancelled);
        AsyncAcquire { granted: grant == Grant::Ok, block: block_index }
    }

    /// Polls a pending shared acquire; completes it if the grant arrived.
    pub fn retry_reader_async(&self, lock: &RwLock, block_index: BlockIndex) -> bool {
        let my_block = self.adaptor.rw_my_block(block_index);
        if my_block.pred_granted() {
            // Our own next word races only with ourselves here.
            if !my_block.next_granted() {
                let my_tail = tail::combine(self.adaptor.thread_id(), block_index);
                let grant = self.finish_reader_acquire(lock, my_block, my_tail);
                debug_assert_eq!(grant, Grant::Ok);
            }
            debug_assert!(my_block.next_granted());
            return true;
        }
        debug_assert!(!my_block.next_granted());
        false
    }

    /// Polls a pending exclusive acquire; completes it if the grant arrived.
    pub fn retry_writer_async(&self, _lock: &RwLock, block_index: BlockIndex) -> bool {
        let my_block = self.adaptor.rw_my_block(block_index);
        if my_block.pred_granted() {
            if !my_block.next_granted() {
                my_block.set_next_granted();
            }
            debug_assert!(my_block.next_granted());
            return true;
        }
        debug_assert!(!my_block.next_granted());
        false
    }

    /// Withdraws a pending shared acquire. If the grant raced in first, the
    /// acquire is completed and then released, so the caller ends up holding
    /// nothing either way.
    pub fn cancel_reader_async(&self, lock: &RwLock, block_index: BlockIndex) {
        if self.retry_reader_async(lock, block_index) {
            self.release_reader(lock, block_index);
            return;
        }
        let my_tail = tail::combine(self.adaptor.thread_id(), block_index);
        if self.cancel_reader(lock, my_tail) == Grant::Ok {
            self.release_reader(lock, block_index);
        }
    }

    /// Withdraws a pending exclusive acquire; see [`cancel_reader_async`].
    ///
    /// [`cancel_reader_async`]: ExtendedRw::cancel_reader_async
    pub fn cancel_writer_async(&self, lock: &RwLock, block_index: BlockIndex) {
        let my_tail = tail::combine(self.adaptor.thread_id(), block_index);
        if self.cancel_writer(lock, my_tail) == Grant::Ok {
            self.release_writer(lock, block_index);
        }
    }

    /// Spins on the grant flag within `timeout`. Returns whether granted.
    fn wait_granted(&self, my_block: &ExtendedRwBlock, timeout: Timeout) -> bool {
        match timeout {
            Timeout::Never => {
                spin_until::<R, _>(|| my_block.pred_granted());
                true
            }
            Timeout::Immediate => my_block.pred_granted(),
            Timeout::Spins(budget) => spin_while_budget::<R, _>(budget, || my_block.pred_granted()),
        }
    }

    fn reader_lock(&self, lock: &RwLock, block_index: BlockIndex, timeout: Timeout) -> Grant {
        debug_assert!(block_index > 0);
        let my_block = self.adaptor.rw_my_block(block_index);
        my_block.init_reader();
        debug_assert!(my_block.pred_waiting());
        debug_assert!(my_block.next_waiting());
        debug_assert!(!my_block.next_busy());
        let id = self.adaptor.thread_id();
        let my_tail = tail::combine(id, block_index);

        let pred = lock.swap_tail(my_tail);
        if pred == 0 {
            lock.increment_nreaders();
            debug_assert_eq!(my_block.pred_id(), 0);
            my_block.set_pred_granted();
            return self.finish_reader_acquire(lock, my_block, my_tail);
        }

        debug_assert_eq!(my_block.pred_id(), 0);
        // Our pred link is still unset, so the predecessor cannot reach us
        // yet; dereferencing it is safe.
        let pred_block = self.adaptor.rw_tail_block(pred);
        if pred_block.is_reader() {
            self.reader_lock_with_reader_pred(lock, my_block, my_tail, pred, timeout)
        } else {
            self.reader_lock_with_writer_pred(lock, my_block, my_tail, pred, timeout)
        }
    }

    /// Completes a granted reader's acquire: while holding the busy bit,
    /// pass the share along to a chained reader successor (if one managed to
    /// register) so consecutive readers overlap.
    fn finish_reader_acquire(
        &self,
        lock: &RwLock,
        my_block: &ExtendedRwBlock,
        my_tail: u32,
    ) -> Grant {
        my_block.set_next_busy_granted();
        debug_assert!(my_block.next_granted());
        debug_assert!(my_block.next_busy());
        spin_until::<R, _>(|| my_block.next_id() != ExtendedRwBlock::SUCC_LEAVING);

        // If the tail still points at us, nobody is behind us.
        if lock.tail() == my_tail {
            my_block.clear_next_busy();
            return Grant::Ok;
        }
        // Busy is set, so our next id is now stable; wait for the successor
        // link to land.
        spin_until::<R, _>(|| my_block.next_id() != 0);
        let next_id = my_block.next_id();
        debug_assert_ne!(next_id, ExtendedRwBlock::SUCC_LEAVING);
        if next_id == ExtendedRwBlock::SUCC_NONE {
            my_block.clear_next_busy();
            return Grant::Ok;
        }

        let succ_block = self.adaptor.rw_tail_block(next_id);
        if my_block.next_leaving_granted() && !my_block.has_successor() {
            // The grant raced our own cancellation: the successor saw us
            // leaving and registered id-only, so it is acquiring afresh and
            // will not wait on our class bits. Hand the share over by hand.
            spin_until::<R, _>(|| succ_block.pred_id() == my_tail);
            debug_assert!(succ_block.pred_waiting());
            if succ_block.cas_pred_id(my_tail, ExtendedRwBlock::PRED_ACQUIRED) {
                lock.increment_nreaders();
                succ_block.set_pred_granted();
                // Release must know there is nothing left to poke.
                my_block.set_next_id(ExtendedRwBlock::SUCC_NONE);
            }
        } else if my_block.has_reader_successor() {
            loop {
                spin_until::<R, _>(|| succ_block.pred_id() == my_tail);
                if succ_block.cas_pred_id(my_tail, ExtendedRwBlock::PRED_ACQUIRED) {
                    debug_assert!(succ_block.pred_waiting());
                    lock.increment_nreaders();
                    succ_block.set_pred_granted();
                    my_block.set_next_id(ExtendedRwBlock::SUCC_NONE);
                    break;
                }
            }
        }
        my_block.clear_next_busy();
        Grant::Ok
    }

    fn reader_lock_with_reader_pred(
        &self,
        lock: &RwLock,
        my_block: &ExtendedRwBlock,
        my_tail: u32,
        mut pred: u32,
        timeout: Timeout,
    ) -> Grant {
        let mut pred_block = self.adaptor.rw_tail_block(pred);
        loop {
            debug_assert_eq!(my_block.pred_id(), 0);
            debug_assert!(pred_block.is_reader());
            // Wait out any previous successor that is still cancelling.
            spin_until::<R, _>(|| pred_block.next_id() == 0 && !pred_block.has_successor());

            let expected = ExtendedRwBlock::WAITING_NO_SUCC as u64;
            let desired = ExtendedRwBlock::WAITING_READER_SUCC as u64;
            let val = pred_block.cas_next_val(expected, desired);
            if val == expected {
                // Registered while the predecessor still waits; line up.
                pred_block.set_next_id(my_tail);
                my_block.set_pred_id(pred);
                if self.wait_granted(my_block, timeout) {
                    return self.finish_reader_acquire(lock, my_block, my_tail);
                }
                if timeout == Timeout::Immediate {
                    return Grant::Requested;
                }
                return self.cancel_reader(lock, my_tail);
            }

            let flags = val as u32;
            if flags & ExtendedRwBlock::STATE_MASK == ExtendedRwBlock::LEAVING {
                // The predecessor is cancelling. Register id-only (no class:
                // it must not try to wake us) and wait for it to hand us a
                // replacement pred, or the lock itself.
                pred_block.set_next_id(my_tail);
                my_block.set_pred_id(pred);
                spin_until::<R, _>(|| my_block.pred_id() != pred || !my_block.pred_waiting());
                let new_pred = my_block.swap_pred_id(0);
                if new_pred == ExtendedRwBlock::PRED_ACQUIRED {
                    spin_until::<R, _>(|| my_block.pred_granted());
                    return self.finish_reader_acquire(lock, my_block, my_tail);
                }
                debug_assert!(!my_block.pred_granted());
                debug_assert!(new_pred != 0 && new_pred != ExtendedRwBlock::PRED_ACQUIRED);
                pred = new_pred;
                pred_block = self.adaptor.rw_tail_block(pred);
                if !pred_block.is_reader() {
                    return self.reader_lock_with_writer_pred(lock, my_block, my_tail, pred, timeout);
                }
            } else {
                // The predecessor is granted, directly or while leaving. We
                // never registered, so it will not wake us; take the share
                // ourselves and stop its release from waiting on a poke.
                // This also covers a predecessor whose busy bit is set.
                debug_assert_ne!(flags & ExtendedRwBlock::GRANTED, 0);
                pred_block.set_next_id(ExtendedRwBlock::SUCC_NONE);
                lock.increment_nreaders();
                my_block.set_pred_granted();
                return self.finish_reader_acquire(lock, my_block, my_tail);
            }
        }
    }

    fn reader_lock_with_writer_pred(
        &self,
        lock: &RwLock,
        my_block: &ExtendedRwBlock,
        my_tail: u32,
        pred: u32,
        mut timeout: Timeout,
    ) -> Grant {
        let pred_block = self.adaptor.rw_tail_block(pred);
        debug_assert!(!pred_block.is_reader());
        // Wait out any previous successor that is still cancelling.
        spin_until::<R, _>(|| pred_block.next_id() == 0 && !pred_block.has_successor());
        debug_assert_eq!(my_block.pred_id(), 0);
        // A writer pred means waiting either way; register class first, then
        // the id, then our own pred link.
        pred_block.set_reader_successor();
        pred_block.set_next_id(my_tail);
        if my_block.swap_pred_id(pred) == ExtendedRwBlock::PRED_ACQUIRED {
            // The predecessor's release raced in and already picked us; the
            // grant is imminent, cancelling now would corrupt the hand-off.
            timeout = Timeout::Never;
        }

        if self.wait_granted(my_block, timeout) {
            return self.finish_reader_acquire(lock, my_block, my_tail);
        }
        if timeout == Timeout::Immediate {
            return Grant::Requested;
        }
        self.cancel_reader(lock, my_tail)
    }

    fn cancel_reader(&self, lock: &RwLock, my_tail: u32) -> Grant {
        let my_block = self.adaptor.rw_tail_block(my_tail);
        // Claim the pred link so the predecessor can neither grant us nor
        // hand us a replacement while we decide.
        let pred = my_block.swap_pred_id(0);
        if pred == ExtendedRwBlock::PRED_ACQUIRED {
            spin_until::<R, _>(|| my_block.pred_granted());
            return self.finish_reader_acquire(lock, my_block, my_tail);
        }

        debug_assert!(!my_block.next_granted());
        my_block.set_next_leaving();
        // A successor that started cancelling first has priority; wait for
        // it to finish before touching our links.
        spin_until::<R, _>(|| my_block.next_id() != ExtendedRwBlock::SUCC_LEAVING);

        debug_assert_ne!(pred, 0);
        let pred_block = self.adaptor.rw_tail_block(pred);
        if pred_block.is_reader() {
            self.cancel_reader_with_reader_pred(lock, my_block, my_tail, pred)
        } else {
            debug_assert_eq!(my_block.pred_id(), 0);
            self.cancel_reader_with_writer_pred(lock, my_block, my_tail, pred)
        }
    }

    fn cancel_reader_with_writer_pred(
        &self,
        lock: &RwLock,
        my_block: &ExtendedRwBlock,
        my_tail: u32,
        mut pred: u32,
    ) -> Grant {
        'pred: loop {
            debug_assert!(my_block.next_leaving());
            debug_assert_ne!(pred, 0);
            debug_assert_ne!(tail::thread_of(pred), self.adaptor.thread_id());
            let pred_block = self.adaptor.rw_tail_block(pred);
            debug_assert!(!pred_block.is_reader());
            // A cancelling chain ahead may still be re-linking; wait until
            // the registration really points at us.
            spin_until::<R, _>(|| {
                pred_block.next_id() == my_tail && pred_block.has_reader_successor()
            });
            debug_assert_eq!(my_block.pred_id(), 0);
            loop {
                let eflags = pred_block.next_flags();
                if eflags & ExtendedRwBlock::STATE_MASK == ExtendedRwBlock::LEAVING {
                    // The pred leaves first; it hands us a new pred after
                    // its own relink CAS (or the lock, if its grant won).
                    my_block.set_pred_id(pred);
                    spin_until::<R, _>(|| my_block.pred_id() != pred);
                    let new_pred = my_block.swap_pred_id(0);
                    if new_pred == ExtendedRwBlock::PRED_ACQUIRED {
                        spin_until::<R, _>(|| my_block.pred_granted());
                        return self.finish_reader_acquire(lock, my_block, my_tail);
                    }
                    debug_assert_ne!(new_pred, 0);
                    pred = new_pred;
                    if self.adaptor.rw_tail_block(pred).is_reader() {
                        return self.cancel_reader_with_reader_pred(lock, my_block, my_tail, pred);
                    }
                    continue 'pred;
                } else if eflags & ExtendedRwBlock::BUSY != 0 {
                    // The pred is releasing straight into us; accept.
                    debug_assert!(pred_block.next_granted());
                    my_block.set_pred_id(pred);
                    spin_until::<R, _>(|| my_block.pred_granted());
                    return self.finish_reader_acquire(lock, my_block, my_tail);
                }
                // Freeze our registration out of the pred.
                let expected = eflags as u64 | ((my_tail as u64) << 32);
                let desired = eflags as u64 | ((ExtendedRwBlock::SUCC_LEAVING as u64) << 32);
                if pred_block.cas_next(expected, desired) {
                    break;
                }
            }
            // The pred can no longer wake us during its release; splice out.
            if my_block.next_id() == 0 && lock.cas_tail(my_tail, pred) {
                pred_block.clear_successor_class();
                pred_block.set_next_id(0);
                debug_assert!(!my_block.has_successor());
                return Grant::Cancelled;
            }
            self.relink_cancelled_reader(pred_block, my_block, my_tail, pred);
            return Grant::Cancelled;
        }
    }

    fn cancel_reader_with_reader_pred(
        &self,
        lock: &RwLock,
        my_block: &ExtendedRwBlock,
        my_tail: u32,
        mut pred: u32,
    ) -> Grant {
        loop {
            debug_assert!(my_block.next_leaving());
            debug_assert_ne!(pred, 0);
            debug_assert_ne!(tail::thread_of(pred), self.adaptor.thread_id());
            let pred_block = self.adaptor.rw_tail_block(pred);
            // Wait for any cancelling chain ahead to finish re-linking us.
            spin_until::<R, _>(|| {
                pred_block.has_reader_successor() && pred_block.next_id() == my_tail
            });

            // Swap only the id for the leaving sentinel, keeping the class.
            let expected =
                ExtendedRwBlock::WAITING_READER_SUCC as u64 | ((my_tail as u64) << 32);
            let desired = ExtendedRwBlock::WAITING_READER_SUCC as u64
                | ((ExtendedRwBlock::SUCC_LEAVING as u64) << 32);
            let val = pred_block.cas_next_val(expected, desired);
            if val == expected {
                // From here the pred waits for a new successor if it moves,
                // and our successor waits for a new pred.
                debug_assert!(my_block.next_leaving());
                if !my_block.has_successor() && lock.cas_tail(my_tail, pred) {
                    // A successor arriving now waits for the leaving
                    // sentinel to clear before registering.
                    debug_assert_eq!(my_block.next_id(), 0);
                    debug_assert!(!my_block.has_successor());
                    debug_assert_eq!(pred_block.next_id(), ExtendedRwBlock::SUCC_LEAVING);
                    pred_block.clear_successor_class();
                    pred_block.set_next_id(0);
                    return Grant::Cancelled;
                }
                self.relink_cancelled_reader(pred_block, my_block, my_tail, pred);
                return Grant::Cancelled;
            }

            debug_assert_ne!(val as u32 & ExtendedRwBlock::SUCC_CLASS_MASK, 0);
            let flags = val as u32;
            if flags & ExtendedRwBlock::GRANTED != 0 {
                // We are registered as a reader successor, so the granted
                // pred will wake us in its finish step (even with its busy
                // bit set); just take the grant.
                my_block.set_pred_id(pred);
                spin_until::<R, _>(|| my_block.pred_granted());
                return self.finish_reader_acquire(lock, my_block, my_tail);
            }

            debug_assert_eq!(flags & ExtendedRwBlock::STATE_MASK, ExtendedRwBlock::LEAVING);
            // The pred leaves first and will hand us a replacement.
            my_block.set_pred_id(pred);
            spin_until::<R, _>(|| my_block.pred_id() != pred || !my_block.pred_waiting());
            let new_pred = my_block.swap_pred_id(0);
            if new_pred == ExtendedRwBlock::PRED_ACQUIRED {
                spin_until::<R, _>(|| my_block.pred_granted());
                return self.finish_reader_acquire(lock, my_block, my_tail);
            }
            debug_assert!(!my_block.pred_granted());
            debug_assert_ne!(new_pred, 0);
            pred = new_pred;
            if !self.adaptor.rw_tail_block(pred).is_reader() {
                return self.cancel_reader_with_writer_pred(lock, my_block, my_tail, pred);
            }
        }
    }

    /// Links our successor to our predecessor, completing a reader's exit
    /// from the middle of the queue.
    fn relink_cancelled_reader(
        &self,
        pred_block: &ExtendedRwBlock,
        my_block: &ExtendedRwBlock,
        my_tail: u32,
        pred: u32,
    ) {
        spin_until::<R, _>(|| my_block.next_id() != 0);
        debug_assert!(my_block.next_leaving());
        let next_id = my_block.next_id();
        debug_assert_ne!(next_id, ExtendedRwBlock::SUCC_LEAVING);
        debug_assert_ne!(next_id, 0);
        let succ_block = self.adaptor.rw_tail_block(next_id);
        debug_assert_ne!(pred, 0);
        while !succ_block.cas_pred_id(my_tail, pred) {}

        // Class-less successors registered against our leaving state; they
        // re-register on their own, so the pred gets no successor entry.
        let successor = if my_block.has_reader_successor() {
            ExtendedRwBlock::SUCC_CLASS_READER as u64 | ((next_id as u64) << 32)
        } else if my_block.has_writer_successor() {
            ExtendedRwBlock::SUCC_CLASS_WRITER as u64 | ((next_id as u64) << 32)
        } else {
            0
        };
        debug_assert!(pred_block.has_reader_successor());
        debug_assert_eq!(pred_block.next_id(), ExtendedRwBlock::SUCC_LEAVING);

        // Install it while preserving the pred's own state and busy bits.
        loop {
            let expected = pred_block.next();
            debug_assert_eq!((expected >> 32) as u32, ExtendedRwBlock::SUCC_LEAVING);
            let mut new_next = successor | (expected & ExtendedRwBlock::STATE_MASK as u64);
            if expected & ExtendedRwBlock::BUSY as u64 != 0 {
                new_next |= ExtendedRwBlock::BUSY as u64;
            }
            if pred_block.cas_next(expected, new_next) {
                return;
            }
        }
    }

    fn finish_reader_release(&self, lock: &RwLock) {
        if lock.decrement_nreaders() > 1 {
            return;
        }
        // We were the last active reader; wake the parked writer, if any.
        let next_writer = lock.next_writer();
        if next_writer != 0 && lock.nreaders() == 0 && lock.cas_next_writer(next_writer, 0) {
            let next_block = self.adaptor.cur_block_of(next_writer);
            let writer_block = self.adaptor.rw_other_block(next_writer, next_block);
            debug_assert!(!writer_block.pred_granted());
            while !writer_block.cas_pred_id(0, ExtendedRwBlock::PRED_ACQUIRED) {}
            debug_assert_eq!(lock.nreaders(), 0);
            writer_block.set_pred_granted();
        }
    }

    fn writer_lock(&self, lock: &RwLock, block_index: BlockIndex, mut timeout: Timeout) -> Grant {
        debug_assert!(block_index > 0);
        let my_block = self.adaptor.rw_my_block(block_index);
        my_block.init_writer();
        debug_assert!(!my_block.is_reader());
        let id = self.adaptor.thread_id();
        let my_tail = tail::combine(id, block_index);

        let pred = lock.swap_tail(my_tail);
        if pred == 0 {
            debug_assert_eq!(lock.next_writer(), 0);
            lock.set_next_writer(id);
            if lock.nreaders() == 0 && lock.swap_next_writer(0) == id {
                // No readers and nobody consumed our next-writer entry.
                my_block.set_pred_granted();
                my_block.set_next_granted();
                debug_assert_eq!(lock.nreaders(), 0);
                debug_assert_eq!(lock.next_writer(), 0);
                return Grant::Ok;
            }
        } else {
            let pred_block = self.adaptor.rw_tail_block(pred);
            // Wait out any previous successor that is still cancelling, then
            // register class first, id second.
            spin_until::<R, _>(|| !pred_block.has_successor() && pred_block.next_id() == 0);
            pred_block.set_writer_successor();
            pred_block.set_next_id(my_tail);
        }

        if my_block.swap_pred_id(pred) == ExtendedRwBlock::PRED_ACQUIRED {
            // A releasing reader (pred == 0) or our pred's release already
            // picked us; the grant is imminent.
            timeout = Timeout::Never;
        }

        if self.wait_granted(my_block, timeout) {
            my_block.set_next_granted();
            debug_assert_eq!(lock.nreaders(), 0);
            debug_assert_eq!(lock.next_writer(), 0);
            return Grant::Ok;
        }
        if timeout == Timeout::Immediate {
            return Grant::Requested;
        }
        self.cancel_writer(lock, my_tail)
    }

    fn cancel_writer(&self, lock: &RwLock, my_tail: u32) -> Grant {
        let my_block = self.adaptor.rw_tail_block(my_tail);
        let pred = my_block.swap_pred_id(0);
        // A releasing pred that already dereferenced us CASes our pred id to
        // the acquired sentinel; this is the last point we can detect that.
        // After the swap, a pred mid-cancel waits for us to pick up its
        // replacement.
        if pred == ExtendedRwBlock::PRED_ACQUIRED {
            spin_until::<R, _>(|| my_block.pred_granted());
            my_block.set_next_granted();
            debug_assert_eq!(lock.nreaders(), 0);
            return Grant::Ok;
        }

        // Freeze the successor.
        my_block.set_next_leaving();
        debug_assert!(!my_block.next_granted());
        spin_until::<R, _>(|| my_block.next_id() != ExtendedRwBlock::SUCC_LEAVING);

        // No pred link means a releasing reader moved us to the lock's
        // next-writer slot; deregister from there instead.
        if pred == 0 {
            return self.cancel_writer_no_pred(lock, my_block, my_tail);
        }
        let mut pred = pred;
        let mut pred_block = self.adaptor.rw_tail_block(pred);
        loop {
            // Wait for a cancelling chain ahead to finish re-linking us.
            spin_until::<R, _>(|| {
                pred_block.next_id() == my_tail && pred_block.has_writer_successor()
            });
            let eflags = pred_block.next_flags();
            if eflags & ExtendedRwBlock::STATE_MASK == ExtendedRwBlock::LEAVING {
                // The pred (cancelling or releasing) hands us a replacement.
                debug_assert_eq!(my_block.pred_id(), 0);
                my_block.set_pred_id(pred);
                spin_until::<R, _>(|| my_block.pred_id() != pred);
                let new_pred = my_block.swap_pred_id(0);
                if new_pred == 0 {
                    // A releasing reader pred moved us to next-writer.
                    return self.cancel_writer_no_pred(lock, my_block, my_tail);
                } else if new_pred == ExtendedRwBlock::PRED_ACQUIRED {
                    spin_until::<R, _>(|| my_block.pred_granted());
                    my_block.set_next_granted();
                    debug_assert_eq!(lock.nreaders(), 0);
                    return Grant::Ok;
                }
                pred = new_pred;
                pred_block = self.adaptor.rw_tail_block(pred);
                continue;
            } else if eflags & ExtendedRwBlock::BUSY != 0 {
                // Our pred id is clear, so the pred cannot conclude anything
                // about us; dereferencing is safe.
                if !pred_block.is_reader() {
                    // A releasing writer holds our registration; accept.
                    debug_assert_eq!(pred_block.next_id(), my_tail);
                    my_block.set_pred_id(pred);
                    spin_until::<R, _>(|| my_block.pred_granted());
                    debug_assert_eq!(my_block.pred_id(), ExtendedRwBlock::PRED_ACQUIRED);
                    my_block.set_next_granted();
                    debug_assert_eq!(lock.nreaders(), 0);
                    return Grant::Ok;
                }
                // A releasing reader either parks us on next-writer or
                // grants us; expose our pred link for one beat and re-read.
                my_block.set_pred_id(pred);
                let new_pred = my_block.swap_pred_id(0);
                if new_pred == 0 {
                    return self.cancel_writer_no_pred(lock, my_block, my_tail);
                } else if new_pred == ExtendedRwBlock::PRED_ACQUIRED {
                    spin_until::<R, _>(|| my_block.pred_granted());
                    my_block.set_next_granted();
                    debug_assert_eq!(lock.nreaders(), 0);
                    return Grant::Ok;
                }
                pred = new_pred;
                pred_block = self.adaptor.rw_tail_block(pred);
                continue;
            }
            // Freeze our registration out of the pred.
            debug_assert_eq!(pred_block.next_id(), my_tail);
            let expected = eflags as u64 | ((my_tail as u64) << 32);
            let desired = eflags as u64 | ((ExtendedRwBlock::SUCC_LEAVING as u64) << 32);
            debug_assert_ne!(expected as u32 & ExtendedRwBlock::STATE_MASK, ExtendedRwBlock::LEAVING);
            if pred_block.cas_next_val(expected, desired) == expected {
                debug_assert_eq!(pred_block.next_id(), ExtendedRwBlock::SUCC_LEAVING);
                break;
            }
        }

        debug_assert_eq!(pred_block.next_id(), ExtendedRwBlock::SUCC_LEAVING);
        if my_block.next_id() == 0 && lock.cas_tail(my_tail, pred) {
            pred_block.clear_successor_class();
            pred_block.set_next_id(0);
            return Grant::Cancelled;
        }

        // Splice our successor over to the pred.
        spin_until::<R, _>(|| my_block.next_id() != 0);
        debug_assert!(my_block.next_leaving());
        let next_id = my_block.next_id();
        debug_assert_ne!(next_id, ExtendedRwBlock::SUCC_LEAVING);
        debug_assert_ne!(next_id, 0);
        let succ_block = self.adaptor.rw_tail_block(next_id);
        while !succ_block.cas_pred_id(my_tail, pred) {}

        let successor = if my_block.has_reader_successor() {
            ExtendedRwBlock::SUCC_CLASS_READER as u64 | ((next_id as u64) << 32)
        } else if my_block.has_writer_successor() {
            ExtendedRwBlock::SUCC_CLASS_WRITER as u64 | ((next_id as u64) << 32)
        } else {
            0
        };
        debug_assert!(pred_block.has_writer_successor());
        debug_assert_eq!(pred_block.next_id(), ExtendedRwBlock::SUCC_LEAVING);

        loop {
            let expected = pred_block.next();
            debug_assert_eq!((expected >> 32) as u32, ExtendedRwBlock::SUCC_LEAVING);
            let mut new_next = successor | (expected & ExtendedRwBlock::STATE_MASK as u64);
            if expected & ExtendedRwBlock::BUSY as u64 != 0 {
                new_next |= ExtendedRwBlock::BUSY as u64;
            }
            if pred_block.cas_next(expected, new_next) {
                return Grant::Cancelled;
            }
        }
    }

    /// Cancels a writer whose pred link is gone: it sits in the lock word's
    /// next-writer slot (or a reader is just now granting it).
    fn cancel_writer_no_pred(
        &self,
        lock: &RwLock,
        my_block: &ExtendedRwBlock,
        my_tail: u32,
    ) -> Grant {
        spin_until::<R, _>(|| lock.next_writer() != 0 || !my_block.pred_waiting());
        if my_block.pred_granted()
            || !lock.cas_next_writer(self.adaptor.thread_id(), 0)
        {
            // A reader picked us up after all.
            spin_until::<R, _>(|| my_block.pred_granted());
            my_block.set_next_granted();
            return Grant::Ok;
        }

        // next-writer is clear again; fix the tail.
        if my_block.next_id() == 0 && lock.cas_tail(my_tail, 0) {
            return Grant::Cancelled;
        }

        spin_until::<R, _>(|| my_block.next_id() != 0);
        let next_id = my_block.next_id();
        debug_assert_ne!(next_id, ExtendedRwBlock::SUCC_LEAVING);
        let succ_block = self.adaptor.rw_tail_block(next_id);
        debug_assert!(succ_block.pred_waiting());
        if !succ_block.is_reader() {
            // Without a pred of our own, our writer successor takes our
            // place in the next-writer slot. Remaining readers CAS on that
            // slot, so a blind store is fine here.
            debug_assert!(my_block.has_writer_successor());
            debug_assert_eq!(lock.next_writer(), 0);
            lock.set_next_writer(tail::thread_of(next_id));
            while !succ_block.cas_pred_id(my_tail, 0) {}
        } else {
            // A reader successor can share with the current holders.
            debug_assert!(my_block.has_reader_successor());
            spin_until::<R, _>(|| succ_block.cas_pred_id(my_tail, ExtendedRwBlock::PRED_ACQUIRED));
            lock.increment_nreaders();
            succ_block.set_pred_granted();
        }
        Grant::Cancelled
    }
}

#[cfg(all(loom, test))]
mod loom_test {
    use super::ExtendedRw;
    use crate::adaptor::LockArena;
    use crate::block::ExtendedRwBlock;
    use crate::relax::Spin;
    use crate::rw::RwLock;

    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn two_readers_share_and_drain() {
        loom::model(|| {
            let arena = Arc::new(LockArena::<ExtendedRwBlock>::new(2, 2));
            let lock = Arc::new(RwLock::new());

            let handles: Vec<_> = (1..=2u16)
                .map(|id| {
                    let (arena, lock) = (Arc::clone(&arena), Arc::clone(&lock));
                    thread::spawn(move || {
                        let rw: ExtendedRw<_, Spin> = ExtendedRw::new(arena.thread(id));
                        let block = rw.acquire_reader(&lock);
                        rw.release_reader(&lock, block);
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(lock.raw(), 0);
        });
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Acquire, ExtendedRw, Timeout};
    use crate::adaptor::{ArenaThread, BlockAdaptor, LockArena};
    use crate::block::ExtendedRwBlock;
    use crate::relax::Spin;
    use crate::rw::RwLock;
    use crate::tail;

    type Arena = LockArena<ExtendedRwBlock>;

    fn driver(arena: &Arena, id: u16) -> ExtendedRw<ArenaThread<'_, ExtendedRwBlock>, Spin> {
        ExtendedRw::new(arena.thread(id))
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
    fn three_reader_fan_in() {
        let arena = Arena::new(3, 4);
        let (r1, r2, r3) = (driver(&arena, 1), driver(&arena, 2), driver(&arena, 3));
        let lock = RwLock::new();

        let b1 = r1.acquire_reader(&lock);
        let b2 = r2.acquire_reader(&lock);
        let b3 = r3.acquire_reader(&lock);

        assert_eq!(lock.nreaders(), 3);
        assert_eq!(lock.tail(), tail::combine(3, b3));
        for (d, b) in [(&r1, b1), (&r2, b2), (&r3, b3)] {
            assert!(d.adaptor().rw_my_block(b).pred_granted());
        }

        r1.release_reader(&lock, b1);
        r2.release_reader(&lock, b2);
        r3.release_reader(&lock, b3);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn writer_waits_for_reader_drain() {
        let arena = Arena::new(2, 4);
        let (r1, w2) = (driver(&arena, 1), driver(&arena, 2));
        let lock = RwLock::new();

        let rb = r1.acquire_reader(&lock);
        let pending = w2.acquire_writer_async(&lock);
        assert!(!pending.granted);
        assert!(!w2.retry_writer_async(&lock, pending.block));

        r1.release_reader(&lock, rb);
        assert!(w2.retry_writer_async(&lock, pending.block));
        assert_eq!(lock.nreaders(), 0);
        assert_eq!(lock.next_writer(), 0);
        assert_eq!(lock.tail(), tail::combine(2, pending.block));

        w2.release_writer(&lock, pending.block);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn reader_handed_over_by_releasing_writer() {
        let arena = Arena::new(2, 4);
        let (w1, r2) = (driver(&arena, 1), driver(&arena, 2));
        let lock = RwLock::new();

        let wb = w1.acquire_writer(&lock);
        let pending = r2.acquire_reader_async(&lock);
        assert!(!pending.granted);

        w1.release_writer(&lock, wb);
        assert!(r2.retry_reader_async(&lock, pending.block));
        assert_eq!(lock.nreaders(), 1);

        r2.release_reader(&lock, pending.block);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn cancelled_middle_writer_leaves_queue() {
        let arena = Arena::new(3, 4);
        let (w1, w2, w3) = (driver(&arena, 1), driver(&arena, 2), driver(&arena, 3));
        let lock = RwLock::new();

        let b1 = w1.acquire_writer(&lock);
        let p2 = w2.acquire_writer_async(&lock);
        let p3 = w3.acquire_writer_async(&lock);
        assert!(!p2.granted && !p3.granted);

        // The middle waiter withdraws, then the holder releases: the grant
        // must skip straight to the third writer.
        w2.cancel_writer_async(&lock, p2.block);
        w1.release_writer(&lock, b1);

        assert!(w3.retry_writer_async(&lock, p3.block));
        assert_eq!(lock.tail(), tail::combine(3, p3.block));
        w3.release_writer(&lock, p3.block);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn cancelled_middle_reader_relinks_writer_successor() {
        let arena = Arena::new(3, 4);
        let (w1, r2, w3) = (driver(&arena, 1), driver(&arena, 2), driver(&arena, 3));
        let lock = RwLock::new();

        let b1 = w1.acquire_writer(&lock);
        let p2 = r2.acquire_reader_async(&lock);
        let p3 = w3.acquire_writer_async(&lock);
        assert!(!p2.granted && !p3.granted);

        r2.cancel_reader_async(&lock, p2.block);
        w1.release_writer(&lock, b1);

        assert!(w3.retry_writer_async(&lock, p3.block));
        assert_eq!(lock.nreaders(), 0);
        w3.release_writer(&lock, p3.block);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn try_reader_fails_against_writer() {
        let arena = Arena::new(2, 4);
        let (w1, r2) = (driver(&arena, 1), driver(&arena, 2));
        let lock = RwLock::new();

        let wb = w1.acquire_writer(&lock);
        let before = lock.raw();
        assert_eq!(r2.try_acquire_reader(&lock), None);
        assert_eq!(lock.raw(), before);
        w1.release_writer(&lock, wb);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn try_reader_joins_granted_tail_reader() {
        let arena = Arena::new(2, 4);
        let (r1, r2) = (driver(&arena, 1), driver(&arena, 2));
        let lock = RwLock::new();

        let b1 = r1.acquire_reader(&lock);
        let b2 = r2.try_acquire_reader(&lock).unwrap();
        assert_eq!(lock.nreaders(), 2);

        // The first reader's release must not wait for a successor poke.
        r1.release_reader(&lock, b1);
        assert_eq!(lock.nreaders(), 1);
        r2.release_reader(&lock, b2);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn try_writer_needs_empty_word() {
        let arena = Arena::new(2, 4);
        let (r1, w2) = (driver(&arena, 1), driver(&arena, 2));
        let lock = RwLock::new();

        let rb = r1.acquire_reader(&lock);
        assert_eq!(w2.try_acquire_writer(&lock), None);
        r1.release_reader(&lock, rb);

        let wb = w2.try_acquire_writer(&lock).unwrap();
        assert_eq!(lock.tail(), tail::combine(2, wb));
        w2.release_writer(&lock, wb);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn pred_acquired_race_converts_cancel_to_release() {
        let arena = Arena::new(2, 4);
        let (w1, w2) = (driver(&arena, 1), driver(&arena, 2));
        let lock = RwLock::new();

        let b1 = w1.acquire_writer(&lock);
        let p2 = w2.acquire_writer_async(&lock);
        assert!(!p2.granted);

        // The holder releases first, transitively granting the pending
        // writer; its cancel must detect the grant and turn into a release.
        w1.release_writer(&lock, b1);
        w2.cancel_writer_async(&lock, p2.block);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn timed_reader_expires_and_cancels() {
        let arena = Arena::new(2, 4);
        let (w1, r2) = (driver(&arena, 1), driver(&arena, 2));
        let lock = RwLock::new();

        let wb = w1.acquire_writer(&lock);
        assert_eq!(r2.acquire_reader_timed(&lock, Timeout::Spins(32)), Acquire::Cancelled);

        // The queue must be whole again: the holder releases into nothing.
        w1.release_writer(&lock, wb);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn timed_writer_expires_and_cancels() {
        let arena = Arena::new(2, 4);
        let (w1, w2) = (driver(&arena, 1), driver(&arena, 2));
        let lock = RwLock::new();

        let wb = w1.acquire_writer(&lock);
        assert_eq!(w2.acquire_writer_timed(&lock, Timeout::Spins(32)), Acquire::Cancelled);

        w1.release_writer(&lock, wb);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn timed_acquire_grants_when_free() {
        let arena = Arena::new(1, 4);
        let rw = driver(&arena, 1);
        let lock = RwLock::new();

        let Acquire::Granted(block) = rw.acquire_writer_timed(&lock, Timeout::Spins(1)) else {
            panic!("uncontended timed acquire must be granted");
        };
        rw.release_writer(&lock, block);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn parked_writer_cancels_from_next_writer_slot() {
        let arena = Arena::new(3, 4);
        let (r1a, r1b, w2) = (driver(&arena, 1), driver(&arena, 2), driver(&arena, 3));
        let lock = RwLock::new();

        let ba = r1a.acquire_reader(&lock);
        let bb = r1b.acquire_reader(&lock);
        let pending = w2.acquire_writer_async(&lock);
        assert!(!pending.granted);

        // One reader leaves; it parks the writer in the next-writer slot but
        // cannot grant it because a reader remains.
        r1b.release_reader(&lock, bb);
        assert_eq!(lock.next_writer(), 3);
        assert_eq!(lock.nreaders(), 1);

        // The parked writer gives up from the slot.
        w2.cancel_writer_async(&lock, pending.block);
        assert_eq!(lock.next_writer(), 0);
        assert_eq!(lock.tail(), 0);
        assert_eq!(lock.nreaders(), 1);

        r1a.release_reader(&lock, ba);
        assert_eq!(lock.raw(), 0);
    }

    #[test]
    fn balanced_schedules_return_to_empty() {
        let arena = Arena::new(3, 16);
        let (d1, d2, d3) = (driver(&arena, 1), driver(&arena, 2), driver(&arena, 3));
        let lock = RwLock::new();

        // A mix of grants, try-failures, and cancels; the word must come
        // back to all-zero after every balanced prefix.
        let b = d1.acquire_writer(&lock);
        assert_eq!(d2.try_acquire_writer(&lock), None);
        let p = d3.acquire_writer_async(&lock);
        d3.cancel_writer_async(&lock, p.block);
        d1.release_writer(&lock, b);
        assert_eq!(lock.raw(), 0);

        let b1 = d1.acquire_reader(&lock);
        let b2 = d2.try_acquire_reader(&lock).unwrap();
        let p3 = d3.acquire_writer_async(&lock);
        d2.release_reader(&lock, b2);
        d3.cancel_writer_async(&lock, p3.block);
        d1.release_reader(&lock, b1);
        assert_eq!(lock.raw(), 0);
    }
}
