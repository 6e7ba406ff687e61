//! Cross-thread invariant checks: mutual exclusion, reader/writer
//! exclusion, queue integrity under cancellation, and return-to-empty after
//! balanced schedules.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::mpsc::channel;
use std::thread;

use once_cell::sync::Lazy;

use mcsrw::relax::Spin;
use mcsrw::{
    Acquire, ExtendedRw, ExtendedRwBlock, LockArena, RwLock, SimpleRw, SimpleRwBlock, Timeout, Ww,
    WwLock,
};

/// Plain non-atomic data a lock is expected to make safe.
struct Racy(UnsafeCell<u64>);

// SAFETY: Only accessed while holding the lock under test.
unsafe impl Sync for Racy {}

const WW_THREADS: u16 = 4;
const WW_ITERS: u16 = 500;

static WW_FIXTURE: Lazy<(LockArena<SimpleRwBlock>, WwLock, Racy)> = Lazy::new(|| {
    (LockArena::new(WW_THREADS, WW_ITERS), WwLock::new(), Racy(UnsafeCell::new(0)))
});

#[test]
fn ww_serializes_plain_increments() {
    let (tx, rx) = channel();
    for id in 1..=WW_THREADS {
        let tx = tx.clone();
        thread::spawn(move || {
            let (arena, lock, data) = &*WW_FIXTURE;
            let ww: Ww<_, Spin> = Ww::new(arena.thread(id));
            for _ in 0..WW_ITERS {
                let block = ww.acquire(lock);
                // SAFETY: The lock serializes access to the cell.
                unsafe { *data.0.get() += 1 };
                ww.release(lock, block);
            }
            tx.send(()).unwrap();
        });
    }
    drop(tx);
    for _ in 0..WW_THREADS {
        rx.recv().unwrap();
    }

    let (_, lock, data) = &*WW_FIXTURE;
    assert_eq!(lock.raw(), 0);
    // SAFETY: All workers have joined.
    assert_eq!(unsafe { *data.0.get() }, WW_THREADS as u64 * WW_ITERS as u64);
}

/// Shared occupancy ledger: readers add 1, writers subtract 1000, so any
/// overlap of a writer with anything trips an assertion.
fn enter_reader(occupancy: &AtomicI32) {
    assert!(occupancy.fetch_add(1, Ordering::AcqRel) >= 0);
}

fn exit_reader(occupancy: &AtomicI32) {
    occupancy.fetch_sub(1, Ordering::AcqRel);
}

fn enter_writer(occupancy: &AtomicI32) {
    assert_eq!(occupancy.fetch_sub(1000, Ordering::AcqRel), 0);
}

fn exit_writer(occupancy: &AtomicI32) {
    occupancy.fetch_add(1000, Ordering::AcqRel);
}

#[test]
fn simple_rw_excludes_writers() {
    const READERS: u16 = 3;
    const WRITERS: u16 = 2;
    const ITERS: u16 = 400;

    let arena: LockArena<SimpleRwBlock> = LockArena::new(READERS + WRITERS, ITERS);
    let lock = RwLock::new();
    let occupancy = AtomicI32::new(0);

    thread::scope(|s| {
        for id in 1..=READERS {
            let (arena, lock, occupancy) = (&arena, &lock, &occupancy);
            s.spawn(move || {
                let rw: SimpleRw<_, Spin> = SimpleRw::new(arena.thread(id));
                for _ in 0..ITERS {
                    let block = rw.acquire_reader(lock);
                    enter_reader(occupancy);
                    exit_reader(occupancy);
                    rw.release_reader(lock, block);
                }
            });
        }
        for id in READERS + 1..=READERS + WRITERS {
            let (arena, lock, occupancy) = (&arena, &lock, &occupancy);
            s.spawn(move || {
                let rw: SimpleRw<_, Spin> = SimpleRw::new(arena.thread(id));
                for _ in 0..ITERS {
                    let block = rw.acquire_writer(lock);
                    enter_writer(occupancy);
                    exit_writer(occupancy);
                    rw.release_writer(lock, block);
                }
            });
        }
    });

    assert_eq!(lock.raw(), 0);
}

#[test]
fn extended_rw_excludes_writers() {
    const READERS: u16 = 3;
    const WRITERS: u16 = 2;
    const ITERS: u32 = 400;

    let arena: LockArena<ExtendedRwBlock> = LockArena::new(READERS + WRITERS, 8);
    let lock = RwLock::new();
    let occupancy = AtomicI32::new(0);

    thread::scope(|s| {
        for id in 1..=READERS {
            let (arena, lock, occupancy) = (&arena, &lock, &occupancy);
            s.spawn(move || {
                let handle = arena.thread(id);
                let rw: ExtendedRw<_, Spin> = ExtendedRw::new(handle);
                for _ in 0..ITERS {
                    // One block per attempt; recycle between attempts while
                    // holding nothing.
                    handle.reset_blocks();
                    let block = rw.acquire_reader(lock);
                    enter_reader(occupancy);
                    exit_reader(occupancy);
                    rw.release_reader(lock, block);
                }
            });
        }
        for id in READERS + 1..=READERS + WRITERS {
            let (arena, lock, occupancy) = (&arena, &lock, &occupancy);
            s.spawn(move || {
                let handle = arena.thread(id);
                let rw: ExtendedRw<_, Spin> = ExtendedRw::new(handle);
                for _ in 0..ITERS {
                    handle.reset_blocks();
                    let block = rw.acquire_writer(lock);
                    enter_writer(occupancy);
                    exit_writer(occupancy);
                    rw.release_writer(lock, block);
                }
            });
        }
    });

    assert_eq!(lock.raw(), 0);
}

#[test]
fn extended_rw_survives_cancellation_storms() {
    const WRITERS: u16 = 4;
    const GRANTS_EACH: u32 = 150;

    let arena: LockArena<ExtendedRwBlock> = LockArena::new(WRITERS, 8);
    let lock = RwLock::new();
    let occupancy = AtomicI32::new(0);
    let cancellations = AtomicU32::new(0);

    thread::scope(|s| {
        for id in 1..=WRITERS {
            let (arena, lock, occupancy, cancellations) =
                (&arena, &lock, &occupancy, &cancellations);
            s.spawn(move || {
                let handle = arena.thread(id);
                let rw: ExtendedRw<_, Spin> = ExtendedRw::new(handle);
                let mut granted = 0;
                while granted < GRANTS_EACH {
                    handle.reset_blocks();
                    // Short patience: many attempts run the full leaving
                    // protocol against concurrent holders and cancellers.
                    match rw.acquire_writer_timed(lock, Timeout::Spins(300)) {
                        Acquire::Granted(block) => {
                            enter_writer(occupancy);
                            exit_writer(occupancy);
                            rw.release_writer(lock, block);
                            granted += 1;
                        }
                        Acquire::Cancelled => {
                            cancellations.fetch_add(1, Ordering::Relaxed);
                        }
                        Acquire::Requested(_) => unreachable!("finite budget cannot report requested"),
                    }
                }
            });
        }
    });

    assert_eq!(lock.raw(), 0);
}

#[test]
fn extended_rw_mixed_cancel_and_share() {
    const THREADS: u16 = 6;
    const ITERS: u32 = 250;

    let arena: LockArena<ExtendedRwBlock> = LockArena::new(THREADS, 8);
    let lock = RwLock::new();
    let occupancy = AtomicI32::new(0);

    thread::scope(|s| {
        for id in 1..=THREADS {
            let (arena, lock, occupancy) = (&arena, &lock, &occupancy);
            s.spawn(move || {
                let handle = arena.thread(id);
                let rw: ExtendedRw<_, Spin> = ExtendedRw::new(handle);
                for round in 0..ITERS {
                    handle.reset_blocks();
                    let as_reader = (round + id as u32) % 2 == 0;
                    if as_reader {
                        match rw.acquire_reader_timed(lock, Timeout::Spins(200)) {
                            Acquire::Granted(block) => {
                                enter_reader(occupancy);
                                exit_reader(occupancy);
                                rw.release_reader(lock, block);
                            }
                            Acquire::Cancelled => {}
                            Acquire::Requested(_) => unreachable!(),
                        }
                    } else {
                        match rw.acquire_writer_timed(lock, Timeout::Spins(200)) {
                            Acquire::Granted(block) => {
                                enter_writer(occupancy);
                                exit_writer(occupancy);
                                rw.release_writer(lock, block);
                            }
                            Acquire::Cancelled => {}
                            Acquire::Requested(_) => unreachable!(),
                        }
                    }
                }
            });
        }
    });

    assert_eq!(lock.raw(), 0);
    assert_eq!(occupancy.load(Ordering::Acquire), 0);
}

#[test]
fn extended_rw_async_poll_and_cancel() {
    const THREADS: u16 = 4;
    const ITERS: u32 = 200;

    let arena: LockArena<ExtendedRwBlock> = LockArena::new(THREADS, 8);
    let lock = RwLock::new();
    let occupancy = AtomicI32::new(0);

    thread::scope(|s| {
        for id in 1..=THREADS {
            let (arena, lock, occupancy) = (&arena, &lock, &occupancy);
            s.spawn(move || {
                let handle = arena.thread(id);
                let rw: ExtendedRw<_, Spin> = ExtendedRw::new(handle);
                for round in 0..ITERS {
                    handle.reset_blocks();
                    let pending = rw.acquire_writer_async(lock);
                    let mut granted = pending.granted;
                    if !granted {
                        // Poll for a while, then give up.
                        for _ in 0..(round % 64) {
                            if rw.retry_writer_async(lock, pending.block) {
                                granted = true;
                                break;
                            }
                            std::hint::spin_loop();
                        }
                    }
                    if granted {
                        enter_writer(occupancy);
                        exit_writer(occupancy);
                        rw.release_writer(lock, pending.block);
                    } else {
                        rw.cancel_writer_async(lock, pending.block);
                    }
                }
            });
        }
    });

    assert_eq!(lock.raw(), 0);
}
