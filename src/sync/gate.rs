//! The concurrency gate every instrumented call passes through.
//!
//! Readers are the instrumented calls themselves: any number may hold the
//! gate at once. The single writer is teardown. Once the writer has the gate
//! it waits for the readers to drain, does its work, and then *closes* the
//! gate for good: readers that were parked behind the writer wake up, see the
//! gate closed, and fall back to the real primitive. Nothing blocks on the
//! gate after that.
//!
//! The gate is a pair of futex words and never allocates, so it can be
//! constructed in a `static` and used before the process has finished
//! starting.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::utils::CachePadded;
use linux_futex::{Futex, Private};

/// This futex represents a lock and is unlocked
const FUTEX_UNLOCKED: u32 = 0;

/// This futex represents a lock and is locked
const FUTEX_LOCKED: u32 = 1;

pub struct Gate {
    writer_lock: CachePadded<Futex<Private>>,
    /// The number of shared holders. The writer takes `writer_lock` and then
    /// waits for this to reach zero.
    nr_readers: CachePadded<Futex<Private>>,
    closed: AtomicBool,
}

/// RAII shared hold on the [`Gate`].
pub struct ReadGuard<'a> {
    gate: &'a Gate,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.gate.dec_nr_readers();
    }
}

/// RAII exclusive hold on the [`Gate`]. No [`ReadGuard`] exists while this is
/// live.
pub struct WriteGuard<'a> {
    gate: &'a Gate,
}

impl WriteGuard<'_> {
    /// Permanently refuse every future shared acquisition. Takes effect for
    /// waiters as soon as this guard is dropped.
    pub fn close(&self) {
        self.gate.closed.store(true, Ordering::Release);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.gate.release_writer_lock();
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub const fn new() -> Self {
        Self {
            writer_lock: CachePadded::new(Futex::new(FUTEX_UNLOCKED)),
            nr_readers: CachePadded::new(Futex::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take the shared side. Blocks only while a writer holds the gate, and
    /// returns `None` once the gate has been closed.
    pub fn read(&self) -> Option<ReadGuard<'_>> {
        loop {
            if self.is_closed() {
                return None;
            }
            // Fast path should stay in userspace!
            if self.writer_lock.value.load(Ordering::Acquire) == FUTEX_LOCKED {
                _ = self.writer_lock.wait(FUTEX_LOCKED);
            }
            if self.is_closed() {
                return None;
            }
            // <-- [1]
            // Each side stores one word and then loads the other; SeqCst on
            // both sides or they can miss each other.
            self.nr_readers.value.fetch_add(1, Ordering::SeqCst);
            if self.writer_lock.value.load(Ordering::SeqCst) == FUTEX_LOCKED {
                // A writer acquired the lock at [1]. It may already be asleep
                // waiting on us, so back out the proper way.
                self.dec_nr_readers();
                continue;
            }
            return Some(ReadGuard { gate: self });
        }
    }

    /// Take the exclusive side, waiting for every shared holder to finish.
    pub fn write(&self) -> WriteGuard<'_> {
        while !self.try_acquire_writer_lock() {}
        self.wait_on_readers();
        WriteGuard { gate: self }
    }

    fn dec_nr_readers(&self) {
        if self.nr_readers.value.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Only a writer ever waits on this, and only the final decrement
            // can release it.
            _ = self.nr_readers.wake(1);
        }
    }

    /// Wait for all readers to finish. The caller must hold `writer_lock`, so
    /// `nr_readers` can only go down from here.
    fn wait_on_readers(&self) {
        loop {
            let nr_readers = self.nr_readers.value.load(Ordering::SeqCst);
            if nr_readers == 0 {
                break;
            }
            _ = self.nr_readers.wait(nr_readers);
        }
    }

    /// Try once to take `writer_lock`, sleeping while another writer holds it.
    /// Only a `true` return means the lock is held.
    fn try_acquire_writer_lock(&self) -> bool {
        if self
            .writer_lock
            .value
            .compare_exchange(
                FUTEX_UNLOCKED,
                FUTEX_LOCKED,
                Ordering::SeqCst,
                Ordering::Acquire,
            )
            .is_ok()
        {
            true
        } else {
            _ = self.writer_lock.wait(FUTEX_LOCKED);
            false
        }
    }

    fn release_writer_lock(&self) {
        self.writer_lock
            .value
            .store(FUTEX_UNLOCKED, Ordering::Release);
        // Every parked reader has to wake up, either to proceed or to notice
        // that the gate is closed.
        _ = self.writer_lock.wake(i32::MAX);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Barrier,
        },
        thread,
        time::Duration,
    };

    use super::Gate;

    #[test]
    fn readers_share_the_gate() {
        let gate = Gate::new();
        let a = gate.read().expect("open gate");
        let b = gate.read().expect("open gate");
        assert_eq!(gate.nr_readers.value.load(Ordering::Acquire), 2);
        drop((a, b));
        assert_eq!(gate.nr_readers.value.load(Ordering::Acquire), 0);
    }

    #[test]
    fn writer_waits_for_readers_to_drain() {
        let gate = Arc::new(Gate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(5));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let (gate, inside, barrier) = (gate.clone(), inside.clone(), barrier.clone());
                thread::spawn(move || {
                    let guard = gate.read().expect("gate is open");
                    inside.fetch_add(1, Ordering::SeqCst);
                    barrier.wait();
                    thread::sleep(Duration::from_millis(20));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                })
            })
            .collect();

        barrier.wait();
        let writer = gate.write();
        assert_eq!(inside.load(Ordering::SeqCst), 0);
        drop(writer);
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn readers_and_writer_exclude_each_other_under_contention() {
        let gate = Arc::new(Gate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let writing = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let (gate, inside, writing, done) =
                    (gate.clone(), inside.clone(), writing.clone(), done.clone());
                thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        let guard = gate.read().expect("gate is open");
                        inside.fetch_add(1, Ordering::SeqCst);
                        assert!(!writing.load(Ordering::SeqCst));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        drop(guard);
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            let writer = gate.write();
            writing.store(true, Ordering::SeqCst);
            assert_eq!(inside.load(Ordering::SeqCst), 0);
            writing.store(false, Ordering::SeqCst);
            drop(writer);
        }
        done.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn closed_gate_refuses_readers_and_wakes_waiters() {
        let gate = Arc::new(Gate::new());
        let writer = gate.write();

        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.read().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        writer.close();
        drop(writer);

        assert!(waiter.join().unwrap());
        assert!(gate.is_closed());
        assert!(gate.read().is_none());
    }
}
