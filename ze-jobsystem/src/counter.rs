//! Fan-in synchronization primitive ("job counter"). Shared via `Arc`
//! rather than hand-written reference counting.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI32, Ordering};

/// A shared, atomically-decrementing counter used to synchronize fan-in
/// (e.g. "wait until all N chunks of a parallel-for have completed").
///
/// `wait()` must never be called from the main thread if any job
/// referencing this counter might enqueue a main-thread command: the
/// scheduler's main-thread command buffer is only drained by
/// [`crate::scheduler::JobScheduler::flush_main_thread_commands`], and a
/// blocked main thread can never reach that call. Use `poll()` in a loop
/// together with `flush_main_thread_commands` instead.
#[derive(Debug)]
pub struct JobCounter {
    value: AtomicI32,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl JobCounter {
    pub fn new(initial: i32) -> Self {
        Self {
            value: AtomicI32::new(initial),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Adds `n` (may be negative) to the counter.
    pub fn add(&self, n: i32) {
        self.value.fetch_add(n, Ordering::Release);
    }

    /// Subtracts one from the counter. Wakes every waiter once the value
    /// drops to zero or below.
    pub fn decrement(&self) {
        let previous = self.value.fetch_sub(1, Ordering::AcqRel);
        if previous - 1 <= 0 {
            let _guard = self.mutex.lock();
            self.condvar.notify_all();
        }
    }

    pub fn get_value(&self) -> i32 {
        self.value.load(Ordering::Acquire)
    }

    /// Non-blocking; safe to call from the main thread.
    pub fn poll(&self) -> bool {
        self.get_value() <= 0
    }

    /// Blocks until the counter reaches zero or below.
    ///
    /// See the type-level warning above about calling this from the main
    /// thread.
    pub fn wait(&self) {
        if self.poll() {
            return;
        }
        let mut guard = self.mutex.lock();
        while !self.poll() {
            self.condvar.wait(&mut guard);
        }
    }

    /// Overwrites the value. Intended for single-owner reuse; racing this
    /// against concurrent `decrement`/`add` calls is left undefined and is
    /// the caller's problem to avoid.
    pub fn reset(&self, n: i32) {
        self.value.store(n, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn reaches_zero_after_k_decrements() {
        let counter = JobCounter::new(8);
        for _ in 0..7 {
            counter.decrement();
            assert!(!counter.poll());
        }
        counter.decrement();
        assert!(counter.poll());
        assert!(counter.get_value() <= 0);
    }

    #[test]
    fn decrements_below_zero_are_legal() {
        let counter = JobCounter::new(1);
        counter.decrement();
        counter.decrement();
        assert_eq!(counter.get_value(), -1);
        assert!(counter.poll());
    }

    #[test]
    fn wait_unblocks_once_all_decrements_land() {
        const K: usize = 200;
        let counter = Arc::new(JobCounter::new(K as i32));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..K {
            let counter = counter.clone();
            let completed = completed.clone();
            handles.push(thread::spawn(move || {
                thread::sleep(Duration::from_micros(100));
                completed.fetch_add(1, Ordering::SeqCst);
                counter.decrement();
            }));
        }

        counter.wait();
        assert!(counter.poll());
        assert_eq!(completed.load(Ordering::SeqCst), K);

        for h in handles {
            h.join().unwrap();
        }
    }
}
