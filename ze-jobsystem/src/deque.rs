//! Lock-free work-stealing deque (Chase-Lev).
//!
//! The owner thread pushes and pops at the bottom (LIFO); any other thread
//! may steal from the top (FIFO). Growth is the only operation that takes a
//! lock, and it never invalidates memory a concurrent [`Deque::steal`] might
//! still be reading: old backing buffers are kept alive for the lifetime of
//! the deque instead of being freed.
//!
//! Chase & Lev, 2005; Lê et al., 2013.

use crossbeam::utils::CachePadded;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicI64, AtomicPtr, Ordering};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use ze_core::sync::SyncUnsafeCell;

/// Result of a [`Deque::steal`] attempt.
///
/// Spurious failure (`Retry`) is distinct from `Empty`: a thief racing the
/// owner or another thief on the last element may lose the CAS even though
/// the deque briefly had work. Callers should retry on `Retry`, move on to
/// the next victim on `Empty`.
#[derive(Debug)]
pub enum Steal<T> {
    Empty,
    Retry,
    Success(T),
}

impl<T> Steal<T> {
    pub fn is_retry(&self) -> bool {
        matches!(self, Steal::Retry)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Steal::Empty)
    }

    pub fn success(self) -> Option<T> {
        match self {
            Steal::Success(value) => Some(value),
            _ => None,
        }
    }
}

struct Buffer<T> {
    mask: i64,
    slots: Box<[SyncUnsafeCell<MaybeUninit<T>>]>,
}

/// `SyncUnsafeCell`'s own blanket impl requires `T: Sync`, too strong for a
/// job payload like `Box<dyn FnOnce() + Send>`. Slots are only ever written
/// by the single owner thread and read either by the owner (`Pop`) or by a
/// thief that has won the index via CAS, so no two threads ever touch the
/// same slot at the same time — `T: Send` is all that's actually required.
unsafe impl<T: Send> Sync for Buffer<T> {}

impl<T> Buffer<T> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || SyncUnsafeCell::new(MaybeUninit::uninit()));
        Self {
            mask: capacity as i64 - 1,
            slots: slots.into_boxed_slice(),
        }
    }

    fn capacity(&self) -> i64 {
        self.mask + 1
    }

    /// # Safety
    /// Caller must guarantee the slot at `index` isn't concurrently written.
    unsafe fn write(&self, index: i64, value: T) {
        let slot = &self.slots[(index & self.mask) as usize];
        (*slot.get()).write(value);
    }

    /// # Safety
    /// Caller must guarantee it has exclusive claim on the slot at `index`
    /// (i.e. it won the CAS that advanced past it), and must not call this
    /// twice for the same logical element.
    unsafe fn read(&self, index: i64) -> T {
        let slot = &self.slots[(index & self.mask) as usize];
        (*slot.get()).as_ptr().read()
    }
}

/// A single-owner, multi-thief double-ended queue.
///
/// `push`/`pop` are for the owner thread only; `steal` may be called from
/// any thread holding a shared reference (typically via `Arc<Deque<T>>`).
pub struct Deque<T> {
    bottom: CachePadded<AtomicI64>,
    top: CachePadded<AtomicI64>,
    buffer: AtomicPtr<Buffer<T>>,
    resize: Mutex<()>,
    // Append-only so a Steal in flight against a pointer read before a Grow
    // can never observe freed memory.
    retired: Mutex<Vec<Box<Buffer<T>>>>,
    owner: ThreadId,
}

impl<T> Deque<T> {
    pub fn new(initial_capacity: usize) -> Self {
        let capacity = initial_capacity.next_power_of_two().max(2);
        let buffer = Box::new(Buffer::new(capacity));
        let ptr = Box::into_raw(buffer);
        Self {
            bottom: CachePadded::new(AtomicI64::new(0)),
            top: CachePadded::new(AtomicI64::new(0)),
            buffer: AtomicPtr::new(ptr),
            resize: Mutex::new(()),
            retired: Mutex::new(Vec::new()),
            owner: thread::current().id(),
        }
    }

    fn current_buffer(&self) -> &Buffer<T> {
        unsafe { &*self.buffer.load(Ordering::Acquire) }
    }

    /// Owner-only. Appends `item` to the bottom, growing the backing array
    /// first if it's full.
    pub fn push(&self, item: T) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "Deque::push called from a non-owner thread"
        );

        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);
        let mut buffer = self.current_buffer();

        if bottom - top >= buffer.capacity() {
            self.grow();
            buffer = self.current_buffer();
        }

        unsafe {
            buffer.write(bottom, item);
        }
        // Publish the slot write before the bottom bump is observable.
        fence(Ordering::Release);
        self.bottom.store(bottom + 1, Ordering::Release);
    }

    /// Owner-only. Pops the most recently pushed item (LIFO).
    pub fn pop(&self) -> Option<T> {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "Deque::pop called from a non-owner thread"
        );

        let bottom = self.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.current_buffer();
        self.bottom.store(bottom, Ordering::Release);
        fence(Ordering::SeqCst);
        let top = self.top.load(Ordering::Relaxed);

        if top < bottom {
            // Still more than one element: no race possible.
            Some(unsafe { buffer.read(bottom) })
        } else if top == bottom {
            // Exactly one element left: race a thief for it.
            let won = self
                .top
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(top + 1, Ordering::Relaxed);
            if won {
                Some(unsafe { buffer.read(bottom) })
            } else {
                None
            }
        } else {
            // Already empty.
            self.bottom.store(top, Ordering::Relaxed);
            None
        }
    }

    /// Any thread. Steals the oldest item (FIFO). May spuriously fail
    /// ([`Steal::Retry`]) if it races the owner or another thief.
    pub fn steal(&self) -> Steal<T> {
        let top = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::Acquire);

        if top >= bottom {
            return Steal::Empty;
        }

        let buffer = self.current_buffer();
        // Speculative read: we may lose the race below, in which case this
        // copy must be forgotten, not dropped (the winner owns the value).
        let value = unsafe { buffer.read(top) };

        match self
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => Steal::Success(value),
            Err(_) => {
                std::mem::forget(value);
                Steal::Retry
            }
        }
    }

    /// Best-effort, may be stale.
    pub fn len(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        (bottom - top).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owner-only, mutex-protected. Doubles the backing array and retires
    /// the old one (kept alive, never freed, so in-flight steals stay
    /// valid).
    fn grow(&self) {
        let _guard = self.resize.lock().unwrap();

        // Another thread may have already grown while we waited for the lock.
        let old_ptr = self.buffer.load(Ordering::Relaxed);
        let old = unsafe { &*old_ptr };
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        if bottom - top < old.capacity() {
            return;
        }

        let new_capacity = (old.capacity() as usize) * 2;
        let new_buffer = Buffer::new(new_capacity);

        // Copy (not move) live elements: the old array must remain readable
        // byte-for-byte for any thief already holding a stale pointer to it.
        let mut i = top;
        while i < bottom {
            unsafe {
                let value = old.read(i);
                new_buffer.write(i, value);
            }
            i += 1;
        }

        let new_ptr = Box::into_raw(Box::new(new_buffer));
        self.buffer.store(new_ptr, Ordering::Release);

        let old_box = unsafe { Box::from_raw(old_ptr) };
        self.retired.lock().unwrap().push(old_box);
    }
}

impl<T> Drop for Deque<T> {
    fn drop(&mut self) {
        // No concurrent access is possible once we have &mut self: drain
        // whatever the current (latest) buffer still holds so elements
        // aren't leaked. Retired buffers hold only stale duplicates of
        // already-consumed or already-drained elements and must not be
        // dropped again.
        let buffer = self.current_buffer();
        let top = self.top.load(Ordering::Relaxed);
        let bottom = self.bottom.load(Ordering::Relaxed);
        let mut i = top;
        while i < bottom {
            unsafe {
                drop(buffer.read(i));
            }
            i += 1;
        }
        unsafe {
            drop(Box::from_raw(self.buffer.load(Ordering::Relaxed)));
        }
    }
}

unsafe impl<T: Send> Send for Deque<T> {}
unsafe impl<T: Send> Sync for Deque<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn push_pop_lifo() {
        let deque = Deque::new(4);
        deque.push(1);
        deque.push(2);
        deque.push(3);
        assert_eq!(deque.pop(), Some(3));
        assert_eq!(deque.pop(), Some(2));
        assert_eq!(deque.pop(), Some(1));
        assert_eq!(deque.pop(), None);
    }

    #[test]
    fn steal_fifo_order() {
        let deque = Arc::new(Deque::new(4));
        for i in 0..10 {
            deque.push(i);
        }
        let mut stolen = Vec::new();
        while let Some(v) = deque.steal().success() {
            stolen.push(v);
        }
        assert_eq!(stolen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let deque = Deque::new(2);
        for i in 0..1000 {
            deque.push(i);
        }
        let mut popped = Vec::new();
        while let Some(v) = deque.pop() {
            popped.push(v);
        }
        popped.reverse();
        assert_eq!(popped, (0..1000).collect::<Vec<_>>());
    }

    /// Conservation + exclusivity under concurrent push/steal, including
    /// growth. The owner only pushes here so the
    /// expected final multiset is known up front (`0..N`), and thieves can
    /// terminate on a simple "producer finished and deque looks empty"
    /// check instead of racing to guess a target count.
    #[test]
    fn conservation_and_exclusivity_under_contention() {
        const N: usize = 20_000;
        const THIEVES: usize = 4;

        let deque = Arc::new(Deque::new(1));
        let barrier = Arc::new(Barrier::new(THIEVES + 1));
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let duplicate = Arc::new(AtomicUsize::new(0));
        let producer_done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..THIEVES {
            let deque = deque.clone();
            let barrier = barrier.clone();
            let seen = seen.clone();
            let duplicate = duplicate.clone();
            let producer_done = producer_done.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                loop {
                    match deque.steal() {
                        Steal::Success(v) => {
                            if !seen.lock().unwrap().insert(v) {
                                duplicate.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        Steal::Empty => {
                            if producer_done.load(Ordering::Acquire) && deque.is_empty() {
                                break;
                            }
                            thread::yield_now();
                        }
                        Steal::Retry => {}
                    }
                }
            }));
        }

        barrier.wait();
        for i in 0..N {
            deque.push(i);
        }
        let mut owner_popped = Vec::new();
        while let Some(v) = deque.pop() {
            owner_popped.push(v);
        }
        producer_done.store(true, Ordering::Release);

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(duplicate.load(Ordering::SeqCst), 0);
        let seen = seen.lock().unwrap();
        let mut all: Vec<usize> = seen.iter().cloned().chain(owner_popped).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), N);
    }
}
