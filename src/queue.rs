//! Lock-free multi-producer multi-consumer task queues.
//!
//! [`MsQueue`] is a Michael–Scott unbounded linked queue with a soft
//! capacity check, used one-per-priority-band by the task engine. Node
//! retirement goes through `crossbeam_epoch` so a dequeued node is never
//! freed while another thread still holds a reference from its own pin —
//! this is what rules out ABA on the head/tail pointers.
//!
//! The enqueue/dequeue discipline is the classic one: enqueue links the new
//! node at the tail and then swings the tail forward; a thread that finds
//! the tail lagging (its `next` already set) helps advance it before
//! retrying. Dequeue observes `head == tail` with a null `next` as empty,
//! otherwise swings the head forward and takes the value out of the new
//! sentinel. Failed CAS attempts are counted as contention; pushes against
//! a full band are counted as overflow and rejected.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::platform::counter_add;

/// Priority bands, drained in declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// Drained before everything else.
    Critical = 0,
    /// Latency-sensitive work.
    High = 1,
    /// Default band.
    Normal = 2,
    /// Bulk and housekeeping work.
    Low = 3,
}

impl Priority {
    /// All bands, highest first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Band index into per-priority arrays.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Counters exposed by a queue. All values are monotonically increasing
/// except `len`, which is the current (approximate under contention)
/// occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Successful enqueues.
    pub enqueued: u64,
    /// Successful dequeues.
    pub dequeued: u64,
    /// CAS retries across both operations.
    pub contention: u64,
    /// Pushes rejected by the soft capacity check.
    pub overflow: u64,
    /// Current occupancy.
    pub len: u64,
}

struct Node<T> {
    /// Uninitialised in the sentinel; moved out exactly once on dequeue.
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Node {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        }
    }
}

/// Michael–Scott unbounded MPMC queue with a soft capacity.
pub struct MsQueue<T> {
    head: Atomic<Node<T>>,
    tail: Atomic<Node<T>>,
    soft_cap: u64,
    len: AtomicU64,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    contention: AtomicU64,
    overflow: AtomicU64,
}

unsafe impl<T: Send> Send for MsQueue<T> {}
unsafe impl<T: Send> Sync for MsQueue<T> {}

impl<T> MsQueue<T> {
    /// Creates a queue that rejects pushes once `soft_cap` items are
    /// resident. `0` means unbounded.
    pub fn with_capacity(soft_cap: u64) -> Self {
        let sentinel = Owned::new(Node::sentinel()).into_shared(unsafe { epoch::unprotected() });
        Self {
            head: Atomic::from(sentinel),
            tail: Atomic::from(sentinel),
            soft_cap,
            len: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            contention: AtomicU64::new(0),
            overflow: AtomicU64::new(0),
        }
    }

    /// Unbounded queue.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Enqueues `value`, or hands it back when the band is saturated.
    pub fn push(&self, value: T) -> Result<(), T> {
        if self.soft_cap != 0 && self.len.load(Ordering::Relaxed) >= self.soft_cap {
            counter_add(&self.overflow, 1);
            return Err(value);
        }

        let guard = epoch::pin();
        let mut node = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        });

        loop {
            let tail = self.tail.load(Ordering::Acquire, &guard);
            // The tail pointer is never null: there is always a sentinel.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, &guard);

            if !next.is_null() {
                // Lagging tail: help the other enqueuer, then retry.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                counter_add(&self.contention, 1);
                continue;
            }

            match tail_ref.next.compare_exchange(
                Shared::null(),
                node,
                Ordering::Release,
                Ordering::Relaxed,
                &guard,
            ) {
                Ok(new) => {
                    let _ = self.tail.compare_exchange(
                        tail,
                        new,
                        Ordering::Release,
                        Ordering::Relaxed,
                        &guard,
                    );
                    self.len.fetch_add(1, Ordering::Relaxed);
                    counter_add(&self.enqueued, 1);
                    return Ok(());
                }
                Err(e) => {
                    node = e.new;
                    counter_add(&self.contention, 1);
                }
            }
        }
    }

    /// Dequeues the oldest value, or `None` when the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        self.pop_with(&guard)
    }

    fn pop_with(&self, guard: &Guard) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Ordering::Acquire, guard);

            let next_ref = match unsafe { next.as_ref() } {
                Some(n) => n,
                // head == tail and next is null: empty.
                None => return None,
            };

            let tail = self.tail.load(Ordering::Acquire, guard);
            if head == tail {
                // Tail lagging behind a half-finished enqueue; repair it.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
            }

            match self.head.compare_exchange(
                head,
                next,
                Ordering::Release,
                Ordering::Relaxed,
                guard,
            ) {
                Ok(_) => {
                    // `next` is the new sentinel. Its value is moved out
                    // here and never touched again; the epoch guard keeps
                    // the retired old head alive for concurrent readers.
                    let value = unsafe { std::ptr::read(next_ref.value.as_ptr()) };
                    unsafe { guard.defer_destroy(head) };
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    counter_add(&self.dequeued, 1);
                    return Some(value);
                }
                Err(_) => {
                    counter_add(&self.contention, 1);
                }
            }
        }
    }

    /// Current occupancy. Exact when quiescent, approximate under
    /// concurrent mutation.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    /// True when no items are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured soft capacity (`0` = unbounded).
    pub fn capacity(&self) -> u64 {
        self.soft_cap
    }

    /// Counter snapshot.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            contention: self.contention.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
            len: self.len(),
        }
    }
}

impl<T> Default for MsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MsQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: drain remaining values, then free the sentinel.
        unsafe {
            let guard = epoch::unprotected();
            while self.pop_with(guard).is_some() {}
            let sentinel = self.head.load(Ordering::Relaxed, guard);
            drop(sentinel.into_owned());
        }
    }
}
