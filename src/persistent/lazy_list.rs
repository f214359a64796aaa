#![allow(unsafe_code)]
//! Thread-safe memoized lazy cons list.
//!
//! This module provides [`LazyList`], a persistent singly-linked list whose
//! tail may be a suspended computation. The suspension is forced at most
//! once across all threads; after the first forcing, the resolved tail is
//! memoized and every observer receives the identical shared tail.
//!
//! # Safety
//!
//! This module uses unsafe code to implement a lock-free forcing state
//! machine. The following invariants are maintained:
//! - `tail` is only initialized when `state` is `STATE_FORCED`
//! - `thunk` is `Some` only when `state` is `STATE_SUSPENDED`
//! - Transition to `STATE_FORCING` is done via `compare_exchange` for
//!   exclusivity
//! - Multiple threads can safely observe via atomic operations and adaptive
//!   spin + `parking_lot::Condvar` blocking wait
//!
//! # Forcing Contract
//!
//! If N threads call [`LazyList::pop_front`] concurrently on the same lazy
//! node, exactly one thunk invocation occurs; all observers receive the
//! identical tail (the same shared allocation). After publication the thunk
//! is dropped, releasing anything it captured, and the node is thereafter
//! effectively immutable.
//!
//! Thunks must not force the node they belong to (the forcing thread would
//! deadlock against itself). Thunks that descend into *other* nodes are
//! fine; that is exactly what the queue's rotation does.
//!
//! If a thunk panics, the node becomes **poisoned** and every subsequent
//! `pop_front` on it panics. Suspensions built by this crate's own queue
//! never panic.
//!
//! # Examples
//!
//! ```rust
//! use perdure::persistent::LazyList;
//!
//! let rest = LazyList::new().push_front(2);
//! let list = LazyList::new_lazy(1, move || rest);
//!
//! assert_eq!(list.front(), Some(&1));
//! // First pop_front runs the thunk; later pops reuse the memoized tail
//! assert_eq!(list.pop_front().front(), Some(&2));
//! assert!(list.pop_front().shares_head(&list.pop_front()));
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};

use super::ReferenceCounter;

/// State: the tail is still a suspended computation
const STATE_SUSPENDED: u8 = 0;
/// State: some thread is running the thunk
const STATE_FORCING: u8 = 1;
/// State: the tail is resolved and published
const STATE_FORCED: u8 = 2;
/// State: the thunk panicked
const STATE_POISONED: u8 = 3;

/// A suspended tail computation.
///
/// Boxed because the closure type is recursive: the queue's rotation thunk
/// captures lazy lists whose own tails are suspensions of the same shape.
type TailThunk<T> = Box<dyn FnOnce() -> LazyList<T> + Send>;

/// Condvar + Mutex pair for blocking wait while another thread forces.
struct WaitSync {
    condvar: Condvar,
    mutex: Mutex<()>,
}

impl WaitSync {
    const fn new() -> Self {
        Self {
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
        }
    }
}

/// A one-shot memoizing cell holding either a tail thunk or the resolved
/// tail.
///
/// The fast path (already forced) is a single `Acquire` load; the slow path
/// claims exclusivity with a `compare_exchange`, runs the thunk, publishes
/// the tail with `Release`, and wakes any waiters.
struct Suspension<T> {
    state: AtomicU8,
    tail: UnsafeCell<MaybeUninit<LazyList<T>>>,
    thunk: UnsafeCell<Option<TailThunk<T>>>,
    wait_sync: WaitSync,
}

// # Safety
//
// - T: Send + Sync makes the contained LazyList<T> (Arc-shared nodes of T)
//   transferable and shareable across threads.
// - The thunk slot is only touched by the single thread that won the
//   compare_exchange into STATE_FORCING; the thunk itself is Send, so it may
//   be run and dropped on whichever thread that is.
// - The tail slot is written exactly once before the Release store of
//   STATE_FORCED; readers only dereference it after an Acquire load observes
//   STATE_FORCED, which establishes the happens-before edge.
unsafe impl<T: Send + Sync> Send for Suspension<T> {}
unsafe impl<T: Send + Sync> Sync for Suspension<T> {}

impl<T> Suspension<T> {
    /// Creates a suspension that will run `thunk` on first forcing.
    fn suspended(thunk: TailThunk<T>) -> Self {
        Self {
            state: AtomicU8::new(STATE_SUSPENDED),
            tail: UnsafeCell::new(MaybeUninit::uninit()),
            thunk: UnsafeCell::new(Some(thunk)),
            wait_sync: WaitSync::new(),
        }
    }

    /// Creates an already-resolved suspension. Forcing never runs a thunk.
    fn resolved(tail: LazyList<T>) -> Self {
        Self {
            state: AtomicU8::new(STATE_FORCED),
            tail: UnsafeCell::new(MaybeUninit::new(tail)),
            thunk: UnsafeCell::new(None),
            wait_sync: WaitSync::new(),
        }
    }

    /// Forces the suspension and returns the resolved tail.
    ///
    /// Runs the thunk at most once across all threads; every caller gets a
    /// reference to the same stored tail.
    #[inline]
    fn force(&self) -> &LazyList<T> {
        let state = self.state.load(Ordering::Acquire);
        if state == STATE_FORCED {
            // SAFETY: the transition to STATE_FORCED happens in run_thunk()
            // after the tail write completes, published with Release. The
            // Acquire load here makes that write visible.
            return unsafe { (*self.tail.get()).assume_init_ref() };
        }
        self.force_slow(state)
    }

    /// Slow path: handles `STATE_SUSPENDED`, `STATE_FORCING`, and
    /// `STATE_POISONED`.
    ///
    /// Kept out of line so the fast path in `force()` stays a load and a
    /// branch.
    #[inline(never)]
    fn force_slow(&self, mut state: u8) -> &LazyList<T> {
        loop {
            match state {
                STATE_FORCED => {
                    // SAFETY: same as the force() fast path.
                    return unsafe { (*self.tail.get()).assume_init_ref() };
                }
                STATE_POISONED => {
                    panic!("LazyList: tail thunk panicked on a previous forcing");
                }
                STATE_SUSPENDED => {
                    match self.state.compare_exchange_weak(
                        STATE_SUSPENDED,
                        STATE_FORCING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return self.run_thunk(),
                        Err(current_state) => state = current_state,
                    }
                }
                STATE_FORCING => {
                    self.spin_then_wait();
                    state = self.state.load(Ordering::Acquire);
                }
                _ => unreachable!("invalid suspension state"),
            }
        }
    }

    /// Runs the thunk after winning the `compare_exchange` into
    /// `STATE_FORCING`.
    fn run_thunk(&self) -> &LazyList<T> {
        // SAFETY: the compare_exchange succeeded, so only this thread is in
        // STATE_FORCING and may touch the thunk slot.
        let thunk = unsafe { (*self.thunk.get()).take() }
            .expect("LazyList: suspension claimed twice");

        let result = catch_unwind(AssertUnwindSafe(thunk));

        let succeeded = result.is_ok_and(|tail| {
            // SAFETY: only the thread that acquired STATE_FORCING reaches
            // here, before the state transition below.
            unsafe { (*self.tail.get()).write(tail) };
            true
        });

        self.state.store(
            if succeeded {
                STATE_FORCED
            } else {
                STATE_POISONED
            },
            Ordering::Release,
        );
        self.wait_sync.condvar.notify_all();

        assert!(succeeded, "LazyList: tail thunk panicked");

        // SAFETY: the tail was written above when succeeded is true.
        unsafe { (*self.tail.get()).assume_init_ref() }
    }

    /// Number of spin iterations before yielding to the OS scheduler.
    const SPIN_BEFORE_YIELD: u32 = 16;

    /// Total spin iterations (including the yield phase) before falling back
    /// to a Condvar blocking wait.
    const ADAPTIVE_SPIN_LIMIT: u32 = 64;

    /// Spins then blocks until `state` leaves `STATE_FORCING`.
    ///
    /// Forcing is O(1) for the queue's rotation thunks, so waiters almost
    /// always resolve inside the spin phase; the Condvar catches descheduled
    /// forcing threads.
    fn spin_then_wait(&self) {
        for iteration in 0..Self::ADAPTIVE_SPIN_LIMIT {
            if self.state.load(Ordering::Acquire) != STATE_FORCING {
                return;
            }
            std::hint::spin_loop();
            if iteration >= Self::SPIN_BEFORE_YIELD {
                std::thread::yield_now();
            }
        }

        let mut guard = self.wait_sync.mutex.lock();
        while self.state.load(Ordering::Acquire) == STATE_FORCING {
            self.wait_sync.condvar.wait(&mut guard);
        }
    }

    /// Returns the resolved tail without forcing, if it has been forced.
    fn get(&self) -> Option<&LazyList<T>> {
        if self.state.load(Ordering::Acquire) == STATE_FORCED {
            // SAFETY: STATE_FORCED guarantees the tail is initialized and
            // the Acquire load synchronizes with its publication.
            Some(unsafe { (*self.tail.get()).assume_init_ref() })
        } else {
            None
        }
    }
}

impl<T> Drop for Suspension<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == STATE_FORCED {
            // SAFETY: STATE_FORCED guarantees the tail is initialized;
            // &mut self guarantees exclusivity.
            unsafe { (*self.tail.get()).assume_init_drop() };
        }
    }
}

/// Internal node structure for the lazy list.
struct LazyNode<T> {
    value: T,
    tail: Suspension<T>,
}

/// A persistent singly-linked list whose tail may be a suspended
/// computation, forced at most once.
///
/// `LazyList` is the building block of
/// [`PersistentQueue`](super::PersistentQueue): the queue's incremental
/// rotation is a chain of suspended tails, and the schedule forces exactly
/// one of them per queue operation. It is exposed because its forcing
/// contract (at most one thunk invocation, identical tail for all
/// observers, from any thread) is independently useful.
///
/// # Time Complexity
///
/// | Operation    | Complexity              |
/// |--------------|-------------------------|
/// | `new`        | O(1)                    |
/// | `push_front` | O(1)                    |
/// | `front`      | O(1), never forces      |
/// | `pop_front`  | O(1) + one thunk, once  |
///
/// # Examples
///
/// ```rust
/// use perdure::persistent::LazyList;
///
/// let list = LazyList::new().push_front(2).push_front(1);
/// assert_eq!(list.front(), Some(&1));
/// assert_eq!(list.pop_front().front(), Some(&2));
/// ```
pub struct LazyList<T> {
    head: Option<ReferenceCounter<LazyNode<T>>>,
}

impl<T> Clone for LazyList<T> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
        }
    }
}

impl<T> LazyList<T> {
    /// Creates a new empty lazy list.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Creates a non-empty lazy list whose tail is computed by `thunk` on
    /// first [`pop_front`](Self::pop_front).
    ///
    /// The thunk runs at most once across all threads; its result is
    /// memoized and the thunk is dropped after the first forcing.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use perdure::persistent::LazyList;
    ///
    /// let list = LazyList::new_lazy(1, || LazyList::new().push_front(2));
    /// assert_eq!(list.front(), Some(&1));
    /// assert_eq!(list.pop_front().front(), Some(&2));
    /// ```
    #[must_use]
    pub fn new_lazy<F>(value: T, thunk: F) -> Self
    where
        F: FnOnce() -> Self + Send + 'static,
    {
        Self {
            head: Some(ReferenceCounter::new(LazyNode {
                value,
                tail: Suspension::suspended(Box::new(thunk)),
            })),
        }
    }

    /// Prepends an element; the receiver becomes the (already-resolved)
    /// tail.
    ///
    /// # Complexity
    ///
    /// O(1); never forces anything.
    #[inline]
    #[must_use]
    pub fn push_front(&self, value: T) -> Self {
        Self {
            head: Some(ReferenceCounter::new(LazyNode {
                value,
                tail: Suspension::resolved(self.clone()),
            })),
        }
    }

    /// Returns a reference to the first element without forcing the tail.
    ///
    /// Returns `None` if the list is empty.
    #[inline]
    #[must_use]
    pub fn front(&self) -> Option<&T> {
        self.head.as_ref().map(|node| &node.value)
    }

    /// Returns the tail of the list, forcing its suspension if this is the
    /// first observation.
    ///
    /// Concurrent callers on the same node are safe: exactly one runs the
    /// thunk, and every caller receives the identical memoized tail. An
    /// empty list pops to an empty list.
    ///
    /// # Panics
    ///
    /// Panics if the tail thunk panicked during this or an earlier forcing
    /// (the node is then poisoned).
    #[inline]
    #[must_use]
    pub fn pop_front(&self) -> Self {
        self.head
            .as_ref()
            .map_or_else(Self::new, |node| node.tail.force().clone())
    }

    /// Returns `true` if the list contains no elements.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Returns `true` if both lists share the same head allocation.
    ///
    /// Two empty lists share trivially. This is an identity check, not an
    /// equality check: it is how tests observe that concurrent forcings
    /// resolved to the one memoized tail.
    #[must_use]
    pub fn shares_head(&self, other: &Self) -> bool {
        match (&self.head, &other.head) {
            (Some(left), Some(right)) => ReferenceCounter::ptr_eq(left, right),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T> Default for LazyList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for LazyList<T> {
    /// Renders the resolved prefix of the list without forcing anything;
    /// a still-suspended tail is shown as `..`.
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = formatter.debug_list();
        let mut current = self.head.clone();
        while let Some(node) = current {
            list.entry(&node.value);
            match node.tail.get() {
                Some(tail) => current = tail.head.clone(),
                None => {
                    list.entry(&format_args!(".."));
                    break;
                }
            }
        }
        list.finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
