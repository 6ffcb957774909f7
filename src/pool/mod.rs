//! Thread-safe pool of reusable objects
//!
//! A capacity-bounded arena of reusable objects with lock-free take and
//! release paths. The free-list is a crossbeam `ArrayQueue`, the
//! allocation budget a CAS-based [`CapacitySemaphore`]; no lock is held
//! across both. Objects are handed out as [`Pooled`] guards so a lost
//! checkout is handled deterministically instead of leaking a slot.

pub mod semaphore;

pub use semaphore::CapacitySemaphore;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::Backoff;
use thiserror::Error;

/// Errors reported by pool operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("object does not belong to this pool")]
    UnknownObject,

    #[error("object is already in the pool")]
    AlreadyReleased,

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// What happens to a checked-out object whose guard is dropped without
/// an explicit release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDiscipline {
    /// The owner must call [`ResourcePool::release`]. A dropped guard
    /// retires its slot and the pool's live capacity shrinks for good.
    Manual,
    /// A dropped guard returns the object to the pool.
    Auto,
}

/// Pool sizing and release behavior
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Objects constructed up front and placed in the free-list
    pub initial_count: usize,
    /// Hard cap on objects the pool may ever construct
    pub max_capacity: usize,
    pub discipline: ReleaseDiscipline,
}

impl PoolOptions {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            initial_count: 0,
            max_capacity,
            discipline: ReleaseDiscipline::Manual,
        }
    }

    pub fn initial_count(mut self, count: usize) -> Self {
        self.initial_count = count;
        self
    }

    pub fn discipline(mut self, discipline: ReleaseDiscipline) -> Self {
        self.discipline = discipline;
        self
    }

    fn validate(&self) -> Result<(), PoolError> {
        if self.max_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "max capacity must be greater than 0".into(),
            ));
        }
        if self.initial_count > self.max_capacity {
            return Err(PoolError::InvalidConfig(format!(
                "initial count {} exceeds max capacity {}",
                self.initial_count, self.max_capacity
            )));
        }
        Ok(())
    }
}

/// Identity of a checked-out slot: which pool it belongs to and which
/// registry entry tracks its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolTicket {
    pool_id: u64,
    slot: u32,
}

// Slot states in the registry
const IN_POOL: u8 = 1;
const CHECKED_OUT: u8 = 2;
const RETIRED: u8 = 3;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct Entry<T> {
    slot: u32,
    item: T,
}

struct PoolShared<T: Send> {
    id: u64,
    free: ArrayQueue<Entry<T>>,
    /// Per-slot state, one entry for the whole lifetime of each object
    states: Box<[AtomicU8]>,
    /// Remaining allocation budget
    budget: CapacitySemaphore,
    /// Objects ever constructed
    allocated: AtomicUsize,
    /// Objects presently in the free-list
    current: AtomicUsize,
    /// Slots permanently lost to dropped guards under manual discipline
    retired: AtomicUsize,
    discipline: ReleaseDiscipline,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    cleanup: Box<dyn Fn(&mut T) + Send + Sync>,
}

impl<T: Send> PoolShared<T> {
    fn release_slot(&self, mut item: T, slot: u32) -> Result<(), PoolError> {
        if self.states[slot as usize]
            .compare_exchange(CHECKED_OUT, IN_POOL, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PoolError::AlreadyReleased);
        }
        (self.cleanup)(&mut item);
        if self.free.push(Entry { slot, item }).is_err() {
            // The queue holds max_capacity entries and every pushed slot
            // was in CheckedOut state, so this is unreachable.
            panic!("pool free-list overflow");
        }
        self.current.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn retire_slot(&self, slot: u32) {
        self.states[slot as usize].store(RETIRED, Ordering::Release);
        self.retired.fetch_add(1, Ordering::AcqRel);
        tracing::warn!(slot, "pooled object dropped without release, slot retired");
    }

    fn live_count(&self) -> usize {
        self.allocated.load(Ordering::Acquire) - self.retired.load(Ordering::Acquire)
    }

    fn drained(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.live_count()
    }
}

/// Capacity-bounded pool of reusable objects.
///
/// Cloning the pool clones a handle to the same shared state, so it can
/// be handed to any number of tasks or threads. `take`/`release` are
/// lock-free; waiting callers poll with a yield/sleep backoff.
pub struct ResourcePool<T: Send> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Send> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> ResourcePool<T> {
    /// Create a pool with a default no-op cleanup hook.
    pub fn new<F>(options: PoolOptions, factory: F) -> Result<Self, PoolError>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_cleanup(options, factory, |_| {})
    }

    /// Create a pool with an explicit cleanup hook, run on every object
    /// on its way back into the free-list.
    pub fn with_cleanup<F, C>(options: PoolOptions, factory: F, cleanup: C) -> Result<Self, PoolError>
    where
        F: Fn() -> T + Send + Sync + 'static,
        C: Fn(&mut T) + Send + Sync + 'static,
    {
        options.validate()?;

        let states = (0..options.max_capacity)
            .map(|_| AtomicU8::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let shared = PoolShared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            free: ArrayQueue::new(options.max_capacity),
            states,
            budget: CapacitySemaphore::new(options.max_capacity, options.max_capacity)?,
            allocated: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
            discipline: options.discipline,
            factory: Box::new(factory),
            cleanup: Box::new(cleanup),
        };

        // Pre-populate the free-list
        for _ in 0..options.initial_count {
            let taken = shared.budget.try_take();
            debug_assert!(taken);
            let slot = shared.allocated.fetch_add(1, Ordering::AcqRel) as u32;
            shared.states[slot as usize].store(IN_POOL, Ordering::Release);
            let item = (shared.factory)();
            if shared.free.push(Entry { slot, item }).is_err() {
                panic!("pool free-list overflow");
            }
            shared.current.fetch_add(1, Ordering::AcqRel);
        }

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Take an object without waiting.
    ///
    /// Pops the free-list, or constructs a new object if the allocation
    /// budget permits. `None` means the pool is momentarily exhausted;
    /// that is backpressure, not an error.
    pub fn try_take(&self) -> Option<Pooled<T>> {
        let shared = &self.shared;

        if let Some(entry) = shared.free.pop() {
            shared.current.fetch_sub(1, Ordering::AcqRel);
            let previous =
                shared.states[entry.slot as usize].swap(CHECKED_OUT, Ordering::AcqRel);
            debug_assert_eq!(previous, IN_POOL);
            return Some(Pooled {
                item: Some(entry.item),
                slot: entry.slot,
                shared: Arc::clone(shared),
            });
        }

        if shared.budget.try_take() {
            let slot = shared.allocated.fetch_add(1, Ordering::AcqRel) as u32;
            shared.states[slot as usize].store(CHECKED_OUT, Ordering::Release);
            let item = (shared.factory)();
            return Some(Pooled {
                item: Some(item),
                slot,
                shared: Arc::clone(shared),
            });
        }

        None
    }

    /// Take an object, spinning with a yield/sleep backoff until one is
    /// available. A momentary free-list miss while a release is in
    /// flight is handled by retrying, never by giving up.
    pub fn take(&self) -> Pooled<T> {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_take() {
                return guard;
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Async flavor of [`take`](Self::take); suspends the task instead
    /// of the thread while waiting.
    pub async fn take_async(&self) -> Pooled<T> {
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_take() {
                return guard;
            }
            if spins < 64 {
                spins += 1;
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    /// Put an object back into the pool.
    ///
    /// Fails with [`PoolError::UnknownObject`] if the guard belongs to a
    /// different pool (the object is then returned to its own pool, the
    /// failed call never strands or corrupts it). A double return is
    /// caught by the slot state machine as
    /// [`PoolError::AlreadyReleased`].
    pub fn release(&self, mut guard: Pooled<T>) -> Result<(), PoolError> {
        if !Arc::ptr_eq(&guard.shared, &self.shared) {
            let slot = guard.slot;
            if let Some(item) = guard.item.take() {
                // Hand the object back to the pool that owns it.
                let _ = guard.shared.release_slot(item, slot);
            }
            return Err(PoolError::UnknownObject);
        }
        let slot = guard.slot;
        match guard.item.take() {
            Some(item) => self.shared.release_slot(item, slot),
            None => Err(PoolError::AlreadyReleased),
        }
    }

    /// Put back an object that was [`detach`](Pooled::detach)ed from its
    /// guard. The ticket must come from this pool and the slot must
    /// still be checked out.
    pub fn release_detached(&self, item: T, ticket: PoolTicket) -> Result<(), PoolError> {
        if ticket.pool_id != self.shared.id
            || (ticket.slot as usize) >= self.shared.allocated.load(Ordering::Acquire)
        {
            return Err(PoolError::UnknownObject);
        }
        self.shared.release_slot(item, ticket.slot)
    }

    /// Block until every live object is back in the free-list.
    ///
    /// Used during shutdown to guarantee nothing is still touching a
    /// pooled object before the resource beneath the pool is torn down.
    pub fn wait_all(&self) {
        let backoff = Backoff::new();
        while !self.shared.drained() {
            if backoff.is_completed() {
                thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Async flavor of [`wait_all`](Self::wait_all).
    pub async fn wait_all_async(&self) {
        let mut spins = 0u32;
        while !self.shared.drained() {
            if spins < 64 {
                spins += 1;
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    /// Objects presently available in the free-list.
    pub fn current_count(&self) -> usize {
        self.shared.current.load(Ordering::Acquire)
    }

    /// Objects ever constructed by this pool.
    pub fn total_count(&self) -> usize {
        self.shared.allocated.load(Ordering::Acquire)
    }

    /// Slots permanently lost to dropped guards under manual discipline.
    pub fn retired_count(&self) -> usize {
        self.shared.retired.load(Ordering::Acquire)
    }

    /// Hard cap on objects this pool may construct.
    pub fn max_capacity(&self) -> usize {
        self.shared.budget.max()
    }
}

impl<T: Send> std::fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("id", &self.shared.id)
            .field("current", &self.current_count())
            .field("total", &self.total_count())
            .field("max", &self.max_capacity())
            .finish()
    }
}

/// Owning guard over a checked-out pool object.
///
/// Derefs to the object. What happens when the guard is dropped without
/// an explicit release depends on the pool's [`ReleaseDiscipline`].
pub struct Pooled<T: Send> {
    item: Option<T>,
    slot: u32,
    shared: Arc<PoolShared<T>>,
}

impl<T: Send> Pooled<T> {
    /// Identity of this checkout, usable with
    /// [`ResourcePool::release_detached`].
    pub fn ticket(&self) -> PoolTicket {
        PoolTicket {
            pool_id: self.shared.id,
            slot: self.slot,
        }
    }

    /// Detach the object from guard management. The caller becomes
    /// responsible for returning it with
    /// [`ResourcePool::release_detached`]; a detached object that is
    /// never returned keeps its slot checked out forever.
    pub fn detach(mut self) -> (T, PoolTicket) {
        let ticket = self.ticket();
        let item = self.item.take().expect("pooled item already taken");
        (item, ticket)
    }
}

impl<T: Send> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item already taken")
    }
}

impl<T: Send> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item already taken")
    }
}

impl<T: Send> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            match self.shared.discipline {
                ReleaseDiscipline::Auto => {
                    // Cannot fail: this guard held the only checkout.
                    let _ = self.shared.release_slot(item, self.slot);
                }
                ReleaseDiscipline::Manual => {
                    self.shared.retire_slot(self.slot);
                }
            }
        }
    }
}
