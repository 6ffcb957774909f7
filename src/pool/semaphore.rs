//! Lock-free counting semaphore bounding pool allocations
//!
//! A CAS-loop alternative to OS semaphores. Callers that need to wait
//! poll `try_take` with a backoff instead of blocking.

use std::sync::atomic::{AtomicIsize, Ordering};

use super::PoolError;

/// Lock-free counting semaphore with a hard upper bound.
///
/// `current` never leaves the `0..=max` range. Taking from an empty
/// semaphore is not an error (the caller retries); releasing past `max`
/// is a double-release bug and panics instead of clamping.
#[derive(Debug)]
pub struct CapacitySemaphore {
    current: AtomicIsize,
    max: isize,
}

impl CapacitySemaphore {
    /// Create a semaphore with `initial` permits and a hard cap of `max`.
    pub fn new(initial: usize, max: usize) -> Result<Self, PoolError> {
        if max == 0 {
            return Err(PoolError::InvalidConfig(
                "semaphore max must be greater than 0".into(),
            ));
        }
        if initial > max {
            return Err(PoolError::InvalidConfig(format!(
                "semaphore initial count {initial} exceeds max {max}"
            )));
        }
        Ok(Self {
            current: AtomicIsize::new(initial as isize),
            max: max as isize,
        })
    }

    /// Attempt to take one permit without blocking.
    ///
    /// Returns `false` with no side effects if no permit is available.
    #[inline]
    pub fn try_take(&self) -> bool {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            let next = current - 1;
            if next < 0 {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return one permit.
    ///
    /// # Panics
    /// Panics if the permit count would exceed `max`. An overflow here
    /// means a double release and must not be absorbed silently.
    #[inline]
    pub fn release(&self) {
        self.release_n(1);
    }

    /// Return `n` permits at once.
    ///
    /// # Panics
    /// Panics if `n` is zero or the permit count would exceed `max`.
    pub fn release_n(&self, n: usize) {
        assert!(n >= 1, "release count must be at least 1");
        let n = n as isize;
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            let next = current + n;
            if next > self.max {
                panic!(
                    "semaphore overflow: releasing {n} at {current}/{} permits",
                    self.max
                );
            }
            match self.current.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current number of available permits.
    #[inline]
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire) as usize
    }

    /// Maximum number of permits.
    #[inline]
    pub fn max(&self) -> usize {
        self.max as usize
    }
}

impl std::fmt::Display for CapacitySemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CapacitySemaphore: {}/{}", self.current(), self.max)
    }
}
