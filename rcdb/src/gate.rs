//! Non-blocking entry gate.
//!
//! A [`Gate`] protects a value with an atomic entry counter. Entry succeeds
//! only for the caller that moves the counter from zero to one; everyone else
//! backs out immediately and gets [`Busy`]. Capture paths must never wait, so
//! the only waiting variant ([`Gate::enter_with_retry`]) spins with a deadline
//! and is only allowed from contexts that may block.

use crate::collab::ExecutionContext;
use crate::error::JournalError;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Another caller is inside the gate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
#[error("gate is held by another caller")]
pub struct Busy;

impl From<Busy> for JournalError {
    fn from(_: Busy) -> Self {
        JournalError::Busy
    }
}

pub struct Gate<T> {
    entered: AtomicI32,
    value: UnsafeCell<T>,
}

// SAFETY: the entry counter admits at most one guard at a time, and only a
// guard hands out references to `value`.
unsafe impl<T: Send> Sync for Gate<T> {}

impl<T> Gate<T> {
    pub fn new(value: T) -> Self {
        Self {
            entered: AtomicI32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Enters the gate if nobody else holds it.
    pub fn try_enter(&self) -> Result<GateGuard<'_, T>, Busy> {
        if self.entered.fetch_add(1, Ordering::Acquire) == 0 {
            Ok(GateGuard { gate: self })
        } else {
            self.entered.fetch_sub(1, Ordering::Release);
            Err(Busy)
        }
    }

    /// Retries [`Self::try_enter`] until `budget` elapses.
    ///
    /// Contexts that cannot block get a single attempt.
    pub fn enter_with_retry(
        &self,
        ctx: &dyn ExecutionContext,
        budget: Duration,
    ) -> Result<GateGuard<'_, T>, Busy> {
        match self.try_enter() {
            Ok(guard) => return Ok(guard),
            Err(Busy) if !ctx.can_block() => return Err(Busy),
            Err(Busy) => {}
        }

        let deadline = Instant::now() + budget;
        loop {
            std::hint::spin_loop();
            if let Ok(guard) = self.try_enter() {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(Busy);
            }
            std::thread::yield_now();
        }
    }

    pub fn is_held(&self) -> bool {
        self.entered.load(Ordering::Relaxed) > 0
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for Gate<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for Gate<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("entered", &self.entered.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the value behind a [`Gate`]; leaves the gate on drop.
pub struct GateGuard<'a, T> {
    gate: &'a Gate<T>,
}

impl<T> Deref for GateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard is the only one alive for the gate.
        unsafe { &*self.gate.value.get() }
    }
}

impl<T> DerefMut for GateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: this guard is the only one alive for the gate.
        unsafe { &mut *self.gate.value.get() }
    }
}

impl<T> Drop for GateGuard<'_, T> {
    fn drop(&mut self) {
        self.gate.entered.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{AnyContext, AtomicContext};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn second_entry_is_busy() {
        let gate = Gate::new(0u32);

        let mut first = gate.try_enter().unwrap();
        *first += 1;
        assert!(gate.is_held());
        assert_eq!(gate.try_enter().err(), Some(Busy));

        drop(first);
        assert!(!gate.is_held());
        assert_eq!(*gate.try_enter().unwrap(), 1);
    }

    #[test]
    fn failed_entry_leaves_counter_balanced() {
        let gate = Gate::new(());
        let guard = gate.try_enter().unwrap();
        for _ in 0..10 {
            assert!(gate.try_enter().is_err());
        }
        drop(guard);
        assert!(gate.try_enter().is_ok());
    }

    #[test]
    fn retry_is_single_shot_when_blocking_is_not_allowed() {
        let gate = Gate::new(());
        let _guard = gate.try_enter().unwrap();

        let started = Instant::now();
        let res = gate.enter_with_retry(&AtomicContext, Duration::from_secs(5));
        assert_eq!(res.err(), Some(Busy));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn retry_gives_up_after_budget() {
        let gate = Gate::new(());
        let _guard = gate.try_enter().unwrap();

        let res = gate.enter_with_retry(&AnyContext, Duration::from_millis(20));
        assert_eq!(res.err(), Some(Busy));
    }

    #[test]
    fn retry_succeeds_once_released() {
        let gate = Arc::new(Gate::new(0u32));
        let guard = gate.try_enter().unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                let mut guard = gate
                    .enter_with_retry(&AnyContext, Duration::from_secs(10))
                    .unwrap();
                *guard += 1;
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        drop(guard);
        waiter.join().unwrap();

        assert_eq!(*gate.try_enter().unwrap(), 1);
    }

    #[test]
    fn concurrent_entries_are_exclusive() {
        let gate = Arc::new(Gate::new(0u64));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    let mut entered = 0u64;
                    for _ in 0..10_000 {
                        if let Ok(mut guard) = gate.try_enter() {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            *guard += 1;
                            entered += 1;
                            inside.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    entered
                })
            })
            .collect();

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(*gate.try_enter().unwrap(), total);
    }
}
