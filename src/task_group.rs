//! Bounded parallel execution primitives.
//!
//! `ConcurrencyLimit` is a Condvar semaphore; `run_bounded` fans a batch of
//! closures out over scoped threads under such a limit and collects every
//! result. Workers observe the ambient cancellation token before starting,
//! so a cancelled batch drains quickly instead of launching stragglers.

use std::sync::{Condvar, Mutex};
use std::thread;

use crate::cancel::CancellationToken;
use crate::error_handling::{utils as errors, TransferError};

/// Semaphore-style limit: wait until a slot is free, then hold until the
/// guard drops.
pub struct ConcurrencyLimit {
    mutex: Mutex<usize>,
    condvar: Condvar,
    max: usize,
}

impl ConcurrencyLimit {
    pub fn new(max: usize) -> Self {
        Self {
            mutex: Mutex::new(0),
            condvar: Condvar::new(),
            max: max.max(1),
        }
    }

    pub fn acquire(&self) -> ConcurrencyGuard<'_> {
        let mut guard = self.mutex.lock().unwrap();
        while *guard >= self.max {
            guard = self.condvar.wait(guard).unwrap();
        }
        *guard += 1;
        ConcurrencyGuard(self)
    }

    /// Current holders (for tests and diagnostics).
    pub fn in_flight(&self) -> usize {
        *self.mutex.lock().unwrap()
    }
}

pub struct ConcurrencyGuard<'a>(&'a ConcurrencyLimit);

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        let mut guard = self.0.mutex.lock().unwrap();
        *guard = guard.saturating_sub(1);
        self.0.condvar.notify_one();
    }
}

/// Run every task with at most `limit` running at once, returning results in
/// submission order. A panicking task surfaces as a resource error; the
/// batch itself always completes.
pub fn run_bounded<T, F>(
    ctx: &CancellationToken,
    operation: &'static str,
    limit: usize,
    tasks: Vec<F>,
) -> Vec<Result<T, TransferError>>
where
    T: Send,
    F: FnOnce() -> Result<T, TransferError> + Send,
{
    let semaphore = ConcurrencyLimit::new(limit);
    thread::scope(|scope| {
        let semaphore = &semaphore;
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                scope.spawn(move || {
                    let _slot = semaphore.acquire();
                    ctx.check(operation)?;
                    task()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(errors::resource_error(operation, "worker panicked")))
            })
            .collect()
    })
}
