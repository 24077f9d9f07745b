//! Ambient cancellation: a one-shot latch threaded through every pipeline stage.
//! Stages check it before any blocking operation; retry sleeps wake promptly on cancel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error_handling::{utils as errors, TransferError};

struct CancelInner {
    flag: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

/// Cloneable cancellation handle. All clones observe the same one-shot signal.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                lock: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Fire the signal. Idempotent; wakes every pending cancellable sleep.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap();
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Error-returning check for use at suspension points.
    pub fn check(&self, operation: &str) -> Result<(), TransferError> {
        if self.is_cancelled() {
            Err(errors::cancelled(operation))
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless cancelled first. Checks before sleeping and
    /// again on wake, per the retry-loop contract.
    pub fn sleep(&self, operation: &str, duration: Duration) -> Result<(), TransferError> {
        self.check(operation)?;
        let guard = self.inner.lock.lock().unwrap();
        let (_guard, _timeout) = self
            .inner
            .condvar
            .wait_timeout_while(guard, duration, |_| !self.inner.flag.load(Ordering::SeqCst))
            .unwrap();
        self.check(operation)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
