//! In-flight push tracking
//!
//! Counts appends that hold a permit so a forced compaction can wait for
//! them to finish. Permits are RAII guards: the count drops when the guard
//! does, including during unwinding.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    count: AtomicUsize,
    drained: Notify,
}

/// Counter of in-flight pushes supporting wait-for-drain.
#[derive(Debug, Default, Clone)]
pub struct InFlightTracker {
    inner: Arc<Inner>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one push. Callers must hold the state read lock.
    pub(crate) fn acquire(&self) -> AppendPermit {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        AppendPermit {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Wait until no push holds a permit. There is no timeout.
    pub async fn wait_drained(&self) {
        loop {
            // Register interest before reading the count so a release in
            // between is not missed.
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Permission to append to a tenant, released on drop.
#[derive(Debug)]
pub struct AppendPermit {
    inner: Arc<Inner>,
}

impl Drop for AppendPermit {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}
