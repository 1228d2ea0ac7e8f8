//! Session-wide interrupt signal.
//!
//! Blocked callers wait on the loop and on this signal at the same time, so
//! an interrupt raised from any thread unwinds them promptly.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

/// A sticky, wake-all signal.
#[derive(Default)]
pub(crate) struct Interrupt {
    triggered: AtomicBool,
    /// Tasks waiting for the signal.
    wakers: Mutex<Vec<Waker>>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal and releases every waiter.
    ///
    /// Returns the number of waiters released.
    pub fn trigger(&self) -> usize {
        self.triggered.store(true, Ordering::SeqCst);
        let wakers = std::mem::take(&mut *self.wakers.lock());
        let count = wakers.len();
        for waker in wakers {
            waker.wake();
        }
        count
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Returns a future that completes once the signal is raised.
    pub fn wait(&self) -> InterruptFuture<'_> {
        InterruptFuture { interrupt: self }
    }

    fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.wakers.lock().len()
    }
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt")
            .field("triggered", &self.is_triggered())
            .finish_non_exhaustive()
    }
}

/// Future returned by [`Interrupt::wait`].
pub(crate) struct InterruptFuture<'a> {
    interrupt: &'a Interrupt,
}

impl Future for InterruptFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.interrupt.is_triggered() {
            return Poll::Ready(());
        }
        self.interrupt.register(cx.waker());
        // A trigger between the check and the registration would be missed.
        if self.interrupt.is_triggered() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}
