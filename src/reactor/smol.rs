//! Smol loop provider.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use smol::channel::{self, Receiver, Sender};
use smol::{Executor, Timer};

use super::{BoxFuture, Call, Reactor, ReactorChoice};
use crate::error::Failure;

/// A reactor backed by a `smol::Executor` driven on the loop thread.
pub struct SmolReactor {
    executor: Executor<'static>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    running: AtomicBool,
    finished: AtomicBool,
    thread: Mutex<Option<ThreadId>>,
}

impl SmolReactor {
    /// Creates the executor. It does not run until [`Reactor::run`].
    #[must_use]
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = channel::bounded(1);
        Self {
            executor: Executor::new(),
            stop_tx,
            stop_rx,
            running: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    /// Spawns onto the executor. A panicking task is logged instead of
    /// unwinding out of the executor and killing the loop.
    fn detach(&self, future: BoxFuture) {
        if self.finished.load(Ordering::SeqCst) {
            tracing::debug!("work submitted to a finished smol reactor was dropped");
            return;
        }
        self.executor
            .spawn(async move {
                if let Err(payload) = AssertUnwindSafe(future).catch_unwind().await {
                    let failure = Failure::from_panic(payload);
                    tracing::error!(%failure, "smol task panicked");
                }
            })
            .detach();
    }
}

impl Default for SmolReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SmolReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmolReactor")
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Reactor for SmolReactor {
    fn choice(&self) -> ReactorChoice {
        ReactorChoice::Smol
    }

    fn run(&self) {
        if self.finished.load(Ordering::SeqCst) || self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("smol reactor cannot run twice");
            return;
        }
        *self.thread.lock() = Some(thread::current().id());
        tracing::debug!("smol reactor running");

        smol::block_on(self.executor.run(async {
            let _ = self.stop_rx.recv().await;
        }));

        *self.thread.lock() = None;
        self.finished.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!("smol reactor stopped");
    }

    fn stop(&self) {
        // A full channel means a stop is already pending.
        let _ = self.stop_tx.try_send(());
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn loop_thread(&self) -> Option<ThreadId> {
        *self.thread.lock()
    }

    fn call_soon(&self, call: Call) {
        self.detach(Box::pin(async move { call() }));
    }

    fn call_later(&self, delay: Duration, call: Call) {
        self.detach(Box::pin(async move {
            Timer::after(delay).await;
            call();
        }));
    }

    fn spawn(&self, future: BoxFuture) {
        self.detach(future);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ReactorHandle;
    use std::sync::Arc;

    #[test]
    fn test_smol_timers_fire_in_order() {
        let reactor = ReactorHandle::new(SmolReactor::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay, tag) in [(20, "late"), (5, "early")] {
            let order = Arc::clone(&order);
            reactor.call_later(Duration::from_millis(delay), move || order.lock().push(tag));
        }
        let stopper = reactor.clone();
        reactor.call_later(Duration::from_millis(40), move || stopper.stop());
        reactor.run();

        assert_eq!(*order.lock(), vec!["early", "late"]);
    }

    #[test]
    fn test_smol_panicking_task_keeps_loop_alive() {
        let reactor = ReactorHandle::new(SmolReactor::new());
        reactor.spawn(async { panic!("task exploded") });
        let stopper = reactor.clone();
        reactor.call_later(Duration::from_millis(5), move || stopper.stop());
        reactor.run();
        assert!(!reactor.is_running());
    }
}
