//! Tokio loop provider.
//!
//! Drives a `current_thread` tokio runtime on the loop thread, so code that
//! relies on `tokio::time` or tokio-aware libraries can run inside tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use loopbridge::{Session, SessionConfig};
//! use loopbridge::reactor::ReactorChoice;
//!
//! let session = Session::start(SessionConfig::new().reactor(ReactorChoice::Tokio))?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use ::tokio::runtime::{Builder, Runtime};
use ::tokio::sync::Notify;
use parking_lot::Mutex;

use super::{BoxFuture, Call, Reactor, ReactorChoice};
use crate::error::{Error, Result};

/// A reactor backed by a single-threaded tokio runtime.
pub struct TokioReactor {
    runtime: Runtime,
    stop: Arc<Notify>,
    stopping: AtomicBool,
    running: AtomicBool,
    finished: AtomicBool,
    thread: Mutex<Option<ThreadId>>,
}

impl TokioReactor {
    /// Builds the runtime. It does not run until [`Reactor::run`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if tokio cannot create the runtime.
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .thread_name("loopbridge-tokio")
            .build()
            .map_err(|source| Error::Backend {
                backend: ReactorChoice::Tokio,
                source,
            })?;

        Ok(Self {
            runtime,
            stop: Arc::new(Notify::new()),
            stopping: AtomicBool::new(false),
            running: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    fn accepts_work(&self) -> bool {
        if self.finished.load(Ordering::SeqCst) {
            tracing::debug!("work submitted to a finished tokio reactor was dropped");
            false
        } else {
            true
        }
    }
}

impl std::fmt::Debug for TokioReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioReactor")
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Reactor for TokioReactor {
    fn choice(&self) -> ReactorChoice {
        ReactorChoice::Tokio
    }

    fn run(&self) {
        if self.finished.load(Ordering::SeqCst) || self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("tokio reactor cannot run twice");
            return;
        }
        *self.thread.lock() = Some(thread::current().id());
        tracing::debug!("tokio reactor running");

        if !self.stopping.load(Ordering::SeqCst) {
            let stop = Arc::clone(&self.stop);
            self.runtime.block_on(async move { stop.notified().await });
        }

        *self.thread.lock() = None;
        self.finished.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!("tokio reactor stopped");
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        // `notify_one` stores a permit, so a stop racing the start of `run`
        // is not lost.
        self.stop.notify_one();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn loop_thread(&self) -> Option<ThreadId> {
        *self.thread.lock()
    }

    fn call_soon(&self, call: Call) {
        if self.accepts_work() {
            drop(self.runtime.spawn(async move { call() }));
        }
    }

    fn call_later(&self, delay: Duration, call: Call) {
        if self.accepts_work() {
            drop(self.runtime.spawn(async move {
                ::tokio::time::sleep(delay).await;
                call();
            }));
        }
    }

    fn spawn(&self, future: BoxFuture) {
        if self.accepts_work() {
            drop(self.runtime.spawn(future));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ReactorHandle;

    #[test]
    fn test_tokio_timers_fire_in_order() {
        let reactor = ReactorHandle::new(TokioReactor::new().unwrap());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay, tag) in [(20, "late"), (5, "early")] {
            let order = Arc::clone(&order);
            reactor.call_later(Duration::from_millis(delay), move || order.lock().push(tag));
        }
        let stopper = reactor.clone();
        reactor.call_later(Duration::from_millis(40), move || stopper.stop());
        reactor.run();

        assert_eq!(*order.lock(), vec!["early", "late"]);
        assert!(!reactor.is_running());
    }

    #[test]
    fn test_tokio_stop_before_run() {
        let reactor = TokioReactor::new().unwrap();
        reactor.stop();
        reactor.run();
        assert!(reactor.loop_thread().is_none());
    }

    #[test]
    fn test_tokio_spawned_future_uses_tokio_time() {
        let reactor = ReactorHandle::new(TokioReactor::new().unwrap());
        let stopper = reactor.clone();
        reactor.spawn(async move {
            ::tokio::time::sleep(Duration::from_millis(5)).await;
            stopper.stop();
        });
        reactor.run();
        assert!(!reactor.is_running());
    }
}
