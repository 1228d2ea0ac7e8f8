//! Loop providers.
//!
//! A reactor is the single-threaded event loop that owns the execution of
//! loop-bound code. This module defines the contract every backend fulfils
//! ([`Reactor`]) and a cheap, cloneable handle over it ([`ReactorHandle`])
//! that adds the generic helpers the rest of the crate uses.
//!
//! # Backends
//!
//! - [`DefaultReactor`] - in-crate event loop, always available
//! - `TokioReactor` - a `current_thread` tokio runtime (with `tokio` feature)
//! - `SmolReactor` - a `smol::Executor` (with `smol` feature)
//!
//! # Example
//!
//! ```rust
//! use loopbridge::reactor::{ReactorChoice, ReactorHandle};
//! use std::time::Duration;
//!
//! let reactor = ReactorHandle::build(ReactorChoice::Default).unwrap();
//! let stopper = reactor.clone();
//! reactor.call_later(Duration::from_millis(5), move || stopper.stop());
//! reactor.run();
//! assert!(!reactor.is_running());
//! ```

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, Either};

use crate::context::Interrupt;
use crate::deferred::Deferred;
use crate::error::{Error, Failure, Result};

mod default;
mod task;

pub use default::DefaultReactor;
pub use task::TaskId;

#[cfg(feature = "tokio")]
pub mod tokio;

#[cfg(feature = "smol")]
pub mod smol;

/// A unit of work scheduled on the loop.
pub type Call = Box<dyn FnOnce() + Send + 'static>;

/// Type-erased boxed future spawned on the loop.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The loop provider backends that can be installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ReactorChoice {
    /// The in-crate event loop.
    #[default]
    Default,
    /// A `current_thread` tokio runtime.
    Tokio,
    /// A smol executor.
    Smol,
}

impl ReactorChoice {
    /// All known choices.
    pub const ALL: [ReactorChoice; 3] = [ReactorChoice::Default, ReactorChoice::Tokio, ReactorChoice::Smol];

    /// The configuration name of this choice.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ReactorChoice::Default => "default",
            ReactorChoice::Tokio => "tokio",
            ReactorChoice::Smol => "smol",
        }
    }

    /// Returns true if this backend was compiled in.
    #[must_use]
    pub fn is_available(self) -> bool {
        match self {
            ReactorChoice::Default => true,
            ReactorChoice::Tokio => cfg!(feature = "tokio"),
            ReactorChoice::Smol => cfg!(feature = "smol"),
        }
    }
}

impl fmt::Display for ReactorChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReactorChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        ReactorChoice::ALL
            .into_iter()
            .find(|choice| choice.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| Error::UnknownReactor(s.to_string()))
    }
}

/// The loop provider contract.
///
/// Implementations must be usable from any thread: only [`run`] is tied to
/// the thread that calls it, and that thread becomes the loop thread for the
/// lifetime of the run.
///
/// [`run`]: Reactor::run
pub trait Reactor: Send + Sync + 'static {
    /// Which backend this is.
    fn choice(&self) -> ReactorChoice;

    /// Runs the loop on the current thread until [`stop`](Reactor::stop)
    /// is called. A reactor runs at most once; a stop requested before the
    /// run makes it return immediately.
    fn run(&self);

    /// Requests the loop to return from [`run`](Reactor::run).
    fn stop(&self);

    /// Whether the loop is currently running.
    fn is_running(&self) -> bool;

    /// The thread running the loop, if it is running.
    fn loop_thread(&self) -> Option<ThreadId>;

    /// Schedules `call` on the loop as soon as possible. Thread-safe.
    fn call_soon(&self, call: Call);

    /// Schedules `call` on the loop after `delay`. Thread-safe.
    fn call_later(&self, delay: Duration, call: Call);

    /// Spawns a future onto the loop. Thread-safe.
    fn spawn(&self, future: BoxFuture);
}

/// Handle to a delayed call scheduled with [`ReactorHandle::call_later`].
#[derive(Clone, Debug)]
pub struct DelayedCall {
    cancelled: Arc<AtomicBool>,
    called: Arc<AtomicBool>,
}

impl DelayedCall {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            called: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancels the call. Returns false if it already ran or was cancelled.
    pub fn cancel(&self) -> bool {
        !self.called.load(Ordering::SeqCst) && !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Returns true while the call is still scheduled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.called.load(Ordering::SeqCst) && !self.cancelled.load(Ordering::SeqCst)
    }

    fn claim(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst) && !self.called.swap(true, Ordering::SeqCst)
    }
}

/// A cloneable handle to an installed reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    inner: Arc<dyn Reactor>,
}

impl ReactorHandle {
    /// Wraps a reactor implementation.
    pub fn new<R: Reactor>(reactor: R) -> Self {
        Self {
            inner: Arc::new(reactor),
        }
    }

    /// Builds a fresh reactor for `choice`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::BackendUnavailable`] if the backend's feature is
    /// disabled, or [`Error::Backend`] if the backend cannot be built.
    pub fn build(choice: ReactorChoice) -> Result<Self> {
        match choice {
            ReactorChoice::Default => Ok(Self::new(DefaultReactor::new())),
            #[cfg(feature = "tokio")]
            ReactorChoice::Tokio => Ok(Self::new(self::tokio::TokioReactor::new()?)),
            #[cfg(feature = "smol")]
            ReactorChoice::Smol => Ok(Self::new(self::smol::SmolReactor::new())),
            #[allow(unreachable_patterns)]
            other => Err(Error::BackendUnavailable(other)),
        }
    }

    /// Which backend this is.
    #[must_use]
    pub fn choice(&self) -> ReactorChoice {
        self.inner.choice()
    }

    /// Runs the loop on the current thread until stopped.
    pub fn run(&self) {
        self.inner.run();
    }

    /// Requests the loop to stop.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Whether the loop is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// The thread running the loop, if any.
    #[must_use]
    pub fn loop_thread(&self) -> Option<ThreadId> {
        self.inner.loop_thread()
    }

    /// Returns true if both handles point at the same reactor.
    #[must_use]
    pub fn same_reactor(&self, other: &ReactorHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Schedules `f` on the loop as soon as possible.
    pub fn call_soon<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.call_soon(Box::new(move || run_guarded(f)));
    }

    /// Schedules `f` on the loop after `delay`.
    ///
    /// The returned [`DelayedCall`] can cancel the call before it runs.
    pub fn call_later<F>(&self, delay: Duration, f: F) -> DelayedCall
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = DelayedCall::new();
        let guard = handle.clone();
        self.inner.call_later(
            delay,
            Box::new(move || {
                if guard.claim() {
                    run_guarded(f);
                }
            }),
        );
        handle
    }

    /// Spawns a future onto the loop.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.spawn(Box::pin(future));
    }

    /// Returns a deferred fired with the result of `f` after `delay`.
    ///
    /// Cancelling the deferred cancels the delayed call.
    pub fn defer_later<T, F>(&self, delay: Duration, f: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce() -> std::result::Result<T, Failure> + Send + 'static,
    {
        let deferred = Deferred::new();
        let target = deferred.clone();
        let call = self.call_later(delay, move || {
            let outcome = catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(Failure::from_panic(payload)));
            let _ = target.resolve(outcome);
        });
        deferred.set_canceller(move || {
            call.cancel();
        });
        deferred
    }

    /// Runs `f` on the loop thread and blocks the calling thread until the
    /// deferred it returns has fired.
    ///
    /// # Errors
    ///
    /// Returns the deferred's failure, or [`Error::ReactorStopped`] if the
    /// reactor dropped the call without running it.
    pub fn blocking_call_from_thread<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Deferred<T> + Send + 'static,
    {
        self.blocking_call_until(f, None)
    }

    /// Like [`blocking_call_from_thread`](Self::blocking_call_from_thread),
    /// but gives up with [`Error::Interrupted`] once `interrupt` triggers.
    pub(crate) fn blocking_call_until<T, F>(&self, f: F, interrupt: Option<&Interrupt>) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Deferred<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.call_soon(move || {
            let deferred = f();
            deferred.subscribe(move |outcome| {
                let _ = tx.send(outcome);
            });
        });

        let delivered = match interrupt {
            Some(interrupt) => match futures::executor::block_on(future::select(rx, interrupt.wait())) {
                Either::Left((delivered, _)) => delivered,
                Either::Right(((), _)) => return Err(Error::Interrupted),
            },
            None => futures::executor::block_on(rx),
        };

        match delivered {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(Error::Failed(failure)),
            Err(oneshot::Canceled) => Err(Error::ReactorStopped),
        }
    }
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("choice", &self.choice())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Runs a loop callback, logging a panic instead of unwinding into the loop.
pub(crate) fn run_guarded<F: FnOnce()>(f: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        let failure = Failure::from_panic(payload);
        tracing::error!(%failure, "unhandled panic in reactor callback");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reactor_choice_parse() {
        assert_eq!("default".parse::<ReactorChoice>().unwrap(), ReactorChoice::Default);
        assert_eq!(" Tokio ".parse::<ReactorChoice>().unwrap(), ReactorChoice::Tokio);
        assert_eq!("smol".parse::<ReactorChoice>().unwrap(), ReactorChoice::Smol);
        assert!(matches!(
            "qt5reactor".parse::<ReactorChoice>(),
            Err(Error::UnknownReactor(name)) if name == "qt5reactor"
        ));
    }

    #[test]
    fn test_reactor_choice_display_roundtrip() {
        for choice in ReactorChoice::ALL {
            assert_eq!(choice.to_string().parse::<ReactorChoice>().unwrap(), choice);
        }
        assert_eq!(ReactorChoice::default(), ReactorChoice::Default);
        assert!(ReactorChoice::Default.is_available());
    }

    #[test]
    fn test_delayed_call_cancel() {
        let call = DelayedCall::new();
        assert!(call.is_active());
        assert!(call.cancel());
        assert!(!call.cancel());
        assert!(!call.is_active());
        assert!(!call.claim());
    }

    #[test]
    fn test_delayed_call_claim_once() {
        let call = DelayedCall::new();
        assert!(call.claim());
        assert!(!call.claim());
        assert!(!call.cancel());
    }

    #[test]
    fn test_build_unavailable_backend() {
        for choice in ReactorChoice::ALL {
            if !choice.is_available() {
                assert!(matches!(
                    ReactorHandle::build(choice),
                    Err(Error::BackendUnavailable(c)) if c == choice
                ));
            }
        }
    }

    #[test]
    fn test_blocking_call_from_thread() {
        let reactor = ReactorHandle::build(ReactorChoice::Default).unwrap();
        let runner = reactor.clone();
        let thread = std::thread::spawn(move || runner.run());

        let value = reactor
            .blocking_call_from_thread(|| Deferred::succeed(7))
            .unwrap();
        assert_eq!(value, 7);

        let error = reactor
            .blocking_call_from_thread(|| Deferred::<()>::fail(Failure::msg("nope")))
            .unwrap_err();
        assert_eq!(error.to_string(), "nope");

        reactor.stop();
        thread.join().unwrap();
    }

    #[test]
    fn test_defer_later_fires() {
        let reactor = ReactorHandle::build(ReactorChoice::Default).unwrap();
        let runner = reactor.clone();
        let thread = std::thread::spawn(move || runner.run());

        let value = reactor
            .blocking_call_from_thread({
                let reactor = reactor.clone();
                move || reactor.defer_later(Duration::from_millis(10), || Ok(42))
            })
            .unwrap();
        assert_eq!(value, 42);

        reactor.stop();
        thread.join().unwrap();
    }
}
