//! Pending values.
//!
//! A [`Deferred`] is a computation that eventually resolves to exactly one
//! value or one [`Failure`]. Callbacks attached to it form a chain: each
//! callback receives the current result and produces the next one, which
//! may itself be another deferred (the chain pauses until it fires).
//!
//! The adapters in this module turn the three calling conventions the
//! crate supports into deferreds:
//!
//! - plain functions and callback chains, through [`IntoDeferred`] and
//!   [`maybe_deferred`]
//! - sequential generators, through [`inline_callbacks`]
//! - futures, through [`ensure_deferred`]
//!
//! # Example
//!
//! ```rust
//! use loopbridge::deferred::Deferred;
//! use loopbridge::Failure;
//!
//! let d = Deferred::new();
//! d.add_callback(|n: u32| Ok::<_, Failure>(n * 2))
//!     .add_errback(|_| Ok::<_, Failure>(0));
//! d.callback(21).unwrap();
//!
//! let value = futures::executor::block_on(async { d.await }).unwrap();
//! assert_eq!(value, 42);
//! ```

mod adapter;
mod sequential;

use std::collections::VecDeque;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use parking_lot::Mutex;

pub use adapter::{ensure_deferred, inline_callbacks, maybe_deferred, run_on_loop};
pub use sequential::{Sequential, Step};

use crate::error::{Error, Failure, Result};

/// Outcome of a pending computation.
pub type DeferredResult<T> = std::result::Result<T, Failure>;

/// What a callback hands to the rest of the chain.
enum Next<T> {
    /// Continue with this result.
    Ready(DeferredResult<T>),
    /// Pause until this deferred fires, then continue with its result.
    Chain(Deferred<T>),
    /// The result was taken; later callbacks see nothing.
    Consumed,
}

type Callback<T> = Box<dyn FnOnce(DeferredResult<T>) -> Next<T> + Send>;
type Canceller = Box<dyn FnOnce() + Send>;

struct State<T> {
    result: Option<DeferredResult<T>>,
    callbacks: VecDeque<Callback<T>>,
    canceller: Option<Canceller>,
    fired: bool,
    running: bool,
    paused: bool,
    consumed: bool,
}

impl<T> Drop for State<T> {
    fn drop(&mut self) {
        if let Some(Err(failure)) = &self.result {
            tracing::warn!(%failure, "unhandled failure in deferred");
        }
    }
}

/// A value that will be available later.
///
/// Clones share the same underlying computation.
pub struct Deferred<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> Deferred<T> {
    /// Creates an unfired deferred.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                result: None,
                callbacks: VecDeque::new(),
                canceller: None,
                fired: false,
                running: false,
                paused: false,
                consumed: false,
            })),
        }
    }

    /// Creates a deferred that already succeeded with `value`.
    pub fn succeed(value: T) -> Self {
        let deferred = Self::new();
        deferred.fire(Ok(value));
        deferred
    }

    /// Creates a deferred that already failed with `failure`.
    pub fn fail(failure: impl Into<Failure>) -> Self {
        let deferred = Self::new();
        deferred.fire(Err(failure.into()));
        deferred
    }

    /// Returns true once the deferred was fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.state.lock().fired
    }

    /// Fires the deferred with a value.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyCalled`] if it was already fired.
    pub fn callback(&self, value: T) -> Result<()> {
        self.resolve(Ok(value))
    }

    /// Fires the deferred with a failure.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyCalled`] if it was already fired.
    pub fn errback(&self, failure: impl Into<Failure>) -> Result<()> {
        self.resolve(Err(failure.into()))
    }

    /// Fires the deferred with either outcome.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyCalled`] if it was already fired.
    pub fn resolve(&self, result: DeferredResult<T>) -> Result<()> {
        if self.fire(result) {
            Ok(())
        } else {
            Err(Error::AlreadyCalled)
        }
    }

    fn fire(&self, result: DeferredResult<T>) -> bool {
        let canceller = {
            let mut state = self.state.lock();
            if state.fired {
                return false;
            }
            state.fired = true;
            state.result = Some(result);
            state.canceller.take()
        };
        drop(canceller);
        self.run_callbacks();
        true
    }

    /// Sets the function run by [`cancel`](Self::cancel) while unfired.
    pub fn set_canceller<F>(&self, canceller: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if !state.fired {
            state.canceller = Some(Box::new(canceller));
        }
    }

    /// Cancels the computation.
    ///
    /// Runs the canceller, then fails the deferred with
    /// [`Error::Cancelled`] unless the canceller fired it. A no-op on a
    /// fired deferred.
    pub fn cancel(&self) {
        let canceller = {
            let mut state = self.state.lock();
            if state.fired {
                return;
            }
            state.canceller.take()
        };
        if let Some(canceller) = canceller {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(canceller)) {
                tracing::error!(failure = %Failure::from_panic(payload), "deferred canceller panicked");
            }
        }
        if self.fire(Err(Failure::new(Error::Cancelled))) {
            tracing::trace!("deferred cancelled");
        }
    }

    /// Appends a callback run on success. Failures pass through.
    pub fn add_callback<F, R>(&self, f: F) -> &Self
    where
        F: FnOnce(T) -> R + Send + 'static,
        R: IntoDeferred<Output = T>,
    {
        self.push(Box::new(move |result| match result {
            Ok(value) => Next::from_deferred(f(value).into_deferred()),
            Err(failure) => Next::Ready(Err(failure)),
        }))
    }

    /// Appends a callback run on failure. Values pass through.
    pub fn add_errback<F, R>(&self, f: F) -> &Self
    where
        F: FnOnce(Failure) -> R + Send + 'static,
        R: IntoDeferred<Output = T>,
    {
        self.push(Box::new(move |result| match result {
            Ok(value) => Next::Ready(Ok(value)),
            Err(failure) => Next::from_deferred(f(failure).into_deferred()),
        }))
    }

    /// Appends a callback/errback pair; exactly one of them runs.
    pub fn add_callbacks<F, E, R>(&self, on_value: F, on_failure: E) -> &Self
    where
        F: FnOnce(T) -> R + Send + 'static,
        E: FnOnce(Failure) -> R + Send + 'static,
        R: IntoDeferred<Output = T>,
    {
        self.push(Box::new(move |result| {
            let next = match result {
                Ok(value) => on_value(value),
                Err(failure) => on_failure(failure),
            };
            Next::from_deferred(next.into_deferred())
        }))
    }

    /// Appends a callback that sees either outcome.
    pub fn add_both<F, R>(&self, f: F) -> &Self
    where
        F: FnOnce(DeferredResult<T>) -> R + Send + 'static,
        R: IntoDeferred<Output = T>,
    {
        self.push(Box::new(move |result| Next::from_deferred(f(result).into_deferred())))
    }

    /// Forwards this deferred's result to `other`, ending this chain.
    pub fn chain_deferred(&self, other: &Deferred<T>) -> &Self {
        let target = other.clone();
        self.subscribe(move |result| {
            if target.resolve(result).is_err() {
                tracing::warn!("chained deferred was already called");
            }
        });
        self
    }

    /// Returns a deferred fired with `f` applied to this one's value.
    ///
    /// A panic in `f` fails the returned deferred.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.and_then(move |value| Ok::<U, Failure>(f(value)))
    }

    /// Returns a deferred fired with the outcome of `f`, which may itself be
    /// pending.
    ///
    /// Cancelling the returned deferred cancels this one.
    pub fn and_then<U, F, R>(&self, f: F) -> Deferred<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
        R: IntoDeferred<Output = U>,
    {
        let mapped = Deferred::new();
        let target = mapped.clone();
        let source = self.clone();
        mapped.set_canceller(move || source.cancel());
        self.subscribe(move |result| {
            let next = match result {
                Ok(value) => catch_unwind(AssertUnwindSafe(move || f(value).into_deferred()))
                    .unwrap_or_else(|payload| Deferred::fail(Failure::from_panic(payload))),
                Err(failure) => Deferred::fail(failure),
            };
            next.chain_deferred(&target);
        });
        mapped
    }

    /// Attaches a terminal consumer that takes the result.
    pub(crate) fn subscribe<F>(&self, f: F)
    where
        F: FnOnce(DeferredResult<T>) + Send + 'static,
    {
        self.push(Box::new(move |result| {
            f(result);
            Next::Consumed
        }));
    }

    fn push(&self, callback: Callback<T>) -> &Self {
        {
            let mut state = self.state.lock();
            if state.consumed {
                drop(state);
                tracing::warn!("callback added to a deferred whose result was already consumed");
                reject_consumed(callback);
                return self;
            }
            state.callbacks.push_back(callback);
        }
        self.run_callbacks();
        self
    }

    /// Runs queued callbacks while a result is available.
    ///
    /// Callbacks run without the lock held, so they may add callbacks to
    /// this deferred; the outermost runner picks them up.
    fn run_callbacks(&self) {
        loop {
            let (callback, current) = {
                let mut state = self.state.lock();
                if state.running || state.paused {
                    return;
                }
                let Some(current) = state.result.take() else {
                    return;
                };
                match state.callbacks.pop_front() {
                    Some(callback) => {
                        state.running = true;
                        (callback, current)
                    }
                    None => {
                        state.result = Some(current);
                        return;
                    }
                }
            };

            let next = catch_unwind(AssertUnwindSafe(move || callback(current)))
                .unwrap_or_else(|payload| Next::Ready(Err(Failure::from_panic(payload))));

            let mut state = self.state.lock();
            state.running = false;
            match next {
                Next::Ready(result) => state.result = Some(result),
                Next::Consumed => {
                    state.consumed = true;
                    let late: Vec<Callback<T>> = state.callbacks.drain(..).collect();
                    drop(state);
                    if !late.is_empty() {
                        tracing::warn!(late = late.len(), "callbacks queued after a consumer see no result");
                    }
                    late.into_iter().for_each(reject_consumed);
                    return;
                }
                Next::Chain(inner) => {
                    state.paused = true;
                    drop(state);
                    let outer = self.clone();
                    inner.subscribe(move |result| outer.unpause(result));
                }
            }
        }
    }

    fn unpause(&self, result: DeferredResult<T>) {
        {
            let mut state = self.state.lock();
            state.paused = false;
            state.result = Some(result);
        }
        self.run_callbacks();
    }
}

/// Runs a callback that arrived after the result was taken, so a waiting
/// consumer fails instead of hanging.
fn reject_consumed<T>(callback: Callback<T>) {
    let outcome = catch_unwind(AssertUnwindSafe(move || callback(Err(Failure::new(Error::ResultConsumed)))));
    if outcome.is_err() {
        tracing::error!("callback panicked on a consumed deferred");
    }
}

impl<T> Next<T>
where
    T: Send + 'static,
{
    /// Continues with an already fired result directly, pauses otherwise.
    fn from_deferred(deferred: Deferred<T>) -> Self {
        {
            let mut state = deferred.state.lock();
            if state.fired && !state.running && !state.paused && state.callbacks.is_empty() {
                if let Some(result) = state.result.take() {
                    state.consumed = true;
                    return Next::Ready(result);
                }
            }
        }
        Next::Chain(deferred)
    }
}

impl<T: Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let result = match &state.result {
            Some(Ok(_)) => "value",
            Some(Err(_)) => "failure",
            None if state.consumed => "consumed",
            None => "pending",
        };
        f.debug_struct("Deferred")
            .field("fired", &state.fired)
            .field("result", &result)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

/// Future over the result of a [`Deferred`].
///
/// If the deferred is dropped without firing, the future fails with
/// [`Error::DeferredDropped`].
#[derive(Debug)]
pub struct Subscription<T> {
    rx: oneshot::Receiver<DeferredResult<T>>,
}

impl<T> Future for Subscription<T> {
    type Output = DeferredResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Failure::new(Error::DeferredDropped))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Send + 'static> IntoFuture for Deferred<T> {
    type Output = DeferredResult<T>;
    type IntoFuture = Subscription<T>;

    fn into_future(self) -> Subscription<T> {
        let (tx, rx) = oneshot::channel();
        self.subscribe(move |result| {
            let _ = tx.send(result);
        });
        Subscription { rx }
    }
}

/// Conversion into a [`Deferred`].
///
/// This is how plain return values join the callback chain: a `Result` is
/// an already fired deferred, and a `Deferred` is itself.
pub trait IntoDeferred: Send + 'static {
    /// The value type of the resulting deferred.
    type Output: Send + 'static;

    /// Performs the conversion.
    fn into_deferred(self) -> Deferred<Self::Output>;
}

impl<T: Send + 'static> IntoDeferred for Deferred<T> {
    type Output = T;

    fn into_deferred(self) -> Deferred<T> {
        self
    }
}

impl<T, E> IntoDeferred for std::result::Result<T, E>
where
    T: Send + 'static,
    E: Into<Failure> + Send + 'static,
{
    type Output = T;

    fn into_deferred(self) -> Deferred<T> {
        match self {
            Ok(value) => Deferred::succeed(value),
            Err(error) => Deferred::fail(error.into()),
        }
    }
}

impl IntoDeferred for () {
    type Output = ();

    fn into_deferred(self) -> Deferred<()> {
        Deferred::succeed(())
    }
}
