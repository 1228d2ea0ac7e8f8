//! Adapters from calling conventions to deferreds.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{AbortHandle, Abortable, Aborted};
use parking_lot::Mutex;
use pin_project_lite::pin_project;

use super::{Deferred, DeferredResult, IntoDeferred, Sequential, Step};
use crate::error::{Error, Failure};
use crate::reactor::ReactorHandle;
use crate::value::Value;

/// Calls `f` and turns whatever it produces into a deferred.
///
/// A panic in `f` becomes a failed deferred instead of unwinding into the
/// caller.
pub fn maybe_deferred<F, R>(f: F) -> Deferred<R::Output>
where
    F: FnOnce() -> R,
    R: IntoDeferred,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.into_deferred(),
        Err(payload) => Deferred::fail(Failure::from_panic(payload)),
    }
}

/// Schedules `work` on the loop's next iteration and returns its result
/// as a deferred.
///
/// `work` never runs inline with the caller, even when called from the
/// loop thread. Cancelling the returned deferred cancels the scheduled call
/// or, once `work` ran, the deferred it returned.
///
/// # Example
///
/// ```rust
/// use loopbridge::deferred::run_on_loop;
/// use loopbridge::reactor::{ReactorChoice, ReactorHandle};
/// use loopbridge::Failure;
///
/// let reactor = ReactorHandle::build(ReactorChoice::Default).unwrap();
/// let runner = reactor.clone();
/// let thread = std::thread::spawn(move || runner.run());
///
/// let on_loop = reactor.clone();
/// let answer = reactor
///     .blocking_call_from_thread(move || run_on_loop(&on_loop, || Ok::<_, Failure>(42)))
///     .unwrap();
/// assert_eq!(answer, 42);
///
/// reactor.stop();
/// thread.join().unwrap();
/// ```
pub fn run_on_loop<F, R>(reactor: &ReactorHandle, work: F) -> Deferred<R::Output>
where
    F: FnOnce() -> R + Send + 'static,
    R: IntoDeferred,
{
    let deferred = Deferred::new();
    let target = deferred.clone();
    let started: Arc<Mutex<Option<Deferred<R::Output>>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&started);

    let call = reactor.call_later(Duration::ZERO, move || {
        let inner = maybe_deferred(work);
        *slot.lock() = Some(inner.clone());
        inner.chain_deferred(&target);
    });

    deferred.set_canceller(move || {
        if !call.cancel() {
            let inner = started.lock().take();
            if let Some(inner) = inner {
                inner.cancel();
            }
        }
    });
    deferred
}

pin_project! {
    /// Polls a future, turning a panic into a failure.
    struct Contained<F> {
        #[pin]
        future: F,
    }
}

impl<F, T, E> Future for Contained<F>
where
    F: Future<Output = Result<T, E>>,
    E: Into<Failure>,
{
    type Output = DeferredResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match catch_unwind(AssertUnwindSafe(|| this.future.poll(cx))) {
            Ok(Poll::Ready(result)) => Poll::Ready(result.map_err(Into::into)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(Failure::from_panic(payload))),
        }
    }
}

/// Drives `future` to completion on the loop and returns its outcome as a
/// deferred.
///
/// A panic inside the future fails the deferred. Cancelling the deferred
/// aborts the future at its next suspension point.
pub fn ensure_deferred<F, T, E>(reactor: &ReactorHandle, future: F) -> Deferred<T>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<Failure> + 'static,
{
    let deferred = Deferred::new();
    let target = deferred.clone();
    let (abort, registration) = AbortHandle::new_pair();
    let contained = Abortable::new(Contained { future }, registration);

    reactor.spawn(async move {
        let outcome = match contained.await {
            Ok(result) => result,
            Err(Aborted) => Err(Failure::new(Error::Cancelled)),
        };
        // A cancelled deferred has already fired.
        let _ = target.resolve(outcome);
    });

    deferred.set_canceller(move || abort.abort());
    deferred
}

/// Drives a [`Sequential`] on the loop, waiting for each pending value it
/// yields, and returns its final outcome as a deferred.
///
/// # Example
///
/// ```rust
/// use loopbridge::deferred::{inline_callbacks, Step};
/// use loopbridge::reactor::{ReactorChoice, ReactorHandle};
/// use loopbridge::Value;
/// use std::time::Duration;
///
/// let reactor = ReactorHandle::build(ReactorChoice::Default).unwrap();
/// let runner = reactor.clone();
/// let thread = std::thread::spawn(move || runner.run());
///
/// let on_loop = reactor.clone();
/// let result = reactor
///     .blocking_call_from_thread(move || {
///         let timer = on_loop.clone();
///         let mut waited = false;
///         inline_callbacks(&on_loop, move |sent: Result<Value, loopbridge::Failure>| {
///             if waited {
///                 return match sent {
///                     Ok(value) => Step::Return(value),
///                     Err(failure) => Step::Raise(failure),
///                 };
///             }
///             waited = true;
///             Step::wait(&timer.defer_later(Duration::from_millis(5), || Ok(7_u8)))
///         })
///     })
///     .unwrap();
/// assert_eq!(result.downcast_ref::<u8>(), Some(&7));
///
/// reactor.stop();
/// thread.join().unwrap();
/// ```
pub fn inline_callbacks<S>(reactor: &ReactorHandle, mut sequential: S) -> Deferred<Value>
where
    S: Sequential,
{
    ensure_deferred(reactor, async move {
        let mut sent = Ok(Value::unit());
        loop {
            match sequential.resume(sent) {
                Step::Await(pending) => sent = pending.await,
                Step::Return(value) => return Ok::<Value, Failure>(value),
                Step::Raise(failure) => return Err(failure),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ReactorChoice;
    use std::thread::JoinHandle;

    fn running_reactor() -> (ReactorHandle, JoinHandle<()>) {
        let reactor = ReactorHandle::build(ReactorChoice::Default).unwrap();
        let runner = reactor.clone();
        let thread = std::thread::spawn(move || runner.run());
        (reactor, thread)
    }

    fn shutdown((reactor, thread): (ReactorHandle, JoinHandle<()>)) {
        reactor.stop();
        thread.join().unwrap();
    }

    #[test]
    fn test_maybe_deferred_captures_panic() {
        let d = maybe_deferred(|| -> Result<(), Failure> { panic!("sync explosion") });
        let failure = futures::executor::block_on(async { d.await }).unwrap_err();
        assert!(failure.is_panic());
    }

    #[test]
    fn test_run_on_loop_runs_on_loop_thread() {
        let running = running_reactor();
        let reactor = running.0.clone();
        let loop_thread = reactor.blocking_call_from_thread({
            let reactor = reactor.clone();
            move || run_on_loop(&reactor, || Ok::<_, Failure>(std::thread::current().id()))
        });
        assert_eq!(loop_thread.unwrap(), reactor.loop_thread().unwrap());
        shutdown(running);
    }

    #[test]
    fn test_run_on_loop_never_inline() {
        let running = running_reactor();
        let reactor = running.0.clone();
        let fired_inline = reactor
            .blocking_call_from_thread({
                let reactor = reactor.clone();
                move || {
                    let d = run_on_loop(&reactor, || Ok::<_, Failure>(()));
                    Deferred::succeed(d.is_fired())
                }
            })
            .unwrap();
        assert!(!fired_inline);
        shutdown(running);
    }

    #[test]
    fn test_run_on_loop_cancel_before_run() {
        let reactor = ReactorHandle::build(ReactorChoice::Default).unwrap();
        let d = run_on_loop(&reactor, || -> Result<(), Failure> { panic!("must not run") });
        d.cancel();
        let failure = futures::executor::block_on(async { d.await }).unwrap_err();
        assert!(failure.is_cancelled());
    }

    #[test]
    fn test_ensure_deferred_failure_keeps_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("division by zero")]
        struct ZeroDivision;

        let running = running_reactor();
        let reactor = running.0.clone();
        let error = reactor
            .blocking_call_from_thread({
                let reactor = reactor.clone();
                move || ensure_deferred(&reactor, async { Err::<(), _>(ZeroDivision) })
            })
            .unwrap_err();
        assert!(error.into_failure().is::<ZeroDivision>());
        shutdown(running);
    }

    #[test]
    fn test_ensure_deferred_cancel_aborts_future() {
        let running = running_reactor();
        let reactor = running.0.clone();
        let d = ensure_deferred(&reactor, futures::future::pending::<Result<(), Failure>>());
        d.cancel();
        let failure = futures::executor::block_on(async { d.await }).unwrap_err();
        assert!(failure.is_cancelled());
        shutdown(running);
    }

    #[test]
    fn test_inline_callbacks_recovers_from_failed_step() {
        let running = running_reactor();
        let reactor = running.0.clone();
        let result = reactor
            .blocking_call_from_thread({
                let reactor = reactor.clone();
                move || {
                    let mut stage = 0;
                    inline_callbacks(&reactor, move |sent: DeferredResult<Value>| {
                        stage += 1;
                        match stage {
                            1 => Step::Await(Deferred::fail(Failure::msg("first try"))),
                            2 => match sent {
                                Err(failure) if failure.to_string() == "first try" => Step::wait(&Deferred::succeed(2_i32)),
                                other => Step::Raise(Failure::msg(format!("unexpected {other:?}"))),
                            },
                            _ => Step::done(sent.map(|v| *v.downcast_ref::<i32>().unwrap_or(&0) * 21).unwrap_or(0)),
                        }
                    })
                }
            })
            .unwrap();
        assert_eq!(result.downcast_ref::<i32>(), Some(&42));
        shutdown(running);
    }
}
