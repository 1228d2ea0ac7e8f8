//! Generator-style sequential code.
//!
//! A [`Sequential`] is resumed with the outcome of the last pending value it
//! waited for and answers with its next [`Step`]. Driving it to completion
//! is the job of [`inline_callbacks`](super::inline_callbacks).

use super::{Deferred, DeferredResult};
use crate::error::Failure;
use crate::value::Value;

/// What a [`Sequential`] wants to do next.
#[derive(Debug)]
pub enum Step {
    /// Wait for this value; its outcome is passed to the next `resume`.
    Await(Deferred<Value>),
    /// Finish with a value.
    Return(Value),
    /// Finish with a failure.
    Raise(Failure),
}

impl Step {
    /// Waits for a typed deferred.
    pub fn wait<T>(deferred: &Deferred<T>) -> Self
    where
        T: std::any::Any + Send + Sync,
    {
        Step::Await(deferred.map(Value::new))
    }

    /// Finishes with a typed value.
    pub fn done<T>(value: T) -> Self
    where
        T: std::any::Any + Send + Sync,
    {
        Step::Return(Value::new(value))
    }
}

/// Code that awaits pending values one at a time.
///
/// The first `resume` receives `Ok(Value::unit())`. A failed pending value
/// arrives as `Err`; the sequential may recover from it or raise it.
///
/// Any `FnMut(DeferredResult<Value>) -> Step` closure is a `Sequential`,
/// which makes small state machines easy to write inline:
///
/// ```rust
/// use loopbridge::deferred::{Deferred, Step};
/// use loopbridge::Value;
///
/// let mut stage = 0;
/// let _sequential = move |sent: Result<Value, loopbridge::Failure>| {
///     stage += 1;
///     match (stage, sent) {
///         (1, _) => Step::wait(&Deferred::succeed(20_u32)),
///         (_, Ok(v)) => Step::done(v.downcast_ref::<u32>().copied().unwrap_or(0) + 22),
///         (_, Err(failure)) => Step::Raise(failure),
///     }
/// };
/// ```
pub trait Sequential: Send + 'static {
    /// Resumes with the outcome of the previous step.
    fn resume(&mut self, sent: DeferredResult<Value>) -> Step;
}

impl<F> Sequential for F
where
    F: FnMut(DeferredResult<Value>) -> Step + Send + 'static,
{
    fn resume(&mut self, sent: DeferredResult<Value>) -> Step {
        self(sent)
    }
}
