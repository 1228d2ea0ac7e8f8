//! Error definitions
//!
//! Two kinds of errors flow through loopbridge:
//!
//! - [`Error`] covers usage violations and runtime state errors raised by the
//!   bridge itself (wrong reactor, reactor stopped, bad fixture scope, ...).
//! - [`Failure`] is the value a pending computation fails with. It wraps
//!   whatever the test or fixture code raised (an error or a panic) and
//!   keeps the original error available through [`Failure::downcast_ref`].

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::lifecycle::{ExecutionKind, Scope};
use crate::reactor::ReactorChoice;

/// Main error type for loopbridge
#[derive(Error, Debug)]
pub enum Error {
    /// A different reactor backend is already installed.
    #[error("wrong reactor already installed: requested {requested}, found {installed}")]
    WrongLoopAlreadyInstalled {
        /// The backend that was asked for.
        requested: ReactorChoice,
        /// The backend that is already active.
        installed: ReactorChoice,
    },

    /// The backend exists but was compiled out.
    #[error("reactor backend {0} is not available (enable the `{0}` feature)")]
    BackendUnavailable(ReactorChoice),

    /// Unrecognized reactor name in configuration.
    #[error("unknown reactor: {0:?}")]
    UnknownReactor(String),

    /// The backend failed to build.
    #[error("failed to build {backend} reactor: {source}")]
    Backend {
        /// Backend being built.
        backend: ReactorChoice,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The loop-driving context has already exited.
    #[error("reactor has stopped")]
    ReactorStopped,

    /// No reactor is installed, or an adopted reactor is not running.
    #[error("reactor is not running")]
    ReactorNotRunning,

    /// `block_on` was called from the loop-driving context itself.
    #[error("block_on cannot be called from the loop-driving context")]
    BlockedFromLoop,

    /// A blocking wait was interrupted.
    #[error("interrupted while blocked on the reactor")]
    Interrupted,

    /// A deferred was fired twice.
    #[error("deferred has already been called")]
    AlreadyCalled,

    /// A deferred was cancelled before it fired.
    #[error("deferred was cancelled")]
    Cancelled,

    /// A consumer subscribed after the result was handed to an earlier
    /// consumer, such as a chained deferred.
    #[error("deferred result was already consumed")]
    ResultConsumed,

    /// A deferred was dropped without ever firing.
    #[error("deferred was dropped before it fired")]
    DeferredDropped,

    /// Unrecognized fixture scope name.
    #[error("unknown fixture scope: {0:?}")]
    UnknownScope(String),

    /// Async fixtures only support function and module scope.
    #[error("fixture {fixture:?} uses unsupported scope {scope}")]
    UnsupportedFixtureScope {
        /// Fixture name.
        fixture: String,
        /// Rejected scope.
        scope: Scope,
    },

    /// An async-yield fixture yielded again during teardown.
    #[error("async generator fixture {0:?} did not stop")]
    AsyncGeneratorFixtureDidNotStop(String),

    /// An async-yield fixture finished without yielding a value.
    #[error("async generator fixture {0:?} did not yield a value")]
    FixtureDidNotYield(String),

    /// A mark was used where it has no meaning (a fixture mark on a test,
    /// or a test mark on a fixture).
    #[error("{name:?} is marked {kind}, which is not valid here")]
    MisplacedMark {
        /// Name of the test or fixture.
        name: String,
        /// The misplaced mark.
        kind: ExecutionKind,
    },

    /// No fixture with this name is registered.
    #[error("fixture {0:?} not found")]
    UnknownFixture(String),

    /// Fixture dependencies form a cycle.
    #[error("fixture dependency cycle: {0}")]
    FixtureCycle(String),

    /// A fixture requested a fixture with a narrower scope.
    #[error("fixture {fixture:?} ({scope}) cannot use {dependency:?} ({dependency_scope})")]
    ScopeMismatch {
        /// Requesting fixture.
        fixture: String,
        /// Requesting fixture's scope.
        scope: Scope,
        /// Requested fixture.
        dependency: String,
        /// Requested fixture's scope.
        dependency_scope: Scope,
    },

    /// A fixture value had an unexpected type.
    #[error("fixture {name:?} is not a {expected}")]
    FixtureType {
        /// Fixture name.
        name: String,
        /// Requested type.
        expected: &'static str,
    },

    /// Test or fixture code failed.
    #[error("{0}")]
    Failed(Failure),
}

impl Error {
    /// Converts into a [`Failure`], unwrapping [`Error::Failed`] instead of
    /// nesting it.
    #[must_use]
    pub fn into_failure(self) -> Failure {
        match self {
            Error::Failed(failure) => failure,
            other => Failure::new(other),
        }
    }

    /// Returns true for [`Error::Interrupted`], including when it travelled
    /// inside a [`Failure`].
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Error::Interrupted => true,
            Error::Failed(failure) => failure.is_interrupted(),
            _ => false,
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Error::Failed(failure)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// The error side of a pending computation.
///
/// A `Failure` is what test bodies, fixtures and deferred callbacks fail
/// with. Any `std::error::Error` converts into one with `?`, panics are
/// captured with their message, and the original error stays reachable
/// through [`downcast_ref`](Failure::downcast_ref).
///
/// `Failure` is cheap to clone: clones share the captured error.
#[derive(Clone)]
pub struct Failure {
    inner: Arc<FailureKind>,
}

enum FailureKind {
    Error(Box<dyn StdError + Send + Sync>),
    Panic(String),
    Message(String),
}

impl Failure {
    /// Wraps an error.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::from_boxed(Box::new(error))
    }

    /// Wraps an already boxed error.
    #[must_use]
    pub fn from_boxed(error: Box<dyn StdError + Send + Sync>) -> Self {
        Self {
            inner: Arc::new(FailureKind::Error(error)),
        }
    }

    /// Creates a failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FailureKind::Message(message.into())),
        }
    }

    /// Creates a failure from a panic payload as returned by
    /// `std::panic::catch_unwind`.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        Self {
            inner: Arc::new(FailureKind::Panic(message)),
        }
    }

    /// Returns the original error if it is an `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match &*self.inner {
            FailureKind::Error(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Returns true if the original error is an `E`.
    #[must_use]
    pub fn is<E>(&self) -> bool
    where
        E: StdError + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    /// Returns true if this failure was captured from a panic.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(&*self.inner, FailureKind::Panic(_))
    }

    /// Returns true if this failure carries [`Error::Interrupted`].
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self.downcast_ref::<Error>(), Some(e) if e.is_interrupted())
    }

    /// Returns true if this failure carries [`Error::Cancelled`].
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.downcast_ref::<Error>(), Some(Error::Cancelled))
    }
}

impl<E> From<E> for Failure
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            FailureKind::Error(error) => write!(f, "{error}"),
            FailureKind::Panic(message) => write!(f, "panicked: {message}"),
            FailureKind::Message(message) => f.write_str(message),
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            FailureKind::Error(error) => f.debug_tuple("Failure").field(error).finish(),
            FailureKind::Panic(message) => f.debug_tuple("Panic").field(message).finish(),
            FailureKind::Message(message) => f.debug_tuple("Failure").field(message).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("division by zero")]
    struct ZeroDivision;

    #[test]
    fn test_failure_keeps_original_error() {
        let failure = Failure::from(ZeroDivision);
        assert!(failure.is::<ZeroDivision>());
        assert_eq!(failure.to_string(), "division by zero");
        assert!(!failure.is_panic());
    }

    #[test]
    fn test_failure_from_panic_payload() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        let failure = Failure::from_panic(payload);
        assert!(failure.is_panic());
        assert_eq!(failure.to_string(), "panicked: boom");

        let payload = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(Failure::from_panic(payload).to_string(), "panicked: formatted 1");
    }

    #[test]
    fn test_into_failure_does_not_nest() {
        let failure = Failure::msg("inner");
        let error = Error::from(failure);
        let back = error.into_failure();
        assert_eq!(back.to_string(), "inner");
        assert!(back.downcast_ref::<Error>().is_none());
    }

    #[test]
    fn test_interrupted_detection() {
        assert!(Error::Interrupted.is_interrupted());
        assert!(Failure::new(Error::Interrupted).is_interrupted());
        assert!(Error::Failed(Failure::new(Error::Interrupted)).is_interrupted());
        assert!(!Failure::msg("nope").is_interrupted());
        assert!(Failure::new(Error::Cancelled).is_cancelled());
    }
}
