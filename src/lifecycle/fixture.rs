//! Fixture definitions and teardown bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::{BoxStream, StreamExt};

use super::{ExecutionKind, FinalizerSink, MarkedCallable, Scope};
use crate::context::LoopContext;
use crate::deferred::{ensure_deferred, run_on_loop, DeferredResult};
use crate::error::{Error, Failure, Result};
use crate::value::Value;

/// A registered fixture.
///
/// # Example
///
/// ```rust
/// use loopbridge::lifecycle::{FixtureDef, MarkedCallable, Scope};
/// use loopbridge::Failure;
///
/// let fixture = FixtureDef::with_scope(
///     "database",
///     Scope::Module,
///     MarkedCallable::async_fixture(|_request, _args| async { Ok::<_, Failure>("sqlite::memory:") }),
/// )
/// .unwrap()
/// .depends_on(["config"]);
/// assert_eq!(fixture.dependencies(), ["config"]);
///
/// let rejected = FixtureDef::with_scope(
///     "per_class",
///     Scope::Class,
///     MarkedCallable::async_fixture(|_request, _args| async { Ok::<_, Failure>(()) }),
/// );
/// assert!(rejected.is_err());
/// ```
#[derive(Clone, Debug)]
pub struct FixtureDef {
    name: String,
    scope: Scope,
    dependencies: Vec<String>,
    callable: MarkedCallable,
}

impl FixtureDef {
    /// A function-scoped fixture.
    ///
    /// # Errors
    ///
    /// [`Error::MisplacedMark`] if `callable` carries a test-only mark.
    pub fn new(name: impl Into<String>, callable: MarkedCallable) -> Result<Self> {
        Self::with_scope(name, Scope::Function, callable)
    }

    /// A fixture with an explicit scope.
    ///
    /// Async fixtures accept `function` and `module` scope only; plain
    /// fixtures additionally accept `session`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedFixtureScope`] for any other scope,
    /// [`Error::MisplacedMark`] if `callable` carries a test-only mark.
    pub fn with_scope(name: impl Into<String>, scope: Scope, callable: MarkedCallable) -> Result<Self> {
        let name = name.into();
        let kind = callable.kind();
        if kind.is_test_only() {
            return Err(Error::MisplacedMark { name, kind });
        }

        let supported = match scope {
            Scope::Function | Scope::Module => true,
            Scope::Session => kind == ExecutionKind::Plain,
            Scope::Class | Scope::Package => false,
        };
        if !supported {
            return Err(Error::UnsupportedFixtureScope { fixture: name, scope });
        }

        Ok(Self {
            name,
            scope,
            dependencies: Vec::new(),
            callable,
        })
    }

    /// Declares the fixtures this one requests.
    #[must_use]
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    /// Fixture name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixture scope.
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// How the fixture function runs.
    #[must_use]
    pub fn kind(&self) -> ExecutionKind {
        self.callable.kind()
    }

    /// Requested fixture names.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub(crate) fn callable(&self) -> &MarkedCallable {
        &self.callable
    }
}

/// An async-yield fixture whose setup half has run.
pub struct FixtureRecord {
    fixture: String,
    order: u64,
    stream: BoxStream<'static, DeferredResult<Value>>,
}

impl FixtureRecord {
    pub(crate) fn new(fixture: &str, stream: BoxStream<'static, DeferredResult<Value>>) -> Self {
        static ORDER: AtomicU64 = AtomicU64::new(0);
        Self {
            fixture: fixture.to_string(),
            order: ORDER.fetch_add(1, Ordering::Relaxed),
            stream,
        }
    }

    /// Name of the fixture.
    #[must_use]
    pub fn fixture(&self) -> &str {
        &self.fixture
    }

    /// Setup order across the session; smaller was set up earlier.
    #[must_use]
    pub fn order(&self) -> u64 {
        self.order
    }

    /// Resumes the fixture on the loop and expects its stream to end.
    pub(crate) fn teardown(self, ctx: &LoopContext) -> DeferredResult<()> {
        let FixtureRecord { fixture, mut stream, .. } = self;
        let reactor = ctx.reactor().map_err(Error::into_failure)?;
        let on_loop = reactor.clone();
        let resumed = run_on_loop(&reactor, move || {
            ensure_deferred(&on_loop, async move { Ok::<_, Failure>(stream.next().await) })
        });

        match ctx.block_on(resumed).map_err(Error::into_failure)? {
            None => {
                tracing::trace!(fixture = %fixture, "async yield fixture stopped");
                Ok(())
            }
            Some(Ok(_)) => Err(Failure::new(Error::AsyncGeneratorFixtureDidNotStop(fixture))),
            Some(Err(failure)) => Err(failure),
        }
    }
}

impl fmt::Debug for FixtureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureRecord")
            .field("fixture", &self.fixture)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// Pending async-yield teardowns, drained in setup order.
#[derive(Debug, Default)]
pub struct TeardownQueue {
    records: VecDeque<FixtureRecord>,
}

impl TeardownQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, record: FixtureRecord) {
        self.records.push_back(record);
    }

    /// Number of fixtures awaiting teardown.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing awaits teardown.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fixture names in teardown order.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(FixtureRecord::fixture)
    }

    /// Tears down every record, first set up first.
    ///
    /// A failing teardown does not stop the rest of the queue.
    pub(crate) fn drain(&mut self, ctx: &LoopContext) -> Vec<Failure> {
        let mut failures = Vec::new();
        while let Some(record) = self.records.pop_front() {
            let fixture = record.fixture.clone();
            if let Err(failure) = record.teardown(ctx) {
                tracing::warn!(fixture = %fixture, %failure, "fixture teardown failed");
                failures.push(failure);
            }
        }
        failures
    }
}

/// Fixture state for one scope instance (an item, a module, the session).
pub(crate) struct ScopeFrame {
    pub(crate) scope: Scope,
    pub(crate) key: String,
    pub(crate) cache: HashMap<String, Value>,
    pub(crate) teardowns: TeardownQueue,
    pub(crate) finalizers: FinalizerSink,
}

impl ScopeFrame {
    pub fn new(scope: Scope, key: &str) -> Self {
        Self {
            scope,
            key: key.to_string(),
            cache: HashMap::new(),
            teardowns: TeardownQueue::new(),
            finalizers: FinalizerSink::default(),
        }
    }

    /// Ends the scope: async-yield teardowns first, then finalizers, most
    /// recently registered first.
    pub fn finish(&mut self, ctx: &LoopContext) -> Vec<Failure> {
        tracing::debug!(
            scope = %self.scope,
            key = %self.key,
            teardowns = self.teardowns.len(),
            "finishing scope"
        );
        let mut failures = self.teardowns.drain(ctx);

        let finalizers = std::mem::take(&mut *self.finalizers.lock());
        for finalizer in finalizers.into_iter().rev() {
            let outcome = catch_unwind(AssertUnwindSafe(finalizer))
                .unwrap_or_else(|payload| Err(Failure::from_panic(payload)));
            if let Err(failure) = outcome {
                tracing::warn!(scope = %self.scope, %failure, "finalizer failed");
                failures.push(failure);
            }
        }

        self.cache.clear();
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ReactorChoice;
    use std::sync::Arc;

    fn yielding<I>(items: I) -> BoxStream<'static, DeferredResult<Value>>
    where
        I: IntoIterator<Item = DeferredResult<Value>>,
        I::IntoIter: Send + 'static,
    {
        futures::stream::iter(items).boxed()
    }

    #[test]
    fn test_async_scopes() {
        let make = || MarkedCallable::async_fixture(|_, _| async { Ok::<_, Failure>(()) });
        assert!(FixtureDef::new("f", make()).is_ok());
        assert!(FixtureDef::with_scope("m", Scope::Module, make()).is_ok());
        for scope in [Scope::Class, Scope::Package, Scope::Session] {
            assert!(matches!(
                FixtureDef::with_scope("x", scope, make()),
                Err(Error::UnsupportedFixtureScope { scope: s, .. }) if s == scope
            ));
        }
    }

    #[test]
    fn test_plain_session_scope_allowed() {
        let plain = MarkedCallable::plain(|_, _| Ok::<_, Failure>(1));
        assert!(FixtureDef::with_scope("s", Scope::Session, plain.clone()).is_ok());
        assert!(FixtureDef::with_scope("c", Scope::Class, plain).is_err());
    }

    #[test]
    fn test_test_mark_on_fixture_rejected() {
        let body = MarkedCallable::awaitable(|_, _| async { Ok::<_, Failure>(()) });
        assert!(matches!(
            FixtureDef::new("oops", body),
            Err(Error::MisplacedMark { kind: ExecutionKind::AsyncAwait, .. })
        ));
    }

    #[test]
    fn test_queue_drains_in_setup_order() {
        let ctx = LoopContext::new();
        ctx.install(ReactorChoice::Default).unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut queue = TeardownQueue::new();
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            let stream = futures::stream::once(async { Ok::<_, Failure>(Value::unit()) })
                .chain(futures::stream::unfold((), move |()| {
                    order.lock().push(name);
                    async { None }
                }))
                .boxed();
            let mut stream = stream;
            futures::executor::block_on(stream.next());
            queue.push(FixtureRecord::new(name, stream));
        }

        assert_eq!(queue.pending().collect::<Vec<_>>(), ["first", "second", "third"]);
        assert!(queue.drain(&ctx).is_empty());
        assert_eq!(*order.lock(), ["first", "second", "third"]);
        assert!(queue.is_empty());
        ctx.stop();
    }

    #[test]
    fn test_teardown_that_yields_again() {
        let ctx = LoopContext::new();
        ctx.install(ReactorChoice::Default).unwrap();

        let mut queue = TeardownQueue::new();
        queue.push(FixtureRecord::new("twice", yielding(vec![Ok(Value::new(2))])));
        queue.push(FixtureRecord::new("broken", yielding(vec![Err(Failure::msg("cleanup failed"))])));
        queue.push(FixtureRecord::new("clean", yielding(vec![])));

        let failures = queue.drain(&ctx);
        assert_eq!(failures.len(), 2);
        assert!(matches!(
            failures[0].downcast_ref::<Error>(),
            Some(Error::AsyncGeneratorFixtureDidNotStop(name)) if name == "twice"
        ));
        assert_eq!(failures[1].to_string(), "cleanup failed");
        ctx.stop();
    }

    #[test]
    fn test_frame_runs_finalizers_after_queue_in_reverse() {
        let ctx = LoopContext::new();
        ctx.install(ReactorChoice::Default).unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut frame = ScopeFrame::new(Scope::Function, "item");
        for tag in ["finalizer 1", "finalizer 2"] {
            let order = Arc::clone(&order);
            frame.finalizers.lock().push(Box::new(move || {
                order.lock().push(tag);
                Ok::<(), Failure>(())
            }));
        }
        let queued = Arc::clone(&order);
        frame.teardowns.push(FixtureRecord::new(
            "async",
            futures::stream::unfold((), move |()| {
                queued.lock().push("async");
                async { None }
            })
            .boxed(),
        ));
        frame
            .finalizers
            .lock()
            .push(Box::new(|| -> DeferredResult<()> { panic!("finalizer exploded") }));

        let failures = frame.finish(&ctx);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].is_panic());
        assert_eq!(*order.lock(), ["async", "finalizer 2", "finalizer 1"]);
        ctx.stop();
    }
}
