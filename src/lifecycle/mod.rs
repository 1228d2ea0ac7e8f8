//! Fixture and test lifecycle.
//!
//! Every test item moves through the same states:
//!
//! ```text
//! CollectFixtures -> RunBody -> DrainTeardowns -> Done
//! ```
//!
//! A setup failure skips the body but still drains teardowns, so fixtures
//! that were set up before the failure are torn down.
//!
//! Test bodies and fixtures are [`MarkedCallable`]s: the execution kind is
//! chosen when the callable is built and dispatched with a single match.

mod fixture;
mod item;
mod machine;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;

pub use fixture::{FixtureDef, FixtureRecord, TeardownQueue};
pub use item::{ItemOutcome, ItemReport, Phase, Summary, TestItem};
pub(crate) use machine::Lifecycle;

use crate::context::LoopContext;
use crate::deferred::{Deferred, DeferredResult, IntoDeferred, Sequential};
use crate::error::{Error, Failure, Result};
use crate::reactor::ReactorHandle;
use crate::value::Value;

/// How a marked callable is executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionKind {
    /// Called directly; may return a deferred.
    Plain,
    /// A generator-style [`Sequential`] driven by `inline_callbacks`.
    InlineSequential,
    /// A future driven by `ensure_deferred`.
    AsyncAwait,
    /// A fixture whose value comes from a future.
    AsyncFixture,
    /// A fixture whose stream yields the value once, then tears down.
    AsyncYieldFixture,
}

impl ExecutionKind {
    /// Marks only valid on fixtures.
    #[must_use]
    pub fn is_fixture_only(self) -> bool {
        matches!(self, ExecutionKind::AsyncFixture | ExecutionKind::AsyncYieldFixture)
    }

    /// Marks only valid on test bodies.
    #[must_use]
    pub fn is_test_only(self) -> bool {
        matches!(self, ExecutionKind::InlineSequential | ExecutionKind::AsyncAwait)
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionKind::Plain => "plain",
            ExecutionKind::InlineSequential => "inline_callbacks",
            ExecutionKind::AsyncAwait => "ensure_deferred",
            ExecutionKind::AsyncFixture => "async_fixture",
            ExecutionKind::AsyncYieldFixture => "async_yield_fixture",
        })
    }
}

/// Fixture scope, narrowest first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// Set up and torn down around one test item.
    #[default]
    Function,
    /// Per test class. Not supported.
    Class,
    /// Shared by the items of one module.
    Module,
    /// Per package. Not supported.
    Package,
    /// Shared by the whole session (plain fixtures only).
    Session,
}

impl Scope {
    /// The configuration name of this scope.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Scope::Function => "function",
            Scope::Class => "class",
            Scope::Module => "module",
            Scope::Package => "package",
            Scope::Session => "session",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [Scope::Function, Scope::Class, Scope::Module, Scope::Package, Scope::Session]
            .into_iter()
            .find(|scope| scope.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownScope(s.to_string()))
    }
}

type PlainFn = Arc<dyn Fn(Request, Args) -> Deferred<Value> + Send + Sync>;
type SequentialFn = Arc<dyn Fn(Request, Args) -> Box<dyn Sequential> + Send + Sync>;
type AwaitableFn = Arc<dyn Fn(Request, Args) -> BoxFuture<'static, DeferredResult<Value>> + Send + Sync>;
type YieldFn = Arc<dyn Fn(Request, Args) -> BoxStream<'static, DeferredResult<Value>> + Send + Sync>;

/// A test body or fixture function tagged with its [`ExecutionKind`].
///
/// Every variant receives the [`Request`] for the item being run and the
/// resolved values of the fixtures it depends on.
///
/// # Example
///
/// ```rust
/// use loopbridge::lifecycle::{ExecutionKind, MarkedCallable};
/// use loopbridge::Failure;
///
/// let body = MarkedCallable::awaitable(|_request, _args| async {
///     Ok::<_, Failure>(42)
/// });
/// assert_eq!(body.kind(), ExecutionKind::AsyncAwait);
/// ```
#[derive(Clone)]
pub enum MarkedCallable {
    /// See [`MarkedCallable::plain`].
    Plain(PlainFn),
    /// See [`MarkedCallable::sequential`].
    InlineSequential(SequentialFn),
    /// See [`MarkedCallable::awaitable`].
    AsyncAwait(AwaitableFn),
    /// See [`MarkedCallable::async_fixture`].
    AsyncFixture(AwaitableFn),
    /// See [`MarkedCallable::async_yield_fixture`].
    AsyncYieldFixture(YieldFn),
}

impl MarkedCallable {
    /// A plain function. Its result may be a `Result` or a [`Deferred`].
    pub fn plain<F, R>(f: F) -> Self
    where
        F: Fn(Request, Args) -> R + Send + Sync + 'static,
        R: IntoDeferred,
        R::Output: Any + Send + Sync,
    {
        MarkedCallable::Plain(Arc::new(move |request, args| f(request, args).into_deferred().map(Value::new)))
    }

    /// A generator-style test body.
    pub fn sequential<F, S>(f: F) -> Self
    where
        F: Fn(Request, Args) -> S + Send + Sync + 'static,
        S: Sequential,
    {
        MarkedCallable::InlineSequential(Arc::new(move |request, args| Box::new(f(request, args)) as Box<dyn Sequential>))
    }

    /// An async test body.
    pub fn awaitable<F, Fut, T, E>(f: F) -> Self
    where
        F: Fn(Request, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Any + Send + Sync,
        E: Into<Failure> + 'static,
    {
        MarkedCallable::AsyncAwait(boxed_future(f))
    }

    /// An async fixture: the future's value is the fixture value.
    pub fn async_fixture<F, Fut, T, E>(f: F) -> Self
    where
        F: Fn(Request, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Any + Send + Sync,
        E: Into<Failure> + 'static,
    {
        MarkedCallable::AsyncFixture(boxed_future(f))
    }

    /// An async fixture with teardown.
    ///
    /// The first item of the stream is the fixture value. At teardown the
    /// stream is polled again and must end; yielding a second item is a
    /// usage error and an `Err` item is a teardown failure.
    pub fn async_yield_fixture<F, St, T, E>(f: F) -> Self
    where
        F: Fn(Request, Args) -> St + Send + Sync + 'static,
        St: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        T: Any + Send + Sync,
        E: Into<Failure> + 'static,
    {
        MarkedCallable::AsyncYieldFixture(Arc::new(move |request, args| {
            f(request, args)
                .map(|item| item.map(Value::new).map_err(Into::into))
                .boxed()
        }))
    }

    /// An async fixture with teardown, written as a setup future and a
    /// teardown future that receives the value.
    ///
    /// ```rust
    /// use loopbridge::lifecycle::MarkedCallable;
    /// use loopbridge::Failure;
    ///
    /// let fixture = MarkedCallable::setup_teardown(
    ///     |_request, _args| async { Ok::<_, Failure>(vec![1, 2, 3]) },
    ///     |values: Vec<i32>| async move {
    ///         assert_eq!(values.len(), 3);
    ///         Ok::<_, Failure>(())
    ///     },
    /// );
    /// ```
    pub fn setup_teardown<S, SFut, D, DFut, T, E>(setup: S, teardown: D) -> Self
    where
        S: Fn(Request, Args) -> SFut + Send + Sync + 'static,
        SFut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        D: Fn(T) -> DFut + Send + Sync + 'static,
        DFut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        T: Any + Clone + Send + Sync,
        E: Into<Failure> + Send + 'static,
    {
        let teardown = Arc::new(teardown);
        Self::async_yield_fixture(move |request, args| {
            let setup = setup(request, args);
            let teardown = Arc::clone(&teardown);
            futures::stream::unfold(Stage::Setup(setup), move |stage| {
                let teardown = Arc::clone(&teardown);
                async move {
                    match stage {
                        Stage::Setup(setup) => match setup.await {
                            Ok(value) => Some((Ok(value.clone()), Stage::Teardown(value))),
                            Err(error) => Some((Err(error), Stage::Done)),
                        },
                        Stage::Teardown(value) => match teardown(value).await {
                            Ok(()) => None,
                            Err(error) => Some((Err(error), Stage::Done)),
                        },
                        Stage::Done => None,
                    }
                }
            })
        })
    }

    /// The execution kind this callable was marked with.
    #[must_use]
    pub fn kind(&self) -> ExecutionKind {
        match self {
            MarkedCallable::Plain(_) => ExecutionKind::Plain,
            MarkedCallable::InlineSequential(_) => ExecutionKind::InlineSequential,
            MarkedCallable::AsyncAwait(_) => ExecutionKind::AsyncAwait,
            MarkedCallable::AsyncFixture(_) => ExecutionKind::AsyncFixture,
            MarkedCallable::AsyncYieldFixture(_) => ExecutionKind::AsyncYieldFixture,
        }
    }
}

enum Stage<F, T> {
    Setup(F),
    Teardown(T),
    Done,
}

fn boxed_future<F, Fut, T, E>(f: F) -> AwaitableFn
where
    F: Fn(Request, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Any + Send + Sync,
    E: Into<Failure> + 'static,
{
    Arc::new(move |request, args| {
        f(request, args)
            .map(|result| result.map(Value::new).map_err(Into::into))
            .boxed()
    })
}

impl fmt::Debug for MarkedCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MarkedCallable").field(&self.kind()).finish()
    }
}

/// Resolved fixture values, in the order they were requested.
#[derive(Clone, Default)]
pub struct Args {
    values: Arc<Vec<(String, Value)>>,
}

impl Args {
    pub(crate) fn new(values: Vec<(String, Value)>) -> Self {
        Self {
            values: Arc::new(values),
        }
    }

    /// The value of fixture `name`, as a `T`.
    ///
    /// # Errors
    ///
    /// A failure carrying [`Error::UnknownFixture`] if `name` was not
    /// requested, or [`Error::FixtureType`] if it is not a `T`.
    pub fn get<T: Any>(&self, name: &str) -> DeferredResult<&T> {
        let value = self
            .value(name)
            .ok_or_else(|| Failure::new(Error::UnknownFixture(name.to_string())))?;
        value.downcast_ref::<T>().ok_or_else(|| {
            Failure::new(Error::FixtureType {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
        })
    }

    /// Like [`get`](Self::get), returning an owned copy.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub fn cloned<T: Any + Clone>(&self, name: &str) -> DeferredResult<T> {
        self.get::<T>(name).cloned()
    }

    /// The untyped value of fixture `name`.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Requested fixture names, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no fixture was requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.values.iter().map(|(n, v)| (n, v))).finish()
    }
}

/// A synchronous cleanup registered with [`Request::add_finalizer`].
pub(crate) type Finalizer = Box<dyn FnOnce() -> DeferredResult<()> + Send>;

/// Shared list of finalizers for one scope frame.
pub(crate) type FinalizerSink = Arc<Mutex<Vec<Finalizer>>>;

/// Context handed to every fixture and test body.
#[derive(Clone)]
pub struct Request {
    ctx: LoopContext,
    reactor: ReactorHandle,
    name: String,
    scope: Scope,
    item: String,
    module: String,
    finalizers: FinalizerSink,
}

impl Request {
    pub(crate) fn new(
        ctx: LoopContext,
        reactor: ReactorHandle,
        name: &str,
        scope: Scope,
        item: &str,
        module: &str,
        finalizers: FinalizerSink,
    ) -> Self {
        Self {
            ctx,
            reactor,
            name: name.to_string(),
            scope,
            item: item.to_string(),
            module: module.to_string(),
            finalizers,
        }
    }

    /// The session reactor.
    #[must_use]
    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    /// The session loop context.
    #[must_use]
    pub fn loop_context(&self) -> &LoopContext {
        &self.ctx
    }

    /// Blocks on the loop. See [`LoopContext::block_on`].
    ///
    /// # Errors
    ///
    /// Same as [`LoopContext::block_on`]; notably
    /// [`Error::BlockedFromLoop`] inside test bodies, which already run on
    /// the loop.
    pub fn block_on<T: Send + 'static>(&self, pending: Deferred<T>) -> Result<T> {
        self.ctx.block_on(pending)
    }

    /// Registers a cleanup run when this request's scope ends.
    ///
    /// Finalizers run after the scope's async-yield teardowns, most recently
    /// registered first.
    pub fn add_finalizer<F, E>(&self, finalizer: F)
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        E: Into<Failure>,
    {
        self.finalizers
            .lock()
            .push(Box::new(move || finalizer().map_err(Into::into)));
    }

    /// Name of the fixture or test being run.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scope of the fixture being set up (`Function` for test bodies).
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Name of the test item that triggered this request.
    #[must_use]
    pub fn item(&self) -> &str {
        &self.item
    }

    /// Module of the test item.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("item", &self.item)
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}
