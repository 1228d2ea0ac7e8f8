//! Harness integration.
//!
//! A [`Session`] is the explicit, session-lifetime owner of the loop: it
//! installs the reactor when it starts and stops it when it finishes. In
//! between, a harness registers fixtures and hands it test items one at a
//! time, or all at once through [`Session::run`].
//!
//! # Example
//!
//! ```rust
//! use loopbridge::prelude::*;
//!
//! let mut session = Session::start(SessionConfig::default()).unwrap();
//! session.register_fixture(
//!     FixtureDef::new(
//!         "foo",
//!         MarkedCallable::async_yield_fixture(|_request, _args| {
//!             futures::stream::iter(vec![Ok::<_, Failure>(42_u32)])
//!         }),
//!     )
//!     .unwrap(),
//! );
//!
//! let item = TestItem::new(
//!     "test_foo",
//!     MarkedCallable::awaitable(|_request, args| async move {
//!         assert_eq!(args.cloned::<u32>("foo")?, 42);
//!         Ok::<_, Failure>(())
//!     }),
//! )
//! .unwrap()
//! .with_args(["foo"]);
//!
//! let reports = session.run(&[item]);
//! assert_eq!(Summary::from_reports(&reports).to_string(), "1 passed");
//! assert!(session.finish().is_empty());
//! ```

use std::fmt;

use crate::config::SessionConfig;
use crate::context::{InterruptHandle, LoopContext};
use crate::deferred::Deferred;
use crate::error::{Failure, Result};
use crate::lifecycle::{FixtureDef, ItemReport, Lifecycle, MarkedCallable, Scope, TestItem};
use crate::reactor::ReactorHandle;

/// Name of the built-in session fixture serving a
/// [`LoopHandle`](crate::context::LoopHandle).
pub const LOOP_CONTEXT_FIXTURE: &str = "loop_context";

/// One test session: a loop context plus the fixture lifecycle.
pub struct Session {
    ctx: LoopContext,
    lifecycle: Lifecycle,
    config: SessionConfig,
    finished: bool,
}

impl Session {
    /// Installs the configured reactor on a fresh loop context.
    ///
    /// # Errors
    ///
    /// Any error from [`LoopContext::install`].
    pub fn start(config: SessionConfig) -> Result<Self> {
        Self::attach(LoopContext::new(), config)
    }

    /// Starts a session on an existing context.
    ///
    /// The configured reactor is installed unless the context already runs
    /// the same backend, installed or adopted.
    ///
    /// # Errors
    ///
    /// [`Error::WrongLoopAlreadyInstalled`](crate::Error::WrongLoopAlreadyInstalled)
    /// if the context runs a different backend.
    pub fn attach(ctx: LoopContext, config: SessionConfig) -> Result<Self> {
        ctx.install(config.reactor)?;
        tracing::debug!(reactor = %config.reactor, external = ctx.is_external(), "session started");

        let mut lifecycle = Lifecycle::new(ctx.clone());
        lifecycle.register_fixture(FixtureDef::with_scope(
            LOOP_CONTEXT_FIXTURE,
            Scope::Session,
            MarkedCallable::plain(|request, _args| Ok::<_, Failure>(request.loop_context().handle())),
        )?);

        Ok(Self {
            ctx,
            lifecycle,
            config,
            finished: false,
        })
    }

    /// Registers a fixture. A later registration with the same name
    /// replaces the earlier one.
    pub fn register_fixture(&mut self, fixture: FixtureDef) {
        self.lifecycle.register_fixture(fixture);
    }

    /// Runs one item. Module and session fixtures stay alive until
    /// [`finish_module`](Self::finish_module) or [`finish`](Self::finish).
    pub fn run_item(&mut self, item: &TestItem) -> ItemReport {
        self.lifecycle.run_item(item)
    }

    /// Runs `items` in order.
    ///
    /// A module's fixtures are torn down as soon as the next item belongs to
    /// a different module; their teardown failures are added to the last
    /// report of that module. The run stops after an item that was
    /// interrupted.
    pub fn run(&mut self, items: &[TestItem]) -> Vec<ItemReport> {
        let mut reports: Vec<ItemReport> = Vec::with_capacity(items.len());
        let mut current: Option<String> = None;

        for item in items {
            if let Some(module) = current.take() {
                if module != item.module() {
                    let failures = self.finish_module(&module);
                    if let Some(last) = reports.last_mut() {
                        last.teardown.extend(failures);
                    }
                }
            }
            current = Some(item.module().to_string());

            let report = self.run_item(item);
            let interrupted = report.interrupted();
            reports.push(report);
            if interrupted {
                tracing::warn!(item = %item.name(), "session interrupted, skipping remaining items");
                break;
            }
        }

        if let Some(module) = current {
            let failures = self.finish_module(&module);
            if let Some(last) = reports.last_mut() {
                last.teardown.extend(failures);
            }
        }
        reports
    }

    /// Tears down the module-scoped fixtures of `module`.
    pub fn finish_module(&mut self, module: &str) -> Vec<Failure> {
        self.lifecycle.finish_module(module)
    }

    /// Tears down every remaining fixture and stops the loop.
    ///
    /// Calling it again returns no failures.
    pub fn finish(&mut self) -> Vec<Failure> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let open: Vec<String> = self.lifecycle.open_modules().map(str::to_string).collect();
        tracing::debug!(modules = ?open, "finishing session");
        let failures = self.lifecycle.finish_all();
        self.ctx.stop();
        failures
    }

    /// Returns true once [`finish`](Self::finish) ran.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Blocks on the loop from hook code. See [`LoopContext::block_on`].
    ///
    /// # Errors
    ///
    /// Same as [`LoopContext::block_on`].
    pub fn block_on<T: Send + 'static>(&self, pending: Deferred<T>) -> Result<T> {
        self.ctx.block_on(pending)
    }

    /// The session reactor.
    ///
    /// # Errors
    ///
    /// [`Error::ReactorNotRunning`](crate::Error::ReactorNotRunning) after
    /// [`finish`](Self::finish).
    pub fn reactor(&self) -> Result<ReactorHandle> {
        self.ctx.reactor()
    }

    /// The session loop context.
    #[must_use]
    pub fn loop_context(&self) -> &LoopContext {
        &self.ctx
    }

    /// Handle for interrupting the session from another thread, such as a
    /// signal handler.
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.ctx.interrupt_handle()
    }

    /// The configuration the session started with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for failure in self.finish() {
            tracing::warn!(%failure, "teardown failed while dropping session");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("ctx", &self.ctx)
            .field("config", &self.config)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
