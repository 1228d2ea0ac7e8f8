//! The per-item state machine and fixture resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;

use super::fixture::ScopeFrame;
use super::{Args, FixtureDef, FixtureRecord, ItemReport, MarkedCallable, Phase, Request, Scope, TestItem};
use crate::context::LoopContext;
use crate::deferred::{ensure_deferred, inline_callbacks, maybe_deferred, run_on_loop, Deferred, DeferredResult};
use crate::error::{Error, Failure};
use crate::reactor::ReactorHandle;
use crate::value::Value;

enum ItemState {
    CollectFixtures,
    RunBody(Args),
    DrainTeardowns,
    Done,
}

impl ItemState {
    fn phase(&self) -> Phase {
        match self {
            ItemState::CollectFixtures => Phase::CollectFixtures,
            ItemState::RunBody(_) => Phase::RunBody,
            ItemState::DrainTeardowns => Phase::DrainTeardowns,
            ItemState::Done => Phase::Done,
        }
    }
}

/// Runs test items against registered fixtures and owns the module and
/// session scope frames.
pub(crate) struct Lifecycle {
    ctx: LoopContext,
    fixtures: HashMap<String, FixtureDef>,
    session: ScopeFrame,
    modules: Vec<ScopeFrame>,
}

impl Lifecycle {
    pub(crate) fn new(ctx: LoopContext) -> Self {
        Self {
            ctx,
            fixtures: HashMap::new(),
            session: ScopeFrame::new(Scope::Session, "session"),
            modules: Vec::new(),
        }
    }

    /// Registers `fixture`, replacing any fixture with the same name.
    pub(crate) fn register_fixture(&mut self, fixture: FixtureDef) {
        if let Some(previous) = self.fixtures.insert(fixture.name().to_string(), fixture) {
            tracing::debug!(fixture = %previous.name(), "fixture overridden");
        }
    }

    /// Runs one item through `CollectFixtures -> RunBody -> DrainTeardowns
    /// -> Done`.
    pub(crate) fn run_item(&mut self, item: &TestItem) -> ItemReport {
        let started = Instant::now();
        let mut report = ItemReport::new(item);
        let mut function = ScopeFrame::new(Scope::Function, item.name());

        let mut state = ItemState::CollectFixtures;
        loop {
            let phase = state.phase();
            tracing::debug!(module = %item.module(), item = %item.name(), ?phase, "lifecycle state");
            report.phases.push(phase);

            state = match state {
                ItemState::CollectFixtures => match self.collect(item, &mut function) {
                    Ok(args) => ItemState::RunBody(args),
                    Err(failure) => {
                        tracing::debug!(item = %item.name(), %failure, "fixture setup failed");
                        report.setup = Some(failure);
                        ItemState::DrainTeardowns
                    }
                },
                ItemState::RunBody(args) => {
                    if let Err(failure) = self.run_body(item, &function, args) {
                        tracing::debug!(item = %item.name(), %failure, "test body failed");
                        report.call = Some(failure);
                    }
                    ItemState::DrainTeardowns
                }
                ItemState::DrainTeardowns => {
                    report.teardown.extend(function.finish(&self.ctx));
                    ItemState::Done
                }
                ItemState::Done => break,
            };
        }

        report.duration = started.elapsed();
        report
    }

    /// Ends the scope of `module`, tearing down its module fixtures.
    pub(crate) fn finish_module(&mut self, module: &str) -> Vec<Failure> {
        match self.modules.iter().position(|frame| frame.key == module) {
            Some(index) => {
                let mut frame = self.modules.remove(index);
                frame.finish(&self.ctx)
            }
            None => Vec::new(),
        }
    }

    /// Ends every open module, then the session scope.
    pub(crate) fn finish_all(&mut self) -> Vec<Failure> {
        let mut failures = Vec::new();
        for mut frame in std::mem::take(&mut self.modules) {
            failures.extend(frame.finish(&self.ctx));
        }
        failures.extend(self.session.finish(&self.ctx));
        failures
    }

    /// Names of modules with live fixtures, in the order they were opened.
    pub(crate) fn open_modules(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|frame| frame.key.as_str())
    }

    fn collect(&mut self, item: &TestItem, function: &mut ScopeFrame) -> DeferredResult<Args> {
        let reactor = self.ctx.reactor().map_err(Error::into_failure)?;
        let module = match self.modules.iter().position(|frame| frame.key == item.module()) {
            Some(index) => &mut self.modules[index],
            None => {
                self.modules.push(ScopeFrame::new(Scope::Module, item.module()));
                let last = self.modules.len() - 1;
                &mut self.modules[last]
            }
        };

        let mut resolver = Resolver {
            ctx: &self.ctx,
            reactor,
            fixtures: &self.fixtures,
            item,
            function,
            module,
            session: &mut self.session,
            stack: Vec::new(),
        };

        let mut values = Vec::with_capacity(item.args().len());
        for name in item.args() {
            values.push((name.clone(), resolver.resolve(name, None)?));
        }
        Ok(Args::new(values))
    }

    fn run_body(&self, item: &TestItem, function: &ScopeFrame, args: Args) -> DeferredResult<()> {
        let reactor = self.ctx.reactor().map_err(Error::into_failure)?;
        let request = Request::new(
            self.ctx.clone(),
            reactor.clone(),
            item.name(),
            Scope::Function,
            item.name(),
            item.module(),
            Arc::clone(&function.finalizers),
        );
        let callable = item.callable().clone();
        let name = item.name().to_string();
        let on_loop = reactor.clone();

        let pending = run_on_loop(&reactor, move || -> Deferred<Value> {
            match callable {
                MarkedCallable::Plain(f) => f(request, args),
                MarkedCallable::InlineSequential(f) => {
                    let mut sequential = f(request, args);
                    inline_callbacks(&on_loop, move |sent: DeferredResult<Value>| sequential.resume(sent))
                }
                MarkedCallable::AsyncAwait(f) => ensure_deferred(&on_loop, f(request, args)),
                other @ (MarkedCallable::AsyncFixture(_) | MarkedCallable::AsyncYieldFixture(_)) => {
                    Deferred::fail(Error::MisplacedMark { name, kind: other.kind() })
                }
            }
        });

        self.ctx.block_on(pending).map(drop).map_err(Error::into_failure)
    }
}

/// Resolves the fixtures of one item.
struct Resolver<'a> {
    ctx: &'a LoopContext,
    reactor: ReactorHandle,
    fixtures: &'a HashMap<String, FixtureDef>,
    item: &'a TestItem,
    function: &'a mut ScopeFrame,
    module: &'a mut ScopeFrame,
    session: &'a mut ScopeFrame,
    stack: Vec<String>,
}

impl Resolver<'_> {
    fn frame(&mut self, scope: Scope, fixture: &str) -> DeferredResult<&mut ScopeFrame> {
        match scope {
            Scope::Function => Ok(&mut *self.function),
            Scope::Module => Ok(&mut *self.module),
            Scope::Session => Ok(&mut *self.session),
            Scope::Class | Scope::Package => Err(Failure::new(Error::UnsupportedFixtureScope {
                fixture: fixture.to_string(),
                scope,
            })),
        }
    }

    fn resolve(&mut self, name: &str, requester: Option<&FixtureDef>) -> DeferredResult<Value> {
        let fixture = self
            .fixtures
            .get(name)
            .cloned()
            .ok_or_else(|| Failure::new(Error::UnknownFixture(name.to_string())))?;

        if let Some(requester) = requester {
            if fixture.scope() < requester.scope() {
                return Err(Failure::new(Error::ScopeMismatch {
                    fixture: requester.name().to_string(),
                    scope: requester.scope(),
                    dependency: name.to_string(),
                    dependency_scope: fixture.scope(),
                }));
            }
        }

        if self.stack.iter().any(|pending| pending == name) {
            let mut path = self.stack.clone();
            path.push(name.to_string());
            return Err(Failure::new(Error::FixtureCycle(path.join(" -> "))));
        }

        if let Some(value) = self.frame(fixture.scope(), name)?.cache.get(name) {
            return Ok(value.clone());
        }

        self.stack.push(name.to_string());
        let mut values = Vec::with_capacity(fixture.dependencies().len());
        for dependency in fixture.dependencies() {
            match self.resolve(dependency, Some(&fixture)) {
                Ok(value) => values.push((dependency.clone(), value)),
                Err(failure) => {
                    self.stack.pop();
                    return Err(failure);
                }
            }
        }
        self.stack.pop();

        let value = self.setup(&fixture, Args::new(values))?;
        self.frame(fixture.scope(), name)?
            .cache
            .insert(name.to_string(), value.clone());
        Ok(value)
    }

    fn setup(&mut self, fixture: &FixtureDef, args: Args) -> DeferredResult<Value> {
        tracing::trace!(fixture = %fixture.name(), scope = %fixture.scope(), kind = %fixture.kind(), "setting up fixture");
        let ctx = self.ctx.clone();
        let reactor = self.reactor.clone();
        let item = self.item;
        let frame = self.frame(fixture.scope(), fixture.name())?;
        let request = Request::new(
            ctx.clone(),
            reactor.clone(),
            fixture.name(),
            fixture.scope(),
            item.name(),
            item.module(),
            Arc::clone(&frame.finalizers),
        );
        let on_loop = reactor.clone();

        match fixture.callable() {
            MarkedCallable::Plain(f) => {
                let pending = maybe_deferred(|| f(request, args));
                ctx.block_on(pending).map_err(Error::into_failure)
            }
            MarkedCallable::AsyncFixture(f) => {
                let f = Arc::clone(f);
                let pending = run_on_loop(&reactor, move || ensure_deferred(&on_loop, f(request, args)));
                ctx.block_on(pending).map_err(Error::into_failure)
            }
            MarkedCallable::AsyncYieldFixture(f) => {
                let f = Arc::clone(f);
                let name = fixture.name().to_string();
                let pending = run_on_loop(&reactor, move || {
                    let mut stream = f(request, args);
                    ensure_deferred(&on_loop, async move {
                        match stream.next().await {
                            Some(Ok(value)) => Ok((value, stream)),
                            Some(Err(failure)) => Err(failure),
                            None => Err(Failure::new(Error::FixtureDidNotYield(name))),
                        }
                    })
                });
                let (value, stream) = ctx.block_on(pending).map_err(Error::into_failure)?;
                frame.teardowns.push(FixtureRecord::new(fixture.name(), stream));
                Ok(value)
            }
            MarkedCallable::InlineSequential(_) | MarkedCallable::AsyncAwait(_) => Err(Failure::new(Error::MisplacedMark {
                name: fixture.name().to_string(),
                kind: fixture.kind(),
            })),
        }
    }
}
