//! The cooperative context pair.
//!
//! [`LoopContext`] owns the single event loop of a session and the context
//! that drives it. Two logical contexts exist: the caller (whatever thread
//! the harness calls in from) and the loop-driving context, a dedicated
//! thread that runs the reactor. Control moves between them explicitly, see
//! [`LoopContext::block_on`].
//!
//! When the reactor was started by someone else before the session attached
//! to it, the context is *external*: no driving context is created and all
//! work is submitted across threads.
//!
//! # Example
//!
//! ```rust
//! use loopbridge::context::{ContextId, LoopContext};
//! use loopbridge::reactor::ReactorChoice;
//!
//! let ctx = LoopContext::new();
//! ctx.install(ReactorChoice::Default).unwrap();
//! assert!(matches!(ctx.current_context(), ContextId::Caller(_)));
//! ctx.stop();
//! ```

mod baton;
mod interrupt;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

pub(crate) use baton::{Baton, Handoff};
pub(crate) use interrupt::Interrupt;

use crate::error::{Error, Result};
use crate::reactor::{ReactorChoice, ReactorHandle};

/// Identity of the context currently executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextId {
    /// The loop-driving context.
    Loop,
    /// A caller context, identified by its thread.
    Caller(ThreadId),
}

/// Handle to the session's event loop.
///
/// Cloning is cheap; all clones refer to the same loop.
#[derive(Clone)]
pub struct LoopContext {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) active: Mutex<Option<Active>>,
    pub(crate) interrupt: Arc<Interrupt>,
    /// Held by the caller currently using the cooperative path.
    pub(crate) entry: Mutex<()>,
    /// Callers waiting for `entry` or for their result park here.
    pub(crate) lobby: Mutex<()>,
    pub(crate) released: Condvar,
    drivers: AtomicUsize,
}

impl Shared {
    /// Wakes every caller parked in the lobby.
    pub(crate) fn wake_waiters(&self) {
        let _lobby = self.lobby.lock();
        self.released.notify_all();
    }
}

#[derive(Clone)]
pub(crate) struct Active {
    pub(crate) reactor: ReactorHandle,
    pub(crate) driver: Option<Arc<Baton>>,
    pub(crate) external: bool,
}

impl LoopContext {
    /// Creates a context with no reactor installed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                active: Mutex::new(None),
                interrupt: Arc::new(Interrupt::new()),
                entry: Mutex::new(()),
                lobby: Mutex::new(()),
                released: Condvar::new(),
                drivers: AtomicUsize::new(0),
            }),
        }
    }

    /// Builds and installs the reactor for `choice` together with its
    /// loop-driving context.
    ///
    /// Installing the backend that is already installed is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::WrongLoopAlreadyInstalled`] if another backend is installed,
    /// or any error from [`ReactorHandle::build`].
    pub fn install(&self, choice: ReactorChoice) -> Result<()> {
        let mut active = self.shared.active.lock();
        if let Some(current) = active.as_ref() {
            let installed = current.reactor.choice();
            if installed == choice {
                tracing::debug!(reactor = %choice, "reactor already installed");
                return Ok(());
            }
            return Err(Error::WrongLoopAlreadyInstalled {
                requested: choice,
                installed,
            });
        }

        let reactor = ReactorHandle::build(choice)?;
        let driver = self.spawn_driver(&reactor)?;
        *active = Some(Active {
            reactor,
            driver: Some(driver),
            external: false,
        });
        tracing::debug!(reactor = %choice, "reactor installed");
        Ok(())
    }

    /// Attaches to an existing reactor.
    ///
    /// If `reactor` is already running, the loop is owned by someone else:
    /// no driving context is created and blocking calls are submitted
    /// across threads. Otherwise this behaves like [`install`](Self::install).
    ///
    /// # Errors
    ///
    /// [`Error::WrongLoopAlreadyInstalled`] if a different reactor is
    /// already installed.
    pub fn adopt(&self, reactor: ReactorHandle) -> Result<()> {
        let mut active = self.shared.active.lock();
        if let Some(current) = active.as_ref() {
            if current.reactor.same_reactor(&reactor) {
                return Ok(());
            }
            return Err(Error::WrongLoopAlreadyInstalled {
                requested: reactor.choice(),
                installed: current.reactor.choice(),
            });
        }

        let external = reactor.is_running();
        let driver = if external {
            None
        } else {
            Some(self.spawn_driver(&reactor)?)
        };
        tracing::debug!(reactor = %reactor.choice(), external, "reactor adopted");
        *active = Some(Active {
            reactor,
            driver,
            external,
        });
        Ok(())
    }

    fn spawn_driver(&self, reactor: &ReactorHandle) -> Result<Arc<Baton>> {
        let live = self.shared.drivers.fetch_add(1, Ordering::SeqCst);
        assert_eq!(live, 0, "a loop-driving context is already alive");
        match Baton::spawn(reactor.clone(), Arc::clone(&self.shared.interrupt)) {
            Ok(baton) => Ok(Arc::new(baton)),
            Err(e) => {
                self.shared.drivers.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Snapshot of the installed loop.
    pub(crate) fn active(&self) -> Option<Active> {
        self.shared.active.lock().clone()
    }

    /// Identity of the context executing this call.
    #[must_use]
    pub fn current_context(&self) -> ContextId {
        if self.is_loop_context() {
            ContextId::Loop
        } else {
            ContextId::Caller(thread::current().id())
        }
    }

    /// Returns true when called from the thread driving the loop.
    #[must_use]
    pub fn is_loop_context(&self) -> bool {
        let Some(active) = self.active() else {
            return false;
        };
        let me = thread::current().id();
        match &active.driver {
            Some(driver) => driver.loop_thread() == me,
            None => active.reactor.loop_thread() == Some(me),
        }
    }

    /// Stops the loop and waits for the driving context to exit.
    ///
    /// A no-op when nothing is installed. An external loop is detached but
    /// left running; its owner stops it.
    pub fn stop(&self) {
        let Some(active) = self.shared.active.lock().take() else {
            return;
        };
        if let Some(driver) = active.driver {
            driver.stop();
            self.shared.drivers.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(reactor = %active.reactor.choice(), "reactor stopped");
        } else {
            tracing::debug!(reactor = %active.reactor.choice(), "detached from external reactor");
        }
    }

    /// Unwinds every caller blocked on the loop with [`Error::Interrupted`].
    ///
    /// Safe to call from any thread. The interrupt stays raised for the
    /// rest of the session.
    pub fn interrupt(&self) {
        let released = self.shared.interrupt.trigger();
        if let Some(driver) = self.active().and_then(|active| active.driver) {
            driver.notify();
        }
        self.shared.wake_waiters();
        tracing::debug!(released, "loop context interrupted");
    }

    /// Returns true once [`interrupt`](Self::interrupt) was called.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupt.is_triggered()
    }

    /// The installed reactor.
    ///
    /// # Errors
    ///
    /// [`Error::ReactorNotRunning`] if nothing is installed.
    pub fn reactor(&self) -> Result<ReactorHandle> {
        self.active()
            .map(|active| active.reactor)
            .ok_or(Error::ReactorNotRunning)
    }

    /// The installed backend, if any.
    #[must_use]
    pub fn choice(&self) -> Option<ReactorChoice> {
        self.active().map(|active| active.reactor.choice())
    }

    /// Returns true if a reactor is installed.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.shared.active.lock().is_some()
    }

    /// Returns true if the loop was started by someone else.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.active().is_some_and(|active| active.external)
    }

    /// Introspection handle, served as the `loop_context` fixture.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle { ctx: self.clone() }
    }

    /// Handle that can interrupt this context from another thread.
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle { ctx: self.clone() }
    }
}

impl Default for LoopContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LoopContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self.active();
        f.debug_struct("LoopContext")
            .field("reactor", &active.as_ref().map(|a| a.reactor.choice()))
            .field("external", &active.as_ref().is_some_and(|a| a.external))
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Read-only view of the session loop.
#[derive(Clone, Debug)]
pub struct LoopHandle {
    ctx: LoopContext,
}

impl LoopHandle {
    /// The installed backend, if any.
    #[must_use]
    pub fn choice(&self) -> Option<ReactorChoice> {
        self.ctx.choice()
    }

    /// Whether the reactor is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.ctx.active().is_some_and(|active| active.reactor.is_running())
    }

    /// Whether the loop is owned by someone else.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.ctx.is_external()
    }

    /// Whether a loop-driving context exists and has not exited.
    #[must_use]
    pub fn driver_alive(&self) -> bool {
        self.ctx
            .active()
            .and_then(|active| active.driver)
            .is_some_and(|driver| !driver.has_exited())
    }

    /// Whether control was ever handed to the loop-driving context. The
    /// loop does not run before that.
    #[must_use]
    pub fn driver_started(&self) -> bool {
        self.ctx
            .active()
            .and_then(|active| active.driver)
            .is_some_and(|driver| driver.has_started())
    }

    /// Identity of the context executing this call.
    #[must_use]
    pub fn current_context(&self) -> ContextId {
        self.ctx.current_context()
    }
}

/// Interrupts a [`LoopContext`] from any thread.
#[derive(Clone, Debug)]
pub struct InterruptHandle {
    ctx: LoopContext,
}

impl InterruptHandle {
    /// See [`LoopContext::interrupt`].
    pub fn interrupt(&self) {
        self.ctx.interrupt();
    }

    /// Returns true once the context was interrupted.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.ctx.is_interrupted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        let ctx = LoopContext::new();
        ctx.install(ReactorChoice::Default).unwrap();
        let first = ctx.active().and_then(|a| a.driver).unwrap();
        ctx.install(ReactorChoice::Default).unwrap();
        let second = ctx.active().and_then(|a| a.driver).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        ctx.stop();
    }

    #[test]
    fn test_install_conflicting_backend() {
        let ctx = LoopContext::new();
        ctx.adopt(ReactorHandle::new(crate::reactor::DefaultReactor::new()))
            .unwrap();
        let other = ReactorChoice::ALL
            .into_iter()
            .find(|c| *c != ReactorChoice::Default)
            .unwrap();
        assert!(matches!(
            ctx.install(other),
            Err(Error::WrongLoopAlreadyInstalled { requested, installed })
                if requested == other && installed == ReactorChoice::Default
        ));
        ctx.stop();
    }

    #[test]
    fn test_current_context_outside_loop() {
        let ctx = LoopContext::new();
        assert_eq!(ctx.current_context(), ContextId::Caller(thread::current().id()));
        assert!(matches!(ctx.reactor(), Err(Error::ReactorNotRunning)));
        assert!(!ctx.is_installed());
    }

    #[test]
    fn test_stop_without_start_and_reinstall() {
        let ctx = LoopContext::new();
        ctx.install(ReactorChoice::Default).unwrap();
        let handle = ctx.handle();
        assert!(handle.driver_alive());
        assert!(!handle.is_running());

        ctx.stop();
        assert!(!ctx.is_installed());
        assert!(!handle.driver_alive());
        ctx.stop();

        ctx.install(ReactorChoice::Default).unwrap();
        assert!(handle.driver_alive());
        ctx.stop();
    }

    #[test]
    fn test_adopt_running_reactor_is_external() {
        let reactor = ReactorHandle::build(ReactorChoice::Default).unwrap();
        let runner = reactor.clone();
        let thread = std::thread::spawn(move || runner.run());
        while !reactor.is_running() {
            std::thread::yield_now();
        }

        let ctx = LoopContext::new();
        ctx.adopt(reactor.clone()).unwrap();
        assert!(ctx.is_external());
        assert!(!ctx.handle().driver_alive());

        ctx.stop();
        assert!(reactor.is_running());
        reactor.stop();
        thread.join().unwrap();
    }

    #[test]
    fn test_interrupt_handle() {
        let ctx = LoopContext::new();
        let handle = ctx.interrupt_handle();
        assert!(!handle.is_interrupted());
        handle.interrupt();
        assert!(ctx.is_interrupted());
    }
}
