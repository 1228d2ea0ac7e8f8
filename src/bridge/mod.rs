//! The blocking bridge.
//!
//! [`LoopContext::block_on`] runs a pending value to completion and returns
//! its outcome synchronously to whichever thread called in.
//!
//! Two paths deliver the result:
//!
//! - **Cooperative**: the caller hands control to the loop-driving context
//!   and sleeps; the completion callback records the result and hands
//!   control straight back. Only one caller drives at a time. A caller that
//!   finds the path taken parks until either its result was recorded while
//!   the other caller drove, or the path is free and it drives itself.
//! - **Cross-thread**: the pending value is submitted with the reactor's
//!   thread-safe call-and-wait primitive. Used when the loop is external.
//!
//! Both paths return the delivered value or the delivered failure exactly
//! once. Nothing is promised about the relative ordering of the two.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, MutexGuard};

use crate::context::{Active, Baton, Handoff, LoopContext, Shared};
use crate::deferred::{Deferred, DeferredResult};
use crate::error::{Error, Result};

/// One in-flight hand-off.
///
/// The result slot is written exactly once, by the completion callback, and
/// read by the caller that created it.
pub(crate) struct PendingCall<T> {
    slot: Mutex<Slot<T>>,
    caller: ThreadId,
}

struct Slot<T> {
    result: Option<DeferredResult<T>>,
    /// The caller is blocked in the baton and must be switched back to.
    driving: bool,
}

impl<T: Send + 'static> PendingCall<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot {
                result: None,
                driving: false,
            }),
            caller: thread::current().id(),
        })
    }

    /// Records the result; returns true if the caller is driving the loop.
    fn deliver(&self, result: DeferredResult<T>) -> bool {
        let mut slot = self.slot.lock();
        slot.result = Some(result);
        slot.driving
    }

    fn take(&self) -> Option<DeferredResult<T>> {
        self.slot.lock().result.take()
    }

    /// Takes the result if it already arrived, otherwise marks the caller
    /// as driving.
    fn start_driving(&self) -> Option<DeferredResult<T>> {
        let mut slot = self.slot.lock();
        let result = slot.result.take();
        slot.driving = result.is_none();
        result
    }

    fn is(&self, handoff: &Handoff) -> bool {
        std::ptr::eq(
            Arc::as_ptr(handoff).cast::<()>(),
            (self as *const Self).cast::<()>(),
        )
    }
}

/// The cooperative path, held for one `block_on`. Releasing it wakes the
/// callers parked behind it.
struct Entry<'a> {
    guard: Option<MutexGuard<'a, ()>>,
    shared: &'a Shared,
}

impl Drop for Entry<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.shared.wake_waiters();
    }
}

impl LoopContext {
    /// Blocks the calling thread until `pending` fires and returns its
    /// outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::BlockedFromLoop`] when called from the loop-driving
    ///   context, which would never be resumed.
    /// - [`Error::ReactorNotRunning`] when no reactor is installed, or the
    ///   external reactor is not running.
    /// - [`Error::ReactorStopped`] when the loop-driving context has exited.
    /// - [`Error::Interrupted`] when the session was interrupted; `pending`
    ///   is cancelled.
    /// - [`Error::Failed`] carrying the pending value's own failure.
    ///
    /// # Panics
    ///
    /// If the loop hands control back with a value that is not this call's
    /// result. That means two callers were resumed out of order and the
    /// bridge state can no longer be trusted.
    ///
    /// # Example
    ///
    /// ```rust
    /// use loopbridge::context::LoopContext;
    /// use loopbridge::deferred::run_on_loop;
    /// use loopbridge::reactor::ReactorChoice;
    /// use loopbridge::Failure;
    ///
    /// let ctx = LoopContext::new();
    /// ctx.install(ReactorChoice::Default).unwrap();
    /// let reactor = ctx.reactor().unwrap();
    ///
    /// let answer = ctx.block_on(run_on_loop(&reactor, || Ok::<_, Failure>(42))).unwrap();
    /// assert_eq!(answer, 42);
    /// ctx.stop();
    /// ```
    pub fn block_on<T>(&self, pending: Deferred<T>) -> Result<T>
    where
        T: Send + 'static,
    {
        let Some(active) = self.active() else {
            return Err(Error::ReactorNotRunning);
        };
        if self.is_loop_context() {
            return Err(Error::BlockedFromLoop);
        }

        match &active.driver {
            None => self.block_across_threads(&active, pending),
            Some(driver) => {
                if driver.has_exited() {
                    return Err(Error::ReactorStopped);
                }
                self.block_cooperatively(driver, pending)
            }
        }
    }

    fn block_across_threads<T>(&self, active: &Active, pending: Deferred<T>) -> Result<T>
    where
        T: Send + 'static,
    {
        if !active.reactor.is_running() {
            return Err(if active.external {
                Error::ReactorNotRunning
            } else {
                Error::ReactorStopped
            });
        }

        tracing::trace!(reactor = %active.reactor.choice(), "blocking across threads");
        let cancel = pending.clone();
        let result = active
            .reactor
            .blocking_call_until(move || pending, Some(&self.shared.interrupt));
        if matches!(result, Err(Error::Interrupted)) {
            cancel.cancel();
        }
        result
    }

    fn block_cooperatively<T>(&self, driver: &Arc<Baton>, pending: Deferred<T>) -> Result<T>
    where
        T: Send + 'static,
    {
        let call = PendingCall::new();
        let caller = call.caller;

        let delivered = Arc::clone(&call);
        let baton = Arc::clone(driver);
        let shared = Arc::downgrade(&self.shared);
        pending.subscribe(move |result| {
            let driving = delivered.deliver(result);
            if driving && thread::current().id() != delivered.caller {
                let handoff: Handoff = delivered;
                baton.switch_to_caller(caller, handoff);
            } else if let Some(shared) = shared.upgrade() {
                shared.wake_waiters();
            }
        });

        let _entry = {
            let mut lobby = self.shared.lobby.lock();
            loop {
                if let Some(outcome) = call.take() {
                    return outcome.map_err(Error::Failed);
                }
                if self.shared.interrupt.is_triggered() {
                    drop(lobby);
                    pending.cancel();
                    return Err(Error::Interrupted);
                }
                if driver.has_exited() {
                    return Err(Error::ReactorStopped);
                }
                if let Some(guard) = self.shared.entry.try_lock() {
                    break Entry {
                        guard: Some(guard),
                        shared: &self.shared,
                    };
                }
                tracing::trace!("cooperative path busy, waiting for the current caller");
                self.shared.released.wait(&mut lobby);
            }
        };

        let outcome = match call.start_driving() {
            Some(outcome) => outcome,
            None => match driver.switch_to_loop(false) {
                Ok(Some(handoff)) => {
                    assert!(call.is(&handoff), "illegal switch in block_on");
                    call.take().ok_or(Error::ReactorStopped)?
                }
                Ok(None) => return Err(Error::ReactorStopped),
                Err(Error::Interrupted) => {
                    tracing::debug!("block_on interrupted, cancelling pending work");
                    driver.discard_early(caller);
                    pending.cancel();
                    return Err(Error::Interrupted);
                }
                Err(e) => return Err(e),
            },
        };

        outcome.map_err(Error::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::run_on_loop;
    use crate::error::Failure;
    use crate::reactor::ReactorChoice;
    use std::time::Duration;

    fn installed() -> LoopContext {
        let ctx = LoopContext::new();
        ctx.install(ReactorChoice::Default).unwrap();
        ctx
    }

    #[test]
    fn test_block_on_already_fired() {
        let ctx = installed();
        assert_eq!(ctx.block_on(Deferred::succeed(5)).unwrap(), 5);
        assert!(!ctx.handle().is_running());
        ctx.stop();
    }

    #[test]
    fn test_block_on_delivers_failure() {
        let ctx = installed();
        let reactor = ctx.reactor().unwrap();
        let error = ctx
            .block_on(reactor.defer_later(Duration::from_millis(5), || Err::<(), _>(Failure::msg("late failure"))))
            .unwrap_err();
        assert_eq!(error.to_string(), "late failure");
        ctx.stop();
    }

    #[test]
    fn test_block_on_repeatedly() {
        let ctx = installed();
        let reactor = ctx.reactor().unwrap();
        for i in 0..20 {
            let value = ctx.block_on(run_on_loop(&reactor, move || Ok::<_, Failure>(i))).unwrap();
            assert_eq!(value, i);
        }
        ctx.stop();
    }

    #[test]
    fn test_block_on_from_loop_is_rejected() {
        let ctx = installed();
        let reactor = ctx.reactor().unwrap();
        let inner = ctx.clone();
        let nested = ctx
            .block_on(run_on_loop(&reactor, move || {
                let result = inner.block_on(Deferred::succeed(1));
                Ok::<_, Failure>(matches!(result, Err(Error::BlockedFromLoop)))
            }))
            .unwrap();
        assert!(nested);
        ctx.stop();
    }

    #[test]
    fn test_block_on_consumed_deferred_fails() {
        let ctx = installed();
        let d = Deferred::succeed(7);
        let forwarded = Deferred::new();
        d.chain_deferred(&forwarded);
        assert_eq!(ctx.block_on(forwarded).unwrap(), 7);

        let error = ctx.block_on(d).unwrap_err();
        assert!(matches!(
            error.into_failure().downcast_ref::<Error>(),
            Some(Error::ResultConsumed)
        ));
        ctx.stop();
    }

    #[test]
    fn test_block_on_without_reactor() {
        let ctx = LoopContext::new();
        assert!(matches!(ctx.block_on(Deferred::succeed(())), Err(Error::ReactorNotRunning)));
    }

    #[test]
    fn test_block_on_after_stop() {
        let ctx = installed();
        let active = ctx.active().unwrap();
        let driver = active.driver.clone().unwrap();
        let reactor = ctx.reactor().unwrap();
        ctx.block_on(run_on_loop(&reactor, || Ok::<_, Failure>(()))).unwrap();

        driver.stop();
        assert!(matches!(
            ctx.block_on(run_on_loop(&reactor, || Ok::<_, Failure>(()))),
            Err(Error::ReactorStopped)
        ));
        ctx.stop();
    }

    #[test]
    fn test_second_caller_waits_while_path_is_busy() {
        let ctx = installed();
        let reactor = ctx.reactor().unwrap();

        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let gate: Deferred<&'static str> = Deferred::new();
        let opener = gate.clone();

        let other = ctx.clone();
        let other_reactor = reactor.clone();
        let helper = std::thread::spawn(move || {
            release_rx.recv().unwrap();
            let value = other
                .block_on(run_on_loop(&other_reactor, || Ok::<_, Failure>(7)))
                .unwrap();
            opener.callback("opened").unwrap();
            value
        });

        reactor.call_soon(move || release_tx.send(()).unwrap());
        assert_eq!(ctx.block_on(gate).unwrap(), "opened");
        assert_eq!(helper.join().unwrap(), 7);
        ctx.stop();
    }

    #[test]
    fn test_interrupt_unwinds_and_cancels() {
        let ctx = installed();
        let reactor = ctx.reactor().unwrap();
        let never: Deferred<()> = Deferred::new();
        let observed = never.clone();

        let handle = ctx.interrupt_handle();
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.interrupt();
        });

        assert!(matches!(ctx.block_on(never), Err(Error::Interrupted)));
        trigger.join().unwrap();
        assert!(observed.is_fired());
        assert!(matches!(
            ctx.block_on(run_on_loop(&reactor, || Ok::<_, Failure>(()))),
            Err(Error::Interrupted)
        ));
        ctx.stop();
    }

    #[test]
    fn test_external_reactor_uses_cross_thread_path() {
        let reactor = crate::reactor::ReactorHandle::build(ReactorChoice::Default).unwrap();
        let runner = reactor.clone();
        let thread = std::thread::spawn(move || runner.run());
        while !reactor.is_running() {
            std::thread::yield_now();
        }

        let ctx = LoopContext::new();
        ctx.adopt(reactor.clone()).unwrap();
        let value = ctx
            .block_on(run_on_loop(&reactor, || Ok::<_, Failure>("external")))
            .unwrap();
        assert_eq!(value, "external");

        reactor.stop();
        thread.join().unwrap();
        assert!(matches!(ctx.block_on(Deferred::succeed(())), Err(Error::ReactorNotRunning)));
    }
}
