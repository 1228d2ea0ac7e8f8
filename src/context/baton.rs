//! The loop-driving context.
//!
//! The reactor runs on a dedicated thread that only advances while it holds
//! the baton. A caller hands the baton over when it blocks on the loop, and
//! the loop hands it back from inside the completion callback of the work
//! the caller is waiting for. Every transfer is explicit. When control
//! returns to a caller some other way (a result delivered from a third
//! thread, an interrupt) the loop parks at its next batch.

use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use super::interrupt::Interrupt;
use crate::error::{Error, Result};
use crate::reactor::ReactorHandle;

/// Value carried by a transfer back to the caller.
pub(crate) type Handoff = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Holder {
    Loop,
    Caller(ThreadId),
}

struct BatonState {
    holder: Holder,
    /// Value handed to the caller by the last transfer.
    handoff: Option<Handoff>,
    /// Caller currently blocked waiting for the baton.
    waiter: Option<ThreadId>,
    /// Handoff produced before its caller started waiting.
    early: Option<(ThreadId, Handoff)>,
    started: bool,
    exited: bool,
    abandon: bool,
}

struct BatonCore {
    state: Mutex<BatonState>,
    turn: Condvar,
    interrupt: Arc<Interrupt>,
}

impl BatonCore {
    /// Body of the loop-driving thread.
    fn drive(&self, reactor: &ReactorHandle) {
        {
            let mut state = self.state.lock();
            while state.holder != Holder::Loop && !state.abandon {
                self.turn.wait(&mut state);
            }
            if state.abandon {
                state.exited = true;
                self.turn.notify_all();
                tracing::debug!("loop-driving context abandoned before start");
                return;
            }
            state.started = true;
        }

        tracing::debug!(reactor = %reactor.choice(), "loop-driving context started");
        reactor.run();

        let mut state = self.state.lock();
        state.exited = true;
        state.handoff = None;
        state.early = None;
        if let Some(waiter) = state.waiter {
            state.holder = Holder::Caller(waiter);
        }
        self.turn.notify_all();
        tracing::debug!("loop-driving context exited");
    }

    /// Parks the loop thread until control is transferred back to it.
    fn wait_for_turn(&self) {
        let mut state = self.state.lock();
        if state.holder != Holder::Loop {
            tracing::trace!("loop parked until the next switch");
        }
        while state.holder != Holder::Loop && !state.abandon {
            self.turn.wait(&mut state);
        }
    }
}

/// Handle to the loop-driving thread.
pub(crate) struct Baton {
    core: Arc<BatonCore>,
    reactor: ReactorHandle,
    loop_thread: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Baton {
    /// Creates the loop-driving context for `reactor`.
    ///
    /// The thread is parked until control is first transferred to it.
    pub fn spawn(reactor: ReactorHandle, interrupt: Arc<Interrupt>) -> Result<Self> {
        let core = Arc::new(BatonCore {
            state: Mutex::new(BatonState {
                holder: Holder::Caller(thread::current().id()),
                handoff: None,
                waiter: None,
                early: None,
                started: false,
                exited: false,
                abandon: false,
            }),
            turn: Condvar::new(),
            interrupt,
        });

        let driver = Arc::clone(&core);
        let runner = reactor.clone();
        let join = thread::Builder::new()
            .name("loopbridge-reactor".into())
            .spawn(move || driver.drive(&runner))
            .map_err(|source| Error::Backend {
                backend: reactor.choice(),
                source,
            })?;

        Ok(Self {
            core,
            loop_thread: join.thread().id(),
            reactor,
            join: Mutex::new(Some(join)),
        })
    }

    /// The thread the loop runs on.
    pub fn loop_thread(&self) -> ThreadId {
        self.loop_thread
    }

    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.loop_thread
    }

    pub fn has_exited(&self) -> bool {
        self.core.state.lock().exited
    }

    pub fn has_started(&self) -> bool {
        self.core.state.lock().started
    }

    /// Transfers control to the loop and blocks the calling thread until
    /// the loop hands control back.
    ///
    /// Returns the value the loop handed back, or `None` if the loop exited
    /// while the caller was waiting.
    ///
    /// # Errors
    ///
    /// [`Error::ReactorStopped`] if the loop already exited,
    /// [`Error::Interrupted`] if the session interrupt fired (unless
    /// `ignore_interrupt` is set).
    pub fn switch_to_loop(&self, ignore_interrupt: bool) -> Result<Option<Handoff>> {
        let me = thread::current().id();
        let interrupted = || !ignore_interrupt && self.core.interrupt.is_triggered();

        let mut state = self.core.state.lock();
        if state.exited {
            return Err(Error::ReactorStopped);
        }
        if let Some((caller, handoff)) = state.early.take() {
            if caller == me {
                tracing::trace!("result was ready before the switch");
                return Ok(Some(handoff));
            }
            state.early = Some((caller, handoff));
        }
        if interrupted() {
            return Err(Error::Interrupted);
        }

        tracing::trace!(?me, "switching to the loop");
        state.holder = Holder::Loop;
        state.waiter = Some(me);
        state.handoff = None;
        self.core.turn.notify_all();

        loop {
            if state.holder == Holder::Caller(me) {
                state.waiter = None;
                return Ok(state.handoff.take());
            }
            if state.exited {
                state.waiter = None;
                return Ok(None);
            }
            if interrupted() {
                state.waiter = None;
                state.holder = Holder::Caller(me);
                drop(state);
                self.park_loop();
                return Err(Error::Interrupted);
            }
            self.core.turn.wait(&mut state);
        }
    }

    /// Queues a call that parks the loop on its next batch. Used when
    /// control returns to a caller without the loop thread being the one
    /// that handed it back.
    fn park_loop(&self) {
        let core = Arc::clone(&self.core);
        self.reactor.call_soon(move || core.wait_for_turn());
    }

    /// Hands control back to `caller` together with `handoff`.
    ///
    /// On the loop thread this parks the loop until control is transferred
    /// back to it. From any other thread the loop parks on its next batch
    /// instead, so it may finish the batch it is running while the caller
    /// resumes. If `caller` is not waiting yet, the handoff is kept for its
    /// next [`switch_to_loop`](Self::switch_to_loop) and the loop keeps
    /// running. Returns true if control was transferred.
    pub fn switch_to_caller(&self, caller: ThreadId, handoff: Handoff) -> bool {
        let mut state = self.core.state.lock();
        if state.waiter != Some(caller) {
            state.early = Some((caller, handoff));
            return false;
        }

        tracing::trace!(?caller, "switching to the caller");
        state.holder = Holder::Caller(caller);
        state.handoff = Some(handoff);
        state.waiter = None;
        self.core.turn.notify_all();

        if self.is_loop_thread() {
            while state.holder != Holder::Loop && !state.abandon {
                self.core.turn.wait(&mut state);
            }
        } else {
            drop(state);
            self.park_loop();
        }
        true
    }

    /// Forgets a handoff addressed to `caller` that it no longer waits for.
    pub fn discard_early(&self, caller: ThreadId) {
        let mut state = self.core.state.lock();
        if matches!(&state.early, Some((thread, _)) if *thread == caller) {
            state.early = None;
        }
    }

    /// Wakes blocked callers so they re-check the interrupt flag.
    pub fn notify(&self) {
        let _state = self.core.state.lock();
        self.core.turn.notify_all();
    }

    /// Stops the loop and waits for the driving thread to exit.
    ///
    /// A no-op if the thread already exited. Called from the loop thread
    /// itself, it only requests the stop.
    pub fn stop(&self) {
        if self.is_loop_thread() {
            self.reactor.stop();
            return;
        }

        let started = {
            let mut state = self.core.state.lock();
            if !state.started && !state.exited {
                state.abandon = true;
                self.core.turn.notify_all();
            }
            state.started && !state.exited
        };

        if started {
            self.reactor.stop();
            // The loop only unwinds while it holds the baton.
            while !self.has_exited() {
                if self.switch_to_loop(true).is_err() {
                    break;
                }
            }
        }

        if let Some(join) = self.join.lock().take() {
            if join.join().is_err() {
                tracing::error!("loop-driving thread panicked");
            }
        }
    }
}

impl Drop for Baton {
    fn drop(&mut self) {
        if !self.is_loop_thread() && self.join.get_mut().is_some() {
            self.stop();
        }
    }
}

impl std::fmt::Debug for Baton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("Baton")
            .field("loop_thread", &self.loop_thread)
            .field("holder", &state.holder)
            .field("started", &state.started)
            .field("exited", &state.exited)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ReactorChoice;
    use std::time::Duration;

    fn baton() -> Baton {
        let reactor = ReactorHandle::build(ReactorChoice::Default).unwrap();
        Baton::spawn(reactor, Arc::new(Interrupt::new())).unwrap()
    }

    /// Re-arms itself every millisecond, counting loop iterations.
    fn tick(reactor: ReactorHandle, ticks: Arc<Mutex<u32>>) {
        *ticks.lock() += 1;
        let next = reactor.clone();
        reactor.call_later(Duration::from_millis(1), move || tick(next, ticks));
    }

    #[test]
    fn test_loop_waits_for_first_switch() {
        let baton = baton();
        std::thread::sleep(Duration::from_millis(10));
        assert!(!baton.has_started());
        assert!(!baton.reactor.is_running());
        baton.stop();
        assert!(baton.has_exited());
    }

    #[test]
    fn test_round_trip_hands_value_back() {
        let baton = Arc::new(baton());
        let me = thread::current().id();
        let payload: Handoff = Arc::new(5_u8);
        let expected = Arc::clone(&payload);

        let back = Arc::clone(&baton);
        baton.reactor.call_soon(move || {
            assert!(back.is_loop_thread());
            assert!(back.switch_to_caller(me, payload));
        });

        let handoff = baton.switch_to_loop(false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&handoff, &expected));
        assert_eq!(handoff.downcast_ref::<u8>(), Some(&5));

        baton.stop();
        assert!(baton.has_exited());
        assert!(matches!(baton.switch_to_loop(false), Err(Error::ReactorStopped)));
    }

    #[test]
    fn test_early_handoff_is_picked_up() {
        let baton = baton();
        let me = thread::current().id();
        assert!(!baton.switch_to_caller(me, Arc::new(())));
        assert!(baton.switch_to_loop(false).unwrap().is_some());
        assert!(!baton.has_started());
        baton.stop();
    }

    #[test]
    fn test_handoff_from_another_thread_parks_loop() {
        let baton = Arc::new(baton());
        let me = thread::current().id();
        let ticks = Arc::new(Mutex::new(0_u32));

        let ticker = Arc::clone(&ticks);
        let reactor = baton.reactor.clone();
        baton.reactor.call_soon(move || tick(reactor, ticker));

        let sender = Arc::clone(&baton);
        let helper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            assert!(sender.switch_to_caller(me, Arc::new(1_u8)));
        });
        assert!(baton.switch_to_loop(false).unwrap().is_some());
        helper.join().unwrap();

        std::thread::sleep(Duration::from_millis(10));
        let parked = *ticks.lock();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(*ticks.lock(), parked);

        baton.stop();
        assert!(baton.has_exited());
    }

    #[test]
    fn test_interrupt_unblocks_waiting_caller() {
        let interrupt = Arc::new(Interrupt::new());
        let reactor = ReactorHandle::build(ReactorChoice::Default).unwrap();
        let baton = Arc::new(Baton::spawn(reactor, Arc::clone(&interrupt)).unwrap());

        let notifier = Arc::clone(&baton);
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            interrupt.trigger();
            notifier.notify();
        });

        assert!(matches!(baton.switch_to_loop(false), Err(Error::Interrupted)));
        trigger.join().unwrap();
        baton.stop();
        assert!(baton.has_exited());
    }
}
