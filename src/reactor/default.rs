//! The in-crate event loop.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::task::{Task, TaskId};
use super::{run_guarded, BoxFuture, Call, Reactor, ReactorChoice};
use crate::error::Failure;

/// A single-threaded event loop.
///
/// Work reaches the loop through three queues: immediate calls, a timer
/// heap, and a ready queue of spawned futures. Each iteration runs
/// everything that is due, then sleeps on a condition variable until the
/// next timer deadline or until another thread submits work.
///
/// Zero-delay calls run in submission order.
///
/// # Example
///
/// ```rust
/// use loopbridge::reactor::{DefaultReactor, Reactor};
/// use std::sync::Arc;
///
/// let reactor = Arc::new(DefaultReactor::new());
/// let stopper = Arc::clone(&reactor);
/// reactor.spawn(Box::pin(async move { stopper.stop() }));
/// reactor.run();
/// assert!(!reactor.is_running());
/// ```
#[derive(Clone)]
pub struct DefaultReactor {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    state: Mutex<LoopState>,
    wakeup: Condvar,
}

#[derive(Default)]
struct LoopState {
    /// Calls to run on the next iteration.
    calls: VecDeque<Call>,
    /// Delayed calls ordered by deadline, then submission.
    timers: BinaryHeap<Reverse<Timer>>,
    next_seq: u64,
    /// Tasks ready to be polled.
    ready: VecDeque<Task>,
    /// Tasks that returned `Poll::Pending` and wait for a wake.
    waiting: HashMap<TaskId, Task>,
    /// Task currently being polled, and whether it was woken meanwhile.
    polling: Option<TaskId>,
    woken_while_polling: bool,
    running: bool,
    stopping: bool,
    finished: bool,
    thread: Option<ThreadId>,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    call: Call,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct Batch {
    calls: Vec<Call>,
    tasks: Vec<Task>,
}

impl DefaultReactor {
    /// Creates a reactor that is not running yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LoopInner {
                state: Mutex::new(LoopState::default()),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Number of spawned tasks that have not completed.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        let state = self.inner.state.lock();
        state.ready.len() + state.waiting.len() + usize::from(state.polling.is_some())
    }

    /// Number of delayed calls still scheduled (including cancelled ones
    /// that have not reached their deadline).
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.inner.state.lock().timers.len()
    }

    /// Takes everything that is due, sleeping until something is.
    ///
    /// Returns `None` once a stop was requested.
    fn next_batch(&self) -> Option<Batch> {
        let mut state = self.inner.state.lock();
        loop {
            if state.stopping {
                return None;
            }

            let now = Instant::now();
            let mut calls: Vec<Call> = state.calls.drain(..).collect();
            while state.timers.peek().is_some_and(|Reverse(t)| t.deadline <= now) {
                if let Some(Reverse(timer)) = state.timers.pop() {
                    calls.push(timer.call);
                }
            }
            let tasks: Vec<Task> = state.ready.drain(..).collect();

            if !calls.is_empty() || !tasks.is_empty() {
                return Some(Batch { calls, tasks });
            }

            match state.timers.peek().map(|Reverse(t)| t.deadline) {
                Some(deadline) => {
                    let _ = self.inner.wakeup.wait_until(&mut state, deadline);
                }
                None => self.inner.wakeup.wait(&mut state),
            }
        }
    }

    fn poll_task(&self, mut task: Task) {
        let id = task.id;
        {
            let mut state = self.inner.state.lock();
            state.polling = Some(id);
            state.woken_while_polling = false;
        }

        let waker = Waker::from(Arc::new(TaskWaker {
            inner: Arc::downgrade(&self.inner),
            id,
        }));
        let mut cx = Context::from_waker(&waker);
        let poll = catch_unwind(AssertUnwindSafe(|| task.poll(&mut cx)));

        let finished = {
            let mut state = self.inner.state.lock();
            state.polling = None;
            match poll {
                Ok(Poll::Pending) => {
                    if state.woken_while_polling {
                        state.ready.push_back(task);
                    } else {
                        state.waiting.insert(id, task);
                    }
                    None
                }
                Ok(Poll::Ready(())) => {
                    tracing::trace!(task = %id, polls = task.poll_count, "task completed");
                    Some(task)
                }
                Err(payload) => {
                    let failure = Failure::from_panic(payload);
                    tracing::error!(task = %id, %failure, "task panicked");
                    Some(task)
                }
            }
        };
        drop(finished);
    }

    /// Clears all queues once the loop has finished.
    ///
    /// Dropping the queued closures drops whatever they captured, so callers
    /// waiting on them observe a closed channel instead of hanging.
    fn finish(&self) {
        let leftovers = {
            let mut state = self.inner.state.lock();
            state.running = false;
            state.finished = true;
            state.thread = None;
            (
                std::mem::take(&mut state.calls),
                std::mem::take(&mut state.timers),
                std::mem::take(&mut state.ready),
                std::mem::take(&mut state.waiting),
            )
        };
        let dropped = leftovers.0.len() + leftovers.1.len() + leftovers.2.len() + leftovers.3.len();
        if dropped > 0 {
            tracing::debug!(dropped, "default reactor dropped unfinished work");
        }
        drop(leftovers);
    }
}

impl Default for DefaultReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DefaultReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("DefaultReactor")
            .field("running", &state.running)
            .field("calls", &state.calls.len())
            .field("timers", &state.timers.len())
            .field("ready", &state.ready.len())
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

impl Reactor for DefaultReactor {
    fn choice(&self) -> ReactorChoice {
        ReactorChoice::Default
    }

    fn run(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.running || state.finished {
                tracing::warn!("default reactor cannot run twice");
                return;
            }
            state.running = true;
            state.thread = Some(thread::current().id());
        }
        tracing::debug!("default reactor running");

        while let Some(batch) = self.next_batch() {
            for call in batch.calls {
                run_guarded(call);
            }
            for task in batch.tasks {
                self.poll_task(task);
            }
        }

        self.finish();
        tracing::debug!("default reactor stopped");
    }

    fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.stopping = true;
        self.inner.wakeup.notify_all();
    }

    fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    fn loop_thread(&self) -> Option<ThreadId> {
        self.inner.state.lock().thread
    }

    fn call_soon(&self, call: Call) {
        let rejected = {
            let mut state = self.inner.state.lock();
            if state.finished {
                Some(call)
            } else {
                state.calls.push_back(call);
                self.inner.wakeup.notify_one();
                None
            }
        };
        if rejected.is_some() {
            tracing::debug!("call submitted to a finished reactor was dropped");
        }
    }

    fn call_later(&self, delay: Duration, call: Call) {
        let rejected = {
            let mut state = self.inner.state.lock();
            if state.finished {
                Some(call)
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.timers.push(Reverse(Timer {
                    deadline: Instant::now() + delay,
                    seq,
                    call,
                }));
                self.inner.wakeup.notify_one();
                None
            }
        };
        if rejected.is_some() {
            tracing::debug!("delayed call submitted to a finished reactor was dropped");
        }
    }

    fn spawn(&self, future: BoxFuture) {
        let task = Task::new(future);
        let rejected = {
            let mut state = self.inner.state.lock();
            if state.finished {
                Some(task)
            } else {
                state.ready.push_back(task);
                self.inner.wakeup.notify_one();
                None
            }
        };
        if let Some(task) = rejected {
            tracing::debug!(task = %task.id, "task spawned on a finished reactor was dropped");
        }
    }
}

/// Waker that moves a task from the waiting set back to the ready queue.
struct TaskWaker {
    inner: Weak<LoopInner>,
    id: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock();
        if let Some(task) = state.waiting.remove(&self.id) {
            state.ready.push_back(task);
            inner.wakeup.notify_one();
        } else if state.polling == Some(self.id) {
            // Woken during its own poll: re-queue once the poll returns.
            state.woken_while_polling = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn spawn_loop(reactor: &DefaultReactor) -> thread::JoinHandle<()> {
        let runner = reactor.clone();
        thread::spawn(move || runner.run())
    }

    #[test]
    fn test_stop_before_run_returns_immediately() {
        let reactor = DefaultReactor::new();
        reactor.stop();
        reactor.run();
        assert!(!reactor.is_running());
    }

    #[test]
    fn test_runs_calls_in_submission_order() {
        let reactor = DefaultReactor::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            reactor.call_later(Duration::ZERO, Box::new(move || order.lock().push(i)));
        }
        let stopper = reactor.clone();
        reactor.call_later(Duration::ZERO, Box::new(move || stopper.stop()));
        reactor.run();

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_timers_fire_by_deadline() {
        let reactor = DefaultReactor::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay, tag) in [(30, "late"), (10, "early"), (20, "middle")] {
            let order = Arc::clone(&order);
            reactor.call_later(Duration::from_millis(delay), Box::new(move || order.lock().push(tag)));
        }
        let stopper = reactor.clone();
        reactor.call_later(Duration::from_millis(40), Box::new(move || stopper.stop()));
        reactor.run();

        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_spawned_task_is_woken_from_another_thread() {
        let reactor = DefaultReactor::new();
        let handle = spawn_loop(&reactor);
        let (tx, rx) = futures::channel::oneshot::channel::<u32>();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        reactor.spawn(Box::pin(async move {
            let value = rx.await.unwrap_or_default();
            done_tx.send(value).unwrap();
        }));

        thread::sleep(Duration::from_millis(10));
        assert_eq!(reactor.active_tasks(), 1);
        tx.send(9).unwrap();

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 9);
        reactor.stop();
        handle.join().unwrap();
        assert_eq!(reactor.active_tasks(), 0);
    }

    #[test]
    fn test_self_waking_task_is_requeued() {
        struct CountingFuture {
            polls: usize,
            complete_after: usize,
            seen: Arc<AtomicUsize>,
        }

        impl std::future::Future for CountingFuture {
            type Output = ();

            fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
                self.polls += 1;
                self.seen.store(self.polls, AtomicOrdering::SeqCst);
                if self.polls >= self.complete_after {
                    Poll::Ready(())
                } else {
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            }
        }

        let reactor = DefaultReactor::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let stopper = reactor.clone();
        let future = CountingFuture {
            polls: 0,
            complete_after: 3,
            seen: Arc::clone(&seen),
        };
        reactor.spawn(Box::pin(async move {
            future.await;
            stopper.stop();
        }));
        reactor.run();

        assert_eq!(seen.load(AtomicOrdering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_call_does_not_kill_the_loop() {
        let reactor = DefaultReactor::new();
        let ran = Arc::new(AtomicUsize::new(0));

        reactor.call_soon(Box::new(|| panic!("callback exploded")));
        let counter = Arc::clone(&ran);
        let stopper = reactor.clone();
        reactor.call_later(
            Duration::from_millis(1),
            Box::new(move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                stopper.stop();
            }),
        );
        reactor.run();

        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_work_after_finish_is_dropped() {
        let reactor = DefaultReactor::new();
        reactor.stop();
        reactor.run();

        let (tx, rx) = futures::channel::oneshot::channel::<()>();
        reactor.call_soon(Box::new(move || {
            let _ = tx.send(());
        }));
        assert!(futures::executor::block_on(rx).is_err());
        assert_eq!(reactor.pending_timers(), 0);
    }

    #[test]
    fn test_run_twice_is_rejected() {
        let reactor = DefaultReactor::new();
        reactor.stop();
        reactor.run();
        reactor.run();
        assert!(!reactor.is_running());
        assert!(reactor.loop_thread().is_none());
    }
}
