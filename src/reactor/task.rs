//! Spawned futures on the default reactor.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use super::BoxFuture;

/// Identifies a future spawned on the [`DefaultReactor`](super::DefaultReactor).
///
/// Ids are process-wide and increase with spawn order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric id, as shown in log fields.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A spawned future and the number of times the loop polled it.
pub(crate) struct Task {
    pub id: TaskId,
    pub poll_count: usize,
    future: BoxFuture,
}

impl Task {
    pub fn new(future: BoxFuture) -> Self {
        Self {
            id: TaskId::next(),
            poll_count: 0,
            future,
        }
    }

    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.poll_count += 1;
        self.future.as_mut().poll(cx)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("poll_count", &self.poll_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_spawn_order() {
        let first = Task::new(Box::pin(async {}));
        let second = Task::new(Box::pin(async {}));
        assert!(first.id < second.id);
        assert_eq!(second.id.to_string(), format!("task-{}", second.id.get()));
    }

    #[test]
    fn test_poll_is_counted() {
        let (tx, rx) = futures::channel::oneshot::channel::<()>();
        let mut task = Task::new(Box::pin(async move {
            let _ = rx.await;
        }));
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert_eq!(task.poll(&mut cx), Poll::Pending);
        tx.send(()).unwrap();
        assert_eq!(task.poll(&mut cx), Poll::Ready(()));
        assert_eq!(task.poll_count, 2);
    }
}
