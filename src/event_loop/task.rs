//! Task types for the event loop.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{CatchUnwind, FutureExt};
use pin_project::pin_project;

use crate::event_loop::RunId;
use crate::pending::Resolver;

/// Unique identifier for a spawned task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Creates a new unique task ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Type-erased boxed future.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Drives a future and hands its outcome, panics included, to a resolver.
#[pin_project]
struct Settle<F: Future> {
    #[pin]
    inner: CatchUnwind<AssertUnwindSafe<F>>,
    resolver: Option<Resolver<F::Output>>,
}

impl<F: Future> Future for Settle<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(outcome) => {
                if let Some(resolver) = this.resolver.take() {
                    resolver.settle(outcome);
                }
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Internal task representation.
pub(crate) struct Task {
    pub id: TaskId,
    /// The run that spawned this task, if any.
    pub run: Option<RunId>,
    /// Set by a waker that fires while the task is out of the task table.
    pub woken: Arc<AtomicBool>,
    pub poll_count: usize,
    future: BoxFuture,
}

impl Task {
    /// Creates a new task whose outcome settles `resolver`.
    pub fn new<F>(future: F, resolver: Resolver<F::Output>, run: Option<RunId>) -> Self
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let settle = Settle {
            inner: AssertUnwindSafe(future).catch_unwind(),
            resolver: Some(resolver),
        };

        Self {
            id: TaskId::new(),
            run,
            woken: Arc::new(AtomicBool::new(false)),
            poll_count: 0,
            future: Box::pin(settle),
        }
    }

    /// Polls the task once.
    ///
    /// Returns `Poll::Ready(())` once the task's outcome has been handed to
    /// its resolver.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.poll_count += 1;
        self.future.as_mut().poll(cx)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("run", &self.run)
            .field("poll_count", &self.poll_count)
            .finish_non_exhaustive()
    }
}
