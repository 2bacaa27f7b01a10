//! Coroutine adapter.
//!
//! A test body comes in one of three shapes: an `async` routine, a plain
//! function returning a [`PendingResult`], or a plain function that already
//! has its value. [`adapt`] turns each into a single pending result.

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;

use crate::collect::Shape;
use crate::pending::PendingResult;
use crate::runtime::EventLoop;

/// What calling a test body produced.
pub enum Invocation<T> {
    /// A suspension sequence, not yet polled.
    Routine(BoxFuture<'static, T>),
    /// A handle to an operation already in flight.
    Pending(PendingResult<T>),
    /// A value; the body ran to completion.
    Ready(T),
}

impl<T> Invocation<T> {
    /// Wraps an `async` body.
    pub fn routine<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self::Routine(Box::pin(future))
    }

    /// Wraps a returned pending result.
    #[must_use]
    pub fn pending(handle: PendingResult<T>) -> Self {
        Self::Pending(handle)
    }

    /// Wraps a value.
    #[must_use]
    pub fn ready(value: T) -> Self {
        Self::Ready(value)
    }

    /// The shape this invocation has.
    #[must_use]
    pub fn shape(&self) -> Shape {
        match self {
            Self::Routine(_) => Shape::Routine,
            Self::Pending(_) => Shape::Pending,
            Self::Ready(_) => Shape::Plain,
        }
    }
}

impl<T> From<PendingResult<T>> for Invocation<T> {
    fn from(handle: PendingResult<T>) -> Self {
        Self::Pending(handle)
    }
}

impl<T> fmt::Debug for Invocation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Invocation").field(&self.shape()).finish()
    }
}

/// Turns an invocation into a pending result driven by `io_loop`.
///
/// A routine is spawned on the loop, which polls it up to its first
/// suspension right away; its later steps run once the loop is started.
/// Nothing here starts or stops the loop.
pub fn adapt<L, T>(io_loop: &L, invocation: Invocation<T>) -> PendingResult<T>
where
    L: EventLoop,
    T: Send + 'static,
{
    match invocation {
        Invocation::Routine(future) => io_loop.spawn(future),
        Invocation::Pending(handle) => handle,
        Invocation::Ready(value) => PendingResult::ready(value),
    }
}
