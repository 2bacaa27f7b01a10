//! Pending result handles.
//!
//! A [`PendingResult`] stands for an operation whose outcome is not known yet.
//! It is settled exactly once through its paired [`Resolver`], either with a
//! value or with a raised panic payload.
//!
//! # Example
//!
//! ```rust
//! use gentest::pending::pending;
//!
//! let (resolver, handle) = pending::<u32>();
//! assert!(!handle.is_settled());
//!
//! resolver.resolve(7);
//! assert!(handle.is_settled());
//! assert_eq!(handle.try_take().map(Result::ok), Some(Some(7)));
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;

use parking_lot::Mutex;

/// A boxed callback run by the event loop or on settlement.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A captured panic payload.
pub type Panic = Box<dyn Any + Send + 'static>;

enum State<T> {
    Pending {
        waker: Option<Waker>,
        callbacks: Vec<Callback>,
    },
    Settled(thread::Result<T>),
    Taken,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

/// Creates a connected resolver/handle pair.
#[must_use]
pub fn pending<T>() -> (Resolver<T>, PendingResult<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending {
            waker: None,
            callbacks: Vec::new(),
        }),
    });
    (
        Resolver {
            shared: Arc::clone(&shared),
        },
        PendingResult { shared },
    )
}

/// The settling side of a [`PendingResult`].
///
/// Dropping a resolver without settling it leaves the handle pending.
pub struct Resolver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Resolver<T> {
    /// Settles the handle with a value.
    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    /// Settles the handle as raised with the given panic payload.
    pub fn raise(self, payload: Panic) {
        self.settle(Err(payload));
    }

    /// Settles the handle with an already captured outcome.
    ///
    /// The awaiting task is woken and settlement callbacks run on the
    /// calling thread, in registration order.
    pub fn settle(self, outcome: thread::Result<T>) {
        let (waker, callbacks) = {
            let mut state = self.shared.state.lock();
            let State::Pending { waker, callbacks } = &mut *state else {
                return;
            };
            let taken = (waker.take(), std::mem::take(callbacks));
            *state = State::Settled(outcome);
            taken
        };

        if let Some(waker) = waker {
            waker.wake();
        }
        for callback in callbacks {
            callback();
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

/// Handle to an operation that will eventually produce a value or raise.
///
/// Awaiting a handle yields the value; awaiting a raised handle resumes the
/// panic at the await point.
pub struct PendingResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> PendingResult<T> {
    /// Creates a handle that is already settled with `value`.
    #[must_use]
    pub fn ready(value: T) -> Self {
        let (resolver, handle) = pending();
        resolver.resolve(value);
        handle
    }

    /// Returns true once the handle has been settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !matches!(&*self.shared.state.lock(), State::Pending { .. })
    }

    /// Registers a callback to run when the handle settles.
    ///
    /// Runs the callback immediately if the handle is already settled.
    pub fn on_settled<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if let State::Pending { callbacks, .. } = &mut *state {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Takes the outcome if the handle has settled.
    ///
    /// Returns `None` while pending, and after the outcome was taken.
    #[must_use]
    pub fn try_take(&self) -> Option<thread::Result<T>> {
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Settled(outcome) => Some(outcome),
            other => {
                *state = other;
                None
            }
        }
    }
}

impl<T> Future for PendingResult<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = {
            let mut state = self.shared.state.lock();
            if let State::Pending { waker, .. } = &mut *state {
                if !waker.as_ref().is_some_and(|w| w.will_wake(cx.waker())) {
                    *waker = Some(cx.waker().clone());
                }
                return Poll::Pending;
            }
            match std::mem::replace(&mut *state, State::Taken) {
                State::Settled(outcome) => outcome,
                _ => panic!("PendingResult polled after its outcome was taken"),
            }
        };

        match outcome {
            Ok(value) => Poll::Ready(value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl<T> fmt::Debug for PendingResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResult")
            .field("is_settled", &self.is_settled())
            .finish_non_exhaustive()
    }
}
