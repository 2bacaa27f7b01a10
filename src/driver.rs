//! The run-to-completion driver.
//!
//! [`run`] claims a loop, adapts the test body into a pending result, arms a
//! [`TimeoutGuard`] around it and runs the loop until one side of the race
//! stops it. Exactly one [`RunOutcome`] comes back. Whatever the outcome, the
//! loop is idle afterwards and nothing the run scheduled is left behind.
//!
//! # Example
//!
//! ```rust
//! use gentest::adapter::Invocation;
//! use gentest::driver::{run, RunConfig, RunOutcome};
//! use gentest::{Deadline, IoLoop};
//! use std::time::Duration;
//!
//! let io_loop = IoLoop::new();
//! let config = RunConfig::new(io_loop.clone(), Deadline::after(Duration::from_millis(50)));
//!
//! let outcome = run(&config, || {
//!     let nap = io_loop.sleep(Duration::from_secs(1));
//!     Invocation::routine(async move { nap.await })
//! })
//! .unwrap();
//!
//! assert!(outcome.is_timed_out());
//! assert!(!io_loop.is_running());
//! ```

use std::fmt;
use std::panic;
use std::time::Duration;

use tracing::debug;

use crate::adapter::{adapt, Invocation};
use crate::config::Deadline;
use crate::error::{Error, LoopMisuse, Result};
use crate::event_loop::RunId;
use crate::pending::Panic;
use crate::runtime::EventLoop;
use crate::timeout::TimeoutGuard;

/// Settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig<L> {
    /// The loop to drive. Borrowed for the duration of the run.
    pub io_loop: L,
    /// When to give up.
    pub deadline: Deadline,
}

impl<L> RunConfig<L> {
    /// Creates a run configuration.
    pub fn new(io_loop: L, deadline: Deadline) -> Self {
        Self { io_loop, deadline }
    }
}

/// How a run ended.
pub enum RunOutcome<T> {
    /// The body finished with a value.
    Completed(T),
    /// The body panicked; this is the original payload.
    Raised(Panic),
    /// The deadline fired first.
    TimedOut(Duration),
}

impl<T> RunOutcome<T> {
    /// Returns true for [`RunOutcome::Completed`].
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Returns true for [`RunOutcome::Raised`].
    #[must_use]
    pub fn is_raised(&self) -> bool {
        matches!(self, Self::Raised(_))
    }

    /// Returns true for [`RunOutcome::TimedOut`].
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// The value, or the deadline error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeadlineExceeded`] for a timed-out run.
    ///
    /// # Panics
    ///
    /// Resumes the original panic of a raised run.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Raised(payload) => panic::resume_unwind(payload),
            Self::TimedOut(timeout) => Err(Error::DeadlineExceeded { timeout }),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Raised(_) => "raised",
            Self::TimedOut(_) => "timed out",
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RunOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(value) => f.debug_tuple("Completed").field(value).finish(),
            Self::Raised(payload) => f
                .debug_tuple("Raised")
                .field(&panic_message(payload).unwrap_or("<non-string payload>"))
                .finish(),
            Self::TimedOut(timeout) => f.debug_tuple("TimedOut").field(timeout).finish(),
        }
    }
}

/// The message of a panic payload, if it is a string.
#[must_use]
pub fn panic_message(payload: &Panic) -> Option<&str> {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

/// Owns the loop for one run. Ends the run on drop, unwinding included.
struct RunScope<'a, L: EventLoop> {
    io_loop: &'a L,
    run: RunId,
}

impl<'a, L: EventLoop> RunScope<'a, L> {
    fn enter(io_loop: &'a L) -> Result<Self> {
        let run = io_loop.begin_run()?;
        Ok(Self { io_loop, run })
    }
}

impl<L: EventLoop> Drop for RunScope<'_, L> {
    fn drop(&mut self) {
        self.io_loop.end_run(self.run);
    }
}

/// Drives the test body to one outcome.
///
/// `body` is called once the loop has been claimed. A panic while calling it
/// propagates as is; a panic while the loop drives it becomes
/// [`RunOutcome::Raised`]. A body that is already complete never starts the
/// loop.
///
/// # Errors
///
/// Returns [`Error::LoopMisuse`] if the loop is already running or closed, or
/// is stopped by someone else before the body settles.
pub fn run<L, T, F>(config: &RunConfig<L>, body: F) -> Result<RunOutcome<T>>
where
    L: EventLoop,
    T: Send + 'static,
    F: FnOnce() -> Invocation<T>,
{
    let io_loop = &config.io_loop;
    let scope = RunScope::enter(io_loop)?;
    debug!(run = %scope.run, deadline = %config.deadline, "run started");

    let pending = adapt(io_loop, body());

    let outcome = match pending.try_take() {
        Some(outcome) => outcome.map_or_else(RunOutcome::Raised, RunOutcome::Completed),
        None => {
            let guard = TimeoutGuard::arm(io_loop, &pending, config.deadline);
            io_loop.start()?;
            let expired = guard.expired();
            guard.disarm();

            // A result that settled alongside the deadline still counts.
            match (pending.try_take(), expired) {
                (Some(outcome), _) => {
                    outcome.map_or_else(RunOutcome::Raised, RunOutcome::Completed)
                }
                (None, Some(timeout)) => RunOutcome::TimedOut(timeout),
                (None, None) => return Err(LoopMisuse::StoppedEarly.into()),
            }
        }
    };

    debug!(run = %scope.run, outcome = outcome.kind(), "run finished");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::pending;
    use crate::IoLoop;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn config(io_loop: &IoLoop, millis: u64) -> RunConfig<IoLoop> {
        RunConfig::new(io_loop.clone(), Deadline::after(Duration::from_millis(millis)))
    }

    #[test]
    fn test_ready_body_never_starts_loop() {
        let io_loop = IoLoop::new();
        let started = Arc::new(AtomicBool::new(false));
        let started2 = Arc::clone(&started);
        io_loop.call_later(Duration::ZERO, move || started2.store(true, Ordering::SeqCst));

        let outcome = run(&config(&io_loop, 100), || Invocation::ready(true)).unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(true)));
        assert!(!started.load(Ordering::SeqCst));
        assert_eq!(io_loop.pending_timers(), 1);
    }

    #[test]
    fn test_completed_value() {
        let io_loop = IoLoop::new();
        let inner = io_loop.clone();
        let outcome = run(&config(&io_loop, 1000), || {
            Invocation::routine(async move {
                inner.sleep(Duration::from_millis(5)).await;
                "value"
            })
        })
        .unwrap();
        assert_eq!(outcome.into_result().unwrap(), "value");
    }

    #[test]
    fn test_raised_keeps_payload() {
        let io_loop = IoLoop::new();
        let inner = io_loop.clone();
        let outcome = run(&config(&io_loop, 1000), || {
            Invocation::<()>::routine(async move {
                inner.next_tick().await;
                panic!("assertion inside body");
            })
        })
        .unwrap();

        match outcome {
            RunOutcome::Raised(payload) => {
                assert_eq!(panic_message(&payload), Some("assertion inside body"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!io_loop.is_running());
    }

    #[test]
    fn test_timed_out_leaves_loop_clean() {
        let io_loop = IoLoop::new();
        let inner = io_loop.clone();
        let outcome = run(&config(&io_loop, 20), || {
            Invocation::routine(async move {
                inner.sleep(Duration::from_secs(1)).await;
            })
        })
        .unwrap();

        assert!(matches!(outcome, RunOutcome::TimedOut(t) if t == Duration::from_millis(20)));
        assert!(!io_loop.is_running());
        assert_eq!(io_loop.pending_timers(), 0);
        assert_eq!(io_loop.task_count(), 0);
    }

    #[test]
    fn test_stopped_by_body_is_misuse() {
        let io_loop = IoLoop::new();
        let inner = io_loop.clone();
        let (_resolver, never) = pending::<()>();
        let err = run(&config(&io_loop, 1000), || {
            inner.add_callback({
                let stopper = inner.clone();
                move || stopper.stop().unwrap()
            });
            Invocation::pending(never)
        })
        .unwrap_err();

        assert_eq!(err, Error::from(LoopMisuse::StoppedEarly));
        assert!(!io_loop.is_running());
    }

    #[test]
    fn test_panic_while_invoking_propagates() {
        let io_loop = IoLoop::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run::<_, (), _>(&config(&io_loop, 100), || panic!("before any suspension"))
        }));
        assert!(result.is_err());
        // The run was released.
        assert!(run(&config(&io_loop, 100), || Invocation::ready(())).is_ok());
    }

    #[test]
    fn test_nested_run_is_misuse() {
        let io_loop = IoLoop::new();
        let inner = io_loop.clone();
        let outcome = run(&config(&io_loop, 1000), || {
            Invocation::routine(async move {
                inner.next_tick().await;
                run(&RunConfig::new(inner.clone(), Deadline::Never), || {
                    Invocation::ready(())
                })
                .map(|_| ())
            })
        })
        .unwrap();

        let nested = outcome.into_result().unwrap();
        assert_eq!(nested.unwrap_err(), Error::from(LoopMisuse::AlreadyRunning));
    }
}
