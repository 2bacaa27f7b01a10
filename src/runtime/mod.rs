//! Event loop abstraction used by the driver.
//!
//! The driver, the timeout guard and the coroutine adapter only need a small
//! set of loop operations. This module names them in the [`EventLoop`] trait
//! so the driving logic is not tied to [`IoLoop`](crate::IoLoop).
//!
//! # Core Operations
//!
//! - `start` / `stop` - run the loop on this thread until asked to stop
//! - `call_later` / `remove_timeout` - schedule and cancel deadline callbacks
//! - `spawn` - turn a future into a pending result the loop drives
//! - `begin_run` / `end_run` - claim the loop for one driver run
//!
//! # Example
//!
//! ```rust
//! use gentest::runtime::EventLoop;
//! use gentest::{Deadline, IoLoop};
//! use std::time::Duration;
//!
//! fn answer<L: EventLoop>(io_loop: &L) -> u32 {
//!     io_loop
//!         .run_sync(Deadline::after(Duration::from_secs(1)), async { 42 })
//!         .unwrap()
//! }
//!
//! assert_eq!(answer(&IoLoop::new()), 42);
//! ```

use std::future::Future;
use std::time::Duration;

use crate::adapter::Invocation;
use crate::config::Deadline;
use crate::driver::{self, RunConfig};
use crate::error::Result;
use crate::event_loop::{RunId, TimeoutHandle};
use crate::pending::PendingResult;

/// The loop operations the driver depends on.
///
/// Handles are shared: cloning one yields another handle to the same loop.
pub trait EventLoop: Clone + Send + Sync + 'static {
    /// Runs the loop on the calling thread until [`stop`](Self::stop) is called.
    ///
    /// # Errors
    ///
    /// Fails if the loop is already running or closed.
    fn start(&self) -> Result<()>;

    /// Asks the running loop to return from `start`.
    ///
    /// # Errors
    ///
    /// Fails if the loop is not running or a stop is already pending.
    fn stop(&self) -> Result<()>;

    /// Returns true while `start` is executing.
    fn is_running(&self) -> bool;

    /// Returns true once the loop has been closed.
    fn is_closed(&self) -> bool;

    /// Monotonic time since the loop was created.
    fn time(&self) -> Duration;

    /// Runs `callback` on the next tick.
    fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static;

    /// Runs `callback` once `delay` has elapsed.
    fn call_later<F>(&self, delay: Duration, callback: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static;

    /// Cancels a scheduled callback. Returns `false` if it already ran.
    fn remove_timeout(&self, handle: TimeoutHandle) -> bool;

    /// Spawns `future` as a loop task.
    fn spawn<F>(&self, future: F) -> PendingResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;

    /// Claims the loop for one driver run.
    ///
    /// # Errors
    ///
    /// Fails if another run owns the loop, or the loop is running or closed.
    fn begin_run(&self) -> Result<RunId>;

    /// Releases the loop, discarding whatever `run` left scheduled.
    fn end_run(&self, run: RunId) -> usize;

    /// Drives `future` to completion, with no deadline.
    ///
    /// # Errors
    ///
    /// Fails if the loop cannot be driven.
    fn run_until<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.run_sync(Deadline::Never, future)
    }

    /// Drives `future` to completion, giving up at `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeadlineExceeded`](crate::Error::DeadlineExceeded)
    /// if the deadline fires first, and a loop misuse error if the loop
    /// cannot be driven.
    fn run_sync<F>(&self, deadline: Deadline, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let config = RunConfig::new(self.clone(), deadline);
        driver::run(&config, || Invocation::routine(future))?.into_result()
    }
}

#[cfg(feature = "tokio")]
pub mod tokio;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, LoopMisuse};
    use crate::IoLoop;

    fn drive<L: EventLoop>(io_loop: &L) -> Result<&'static str> {
        let inner = io_loop.clone();
        io_loop.run_until(async move {
            let (resolver, value) = crate::pending::pending();
            inner.add_callback(move || resolver.resolve("through the trait"));
            value.await
        })
    }

    #[test]
    fn test_generic_driving() {
        let io_loop = IoLoop::new();
        assert_eq!(drive(&io_loop).unwrap(), "through the trait");
        assert!(!EventLoop::is_running(&io_loop));
    }

    #[test]
    fn test_run_sync_deadline() {
        let io_loop = IoLoop::new();
        let err = io_loop
            .run_sync(
                Deadline::after(Duration::from_millis(10)),
                futures::future::pending::<()>(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::DeadlineExceeded {
                timeout: Duration::from_millis(10)
            }
        );
    }

    #[test]
    fn test_run_on_closed_loop() {
        let io_loop = IoLoop::new();
        io_loop.close().unwrap();
        assert_eq!(
            drive(&io_loop).unwrap_err(),
            Error::from(LoopMisuse::Closed)
        );
    }
}
