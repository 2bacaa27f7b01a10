//! Tokio runtime integration for gentest.
//!
//! [`IoLoop`] is not a tokio runtime, so tokio timers and sockets created by a
//! test body need a reactor to drive them. A [`TokioContext`] keeps one alive
//! on a background worker thread; loops built from it enter its context while
//! running, and tokio's wake-ups reach the loop through its thread-safe
//! wakers.
//!
//! # Example
//!
//! ```rust
//! use gentest::runtime::tokio::TokioContext;
//! use std::time::Duration;
//!
//! let context = TokioContext::new().unwrap();
//! let io_loop = context.io_loop();
//!
//! let value = io_loop
//!     .run_until(async {
//!         ::tokio::time::sleep(Duration::from_millis(5)).await;
//!         "slept on tokio"
//!     })
//!     .unwrap();
//! assert_eq!(value, "slept on tokio");
//! ```

use std::fmt;
use std::io;

use ::tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::IoLoop;

/// A background tokio runtime for loops whose tests use tokio I/O or timers.
pub struct TokioContext {
    runtime: Option<Runtime>,
}

impl TokioContext {
    /// Starts a runtime with a single worker thread and all drivers enabled.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while building the runtime.
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("gentest-tokio")
            .enable_all()
            .build()?;
        debug!("tokio context started");
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    /// Returns a handle to the runtime.
    #[must_use]
    pub fn handle(&self) -> Handle {
        match &self.runtime {
            Some(runtime) => runtime.handle().clone(),
            None => unreachable!("runtime is present until drop"),
        }
    }

    /// Builds a loop that enters this runtime's context while it runs.
    #[must_use]
    pub fn io_loop(&self) -> IoLoop {
        IoLoop::builder().tokio(self.handle()).build()
    }
}

impl fmt::Debug for TokioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioContext").finish_non_exhaustive()
    }
}

impl Drop for TokioContext {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which tokio forbids inside its own context.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tokio_sleep_on_io_loop() {
        let context = TokioContext::new().unwrap();
        let io_loop = context.io_loop();

        let start = io_loop.time();
        io_loop
            .run_until(async {
                ::tokio::time::sleep(Duration::from_millis(20)).await;
            })
            .unwrap();
        assert!(io_loop.time() - start >= Duration::from_millis(20));
    }

    #[test]
    fn test_tokio_spawn_result_reaches_loop() {
        let context = TokioContext::new().unwrap();
        let io_loop = context.io_loop();

        let value = io_loop
            .run_until(async {
                ::tokio::spawn(async { 6 * 7 }).await.unwrap()
            })
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_drop_context_inside_tokio() {
        let outer = ::tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        outer.block_on(async {
            let context = TokioContext::new().unwrap();
            drop(context);
        });
    }
}
