//! A single-threaded event loop for driving async tests
//!
//! This module provides [`IoLoop`], a cooperative event loop with a FIFO
//! callback queue, a timer queue and a task table. Tests drive asynchronous
//! bodies to completion on it; the loop stops when the body settles or its
//! deadline fires.
//!
//! # Example
//!
//! ```rust
//! use gentest::IoLoop;
//! use std::time::Duration;
//!
//! let io_loop = IoLoop::new();
//! let nap = io_loop.sleep(Duration::from_millis(1));
//!
//! let answer = io_loop
//!     .run_until(async move {
//!         nap.await;
//!         42
//!     })
//!     .unwrap();
//! assert_eq!(answer, 42);
//! ```

use std::fmt;

mod io_loop;
mod task;
mod timer;

pub use io_loop::{CurrentGuard, IoLoop, IoLoopBuilder};
pub use task::TaskId;
pub use timer::TimeoutHandle;

/// Identifies one driver run on a loop.
///
/// Callbacks, timers and tasks registered while a run owns the loop are
/// tagged with it, and whatever is left over when the run ends is dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunId(u64);

impl RunId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run#{}", self.0)
    }
}
