//! # gentest
//!
//! > Run async test bodies to completion on a single-threaded event loop
//!
//! **gentest** drives `async` tests on a cooperative [`IoLoop`], under a
//! bounded deadline, and reports the result as an ordinary test outcome. The
//! loop is started and stopped for you; a body that panics fails with its
//! own panic, and a body that never finishes fails with a distinct
//! "deadline exceeded" message instead of hanging the test run.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gentest::IoLoop;
//! use std::time::Duration;
//!
//! #[gentest::test]
//! async fn test_sleeps(io_loop: IoLoop) {
//!     io_loop.sleep(Duration::from_millis(10)).await;
//! }
//!
//! #[gentest::test]
//! #[gen_test(timeout = 0.5)]
//! async fn test_with_deadline(io_loop: IoLoop) {
//!     io_loop.next_tick().await;
//! }
//! ```
//!
//! ## Features
//!
//! - **Implicit detection** - `async fn` tests are driven without a marker
//! - **Deadlines** - per test, per session (`ASYNC_TEST_TIMEOUT`) or built in
//! - **Clean loops** - nothing scheduled by one test can fire in the next
//! - **Metadata** - ask whether a test was driven, and with which deadline

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod adapter;
pub mod collect;
pub mod config;
pub mod driver;
pub mod error;
pub mod event_loop;
pub mod fixture;
pub mod harness;
pub mod pending;
pub mod runtime;
pub mod timeout;

/// Prelude for convenient imports
///
/// ```rust
/// use gentest::prelude::*;
/// ```
pub mod prelude {
    pub use crate::adapter::Invocation;
    pub use crate::config::{Deadline, SessionConfig, TestConfig};
    pub use crate::driver::RunOutcome;
    pub use crate::error::{Error, Result};
    pub use crate::event_loop::{IoLoop, TimeoutHandle};
    pub use crate::pending::{pending, PendingResult, Resolver};
    pub use crate::runtime::EventLoop;
}

// Re-exports
pub use collect::{current, metadata, Metadata};
pub use config::Deadline;
pub use error::{Error, Result};
pub use event_loop::IoLoop;
pub use pending::PendingResult;

// Re-export the attributes when macros feature is enabled
#[cfg(feature = "macros")]
pub use gentest_macros::{gen_test, test};

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_prelude_round_trip() {
        let io_loop = IoLoop::new();
        let nap = io_loop.sleep(Duration::from_millis(1));
        let value = io_loop
            .run_sync(Deadline::after(Duration::from_secs(1)), async move {
                nap.await;
                "prelude"
            })
            .unwrap();
        assert_eq!(value, "prelude");
    }
}
