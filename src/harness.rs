//! Entry point used by the generated `#[test]` functions.
//!
//! [`run_test`] classifies a test, records its metadata, acquires the loop
//! fixture and either calls the body directly or drives it. Outcomes are
//! turned into what the standard test harness expects: a returned value for
//! success, the original panic for a raised body, and a panic carrying the
//! deadline message for a timeout.

use std::panic;

use tracing::debug;

use crate::adapter::Invocation;
use crate::collect::{CurrentTest, TestItem};
use crate::config::{Deadline, SessionConfig, DEFAULT_TIMEOUT};
use crate::driver::{self, RunConfig, RunOutcome};
use crate::error::Error;
use crate::fixture::LoopFixture;
use crate::IoLoop;

/// Runs a test with the process-wide [`SessionConfig`].
///
/// # Panics
///
/// Panics when the test fails: with the body's own panic, with the
/// deadline message on timeout, or with the error of a misused loop.
///
/// # Example
///
/// ```rust
/// use gentest::adapter::Invocation;
/// use gentest::collect::{Marker, Shape, TestItem};
/// use gentest::harness::run_test;
/// use std::time::Duration;
///
/// let item = TestItem::new("doc::sleeps", Shape::Routine, Marker::Unmarked);
/// let value = run_test(item, |io_loop| {
///     Invocation::routine(async move {
///         io_loop.sleep(Duration::from_millis(1)).await;
///         "awake"
///     })
/// });
/// assert_eq!(value, "awake");
/// ```
pub fn run_test<T, F>(item: TestItem, body: F) -> T
where
    T: Send + 'static,
    F: FnOnce(IoLoop) -> Invocation<T>,
{
    run_test_with(item, SessionConfig::global(), body)
}

/// Runs a test with an explicit session configuration.
///
/// # Panics
///
/// See [`run_test`].
pub fn run_test_with<T, F>(item: TestItem, session: &SessionConfig, body: F) -> T
where
    T: Send + 'static,
    F: FnOnce(IoLoop) -> Invocation<T>,
{
    let metadata = item.collect(session);
    let _current = CurrentTest::enter(metadata.clone());
    let fixture = LoopFixture::acquire(session.loop_scope);
    let io_loop = fixture.io_loop().clone();

    if !metadata.is_async {
        return match body(io_loop) {
            Invocation::Ready(value) => value,
            Invocation::Routine(_) | Invocation::Pending(_) => fail(&Error::NotDriven {
                name: metadata.name,
            }),
        };
    }

    let deadline = metadata
        .resolved_timeout
        .unwrap_or(Deadline::After(DEFAULT_TIMEOUT));
    debug!(test = %metadata.name, %deadline, "driving async test");

    let config = RunConfig::new(io_loop.clone(), deadline);
    match driver::run(&config, move || body(io_loop)) {
        Ok(RunOutcome::Completed(value)) => value,
        Ok(RunOutcome::Raised(payload)) => panic::resume_unwind(payload),
        Ok(RunOutcome::TimedOut(timeout)) => fail(&Error::DeadlineExceeded { timeout }),
        Err(err) => fail(&err),
    }
}

fn fail(err: &Error) -> ! {
    panic!("{err}")
}
