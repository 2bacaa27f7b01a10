//! Integration tests for the `#[gentest::test]` and `#[gentest::gen_test]` attributes.

#![cfg(feature = "macros")]

use std::time::Duration;

use gentest::collect::Classification;
use gentest::config::TimeoutSource;
use gentest::{Deadline, IoLoop, PendingResult};

/// Unmarked async test: driven implicitly.
#[gentest::test]
async fn test_implicit_routine(io_loop: IoLoop) {
    io_loop.sleep(Duration::from_millis(5)).await;

    let meta = gentest::current().unwrap();
    assert_eq!(meta.name, "macro_tests::test_implicit_routine");
    assert_eq!(meta.classification, Classification::AsyncImplicit);
    assert!(meta.is_async);
    assert!(meta.explicit.is_none());
}

/// Async test without a loop parameter still runs on one.
#[gentest::test]
async fn test_without_loop_param() {
    let io_loop = IoLoop::current().unwrap();
    io_loop.next_tick().await;
    assert!(io_loop.is_running());
}

/// A body that never suspends completes without blocking on the loop.
#[gentest::test]
async fn test_returns_without_suspending(io_loop: IoLoop) {
    assert!(!io_loop.is_running());
}

/// Several parameters all receive the same loop.
#[gentest::test]
async fn test_multiple_loop_params(first: IoLoop, second: IoLoop) {
    assert_eq!(first, second);
    second.next_tick().await;
}

/// Explicit deadline overrides the session default.
#[gentest::test]
#[gen_test(timeout = 0.5)]
async fn test_explicit_timeout(io_loop: IoLoop) {
    io_loop.next_tick().await;

    let meta = gentest::current().unwrap();
    assert_eq!(meta.classification, Classification::AsyncExplicit);
    assert_eq!(
        meta.resolved_timeout,
        Some(Deadline::after(Duration::from_millis(500)))
    );
    assert_eq!(meta.timeout_source, Some(TimeoutSource::Explicit));
}

/// Bare marker keeps the session or built-in deadline.
#[gentest::test]
#[gen_test]
async fn test_bare_marker(io_loop: IoLoop) {
    io_loop.next_tick().await;

    let meta = gentest::current().unwrap();
    assert_eq!(meta.classification, Classification::AsyncExplicit);
    assert_ne!(meta.timeout_source, Some(TimeoutSource::Explicit));
}

/// Callable-style alias with no deadline.
#[gentest::gen_test(timeout = None)]
async fn test_alias_without_deadline(io_loop: IoLoop) {
    io_loop.sleep(Duration::from_millis(1)).await;

    let meta = gentest::current().unwrap();
    assert_eq!(meta.resolved_timeout, Some(Deadline::Never));
}

/// Callable-style alias with an integer deadline.
#[gentest::gen_test(timeout = 3)]
async fn test_alias_integer_timeout() {
    let meta = gentest::current().unwrap();
    assert_eq!(
        meta.resolved_timeout,
        Some(Deadline::after(Duration::from_secs(3)))
    );
}

/// Plain functions are ordinary tests.
#[gentest::test]
fn test_plain_is_ordinary(io_loop: IoLoop) {
    assert!(!io_loop.is_running());
    let meta = gentest::current().unwrap();
    assert_eq!(meta.classification, Classification::Ordinary);
    assert_eq!(meta.resolved_timeout, None);
}

/// Marking a plain function drives it anyway.
#[gentest::test]
#[gen_test(timeout = 1)]
fn test_plain_marked_is_driven() {
    let meta = gentest::current().unwrap();
    assert_eq!(meta.classification, Classification::AsyncExplicit);
}

/// A function returning a pending result is driven until it settles.
#[gentest::test]
fn test_returns_pending(io_loop: IoLoop) -> PendingResult<()> {
    let (resolver, handle) = gentest::pending::pending();
    io_loop.call_later(Duration::from_millis(5), move || resolver.resolve(()));
    handle
}

/// Result-returning tests report through the standard harness.
#[gentest::test]
async fn test_returns_result(io_loop: IoLoop) -> Result<(), String> {
    io_loop.next_tick().await;
    Ok(())
}

/// The deadline surfaces as its own failure.
#[gentest::test]
#[gen_test(timeout = 0.05)]
#[should_panic(expected = "deadline exceeded")]
async fn test_deadline_exceeded(io_loop: IoLoop) {
    io_loop.sleep(Duration::from_secs(1)).await;
}

/// A panic inside the body fails the test with the original message.
#[gentest::test]
#[should_panic(expected = "attempt to divide by zero")]
async fn test_division_by_zero_propagates(io_loop: IoLoop) {
    io_loop.next_tick().await;
    let divisor = std::hint::black_box(0);
    let _ = 1 / divisor;
}

/// Opting an async body out is reported, not silently skipped.
#[gentest::test]
#[not_gen_test]
#[should_panic(expected = "opted out of async driving")]
async fn test_opted_out_async_body() {}

/// Other attributes pass through to the generated test.
#[gentest::test]
#[ignore = "exercises attribute passthrough only"]
async fn test_ignored_passthrough(io_loop: IoLoop) {
    io_loop.sleep(Duration::from_secs(60)).await;
}
