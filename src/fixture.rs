//! The loop fixture handed to tests.

use std::cell::RefCell;
use std::fmt;

use tracing::{debug, warn};

use crate::config::LoopScope;
use crate::event_loop::{CurrentGuard, IoLoop};

thread_local! {
    static THREAD_LOOP: RefCell<Option<IoLoop>> = RefCell::new(None);
}

/// Supplies the loop for one test and makes it current while the test runs.
///
/// With [`LoopScope::Test`] every fixture gets a fresh loop that is closed
/// when the fixture is dropped. With [`LoopScope::Thread`] tests on the same
/// thread share one loop, left open between tests.
///
/// # Example
///
/// ```rust
/// use gentest::config::LoopScope;
/// use gentest::fixture::LoopFixture;
/// use gentest::IoLoop;
///
/// let io_loop = {
///     let fixture = LoopFixture::acquire(LoopScope::Test);
///     assert!(IoLoop::current().is_some());
///     fixture.io_loop().clone()
/// };
/// assert!(io_loop.is_closed());
/// ```
pub struct LoopFixture {
    io_loop: IoLoop,
    scope: LoopScope,
    _current: CurrentGuard,
}

impl LoopFixture {
    /// Acquires a loop for the given scope.
    #[must_use]
    pub fn acquire(scope: LoopScope) -> Self {
        let io_loop = match scope {
            LoopScope::Test => new_loop(),
            LoopScope::Thread => THREAD_LOOP.with(|slot| {
                let mut slot = slot.borrow_mut();
                match slot.as_ref() {
                    Some(io_loop) if !io_loop.is_closed() => io_loop.clone(),
                    _ => {
                        debug!("creating thread-scoped loop");
                        let io_loop = new_loop();
                        *slot = Some(io_loop.clone());
                        io_loop
                    }
                }
            }),
        };
        let current = io_loop.make_current();
        Self {
            io_loop,
            scope,
            _current: current,
        }
    }

    /// The loop.
    #[must_use]
    pub fn io_loop(&self) -> &IoLoop {
        &self.io_loop
    }

    /// The scope the loop was acquired with.
    #[must_use]
    pub fn scope(&self) -> LoopScope {
        self.scope
    }
}

impl fmt::Debug for LoopFixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopFixture")
            .field("io_loop", &self.io_loop)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Drop for LoopFixture {
    fn drop(&mut self) {
        if self.scope == LoopScope::Test {
            if let Err(err) = self.io_loop.close() {
                warn!(error = %err, "failed to close test loop");
            }
        }
    }
}

#[cfg(not(feature = "tokio"))]
fn new_loop() -> IoLoop {
    IoLoop::new()
}

/// With tokio enabled, fixture loops share one background tokio context.
#[cfg(feature = "tokio")]
fn new_loop() -> IoLoop {
    use std::sync::OnceLock;

    use crate::runtime::tokio::TokioContext;

    static CONTEXT: OnceLock<Option<TokioContext>> = OnceLock::new();
    let context = CONTEXT.get_or_init(|| match TokioContext::new() {
        Ok(context) => Some(context),
        Err(err) => {
            warn!(error = %err, "tokio context unavailable, fixture loops run without it");
            None
        }
    });
    match context {
        Some(context) => context.io_loop(),
        None => IoLoop::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_scope_closes_loop() {
        let fixture = LoopFixture::acquire(LoopScope::Test);
        let io_loop = fixture.io_loop().clone();
        assert_eq!(fixture.scope(), LoopScope::Test);
        assert!(!io_loop.is_closed());

        drop(fixture);
        assert!(io_loop.is_closed());
        assert!(IoLoop::current().is_none());
    }

    #[test]
    fn test_test_scope_loops_are_fresh() {
        let first = LoopFixture::acquire(LoopScope::Test).io_loop().clone();
        let second = LoopFixture::acquire(LoopScope::Test).io_loop().clone();
        assert_ne!(first, second);
        assert!(first.is_closed());
        assert!(second.is_closed());
    }

    #[test]
    fn test_thread_scope_reuses_loop() {
        let first = LoopFixture::acquire(LoopScope::Thread);
        let first_loop = first.io_loop().clone();
        drop(first);
        assert!(!first_loop.is_closed());

        let second = LoopFixture::acquire(LoopScope::Thread);
        assert_eq!(second.io_loop(), &first_loop);
    }

    #[test]
    fn test_thread_scope_replaces_closed_loop() {
        let first = LoopFixture::acquire(LoopScope::Thread);
        let first_loop = first.io_loop().clone();
        first_loop.close().unwrap();
        drop(first);

        let second = LoopFixture::acquire(LoopScope::Thread);
        assert!(!second.io_loop().is_closed());
        assert_ne!(second.io_loop(), &first_loop);
    }
}
