//! Test detection, marking and per-test metadata.
//!
//! Every test is described by a [`TestItem`]: its name, the [`Shape`] of its
//! body (decided once, from the function signature) and the [`Marker`] it
//! carries. [`classify`] turns that into a [`Classification`] plus a resolved
//! deadline, and [`TestItem::collect`] records the result in the process-wide
//! [`Registry`] where other tooling can query it.
//!
//! libtest has no collection hook, so a test is recorded when it starts
//! running: [`metadata`] returns `None` for a test that has not run yet.
//!
//! # Example
//!
//! ```rust
//! use gentest::collect::{classify, Classification, Marker, Shape, TestItem};
//! use gentest::config::{SessionConfig, TimeoutSource, DEFAULT_TIMEOUT};
//! use gentest::Deadline;
//!
//! let item = TestItem::new("tests::fetches", Shape::Routine, Marker::Unmarked);
//! let classified = classify(&item, &SessionConfig::new());
//!
//! assert_eq!(classified.classification, Classification::AsyncImplicit);
//! assert_eq!(classified.timeout, Some(Deadline::after(DEFAULT_TIMEOUT)));
//! assert_eq!(classified.source, Some(TimeoutSource::BuiltIn));
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::{resolve_timeout, Deadline, SessionConfig, TestConfig, TimeoutSource};

/// What calling a test body produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// An `async fn`: a suspension sequence that has to be driven.
    Routine,
    /// A plain function returning a pending result handle.
    Pending,
    /// A plain function that runs to completion when called.
    Plain,
}

impl Shape {
    /// Returns true if the body cannot complete without a loop driving it.
    #[must_use]
    pub fn needs_driving(&self) -> bool {
        matches!(self, Self::Routine | Self::Pending)
    }
}

/// The explicit marking on a test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Marker {
    /// No marker: decided by shape.
    #[default]
    Unmarked,
    /// Marked async, with the marker's options.
    Async(TestConfig),
    /// Opted out of async driving.
    NotAsync,
}

/// How a test is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Called directly.
    Ordinary,
    /// Driven because of its shape.
    AsyncImplicit,
    /// Driven because it is marked async.
    AsyncExplicit,
}

impl Classification {
    /// Returns true if the test is driven on a loop.
    #[must_use]
    pub fn is_async(&self) -> bool {
        !matches!(self, Self::Ordinary)
    }
}

/// A collected test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestItem {
    /// Fully qualified test name.
    pub name: String,
    /// Shape of the test body.
    pub shape: Shape,
    /// Explicit marking.
    pub marker: Marker,
}

impl TestItem {
    /// Describes a test.
    #[must_use]
    pub fn new(name: impl Into<String>, shape: Shape, marker: Marker) -> Self {
        Self {
            name: name.into(),
            shape,
            marker,
        }
    }

    /// Classifies the test and records its metadata in the global registry.
    ///
    /// Metadata is recorded once per name; later calls return what was first
    /// recorded.
    pub fn collect(&self, session: &SessionConfig) -> Metadata {
        let classified = classify(self, session);
        let explicit = match self.marker {
            Marker::Async(config) => Some(config),
            Marker::Unmarked | Marker::NotAsync => None,
        };
        Registry::global().record(Metadata {
            name: self.name.clone(),
            classification: classified.classification,
            is_async: classified.classification.is_async(),
            resolved_timeout: classified.timeout,
            timeout_source: classified.source,
            explicit,
        })
    }
}

/// The result of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    /// How the test is run.
    pub classification: Classification,
    /// Resolved deadline; `None` for ordinary tests.
    pub timeout: Option<Deadline>,
    /// Tier the deadline came from; `None` for ordinary tests.
    pub source: Option<TimeoutSource>,
}

/// Decides whether a test is driven, and with which deadline.
///
/// An opt-out always wins; an explicit async marker always drives; an
/// unmarked test is driven only if its shape needs driving.
#[must_use]
pub fn classify(item: &TestItem, session: &SessionConfig) -> Classified {
    let (classification, explicit) = match item.marker {
        Marker::NotAsync => (Classification::Ordinary, None),
        Marker::Async(config) => (Classification::AsyncExplicit, Some(config)),
        Marker::Unmarked if item.shape.needs_driving() => (Classification::AsyncImplicit, None),
        Marker::Unmarked => (Classification::Ordinary, None),
    };

    let (timeout, source) = if classification.is_async() {
        let (deadline, source) = resolve_timeout(explicit.as_ref(), session);
        (Some(deadline), Some(source))
    } else {
        (None, None)
    };

    debug!(
        test = %item.name,
        ?classification,
        timeout = ?timeout,
        source = ?source,
        "classified test"
    );
    Classified {
        classification,
        timeout,
        source,
    }
}

/// What was decided about a test when it started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Fully qualified test name.
    pub name: String,
    /// How the test is run.
    pub classification: Classification,
    /// Whether the test is driven on a loop.
    pub is_async: bool,
    /// Resolved deadline, for async tests.
    pub resolved_timeout: Option<Deadline>,
    /// Tier the deadline came from, for async tests.
    pub timeout_source: Option<TimeoutSource>,
    /// Options of the explicit async marker, if any.
    pub explicit: Option<TestConfig>,
}

/// Process-wide record of collected tests.
///
/// Entries appear as tests start, through [`TestItem::collect`].
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Metadata>>,
}

impl Registry {
    /// The global registry.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::default)
    }

    /// Records metadata unless the name is already known, returning the
    /// recorded entry.
    pub fn record(&self, metadata: Metadata) -> Metadata {
        if let Some(existing) = self.entries.read().get(&metadata.name) {
            return existing.clone();
        }
        self.entries
            .write()
            .entry(metadata.name.clone())
            .or_insert(metadata)
            .clone()
    }

    /// Looks a test up by its fully qualified name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Metadata> {
        self.entries.read().get(name).cloned()
    }

    /// Number of recorded tests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

thread_local! {
    static CURRENT_TEST: RefCell<Option<Metadata>> = RefCell::new(None);
}

/// Metadata recorded for `name`.
///
/// Returns `None` until the test has started at least once.
#[must_use]
pub fn metadata(name: &str) -> Option<Metadata> {
    Registry::global().get(name)
}

/// Metadata of the test running on this thread.
#[must_use]
pub fn current() -> Option<Metadata> {
    CURRENT_TEST.with(|current| current.borrow().clone())
}

/// Marks a test as running on this thread until dropped.
#[derive(Debug)]
pub(crate) struct CurrentTest {
    previous: Option<Metadata>,
}

impl CurrentTest {
    pub(crate) fn enter(metadata: Metadata) -> Self {
        let previous = CURRENT_TEST.with(|current| current.borrow_mut().replace(metadata));
        Self { previous }
    }
}

impl Drop for CurrentTest {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TEST.with(|current| *current.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TIMEOUT;
    use std::time::Duration;

    fn session_2s() -> SessionConfig {
        SessionConfig::new().default_timeout(Deadline::after(Duration::from_secs(2)))
    }

    #[test]
    fn test_unmarked_routine_is_implicit_with_default() {
        let item = TestItem::new("t", Shape::Routine, Marker::Unmarked);
        let classified = classify(&item, &SessionConfig::new());

        assert_eq!(classified.classification, Classification::AsyncImplicit);
        assert_eq!(classified.timeout, Some(Deadline::after(DEFAULT_TIMEOUT)));
    }

    #[test]
    fn test_unmarked_pending_is_implicit() {
        let item = TestItem::new("t", Shape::Pending, Marker::Unmarked);
        let classified = classify(&item, &session_2s());

        assert_eq!(classified.classification, Classification::AsyncImplicit);
        assert_eq!(classified.source, Some(TimeoutSource::Session));
    }

    #[test]
    fn test_unmarked_plain_is_ordinary() {
        let item = TestItem::new("t", Shape::Plain, Marker::Unmarked);
        let classified = classify(&item, &session_2s());

        assert_eq!(classified.classification, Classification::Ordinary);
        assert_eq!(classified.timeout, None);
        assert_eq!(classified.source, None);
    }

    #[test]
    fn test_explicit_marker_drives_any_shape() {
        let config = TestConfig::new().timeout(Deadline::after(Duration::from_millis(500)));
        for shape in [Shape::Routine, Shape::Pending, Shape::Plain] {
            let item = TestItem::new("t", shape, Marker::Async(config));
            let classified = classify(&item, &session_2s());

            assert_eq!(classified.classification, Classification::AsyncExplicit);
            assert_eq!(
                classified.timeout,
                Some(Deadline::after(Duration::from_millis(500)))
            );
            assert_eq!(classified.source, Some(TimeoutSource::Explicit));
        }
    }

    #[test]
    fn test_bare_marker_uses_session_default() {
        let item = TestItem::new("t", Shape::Routine, Marker::Async(TestConfig::new()));
        let classified = classify(&item, &session_2s());

        assert_eq!(classified.classification, Classification::AsyncExplicit);
        assert_eq!(classified.timeout, Some(Deadline::after(Duration::from_secs(2))));
        assert_eq!(classified.source, Some(TimeoutSource::Session));
    }

    #[test]
    fn test_opt_out_beats_shape() {
        let item = TestItem::new("t", Shape::Routine, Marker::NotAsync);
        assert_eq!(
            classify(&item, &SessionConfig::new()).classification,
            Classification::Ordinary
        );
    }

    #[test]
    fn test_collect_records_once() {
        let name = "collect::tests::recorded_once";
        let first = TestItem::new(name, Shape::Routine, Marker::Unmarked)
            .collect(&SessionConfig::new());
        let second = TestItem::new(name, Shape::Plain, Marker::NotAsync)
            .collect(&SessionConfig::new());

        assert!(first.is_async);
        assert_eq!(second, first);
        assert_eq!(metadata(name), Some(first));
        assert!(!Registry::global().is_empty());
    }

    #[test]
    fn test_current_test_guard() {
        assert_eq!(current(), None);
        let meta = TestItem::new("collect::tests::current", Shape::Plain, Marker::Unmarked)
            .collect(&SessionConfig::new());
        {
            let _guard = CurrentTest::enter(meta.clone());
            assert_eq!(current(), Some(meta));
        }
        assert_eq!(current(), None);
    }

    #[test]
    fn test_metadata_appears_once_collected() {
        let item = TestItem::new(
            "collect::tests::not_yet_started",
            Shape::Routine,
            Marker::Unmarked,
        );
        assert_eq!(metadata(&item.name), None);

        let recorded = item.collect(&SessionConfig::new());
        assert_eq!(metadata(&item.name), Some(recorded));
    }
}
