//! Error definitions
//!
//! This module provides error types for gentest.
//!
//! A panic raised by a test body is deliberately *not* represented here: the
//! driver hands the original panic payload back so it can be re-raised
//! untouched.

use std::time::Duration;

use thiserror::Error;

/// Main error type for gentest
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The deadline fired before the test body finished.
    #[error("deadline exceeded: test did not finish within {timeout:?}")]
    DeadlineExceeded {
        /// The deadline that was configured for the run.
        timeout: Duration,
    },

    /// The event loop was used in a way only a programming error can cause.
    #[error("event loop misuse: {0}")]
    LoopMisuse(#[from] LoopMisuse),

    /// An asynchronous test body was opted out of driving and never ran.
    #[error("test `{name}` produced a suspension sequence but was opted out of async driving")]
    NotDriven {
        /// Fully qualified test name.
        name: String,
    },

    /// A configuration value could not be parsed.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidConfig {
        /// The configuration key (environment variable or marker option).
        key: String,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// The ways an event loop can be misused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMisuse {
    /// `start` was called on a loop that is already running.
    #[error("loop is already running")]
    AlreadyRunning,
    /// `stop` was called on a loop that is not running.
    #[error("loop is not running")]
    NotRunning,
    /// `stop` was called twice during the same run.
    #[error("loop is already stopping")]
    AlreadyStopping,
    /// The loop has been closed.
    #[error("loop is closed")]
    Closed,
    /// The loop stopped before the driven operation settled.
    #[error("loop was stopped before the operation settled")]
    StoppedEarly,
}

impl Error {
    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for [`Error::DeadlineExceeded`].
    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// Returns true for [`Error::LoopMisuse`].
    #[must_use]
    pub fn is_loop_misuse(&self) -> bool {
        matches!(self, Self::LoopMisuse(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_message_names_the_timeout() {
        let err = Error::DeadlineExceeded {
            timeout: Duration::from_millis(100),
        };
        assert_eq!(
            err.to_string(),
            "deadline exceeded: test did not finish within 100ms"
        );
        assert!(err.is_deadline_exceeded());
        assert!(!err.is_loop_misuse());
    }

    #[test]
    fn test_loop_misuse_from() {
        let err: Error = LoopMisuse::AlreadyRunning.into();
        assert!(err.is_loop_misuse());
        assert_eq!(
            err.to_string(),
            "event loop misuse: loop is already running"
        );
    }

    #[test]
    fn test_loop_misuse_is_the_source() {
        use std::error::Error as _;

        let err = Error::from(LoopMisuse::StoppedEarly);
        let source = err.source().unwrap();
        assert_eq!(
            source.to_string(),
            "loop was stopped before the operation settled"
        );
        assert_eq!(
            source.downcast_ref::<LoopMisuse>(),
            Some(&LoopMisuse::StoppedEarly)
        );
    }

    #[test]
    fn test_invalid_config() {
        let err = Error::invalid_config("ASYNC_TEST_TIMEOUT", "-1", "must not be negative");
        assert_eq!(
            err.to_string(),
            "invalid value \"-1\" for ASYNC_TEST_TIMEOUT: must not be negative"
        );
    }
}
