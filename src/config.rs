//! Configuration for async test runs.
//!
//! Deadlines are resolved from three tiers, highest first:
//!
//! 1. the per-test marker option (`#[gen_test(timeout = 0.5)]`),
//! 2. the session default from the `ASYNC_TEST_TIMEOUT` environment variable,
//! 3. the built-in [`DEFAULT_TIMEOUT`].
//!
//! # Example
//!
//! ```rust
//! use gentest::config::{resolve_timeout, SessionConfig, TestConfig, TimeoutSource};
//! use gentest::Deadline;
//! use std::time::Duration;
//!
//! let session = SessionConfig::new().default_timeout(Deadline::after(Duration::from_secs(2)));
//! let explicit = TestConfig::new().timeout(Deadline::after(Duration::from_millis(500)));
//!
//! let (deadline, source) = resolve_timeout(Some(&explicit), &session);
//! assert_eq!(deadline, Deadline::after(Duration::from_millis(500)));
//! assert_eq!(source, TimeoutSource::Explicit);
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Built-in deadline used when neither the test nor the session sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variable holding the session default deadline, in seconds.
pub const TIMEOUT_ENV: &str = "ASYNC_TEST_TIMEOUT";

/// Environment variable selecting the loop fixture scope.
pub const LOOP_SCOPE_ENV: &str = "ASYNC_TEST_LOOP_SCOPE";

/// How long a run may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Deadline {
    /// Give up once the duration has elapsed. Zero expires immediately.
    After(Duration),
    /// Wait forever.
    Never,
}

impl Deadline {
    /// A deadline `duration` from the start of the run.
    #[must_use]
    pub const fn after(duration: Duration) -> Self {
        Self::After(duration)
    }

    /// A deadline from fractional seconds; infinity means [`Deadline::Never`].
    ///
    /// # Errors
    ///
    /// Rejects negative, NaN and out-of-range values.
    pub fn from_secs_f64(secs: f64) -> Result<Self> {
        let reject = |reason: &str| Error::invalid_config("timeout", secs.to_string(), reason);
        if secs.is_nan() {
            return Err(reject("not a number"));
        }
        if secs < 0.0 {
            return Err(reject("must not be negative"));
        }
        if secs.is_infinite() {
            return Ok(Self::Never);
        }
        Duration::try_from_secs_f64(secs)
            .map(Self::After)
            .map_err(|_| reject("out of range"))
    }

    /// The duration, or `None` for [`Deadline::Never`].
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::After(duration) => Some(*duration),
            Self::Never => None,
        }
    }

    /// Returns true for [`Deadline::Never`].
    #[must_use]
    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Self::After(duration)
    }
}

impl FromStr for Deadline {
    type Err = Error;

    /// Parses seconds (`"0.5"`, `"10"`) or `none` / `off` / `never`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if ["none", "off", "never"]
            .iter()
            .any(|word| trimmed.eq_ignore_ascii_case(word))
        {
            return Ok(Self::Never);
        }
        let secs: f64 = trimmed
            .parse()
            .map_err(|_| Error::invalid_config("timeout", s, "expected seconds or `none`"))?;
        Self::from_secs_f64(secs)
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::After(duration) => write!(f, "{duration:?}"),
            Self::Never => write!(f, "none"),
        }
    }
}

/// Options carried by an explicit async marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestConfig {
    /// Overrides the session deadline for this test only.
    pub timeout: Option<Deadline>,
}

impl TestConfig {
    /// A marker without options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-test deadline.
    #[must_use]
    pub fn timeout(mut self, deadline: Deadline) -> Self {
        self.timeout = Some(deadline);
        self
    }
}

/// Lifetime of the loop handed to tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopScope {
    /// A fresh loop per test, closed when the test ends.
    #[default]
    Test,
    /// One loop per test thread, shared by every test run on it.
    Thread,
}

impl FromStr for LoopScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" | "function" => Ok(Self::Test),
            "thread" | "session" => Ok(Self::Thread),
            _ => Err(Error::invalid_config(
                LOOP_SCOPE_ENV,
                s,
                "expected `test` or `thread`",
            )),
        }
    }
}

/// Which tier a resolved deadline came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSource {
    /// The test's own marker.
    Explicit,
    /// The session default.
    Session,
    /// [`DEFAULT_TIMEOUT`].
    BuiltIn,
}

/// Session-wide settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for tests whose marker does not set one.
    pub default_timeout: Option<Deadline>,
    /// Lifetime of the loop handed to tests.
    pub loop_scope: LoopScope,
}

impl SessionConfig {
    /// A configuration with no session overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the session default deadline.
    #[must_use]
    pub fn default_timeout(mut self, deadline: Deadline) -> Self {
        self.default_timeout = Some(deadline);
        self
    }

    /// Sets the loop scope.
    #[must_use]
    pub fn loop_scope(mut self, scope: LoopScope) -> Self {
        self.loop_scope = scope;
        self
    }

    /// Reads [`TIMEOUT_ENV`] and [`LOOP_SCOPE_ENV`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a value that does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    /// Empty values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a value that does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(value) = read(TIMEOUT_ENV) {
            let deadline = value.parse::<Deadline>().map_err(|err| match err {
                Error::InvalidConfig { reason, .. } => {
                    Error::invalid_config(TIMEOUT_ENV, value.as_str(), reason)
                }
                other => other,
            })?;
            config.default_timeout = Some(deadline);
        }
        if let Some(value) = read(LOOP_SCOPE_ENV) {
            config.loop_scope = value.parse()?;
        }
        Ok(config)
    }

    /// The process-wide configuration, read from the environment once.
    ///
    /// An invalid value is logged and the built-in defaults are used instead.
    pub fn global() -> &'static SessionConfig {
        static GLOBAL: OnceLock<SessionConfig> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Self::from_env().unwrap_or_else(|err| {
                warn!(error = %err, "ignoring invalid session configuration");
                Self::default()
            })
        })
    }
}

/// Resolves a test's deadline: explicit marker, then session, then built-in.
#[must_use]
pub fn resolve_timeout(
    explicit: Option<&TestConfig>,
    session: &SessionConfig,
) -> (Deadline, TimeoutSource) {
    if let Some(deadline) = explicit.and_then(|config| config.timeout) {
        return (deadline, TimeoutSource::Explicit);
    }
    if let Some(deadline) = session.default_timeout {
        return (deadline, TimeoutSource::Session);
    }
    (Deadline::After(DEFAULT_TIMEOUT), TimeoutSource::BuiltIn)
}
