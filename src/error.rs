// The categorized error taxonomy. Internal plumbing still propagates
// anyhow::Result with .context(...) the way the rest of this crate does -
// this enum exists only at the seams where a caller (a reporter, the CLI's
// exit-code logic, a SpecResult) needs to branch on *what kind* of failure
// occurred rather than just display a message.
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::Teardown => write!(f, "teardown"),
        }
    }
}

/// One category per row of the error taxonomy. Carries only what's needed
/// to report/branch on a failure; the descriptive detail lives in the
/// `message` field of the containing `SpecResult`'s failure payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Kind {
    #[error("assertion failed")]
    Assertion,

    #[error("unhandled error in spec body")]
    Runtime,

    #[error("spec timed out")]
    Timeout,

    #[error("{0} hook failed")]
    Hook(Phase),

    #[error("duplicate fixture or invalid declaration: {0}")]
    InvalidSpec(String),

    #[error("could not parse spec file: {0}")]
    ParseError(String),

    #[error("unknown fixture {0:?}")]
    UnknownFixture(String),

    #[error("fixture {0:?} retrieved at the wrong type")]
    FixtureTypeMismatch(String),

    #[error("fixture API used outside a running spec body")]
    InvalidLifecycle,

    #[error("contradictory configuration: {0}")]
    Configuration(String),
}

impl Kind {
    pub fn setup(msg: impl Into<String>) -> FailureDetail {
        FailureDetail::new(Kind::Hook(Phase::Setup), msg)
    }

    pub fn teardown(msg: impl Into<String>) -> FailureDetail {
        FailureDetail::new(Kind::Hook(Phase::Teardown), msg)
    }
}

/// Attached to a failed `SpecResult`: the category plus a free-form message,
/// an optional stack/backtrace, and optional expected/actual strings
/// supplied by whatever assertion layer the spec body used - the core does
/// not endorse one, it just carries through what it's given (spec.md §3,
/// §7's Assertion row).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    pub kind: Kind,
    pub message: String,
    pub stack: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl FailureDetail {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            expected: None,
            actual: None,
        }
    }

    /// Structured expected/actual, e.g. a snapshot mismatch or an assertion
    /// library that supplied both sides of a comparison.
    pub fn mismatch(kind: Kind, message: impl Into<String>, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            expected: Some(expected.into()),
            actual: Some(actual.into()),
            ..Self::new(kind, message)
        }
    }

    pub fn runtime(err: &anyhow::Error) -> Self {
        Self {
            stack: Some(format!("{err:?}")),
            ..Self::new(Kind::Runtime, format!("{err:#}"))
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(Kind::Timeout, format!("exceeded {after:?}"))
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
