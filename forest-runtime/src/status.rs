//! Crate-wide error currency: every fallible runtime operation returns
//! [`ForestError`], tagged with the [`ErrorKind`] a caller can dispatch on.

use std::error::Error;
use std::fmt;
use std::fmt::{Display, Formatter};

/// Failure classification shared by the substrate, the component runtimes,
/// and the management surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or incomplete configuration. Fatal at startup, before any I/O.
    ConfigInvalid,
    /// Duplicate component name for a kind already registered.
    NameConflict,
    /// Referenced script or prompt file is absent.
    ArtifactNotFound,
    /// Publish, subscribe, or stream commit failure.
    Bus,
    /// Key absent from the state store.
    NotFound,
    /// Compare-and-set expectation did not match the current revision.
    RevisionConflict,
    /// A user script raised or returned an unusable value.
    Script,
    /// An outbound HTTP or LLM call exceeded its deadline.
    ExternalTimeout,
    /// Cooperative shutdown interrupted the operation.
    Cancelled,
    /// The advisory operation is not implemented by this component.
    NotSupported,
    /// Broken internal invariant. Always a bug.
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code, used verbatim by the management API.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::NameConflict => "name_conflict",
            ErrorKind::ArtifactNotFound => "artifact_not_found",
            ErrorKind::Bus => "bus",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RevisionConflict => "revision_conflict",
            ErrorKind::Script => "script_error",
            ErrorKind::ExternalTimeout => "external_timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForestError {
    kind: ErrorKind,
    message: String,
}

impl ForestError {
    pub fn fail_with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for failures worth redelivering (transient); deterministic
    /// failures should be acked and dropped instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Bus | ErrorKind::ExternalTimeout | ErrorKind::RevisionConflict
        )
    }
}

impl Display for ForestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for ForestError {}
