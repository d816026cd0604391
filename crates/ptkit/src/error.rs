use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Rejection — non-fatal, logged and reported through `Outcome::Ignored`
// ---------------------------------------------------------------------------

/// Why a mutation left a mirror untouched.
///
/// None of these are fatal: the mirror logs them and carries on. They are
/// surfaced so callers (and tests) can tell an applied change from a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("element already present")]
    DuplicateInsert,

    #[error("element not present")]
    NotFoundOnRemove,

    #[error("modification changes the sort key; express it as remove + add")]
    InconsistentModify,

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("record \"{id}\" rejected by sanity filter")]
    SanityCheckRejected { id: String },
}

// ---------------------------------------------------------------------------
// DecodeError
// ---------------------------------------------------------------------------

/// A remote record could not be turned into a domain element.
#[derive(Debug, Clone)]
pub struct DecodeError {
    pub id: String,
    pub message: String,
}

impl DecodeError {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"Failed to decode record "{}": {}"#, self.id, self.message)
    }
}

impl std::error::Error for DecodeError {}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// Classification of remote store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Retriable (network, temporary unavailability)
    Transient,
    /// Not retriable (validation, malformed request)
    Permanent,
    /// The referenced record or collection does not exist
    NotFound,
    /// Rejected by the store's access rules
    PermissionDenied,
}

/// Failure reported by a [`RemoteStore`](crate::remote::RemoteStore).
#[derive(Debug, Clone, Error)]
#[error("Remote store error ({kind:?}): {message}")]
pub struct RemoteError {
    pub message: String,
    pub kind: RemoteErrorKind,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: RemoteErrorKind::Transient,
        }
    }

    pub fn with_kind(message: impl Into<String>, kind: RemoteErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// PtkitError — top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PtkitError {
    #[error("Mirror \"{mirror}\" is no longer running")]
    Closed { mirror: String },

    #[error("Job on mirror \"{mirror}\" panicked; the mirror keeps running")]
    JobPanicked { mirror: String },

    #[error("Conflicting configuration: {0}")]
    ConflictingConfiguration(String),

    #[error("View \"{0}\" needs either a source mirror or static contents")]
    MissingSource(String),

    #[error("Committing null object")]
    NullCommit,

    #[error("Index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Convenience alias — the default error type is `PtkitError`.
pub type Result<T, E = PtkitError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
