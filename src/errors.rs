//! Errors raised while assembling and using a task's state.
//!
//! Every failure while building an
//! [`crate::context::InitializationContext`] is a failure of the
//! whole context; callers never see a partially built one. Messages
//! built with the helpers in here carry the source location that
//! raised them, so a restore failure deep in a backend still points
//! at the line that gave up.

use std::panic::Location;

/// Boxed cause attached to some [`StateError`] variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type used in the crate.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A backend or timer manager could not be reconstructed from
    /// its handles: format mismatch, missing data, or a capability
    /// mismatch between the snapshot and the requested variant.
    #[error("restore failure: {msg}")]
    RestoreFailure {
        msg: String,
        #[source]
        source: Option<BoxError>,
    },
    /// Handles are structurally inconsistent: mismatched checkpoint
    /// ids, key-group gaps, or key groups outside the assigned range.
    #[error("corrupt state: {0}")]
    CorruptState(String),
    /// Storage I/O failure opening a partition stream.
    #[error("resource exhausted: {msg}")]
    ResourceExhausted {
        msg: String,
        #[source]
        source: Option<BoxError>,
    },
    /// Task startup was aborted externally.
    #[error("state initialization cancelled")]
    Cancelled,
    /// A resource was used after it was closed.
    #[error("resource already released: {0}")]
    ResourceAlreadyReleased(String),
    /// Keyed state or a timer was touched with no current key set.
    #[error("no current key set for {0}")]
    NoCurrentKey(String),
    /// Configuration could not be loaded or is inconsistent.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl StateError {
    #[track_caller]
    pub fn restore_failure(msg: &str) -> Self {
        Self::RestoreFailure {
            msg: prepend_caller(Location::caller(), msg),
            source: None,
        }
    }

    #[track_caller]
    pub fn corrupt(msg: &str) -> Self {
        Self::CorruptState(prepend_caller(Location::caller(), msg))
    }

    #[track_caller]
    pub fn exhausted(msg: &str) -> Self {
        Self::ResourceExhausted {
            msg: prepend_caller(Location::caller(), msg),
            source: None,
        }
    }

    #[track_caller]
    pub fn released(msg: &str) -> Self {
        Self::ResourceAlreadyReleased(prepend_caller(Location::caller(), msg))
    }

    #[track_caller]
    pub fn invalid_config(msg: &str) -> Self {
        Self::InvalidConfig(prepend_caller(Location::caller(), msg))
    }

    /// Re-label a storage-level failure as a restore failure of the
    /// backend that was reading it.
    ///
    /// Structural errors and cancellation pass through unchanged.
    #[track_caller]
    pub(crate) fn into_restore_failure(self, msg: &str) -> Self {
        match self {
            Self::ResourceExhausted { .. } | Self::ResourceAlreadyReleased(_) => {
                Self::RestoreFailure {
                    msg: prepend_caller(Location::caller(), msg),
                    source: Some(Box::new(self)),
                }
            }
            other => other,
        }
    }
}

/// Attach a [`StateError`] classification to any other error.
///
/// Example:
///     conn.execute(...).or_exhausted("Error reading region")?;
pub(crate) trait ErrorContext<T> {
    fn or_restore_failure(self, msg: &str) -> StateResult<T>;

    fn or_exhausted(self, msg: &str) -> StateResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    #[track_caller]
    fn or_restore_failure(self, msg: &str) -> StateResult<T> {
        let caller = Location::caller();
        self.map_err(|err| StateError::RestoreFailure {
            msg: prepend_caller(caller, msg),
            source: Some(err.into()),
        })
    }

    #[track_caller]
    fn or_exhausted(self, msg: &str) -> StateResult<T> {
        let caller = Location::caller();
        self.map_err(|err| StateError::ResourceExhausted {
            msg: prepend_caller(caller, msg),
            source: Some(err.into()),
        })
    }
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

#[test]
fn helpers_record_caller_location() {
    let err = StateError::corrupt("gap in key groups");
    let msg = err.to_string();
    assert!(msg.contains("errors.rs"), "{msg}");
    assert!(msg.ends_with("gap in key groups"), "{msg}");
}

#[test]
fn storage_errors_become_restore_failures() {
    let err = StateError::exhausted("disk gone").into_restore_failure("restoring keyed backend");
    match err {
        StateError::RestoreFailure { source, .. } => assert!(source.is_some()),
        other => panic!("unexpected {other:?}"),
    }

    let err = StateError::Cancelled.into_restore_failure("restoring keyed backend");
    assert!(matches!(err, StateError::Cancelled));
}

#[test]
fn foreign_errors_are_classified() {
    let res: Result<(), std::io::Error> =
        Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
    let err = res.or_exhausted("reading").unwrap_err();
    assert!(matches!(err, StateError::ResourceExhausted { .. }));
    assert!(std::error::Error::source(&err).is_some());
}
