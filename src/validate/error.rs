//! Errors that stop a validation run before it starts

use thiserror::Error;

/// A run could not be started.
///
/// Per-candidate failures never surface here; they are recorded as
/// [`ProbeOutcome::Failure`](crate::validate::ProbeOutcome) and simply leave the
/// endpoint out of the ranking.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error("candidate set is empty")]
    EmptyCandidateSet,
    #[error("invalid run configuration: {0}")]
    InvalidConfig(String),
}

impl SetupError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        SetupError::InvalidConfig(msg.into())
    }
}
