//! Error type shared by every session operation.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Status>;

/// Semantic error class, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Cancelled,
    DeadlineExceeded,
    Internal,
    FailedPrecondition,
    Unknown,
}

/// A non-OK operation outcome: a code plus a human-readable message.
///
/// Statuses are cloned freely; barrier callbacks and timeout handlers
/// accumulate them under a lock and the first non-OK status wins.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code:?}: {message}")]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(Code::AlreadyExists, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Internal errors caused by client-supplied types are reported as
    /// invalid-argument at the public boundary.
    pub fn demote_internal(self) -> Self {
        if self.code == Code::Internal {
            Self::new(Code::InvalidArgument, self.message)
        } else {
            self
        }
    }

    /// Wrap an opaque kernel/collaborator failure. A `Status` raised behind
    /// the seam passes through verbatim; anything else surfaces as unknown.
    pub fn from_opaque(err: anyhow::Error) -> Self {
        match err.downcast::<Status>() {
            Ok(status) => status,
            Err(err) => Self::unknown(format!("{err:#}")),
        }
    }
}

/// Mutable accumulator with first-error-wins semantics.
#[derive(Debug, Default)]
pub struct StatusGroup {
    first: Option<Status>,
}

impl StatusGroup {
    pub fn update(&mut self, result: Result<()>) {
        if let Err(status) = result {
            if self.first.is_none() {
                self.first = Some(status);
            } else {
                crate::error_log!("suppressed secondary status: {}", status);
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        self.first.is_none()
    }

    pub fn current(&self) -> Result<()> {
        match &self.first {
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }

    pub fn take(self) -> Result<()> {
        match self.first {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let status = Status::invalid_argument("bad feed name");
        assert!(status.to_string().contains("InvalidArgument"));
        assert!(status.to_string().contains("bad feed name"));
    }

    #[test]
    fn first_status_wins() {
        let mut group = StatusGroup::default();
        group.update(Ok(()));
        group.update(Err(Status::cancelled("step cancelled")));
        group.update(Err(Status::internal("late failure")));
        let err = group.take().unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
    }

    #[test]
    fn demote_internal_only_touches_internal() {
        let demoted = Status::internal("type mismatch").demote_internal();
        assert_eq!(demoted.code(), Code::InvalidArgument);
        let kept = Status::not_found("missing node").demote_internal();
        assert_eq!(kept.code(), Code::NotFound);
    }
}
