//! Structured, categorized error codes.
//!
//! Every failure a workflow can produce maps onto one of the
//! [`StepwiseError`] variants, each carrying a numeric [`ErrorCode`] in the
//! E1xxx-E5xxx ranges. The numeric code is what shows up in JSON-RPC error
//! payloads and report output; the variant is what callers match on.

use std::fmt;
use thiserror::Error;

/// A four-digit error code: first digit is the category, rest is the
/// specific error within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // E1xxx: document load (parse, import, cycle)
    pub const PARSE_ERROR: Self = Self(1001);
    pub const IMPORT_ERROR: Self = Self(1002);
    pub const CYCLE_ERROR: Self = Self(1003);

    // E2xxx: transport
    pub const TRANSPORT_ERROR: Self = Self(2001);
    pub const TIMEOUT_ERROR: Self = Self(2002);

    // E3xxx: validation / capture
    pub const VALIDATION_FAILURE: Self = Self(3001);
    pub const CAPTURE_FAILURE: Self = Self(3002);

    // E4xxx: substitution / configuration
    pub const SUBSTITUTION_ERROR: Self = Self(4001);

    // E5xxx: orchestration / internal
    pub const BRANCH_ERROR: Self = Self(5001);
    pub const INTERNAL_ERROR: Self = Self(5002);

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Document,
            2 => ErrorCategory::Transport,
            3 => ErrorCategory::Validation,
            4 => ErrorCategory::Substitution,
            5 => ErrorCategory::Orchestration,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Document,
    Transport,
    Validation,
    Substitution,
    Orchestration,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Document => "document",
            Self::Transport => "transport",
            Self::Validation => "validation",
            Self::Substitution => "substitution",
            Self::Orchestration => "orchestration",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// `CaptureFailure` is the only kind that never fails a step outright — the
/// step executor records it as a warning and continues.
#[derive(Debug, Error, Clone)]
pub enum StepwiseError {
    #[error("{0}")]
    ParseError(String),

    #[error("import error: {0}")]
    ImportError(String),

    #[error("import cycle: {0}")]
    CycleError(String),

    #[error("substitution error: {0}")]
    SubstitutionError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("timeout after {0}")]
    TimeoutError(String),

    #[error("validation failed: {0}")]
    ValidationFailure(String),

    #[error("capture failed: {0}")]
    CaptureFailure(String),

    #[error("no branch condition matched")]
    BranchError,

    #[error("internal error: {0}")]
    InternalError(String),
}

impl StepwiseError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ParseError(_) => ErrorCode::PARSE_ERROR,
            Self::ImportError(_) => ErrorCode::IMPORT_ERROR,
            Self::CycleError(_) => ErrorCode::CYCLE_ERROR,
            Self::SubstitutionError(_) => ErrorCode::SUBSTITUTION_ERROR,
            Self::TransportError(_) => ErrorCode::TRANSPORT_ERROR,
            Self::TimeoutError(_) => ErrorCode::TIMEOUT_ERROR,
            Self::ValidationFailure(_) => ErrorCode::VALIDATION_FAILURE,
            Self::CaptureFailure(_) => ErrorCode::CAPTURE_FAILURE,
            Self::BranchError => ErrorCode::BRANCH_ERROR,
            Self::InternalError(_) => ErrorCode::INTERNAL_ERROR,
        }
    }

    /// `TimeoutError` is treated like a `TransportError` for retry/poll
    /// eligibility purposes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportError(_) | Self::TimeoutError(_))
    }

    pub fn user_message(&self) -> String {
        format!("[{}] {}", self.code(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_error_codes() {
        assert_eq!(ErrorCode::PARSE_ERROR.formatted(), "E1001");
        assert_eq!(ErrorCode::TRANSPORT_ERROR.formatted(), "E2001");
    }

    #[test]
    fn categorizes_error_codes() {
        assert_eq!(ErrorCode::CYCLE_ERROR.category(), ErrorCategory::Document);
        assert_eq!(ErrorCode::TIMEOUT_ERROR.category(), ErrorCategory::Transport);
        assert_eq!(ErrorCode::BRANCH_ERROR.category(), ErrorCategory::Orchestration);
    }

    #[test]
    fn timeout_and_transport_are_retryable_capture_is_not() {
        assert!(StepwiseError::TimeoutError("5s".into()).is_retryable());
        assert!(StepwiseError::TransportError("connection reset".into()).is_retryable());
        assert!(!StepwiseError::CaptureFailure("missing path".into()).is_retryable());
    }

    #[test]
    fn user_message_includes_code() {
        let err = StepwiseError::ValidationFailure("status 404 != 200".into());
        assert!(err.user_message().starts_with("[E3001]"));
    }
}
