use serde_json::json;
use thiserror::Error;

/// Typed failure of every engine operation.
///
/// Each variant carries a stable wire code (see [`GradebookError::code`]) so the
/// sidecar can report it without string matching on messages.
#[derive(Debug, Error)]
pub enum GradebookError {
    #[error("assignment is not open for submissions")]
    NotAvailable,

    #[error("due date has passed and late submissions are not allowed")]
    LateNotAllowed,

    #[error("maximum number of attempts ({max}) reached")]
    AttemptsExceeded { max: i64 },

    #[error("{0}")]
    InvalidContent(String),

    #[error("learner is not enrolled in the course")]
    NotEnrolled,

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("submission is already graded")]
    AlreadyGraded,

    #[error("submission already has a grade; update the existing grade instead")]
    GradeExists { grade_id: String },

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, GradebookError>;

impl GradebookError {
    pub fn code(&self) -> &'static str {
        match self {
            GradebookError::NotAvailable => "not_available",
            GradebookError::LateNotAllowed => "late_not_allowed",
            GradebookError::AttemptsExceeded { .. } => "attempts_exceeded",
            GradebookError::InvalidContent(_) => "invalid_content",
            GradebookError::NotEnrolled => "not_enrolled",
            GradebookError::InvalidInput(_) => "bad_params",
            GradebookError::Forbidden(_) => "forbidden",
            GradebookError::NotFound(_) => "not_found",
            GradebookError::AlreadyGraded => "already_graded",
            GradebookError::GradeExists { .. } => "grade_exists",
            GradebookError::Storage(_) => "db_query_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            GradebookError::AttemptsExceeded { max } => Some(json!({ "maxAttempts": max })),
            GradebookError::GradeExists { grade_id } => Some(json!({ "gradeId": grade_id })),
            _ => None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        GradebookError::InvalidInput(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        GradebookError::Forbidden(message.into())
    }
}
