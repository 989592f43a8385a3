use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Instructor,
    Learner,
}

/// The identity an operation is performed as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub title: String,
    pub instructor_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: String,
    pub course_id: String,
    pub learner_id: String,
    pub progress_percentage: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionFormat {
    Text,
    File,
    Url,
}

impl SubmissionFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionFormat::Text => "text",
            SubmissionFormat::File => "file",
            SubmissionFormat::Url => "url",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Some(SubmissionFormat::Text),
            "file" => Some(SubmissionFormat::File),
            "url" => Some(SubmissionFormat::Url),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: String,
    pub course_id: String,
    pub category_id: Option<String>,
    pub title: String,
    pub max_points: Decimal,
    pub due_date: Option<DateTime<Utc>>,
    pub available_from: Option<DateTime<Utc>>,
    pub available_until: Option<DateTime<Utc>>,
    pub allow_late: bool,
    pub late_penalty_percentage: Option<Decimal>,
    pub max_attempts: Option<i64>,
    pub submission_format: SubmissionFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Submitted,
    Resubmitted,
    Graded,
}

impl SubmissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Submitted => "submitted",
            SubmissionStatus::Resubmitted => "resubmitted",
            SubmissionStatus::Graded => "graded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(SubmissionStatus::Submitted),
            "resubmitted" => Some(SubmissionStatus::Resubmitted),
            "graded" => Some(SubmissionStatus::Graded),
            _ => None,
        }
    }
}

/// What a learner hands in. Which field is required depends on the
/// assignment's [`SubmissionFormat`]; URL submissions travel in `text`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionContent {
    pub text: Option<String>,
    pub file_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub assignment_id: String,
    pub learner_id: String,
    pub attempt_number: i64,
    pub submitted_at: DateTime<Utc>,
    pub late: bool,
    pub status: SubmissionStatus,
    pub content: SubmissionContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub id: String,
    pub submission_id: String,
    pub assignment_id: String,
    pub learner_id: String,
    pub grader_id: String,
    pub points_earned: Decimal,
    pub points_possible: Decimal,
    pub percentage: Decimal,
    pub letter_grade: String,
    pub late_penalty_applied: Decimal,
    pub late: bool,
    pub excused: bool,
    pub feedback: Option<String>,
    pub released: bool,
    pub released_at: Option<DateTime<Utc>>,
    pub revision: i64,
    pub graded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradebookCategory {
    pub id: String,
    pub course_id: String,
    pub name: String,
    pub weight: Decimal,
    pub drop_lowest: i64,
    pub active: bool,
    pub position: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseGrade {
    pub id: String,
    pub course_id: String,
    pub learner_id: String,
    pub percentage: Decimal,
    pub letter_grade: String,
    pub grade_points: Decimal,
    pub passing: bool,
    pub complete: bool,
    pub completion_date: Option<DateTime<Utc>>,
    pub last_calculated: DateTime<Utc>,
}
