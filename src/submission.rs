use crate::authz;
use crate::error::{GradebookError, Result};
use crate::model::{Actor, Assignment, Submission, SubmissionContent, SubmissionFormat, SubmissionStatus};
use crate::repo::{self, SubmissionFilter};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{info, warn};
use uuid::Uuid;

/// Checks the availability window and late policy at `now`. Returns whether
/// a submission made now would be late.
pub fn check_window(assignment: &Assignment, now: DateTime<Utc>) -> Result<bool> {
    if assignment.available_from.is_some_and(|from| now < from) {
        return Err(GradebookError::NotAvailable);
    }
    if assignment.available_until.is_some_and(|until| now > until) {
        return Err(GradebookError::NotAvailable);
    }
    let late = assignment.due_date.is_some_and(|due| now > due);
    if late && !assignment.allow_late {
        return Err(GradebookError::LateNotAllowed);
    }
    Ok(late)
}

pub fn check_attempts(assignment: &Assignment, prior_attempts: i64) -> Result<()> {
    match assignment.max_attempts {
        Some(max) if prior_attempts >= max => Err(GradebookError::AttemptsExceeded { max }),
        _ => Ok(()),
    }
}

fn non_blank(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

pub fn is_valid_url(raw: &str) -> bool {
    url::Url::parse(raw.trim())
        .map(|u| u.has_host())
        .unwrap_or(false)
}

pub fn validate_content(format: SubmissionFormat, content: &SubmissionContent) -> Result<()> {
    match format {
        SubmissionFormat::Text => {
            if non_blank(content.text.as_deref()).is_none() {
                return Err(GradebookError::InvalidContent(
                    "text submission is required".into(),
                ));
            }
        }
        SubmissionFormat::File => {
            if non_blank(content.file_ref.as_deref()).is_none() {
                return Err(GradebookError::InvalidContent(
                    "file submission is required".into(),
                ));
            }
        }
        SubmissionFormat::Url => {
            if !non_blank(content.text.as_deref()).is_some_and(is_valid_url) {
                return Err(GradebookError::InvalidContent(
                    "a valid URL submission is required".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Records a new attempt for `learner_id`. Attempt counting and the insert
/// share one write transaction so concurrent submits cannot reuse a number.
pub fn submit(
    conn: &mut Connection,
    actor: &Actor,
    assignment_id: &str,
    learner_id: &str,
    content: SubmissionContent,
    now: DateTime<Utc>,
) -> Result<Submission> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let assignment = repo::get_assignment(&tx, assignment_id)?;
    authz::require_self(actor, learner_id)?;
    if repo::find_enrollment(&tx, &assignment.course_id, learner_id)?.is_none() {
        return Err(GradebookError::NotEnrolled);
    }

    let late = check_window(&assignment, now)?;
    let prior = repo::count_attempts(&tx, assignment_id, learner_id)?;
    if let Err(e) = check_attempts(&assignment, prior) {
        warn!(assignment_id, learner_id, prior, "submission rejected: attempts exhausted");
        return Err(e);
    }
    validate_content(assignment.submission_format, &content)?;

    let submission = Submission {
        id: Uuid::new_v4().to_string(),
        assignment_id: assignment_id.to_string(),
        learner_id: learner_id.to_string(),
        attempt_number: prior + 1,
        submitted_at: now,
        late,
        status: SubmissionStatus::Submitted,
        content,
    };
    repo::insert_submission(&tx, &submission)?;
    tx.commit()?;

    info!(
        submission_id = %submission.id,
        assignment_id,
        learner_id,
        attempt = submission.attempt_number,
        late,
        "submission recorded"
    );
    Ok(submission)
}

/// Replaces the content of an ungraded submission. Attempt number and the
/// late flag keep the values fixed at submit time.
pub fn resubmit(
    conn: &mut Connection,
    actor: &Actor,
    submission_id: &str,
    content: SubmissionContent,
) -> Result<Submission> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut submission = repo::get_submission(&tx, submission_id)?;
    authz::require_owner_or_admin(actor, &submission)?;
    if submission.status == SubmissionStatus::Graded {
        return Err(GradebookError::AlreadyGraded);
    }
    let assignment = repo::get_assignment(&tx, &submission.assignment_id)?;
    validate_content(assignment.submission_format, &content)?;

    repo::update_submission_content(&tx, submission_id, &content, SubmissionStatus::Resubmitted)?;
    tx.commit()?;

    submission.content = content;
    submission.status = SubmissionStatus::Resubmitted;
    info!(submission_id, "submission content replaced");
    Ok(submission)
}

pub fn delete(conn: &mut Connection, actor: &Actor, submission_id: &str) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let submission = repo::get_submission(&tx, submission_id)?;
    authz::require_owner_or_admin(actor, &submission)?;
    if submission.status == SubmissionStatus::Graded {
        return Err(GradebookError::AlreadyGraded);
    }
    repo::delete_submission(&tx, submission_id)?;
    tx.commit()?;
    info!(submission_id, "submission deleted");
    Ok(())
}

/// The submitting learner and course staff may read a submission.
pub fn get(conn: &Connection, actor: &Actor, submission_id: &str) -> Result<Submission> {
    let submission = repo::get_submission(conn, submission_id)?;
    if actor.is_admin() || actor.id == submission.learner_id {
        return Ok(submission);
    }
    let assignment = repo::get_assignment(conn, &submission.assignment_id)?;
    let course = repo::get_course(conn, &assignment.course_id)?;
    authz::require_course_staff(actor, &course, "view submissions")?;
    Ok(submission)
}

pub fn list_for_assignment(
    conn: &Connection,
    actor: &Actor,
    assignment_id: &str,
    filter: SubmissionFilter,
) -> Result<Vec<Submission>> {
    let assignment = repo::get_assignment(conn, assignment_id)?;
    let course = repo::get_course(conn, &assignment.course_id)?;
    authz::require_course_staff(actor, &course, "list submissions")?;
    repo::list_submissions(conn, assignment_id, filter)
}
