//! Permission checks as pure functions of (actor, resource).

use crate::error::{GradebookError, Result};
use crate::model::{Actor, Course, Role, Submission};

pub fn is_course_staff(actor: &Actor, course: &Course) -> bool {
    actor.is_admin() || (actor.role == Role::Instructor && actor.id == course.instructor_id)
}

pub fn require_course_staff(actor: &Actor, course: &Course, action: &str) -> Result<()> {
    if is_course_staff(actor, course) {
        return Ok(());
    }
    Err(GradebookError::forbidden(format!(
        "only the course instructor or an admin may {action}"
    )))
}

/// Submitting is done by learners for themselves.
pub fn require_self(actor: &Actor, learner_id: &str) -> Result<()> {
    if actor.id == learner_id {
        return Ok(());
    }
    Err(GradebookError::forbidden("learners can only submit for themselves"))
}

pub fn require_owner_or_admin(actor: &Actor, submission: &Submission) -> Result<()> {
    if actor.is_admin() || actor.id == submission.learner_id {
        return Ok(());
    }
    Err(GradebookError::forbidden(
        "only the submitting learner or an admin may change this submission",
    ))
}

/// The learner themselves, the course instructor or an admin.
pub fn require_learner_view(actor: &Actor, course: &Course, learner_id: &str) -> Result<()> {
    if actor.id == learner_id || is_course_staff(actor, course) {
        return Ok(());
    }
    Err(GradebookError::forbidden(
        "grades are visible only to the learner and course staff",
    ))
}
