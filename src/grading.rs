use crate::authz;
use crate::calc::{self, percentage, round2};
use crate::error::{GradebookError, Result};
use crate::model::{Actor, CourseGrade, Grade, SubmissionStatus};
use crate::recompute;
use crate::repo;
use crate::signal::CompletionSink;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

pub const EXCUSED_LETTER: &str = "EX";

/// Lower bounds (inclusive, checked top-down) with their letter and grade
/// points. A+ and A intentionally share 4.0.
const LETTER_BANDS: [(i64, &str, i64); 12] = [
    (97, "A+", 40),
    (93, "A", 40),
    (90, "A-", 37),
    (87, "B+", 33),
    (83, "B", 30),
    (80, "B-", 27),
    (77, "C+", 23),
    (73, "C", 20),
    (70, "C-", 17),
    (67, "D+", 13),
    (63, "D", 10),
    (60, "D-", 7),
];

pub const ALL_LETTERS: [&str; 13] = [
    "A+", "A", "A-", "B+", "B", "B-", "C+", "C", "C-", "D+", "D", "D-", "F",
];

pub fn letter_grade(pct: Decimal) -> &'static str {
    LETTER_BANDS
        .iter()
        .find(|(min, _, _)| pct >= Decimal::from(*min))
        .map(|(_, letter, _)| *letter)
        .unwrap_or("F")
}

pub fn grade_points(pct: Decimal) -> Decimal {
    LETTER_BANDS
        .iter()
        .find(|(min, _, _)| pct >= Decimal::from(*min))
        .map(|(_, _, tenths)| Decimal::new(*tenths, 1))
        .unwrap_or_else(|| Decimal::new(0, 1))
}

/// What the grader hands in. `points_earned` is always the raw score before
/// any late penalty.
#[derive(Debug, Clone)]
pub struct GradeInput {
    pub points_earned: Decimal,
    pub feedback: Option<String>,
    pub excused: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub points_earned: Decimal,
    pub percentage: Decimal,
    pub letter_grade: String,
    pub late_penalty_applied: Decimal,
}

/// Turns raw points into the stored grade fields. The penalty comes off the
/// points, once, and always from `raw_points`.
pub fn score(
    raw_points: Decimal,
    points_possible: Decimal,
    late: bool,
    late_penalty_percentage: Option<Decimal>,
    excused: bool,
) -> Result<Scored> {
    if excused {
        return Ok(Scored {
            points_earned: raw_points,
            percentage: Decimal::ZERO,
            letter_grade: EXCUSED_LETTER.to_string(),
            late_penalty_applied: Decimal::ZERO,
        });
    }

    let mut points_earned = raw_points;
    let mut penalty = Decimal::ZERO;
    if late {
        if let Some(p) = late_penalty_percentage {
            penalty = raw_points
                .checked_mul(p)
                .and_then(|x| x.checked_div(Decimal::ONE_HUNDRED))
                .map(round2)
                .ok_or_else(|| GradebookError::invalid("late penalty is out of range"))?;
            points_earned = raw_points - penalty;
        }
    }
    let pct = percentage(points_earned, points_possible)?;
    Ok(Scored {
        points_earned,
        percentage: pct,
        letter_grade: letter_grade(pct).to_string(),
        late_penalty_applied: penalty,
    })
}

fn validate_input(input: &GradeInput) -> Result<()> {
    if input.points_earned.is_sign_negative() && !input.points_earned.is_zero() {
        return Err(GradebookError::invalid("pointsEarned must not be negative"));
    }
    if input.points_earned > calc::points_ceiling() {
        return Err(GradebookError::invalid(format!(
            "pointsEarned must not exceed {}",
            calc::POINTS_CEILING
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeOutcome {
    pub grade: Grade,
    /// `None` when the follow-up recompute failed; the grade itself is stored.
    pub course_grade: Option<CourseGrade>,
}

fn recompute_after_grading(
    conn: &mut Connection,
    sink: &dyn CompletionSink,
    course_id: &str,
    learner_id: &str,
    now: DateTime<Utc>,
) -> Option<CourseGrade> {
    match recompute::recompute_learner(conn, sink, course_id, learner_id, now) {
        Ok(cg) => Some(cg),
        Err(e) => {
            error!(course_id, learner_id, error = %e, "course grade recompute after grading failed");
            None
        }
    }
}

/// Grades a submission for the first time and moves it to `graded`.
pub fn grade_submission(
    conn: &mut Connection,
    sink: &dyn CompletionSink,
    actor: &Actor,
    submission_id: &str,
    input: GradeInput,
    now: DateTime<Utc>,
) -> Result<GradeOutcome> {
    validate_input(&input)?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let submission = repo::get_submission(&tx, submission_id)?;
    let assignment = repo::get_assignment(&tx, &submission.assignment_id)?;
    let course = repo::get_course(&tx, &assignment.course_id)?;
    authz::require_course_staff(actor, &course, "grade submissions")?;

    if let Some(existing) = repo::find_grade_for_submission(&tx, submission_id)? {
        return Err(GradebookError::GradeExists {
            grade_id: existing.id,
        });
    }

    let scored = score(
        input.points_earned,
        assignment.max_points,
        submission.late,
        assignment.late_penalty_percentage,
        input.excused,
    )?;
    let grade = Grade {
        id: Uuid::new_v4().to_string(),
        submission_id: submission.id.clone(),
        assignment_id: assignment.id.clone(),
        learner_id: submission.learner_id.clone(),
        grader_id: actor.id.clone(),
        points_earned: scored.points_earned,
        points_possible: assignment.max_points,
        percentage: scored.percentage,
        letter_grade: scored.letter_grade,
        late_penalty_applied: scored.late_penalty_applied,
        late: submission.late,
        excused: input.excused,
        feedback: input.feedback,
        released: false,
        released_at: None,
        revision: 1,
        graded_at: now,
    };
    repo::insert_grade(&tx, &grade)?;
    repo::append_grade_revision(
        &tx,
        &repo::GradeRevision {
            grade: &grade,
            raw_points: input.points_earned,
        },
    )?;
    repo::set_submission_status(&tx, submission_id, SubmissionStatus::Graded)?;
    tx.commit()?;

    info!(
        grade_id = %grade.id,
        submission_id,
        learner_id = %grade.learner_id,
        percentage = %grade.percentage,
        letter = %grade.letter_grade,
        "submission graded"
    );

    let course_grade =
        recompute_after_grading(conn, sink, &course.id, &grade.learner_id, now);
    Ok(GradeOutcome {
        grade,
        course_grade,
    })
}

/// Re-grades an existing grade as a new revision. Released grades stay
/// editable and the learner is not re-notified.
pub fn update_grade(
    conn: &mut Connection,
    sink: &dyn CompletionSink,
    actor: &Actor,
    grade_id: &str,
    input: GradeInput,
    now: DateTime<Utc>,
) -> Result<GradeOutcome> {
    validate_input(&input)?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut grade = repo::get_grade(&tx, grade_id)?;
    let assignment = repo::get_assignment(&tx, &grade.assignment_id)?;
    let course = repo::get_course(&tx, &assignment.course_id)?;
    authz::require_course_staff(actor, &course, "update grades")?;

    let scored = score(
        input.points_earned,
        grade.points_possible,
        grade.late,
        assignment.late_penalty_percentage,
        input.excused,
    )?;
    grade.grader_id = actor.id.clone();
    grade.points_earned = scored.points_earned;
    grade.percentage = scored.percentage;
    grade.letter_grade = scored.letter_grade;
    grade.late_penalty_applied = scored.late_penalty_applied;
    grade.excused = input.excused;
    grade.feedback = input.feedback;
    grade.revision += 1;
    grade.graded_at = now;

    repo::update_grade_scores(&tx, &grade)?;
    repo::append_grade_revision(
        &tx,
        &repo::GradeRevision {
            grade: &grade,
            raw_points: input.points_earned,
        },
    )?;
    tx.commit()?;

    info!(
        grade_id,
        revision = grade.revision,
        percentage = %grade.percentage,
        released = grade.released,
        "grade updated"
    );

    let course_grade =
        recompute_after_grading(conn, sink, &course.id, &grade.learner_id, now);
    Ok(GradeOutcome {
        grade,
        course_grade,
    })
}

/// Makes a grade visible to the learner. Releasing twice is a no-op.
pub fn release_grade(
    conn: &Connection,
    actor: &Actor,
    grade_id: &str,
    now: DateTime<Utc>,
) -> Result<Grade> {
    let grade = repo::get_grade(conn, grade_id)?;
    let assignment = repo::get_assignment(conn, &grade.assignment_id)?;
    let course = repo::get_course(conn, &assignment.course_id)?;
    authz::require_course_staff(actor, &course, "release grades")?;

    if repo::mark_grade_released(conn, grade_id, now)? {
        info!(grade_id, learner_id = %grade.learner_id, "grade released");
    }
    repo::get_grade(conn, grade_id)
}

/// Releases every unreleased grade of an assignment and returns how many
/// changed.
pub fn release_all_grades(
    conn: &mut Connection,
    actor: &Actor,
    assignment_id: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let assignment = repo::get_assignment(&tx, assignment_id)?;
    let course = repo::get_course(&tx, &assignment.course_id)?;
    authz::require_course_staff(actor, &course, "release grades")?;

    let mut released = 0;
    for g in repo::list_grades_for_assignment(&tx, assignment_id)? {
        if repo::mark_grade_released(&tx, &g.id, now)? {
            released += 1;
        }
    }
    tx.commit()?;
    info!(assignment_id, released, "grades released for assignment");
    Ok(released)
}

/// Learners only see their own grades, and only once released.
pub fn get_grade(conn: &Connection, actor: &Actor, grade_id: &str) -> Result<Grade> {
    let grade = repo::get_grade(conn, grade_id)?;
    check_grade_visible(conn, actor, &grade)?;
    Ok(grade)
}

pub fn grade_for_submission(
    conn: &Connection,
    actor: &Actor,
    submission_id: &str,
) -> Result<Option<Grade>> {
    let submission = repo::get_submission(conn, submission_id)?;
    let Some(grade) = repo::find_grade_for_submission(conn, &submission.id)? else {
        return Ok(None);
    };
    check_grade_visible(conn, actor, &grade)?;
    Ok(Some(grade))
}

fn check_grade_visible(conn: &Connection, actor: &Actor, grade: &Grade) -> Result<()> {
    let assignment = repo::get_assignment(conn, &grade.assignment_id)?;
    let course = repo::get_course(conn, &assignment.course_id)?;
    if authz::is_course_staff(actor, &course) {
        return Ok(());
    }
    if actor.id == grade.learner_id && grade.released {
        return Ok(());
    }
    // Unreleased grades look absent to the learner.
    if actor.id == grade.learner_id {
        return Err(GradebookError::NotFound("grade"));
    }
    Err(GradebookError::forbidden("grade is not visible to this actor"))
}

pub fn grades_for_assignment(
    conn: &Connection,
    actor: &Actor,
    assignment_id: &str,
) -> Result<Vec<Grade>> {
    let assignment = repo::get_assignment(conn, assignment_id)?;
    let course = repo::get_course(conn, &assignment.course_id)?;
    authz::require_course_staff(actor, &course, "view assignment grades")?;
    repo::list_grades_for_assignment(conn, assignment_id)
}

pub fn released_grades(conn: &Connection, actor: &Actor, learner_id: &str) -> Result<Vec<Grade>> {
    if !actor.is_admin() && actor.id != learner_id {
        return Err(GradebookError::forbidden("learners can only view their own grades"));
    }
    repo::list_released_grades_for_learner(conn, learner_id)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentGradeStats {
    pub assignment_id: String,
    pub graded_count: usize,
    pub excused_count: usize,
    pub average: Option<Decimal>,
    pub highest: Option<Decimal>,
    pub lowest: Option<Decimal>,
}

pub fn summarize_assignment_grades(
    assignment_id: &str,
    grades: &[Grade],
) -> Result<AssignmentGradeStats> {
    let counted: Vec<Decimal> = grades
        .iter()
        .filter(|g| !g.excused)
        .map(|g| g.percentage)
        .collect();
    Ok(AssignmentGradeStats {
        assignment_id: assignment_id.to_string(),
        graded_count: counted.len(),
        excused_count: grades.len() - counted.len(),
        average: calc::average(&counted)?,
        highest: counted.iter().copied().max(),
        lowest: counted.iter().copied().min(),
    })
}

pub fn assignment_grade_stats(
    conn: &Connection,
    actor: &Actor,
    assignment_id: &str,
) -> Result<AssignmentGradeStats> {
    let grades = grades_for_assignment(conn, actor, assignment_id)?;
    summarize_assignment_grades(assignment_id, &grades)
}
