//! Row-level reads and writes. Entities are addressed by id only; callers
//! resolve relationships through these lookups instead of holding references.

use crate::calc::GradedItem;
use crate::error::{GradebookError, Result};
use crate::model::{
    Assignment, Course, CourseGrade, Enrollment, Grade, GradebookCategory, Submission,
    SubmissionContent, SubmissionFormat, SubmissionStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::str::FromStr;

fn conversion_err(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn dec(r: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = r.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_err(idx, format!("{raw}: {e}")))
}

fn opt_dec(r: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = r.get(idx)?;
    match raw {
        None => Ok(None),
        Some(s) => Decimal::from_str(&s)
            .map(Some)
            .map_err(|e| conversion_err(idx, format!("{s}: {e}"))),
    }
}

fn flag(r: &Row<'_>, idx: usize) -> rusqlite::Result<bool> {
    Ok(r.get::<_, i64>(idx)? != 0)
}

// ---- courses & enrollments -------------------------------------------------

pub fn get_course(conn: &Connection, course_id: &str) -> Result<Course> {
    conn.query_row(
        "SELECT id, title, instructor_id FROM courses WHERE id = ?",
        [course_id],
        |r| {
            Ok(Course {
                id: r.get(0)?,
                title: r.get(1)?,
                instructor_id: r.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or(GradebookError::NotFound("course"))
}

pub fn upsert_course(conn: &Connection, course: &Course) -> Result<()> {
    conn.execute(
        "INSERT INTO courses(id, title, instructor_id) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           title = excluded.title,
           instructor_id = excluded.instructor_id",
        (&course.id, &course.title, &course.instructor_id),
    )?;
    Ok(())
}

const ENROLLMENT_COLS: &str = "id, course_id, learner_id, progress_percentage";

fn enrollment_from_row(r: &Row<'_>) -> rusqlite::Result<Enrollment> {
    Ok(Enrollment {
        id: r.get(0)?,
        course_id: r.get(1)?,
        learner_id: r.get(2)?,
        progress_percentage: dec(r, 3)?,
    })
}

pub fn find_enrollment(
    conn: &Connection,
    course_id: &str,
    learner_id: &str,
) -> Result<Option<Enrollment>> {
    let sql = format!(
        "SELECT {ENROLLMENT_COLS} FROM enrollments WHERE course_id = ? AND learner_id = ?"
    );
    Ok(conn
        .query_row(&sql, (course_id, learner_id), enrollment_from_row)
        .optional()?)
}

pub fn list_enrollments(conn: &Connection, course_id: &str) -> Result<Vec<Enrollment>> {
    let sql = format!(
        "SELECT {ENROLLMENT_COLS} FROM enrollments WHERE course_id = ? ORDER BY learner_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([course_id], enrollment_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Inserts or updates the enrollment for (course, learner) and returns the
/// stored row. An existing enrollment keeps its id.
pub fn upsert_enrollment(conn: &Connection, enrollment: &Enrollment) -> Result<Enrollment> {
    conn.execute(
        "INSERT INTO enrollments(id, course_id, learner_id, progress_percentage)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(course_id, learner_id) DO UPDATE SET
           progress_percentage = excluded.progress_percentage",
        (
            &enrollment.id,
            &enrollment.course_id,
            &enrollment.learner_id,
            enrollment.progress_percentage.to_string(),
        ),
    )?;
    find_enrollment(conn, &enrollment.course_id, &enrollment.learner_id)?
        .ok_or(GradebookError::NotFound("enrollment"))
}

// ---- categories ------------------------------------------------------------

const CATEGORY_COLS: &str = "id, course_id, name, weight, drop_lowest, active, position";

fn category_from_row(r: &Row<'_>) -> rusqlite::Result<GradebookCategory> {
    Ok(GradebookCategory {
        id: r.get(0)?,
        course_id: r.get(1)?,
        name: r.get(2)?,
        weight: dec(r, 3)?,
        drop_lowest: r.get(4)?,
        active: flag(r, 5)?,
        position: r.get(6)?,
    })
}

pub fn get_category(conn: &Connection, category_id: &str) -> Result<GradebookCategory> {
    let sql = format!("SELECT {CATEGORY_COLS} FROM gradebook_categories WHERE id = ?");
    conn.query_row(&sql, [category_id], category_from_row)
        .optional()?
        .ok_or(GradebookError::NotFound("category"))
}

pub fn list_categories(
    conn: &Connection,
    course_id: &str,
    active_only: bool,
) -> Result<Vec<GradebookCategory>> {
    let sql = format!(
        "SELECT {CATEGORY_COLS} FROM gradebook_categories
         WHERE course_id = ? AND (? = 0 OR active = 1)
         ORDER BY position, name"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((course_id, active_only as i64), category_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn category_name_taken(
    conn: &Connection,
    course_id: &str,
    name: &str,
    except_id: Option<&str>,
) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM gradebook_categories
             WHERE course_id = ? AND lower(name) = lower(?) AND id <> COALESCE(?, '')",
            (course_id, name, except_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn next_category_position(conn: &Connection, course_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM gradebook_categories WHERE course_id = ?",
        [course_id],
        |r| r.get(0),
    )?)
}

pub fn insert_category(conn: &Connection, c: &GradebookCategory) -> Result<()> {
    conn.execute(
        "INSERT INTO gradebook_categories(id, course_id, name, weight, drop_lowest, active, position)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &c.id,
            &c.course_id,
            &c.name,
            c.weight.to_string(),
            c.drop_lowest,
            c.active as i64,
            c.position,
        ),
    )?;
    Ok(())
}

pub fn update_category(conn: &Connection, c: &GradebookCategory) -> Result<()> {
    conn.execute(
        "UPDATE gradebook_categories
         SET name = ?, weight = ?, drop_lowest = ?, active = ?, position = ?
         WHERE id = ?",
        (
            &c.name,
            c.weight.to_string(),
            c.drop_lowest,
            c.active as i64,
            c.position,
            &c.id,
        ),
    )?;
    Ok(())
}

// ---- assignments -----------------------------------------------------------

const ASSIGNMENT_COLS: &str = "id, course_id, category_id, title, max_points, due_date,
    available_from, available_until, allow_late, late_penalty_percentage, max_attempts,
    submission_format";

fn assignment_from_row(r: &Row<'_>) -> rusqlite::Result<Assignment> {
    let format_raw: String = r.get(11)?;
    let submission_format = SubmissionFormat::parse(&format_raw)
        .ok_or_else(|| conversion_err(11, format!("unknown submission format {format_raw}")))?;
    Ok(Assignment {
        id: r.get(0)?,
        course_id: r.get(1)?,
        category_id: r.get(2)?,
        title: r.get(3)?,
        max_points: dec(r, 4)?,
        due_date: r.get(5)?,
        available_from: r.get(6)?,
        available_until: r.get(7)?,
        allow_late: flag(r, 8)?,
        late_penalty_percentage: opt_dec(r, 9)?,
        max_attempts: r.get(10)?,
        submission_format,
    })
}

pub fn get_assignment(conn: &Connection, assignment_id: &str) -> Result<Assignment> {
    let sql = format!("SELECT {ASSIGNMENT_COLS} FROM assignments WHERE id = ?");
    conn.query_row(&sql, [assignment_id], assignment_from_row)
        .optional()?
        .ok_or(GradebookError::NotFound("assignment"))
}

pub fn upsert_assignment(conn: &Connection, a: &Assignment) -> Result<()> {
    conn.execute(
        "INSERT INTO assignments(id, course_id, category_id, title, max_points, due_date,
             available_from, available_until, allow_late, late_penalty_percentage,
             max_attempts, submission_format)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           course_id = excluded.course_id,
           category_id = excluded.category_id,
           title = excluded.title,
           max_points = excluded.max_points,
           due_date = excluded.due_date,
           available_from = excluded.available_from,
           available_until = excluded.available_until,
           allow_late = excluded.allow_late,
           late_penalty_percentage = excluded.late_penalty_percentage,
           max_attempts = excluded.max_attempts,
           submission_format = excluded.submission_format",
        rusqlite::params![
            &a.id,
            &a.course_id,
            &a.category_id,
            &a.title,
            a.max_points.to_string(),
            a.due_date,
            a.available_from,
            a.available_until,
            a.allow_late as i64,
            a.late_penalty_percentage.map(|p| p.to_string()),
            a.max_attempts,
            a.submission_format.as_str(),
        ],
    )?;
    Ok(())
}

// ---- submissions -----------------------------------------------------------

const SUBMISSION_COLS: &str = "id, assignment_id, learner_id, attempt_number, submitted_at,
    is_late, status, content_text, content_file";

fn submission_from_row(r: &Row<'_>) -> rusqlite::Result<Submission> {
    let status_raw: String = r.get(6)?;
    let status = SubmissionStatus::parse(&status_raw)
        .ok_or_else(|| conversion_err(6, format!("unknown submission status {status_raw}")))?;
    Ok(Submission {
        id: r.get(0)?,
        assignment_id: r.get(1)?,
        learner_id: r.get(2)?,
        attempt_number: r.get(3)?,
        submitted_at: r.get(4)?,
        late: flag(r, 5)?,
        status,
        content: SubmissionContent {
            text: r.get(7)?,
            file_ref: r.get(8)?,
        },
    })
}

pub fn get_submission(conn: &Connection, submission_id: &str) -> Result<Submission> {
    let sql = format!("SELECT {SUBMISSION_COLS} FROM submissions WHERE id = ?");
    conn.query_row(&sql, [submission_id], submission_from_row)
        .optional()?
        .ok_or(GradebookError::NotFound("submission"))
}

pub fn count_attempts(conn: &Connection, assignment_id: &str, learner_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(attempt_number), 0) FROM submissions
         WHERE assignment_id = ? AND learner_id = ?",
        (assignment_id, learner_id),
        |r| r.get(0),
    )?)
}

pub fn insert_submission(conn: &Connection, s: &Submission) -> Result<()> {
    conn.execute(
        "INSERT INTO submissions(id, assignment_id, learner_id, attempt_number, submitted_at,
             is_late, status, content_text, content_file)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &s.id,
            &s.assignment_id,
            &s.learner_id,
            s.attempt_number,
            s.submitted_at,
            s.late as i64,
            s.status.as_str(),
            &s.content.text,
            &s.content.file_ref,
        ],
    )?;
    Ok(())
}

pub fn update_submission_content(
    conn: &Connection,
    submission_id: &str,
    content: &SubmissionContent,
    status: SubmissionStatus,
) -> Result<()> {
    conn.execute(
        "UPDATE submissions SET content_text = ?, content_file = ?, status = ? WHERE id = ?",
        (&content.text, &content.file_ref, status.as_str(), submission_id),
    )?;
    Ok(())
}

pub fn set_submission_status(
    conn: &Connection,
    submission_id: &str,
    status: SubmissionStatus,
) -> Result<()> {
    conn.execute(
        "UPDATE submissions SET status = ? WHERE id = ?",
        (status.as_str(), submission_id),
    )?;
    Ok(())
}

pub fn delete_submission(conn: &Connection, submission_id: &str) -> Result<()> {
    conn.execute("DELETE FROM submissions WHERE id = ?", [submission_id])?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionFilter {
    All,
    PendingGrading,
    Late,
}

pub fn list_submissions(
    conn: &Connection,
    assignment_id: &str,
    filter: SubmissionFilter,
) -> Result<Vec<Submission>> {
    let clause = match filter {
        SubmissionFilter::All => "",
        SubmissionFilter::PendingGrading => " AND status <> 'graded'",
        SubmissionFilter::Late => " AND is_late = 1",
    };
    let sql = format!(
        "SELECT {SUBMISSION_COLS} FROM submissions WHERE assignment_id = ?{clause}
         ORDER BY submitted_at, learner_id, attempt_number"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([assignment_id], submission_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ---- grades ----------------------------------------------------------------

const GRADE_COLS: &str = "id, submission_id, assignment_id, learner_id, grader_id,
    points_earned, points_possible, percentage, letter_grade, late_penalty_applied, is_late,
    excused, feedback, released, released_at, revision, graded_at";

fn grade_from_row(r: &Row<'_>) -> rusqlite::Result<Grade> {
    Ok(Grade {
        id: r.get(0)?,
        submission_id: r.get(1)?,
        assignment_id: r.get(2)?,
        learner_id: r.get(3)?,
        grader_id: r.get(4)?,
        points_earned: dec(r, 5)?,
        points_possible: dec(r, 6)?,
        percentage: dec(r, 7)?,
        letter_grade: r.get(8)?,
        late_penalty_applied: dec(r, 9)?,
        late: flag(r, 10)?,
        excused: flag(r, 11)?,
        feedback: r.get(12)?,
        released: flag(r, 13)?,
        released_at: r.get(14)?,
        revision: r.get(15)?,
        graded_at: r.get(16)?,
    })
}

pub fn get_grade(conn: &Connection, grade_id: &str) -> Result<Grade> {
    let sql = format!("SELECT {GRADE_COLS} FROM grades WHERE id = ?");
    conn.query_row(&sql, [grade_id], grade_from_row)
        .optional()?
        .ok_or(GradebookError::NotFound("grade"))
}

pub fn find_grade_for_submission(conn: &Connection, submission_id: &str) -> Result<Option<Grade>> {
    let sql = format!("SELECT {GRADE_COLS} FROM grades WHERE submission_id = ?");
    Ok(conn
        .query_row(&sql, [submission_id], grade_from_row)
        .optional()?)
}

pub fn list_grades_for_assignment(conn: &Connection, assignment_id: &str) -> Result<Vec<Grade>> {
    let sql = format!(
        "SELECT {GRADE_COLS} FROM grades WHERE assignment_id = ? ORDER BY learner_id, graded_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([assignment_id], grade_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn list_released_grades_for_learner(conn: &Connection, learner_id: &str) -> Result<Vec<Grade>> {
    let sql = format!(
        "SELECT {GRADE_COLS} FROM grades WHERE learner_id = ? AND released = 1
         ORDER BY graded_at DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([learner_id], grade_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn insert_grade(conn: &Connection, g: &Grade) -> Result<()> {
    conn.execute(
        "INSERT INTO grades(id, submission_id, assignment_id, learner_id, grader_id,
             points_earned, points_possible, percentage, letter_grade, late_penalty_applied,
             is_late, excused, feedback, released, released_at, revision, graded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &g.id,
            &g.submission_id,
            &g.assignment_id,
            &g.learner_id,
            &g.grader_id,
            g.points_earned.to_string(),
            g.points_possible.to_string(),
            g.percentage.to_string(),
            &g.letter_grade,
            g.late_penalty_applied.to_string(),
            g.late as i64,
            g.excused as i64,
            &g.feedback,
            g.released as i64,
            g.released_at,
            g.revision,
            g.graded_at,
        ],
    )?;
    Ok(())
}

/// Rewrites the computed fields of an existing grade. `points_possible`,
/// `late` and the release state are never touched here.
pub fn update_grade_scores(conn: &Connection, g: &Grade) -> Result<()> {
    conn.execute(
        "UPDATE grades SET grader_id = ?, points_earned = ?, percentage = ?, letter_grade = ?,
             late_penalty_applied = ?, excused = ?, feedback = ?, revision = ?, graded_at = ?
         WHERE id = ?",
        rusqlite::params![
            &g.grader_id,
            g.points_earned.to_string(),
            g.percentage.to_string(),
            &g.letter_grade,
            g.late_penalty_applied.to_string(),
            g.excused as i64,
            &g.feedback,
            g.revision,
            g.graded_at,
            &g.id,
        ],
    )?;
    Ok(())
}

/// Marks a grade released. Returns false when it already was.
pub fn mark_grade_released(conn: &Connection, grade_id: &str, at: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE grades SET released = 1, released_at = ? WHERE id = ? AND released = 0",
        rusqlite::params![at, grade_id],
    )?;
    Ok(changed > 0)
}

#[derive(Debug, Clone)]
pub struct GradeRevision<'a> {
    pub grade: &'a Grade,
    pub raw_points: Decimal,
}

pub fn append_grade_revision(conn: &Connection, rev: &GradeRevision<'_>) -> Result<()> {
    let g = rev.grade;
    conn.execute(
        "INSERT INTO grade_revisions(grade_id, revision, grader_id, raw_points,
             late_penalty_applied, points_earned, percentage, excused, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &g.id,
            g.revision,
            &g.grader_id,
            rev.raw_points.to_string(),
            g.late_penalty_applied.to_string(),
            g.points_earned.to_string(),
            g.percentage.to_string(),
            g.excused as i64,
            g.graded_at,
        ],
    )?;
    Ok(())
}

/// The learner's graded work in a course, one entry per assignment: the
/// highest graded attempt wins.
pub fn graded_items(conn: &Connection, course_id: &str, learner_id: &str) -> Result<Vec<GradedItem>> {
    let mut stmt = conn.prepare(
        "SELECT a.id, a.category_id, g.percentage, g.excused
         FROM grades g
         JOIN submissions s ON s.id = g.submission_id
         JOIN assignments a ON a.id = g.assignment_id
         WHERE a.course_id = ? AND g.learner_id = ?
         ORDER BY a.id, s.attempt_number DESC",
    )?;
    let rows = stmt
        .query_map((course_id, learner_id), |r| {
            Ok(GradedItem {
                assignment_id: r.get(0)?,
                category_id: r.get(1)?,
                percentage: dec(r, 2)?,
                excused: flag(r, 3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut seen: HashSet<String> = HashSet::new();
    Ok(rows
        .into_iter()
        .filter(|item| seen.insert(item.assignment_id.clone()))
        .collect())
}

// ---- course grades ---------------------------------------------------------

const COURSE_GRADE_COLS: &str = "id, course_id, learner_id, percentage, letter_grade,
    grade_points, passing, complete, completion_date, last_calculated";

fn course_grade_from_row(r: &Row<'_>) -> rusqlite::Result<CourseGrade> {
    Ok(CourseGrade {
        id: r.get(0)?,
        course_id: r.get(1)?,
        learner_id: r.get(2)?,
        percentage: dec(r, 3)?,
        letter_grade: r.get(4)?,
        grade_points: dec(r, 5)?,
        passing: flag(r, 6)?,
        complete: flag(r, 7)?,
        completion_date: r.get(8)?,
        last_calculated: r.get(9)?,
    })
}

pub fn find_course_grade(
    conn: &Connection,
    course_id: &str,
    learner_id: &str,
) -> Result<Option<CourseGrade>> {
    let sql = format!(
        "SELECT {COURSE_GRADE_COLS} FROM course_grades WHERE course_id = ? AND learner_id = ?"
    );
    Ok(conn
        .query_row(&sql, (course_id, learner_id), course_grade_from_row)
        .optional()?)
}

/// All course grades, best first. Percentages are stored as text, so the
/// ordering happens here rather than in SQL.
pub fn list_course_grades(conn: &Connection, course_id: &str) -> Result<Vec<CourseGrade>> {
    let sql = format!("SELECT {COURSE_GRADE_COLS} FROM course_grades WHERE course_id = ?");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map([course_id], course_grade_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.sort_by(|a, b| {
        b.percentage
            .cmp(&a.percentage)
            .then_with(|| a.learner_id.cmp(&b.learner_id))
    });
    Ok(rows)
}

pub fn upsert_course_grade(conn: &Connection, cg: &CourseGrade) -> Result<()> {
    conn.execute(
        "INSERT INTO course_grades(id, course_id, learner_id, percentage, letter_grade,
             grade_points, passing, complete, completion_date, last_calculated)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(course_id, learner_id) DO UPDATE SET
           percentage = excluded.percentage,
           letter_grade = excluded.letter_grade,
           grade_points = excluded.grade_points,
           passing = excluded.passing,
           complete = excluded.complete,
           completion_date = COALESCE(course_grades.completion_date, excluded.completion_date),
           last_calculated = excluded.last_calculated",
        rusqlite::params![
            &cg.id,
            &cg.course_id,
            &cg.learner_id,
            cg.percentage.to_string(),
            &cg.letter_grade,
            cg.grade_points.to_string(),
            cg.passing as i64,
            cg.complete as i64,
            cg.completion_date,
            cg.last_calculated,
        ],
    )?;
    Ok(())
}
