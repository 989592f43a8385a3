use crate::authz;
use crate::calc::{self, CalcContext, CourseScore};
use crate::error::Result;
use crate::grading::{grade_points, letter_grade, ALL_LETTERS};
use crate::model::{Actor, CourseGrade, Enrollment};
use crate::repo;
use crate::signal::CompletionSignal;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const PASSING_THRESHOLD: i64 = 60;
pub const COMPLETE_PROGRESS: i64 = 100;

#[derive(Debug, Clone)]
pub struct Finalized {
    pub course_grade: CourseGrade,
    pub score: CourseScore,
    /// Set only on the run that turned the course grade complete.
    pub newly_completed: Option<CompletionSignal>,
}

/// Builds the next course grade from a fresh score. Completion is sticky: once
/// complete, a grade stays complete and keeps its first completion date.
pub fn next_course_grade(
    existing: Option<&CourseGrade>,
    course_id: &str,
    learner_id: &str,
    percentage: Decimal,
    progress: Option<Decimal>,
    now: DateTime<Utc>,
) -> (CourseGrade, bool) {
    let was_complete = existing.is_some_and(|cg| cg.complete);
    let reached = progress.is_some_and(|p| p >= Decimal::from(COMPLETE_PROGRESS));
    let complete = was_complete || reached;
    let newly_complete = complete && !was_complete;

    let completion_date = match existing.and_then(|cg| cg.completion_date) {
        Some(first) => Some(first),
        None if newly_complete => Some(now),
        None => None,
    };

    let cg = CourseGrade {
        id: existing
            .map(|cg| cg.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        course_id: course_id.to_string(),
        learner_id: learner_id.to_string(),
        percentage,
        letter_grade: letter_grade(percentage).to_string(),
        grade_points: grade_points(percentage),
        passing: percentage >= Decimal::from(PASSING_THRESHOLD),
        complete,
        completion_date,
        last_calculated: now,
    };
    (cg, newly_complete)
}

/// Recomputes and stores the learner's course grade. Must run inside the
/// caller's write transaction; the returned signal is for the caller to
/// deliver after commit.
pub fn finalize_course_grade(
    conn: &Connection,
    course_id: &str,
    learner_id: &str,
    now: DateTime<Utc>,
) -> Result<Finalized> {
    repo::get_course(conn, course_id)?;
    let score = calc::compute_course_score(&CalcContext {
        conn,
        course_id,
        learner_id,
    })?;
    let enrollment: Option<Enrollment> = repo::find_enrollment(conn, course_id, learner_id)?;
    let existing = repo::find_course_grade(conn, course_id, learner_id)?;

    let (course_grade, newly_complete) = next_course_grade(
        existing.as_ref(),
        course_id,
        learner_id,
        score.percentage,
        enrollment.as_ref().map(|e| e.progress_percentage),
        now,
    );
    repo::upsert_course_grade(conn, &course_grade)?;

    let newly_completed = match (newly_complete, enrollment) {
        (true, Some(e)) => Some(CompletionSignal {
            enrollment_id: e.id,
            learner_id: learner_id.to_string(),
            course_id: course_id.to_string(),
            completed_at: course_grade.completion_date.unwrap_or(now),
        }),
        _ => None,
    };

    Ok(Finalized {
        course_grade,
        score,
        newly_completed,
    })
}

pub fn get_course_grade(
    conn: &Connection,
    actor: &Actor,
    course_id: &str,
    learner_id: &str,
) -> Result<Option<CourseGrade>> {
    let course = repo::get_course(conn, course_id)?;
    authz::require_learner_view(actor, &course, learner_id)?;
    repo::find_course_grade(conn, course_id, learner_id)
}

/// Current score breakdown without writing anything.
pub fn preview_course_score(
    conn: &Connection,
    actor: &Actor,
    course_id: &str,
    learner_id: &str,
) -> Result<CourseScore> {
    let course = repo::get_course(conn, course_id)?;
    authz::require_learner_view(actor, &course, learner_id)?;
    calc::compute_course_score(&CalcContext {
        conn,
        course_id,
        learner_id,
    })
}

pub fn list_course_grades(
    conn: &Connection,
    actor: &Actor,
    course_id: &str,
) -> Result<Vec<CourseGrade>> {
    let course = repo::get_course(conn, course_id)?;
    authz::require_course_staff(actor, &course, "view course grades")?;
    repo::list_course_grades(conn, course_id)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LetterBands {
    pub a: usize,
    pub b: usize,
    pub c: usize,
    pub d: usize,
    pub f: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseStatistics {
    pub course_id: String,
    pub total_students: usize,
    pub passing_students: usize,
    pub completed_students: usize,
    pub average: Option<Decimal>,
    pub highest: Option<Decimal>,
    pub lowest: Option<Decimal>,
    pub letter_histogram: BTreeMap<String, usize>,
    pub bands: LetterBands,
}

pub fn summarize(course_id: &str, grades: &[CourseGrade]) -> Result<CourseStatistics> {
    let mut histogram: BTreeMap<String, usize> =
        ALL_LETTERS.iter().map(|l| (l.to_string(), 0)).collect();
    let mut bands = LetterBands::default();
    for g in grades {
        *histogram.entry(g.letter_grade.clone()).or_insert(0) += 1;
        match g.letter_grade.chars().next() {
            Some('A') => bands.a += 1,
            Some('B') => bands.b += 1,
            Some('C') => bands.c += 1,
            Some('D') => bands.d += 1,
            _ => bands.f += 1,
        }
    }

    let percentages: Vec<Decimal> = grades.iter().map(|g| g.percentage).collect();

    Ok(CourseStatistics {
        course_id: course_id.to_string(),
        total_students: grades.len(),
        passing_students: grades.iter().filter(|g| g.passing).count(),
        completed_students: grades.iter().filter(|g| g.complete).count(),
        average: calc::average(&percentages)?,
        highest: percentages.iter().copied().max(),
        lowest: percentages.iter().copied().min(),
        letter_histogram: histogram,
        bands,
    })
}

pub fn course_statistics(conn: &Connection, actor: &Actor, course_id: &str) -> Result<CourseStatistics> {
    let grades = list_course_grades(conn, actor, course_id)?;
    summarize(course_id, &grades)
}

/// Course grades below `threshold`, lowest first.
pub fn students_needing_attention(
    conn: &Connection,
    actor: &Actor,
    course_id: &str,
    threshold: Decimal,
) -> Result<Vec<CourseGrade>> {
    let mut below: Vec<CourseGrade> = list_course_grades(conn, actor, course_id)?
        .into_iter()
        .filter(|g| g.percentage < threshold)
        .collect();
    below.sort_by(|a, b| {
        a.percentage
            .cmp(&b.percentage)
            .then_with(|| a.learner_id.cmp(&b.learner_id))
    });
    Ok(below)
}
