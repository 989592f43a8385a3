//! Keeps stored course grades in step with the grades and categories they
//! are derived from.
//!
//! Every recompute runs in its own IMMEDIATE transaction covering exactly one
//! (course, learner) row, so concurrent grading of different learners never
//! serializes on anything but SQLite's write lock, and two recomputes of the
//! same learner cannot interleave their read and write. Completion signals
//! are delivered only after the transaction commits.

use crate::authz;
use crate::db;
use crate::error::Result;
use crate::finalize::{self, Finalized};
use crate::model::{Actor, CourseGrade};
use crate::repo;
use crate::signal::{CompletionSignal, CompletionSink};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub fn deliver_signal(sink: &dyn CompletionSink, signal: &CompletionSignal) {
    match sink.deliver(signal) {
        Ok(()) => info!(
            enrollment_id = %signal.enrollment_id,
            course_id = %signal.course_id,
            learner_id = %signal.learner_id,
            "course completion signalled"
        ),
        Err(e) => error!(
            enrollment_id = %signal.enrollment_id,
            error = %e,
            "completion signal delivery failed; course grade kept"
        ),
    }
}

/// Recomputes one learner's course grade and delivers the completion signal
/// if this run completed the course.
pub fn recompute_learner(
    conn: &mut Connection,
    sink: &dyn CompletionSink,
    course_id: &str,
    learner_id: &str,
    now: DateTime<Utc>,
) -> Result<CourseGrade> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let Finalized {
        course_grade,
        newly_completed,
        ..
    } = finalize::finalize_course_grade(&tx, course_id, learner_id, now)?;
    tx.commit()?;

    debug!(
        course_id,
        learner_id,
        percentage = %course_grade.percentage,
        letter = %course_grade.letter_grade,
        "course grade recomputed"
    );
    if let Some(signal) = newly_completed {
        deliver_signal(sink, &signal);
    }
    Ok(course_grade)
}

/// Where and how wide bulk recalculation runs.
#[derive(Debug, Clone)]
pub struct RecalcSettings {
    pub db_path: PathBuf,
    pub threads: usize,
    pub busy_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerFailure {
    pub learner_id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalcReport {
    pub course_id: String,
    pub recalculated: usize,
    pub failed: Vec<LearnerFailure>,
}

fn recompute_on_own_connection(
    settings: &RecalcSettings,
    sink: &dyn CompletionSink,
    course_id: &str,
    learner_id: &str,
    now: DateTime<Utc>,
) -> std::result::Result<CourseGrade, LearnerFailure> {
    let fail = |code: &str, message: String| LearnerFailure {
        learner_id: learner_id.to_string(),
        code: code.to_string(),
        message,
    };
    let mut conn = db::connect(&settings.db_path, settings.busy_timeout)
        .map_err(|e| fail("db_open_failed", e.to_string()))?;
    recompute_learner(&mut conn, sink, course_id, learner_id, now)
        .map_err(|e| fail(e.code(), e.to_string()))
}

/// Recomputes every enrolled learner of a course in parallel. One learner
/// failing does not stop the others; failures are collected in the report.
pub fn recalculate_course(
    conn: &Connection,
    settings: &RecalcSettings,
    sink: &dyn CompletionSink,
    course_id: &str,
    now: DateTime<Utc>,
) -> Result<RecalcReport> {
    repo::get_course(conn, course_id)?;
    let learners: Vec<String> = repo::list_enrollments(conn, course_id)?
        .into_iter()
        .map(|e| e.learner_id)
        .collect();

    let run = || -> Vec<std::result::Result<CourseGrade, LearnerFailure>> {
        learners
            .par_iter()
            .map(|learner_id| recompute_on_own_connection(settings, sink, course_id, learner_id, now))
            .collect()
    };

    let results = match rayon::ThreadPoolBuilder::new()
        .num_threads(settings.threads.max(1))
        .build()
    {
        Ok(pool) => pool.install(run),
        Err(e) => {
            warn!(error = %e, "recalc thread pool unavailable; using global pool");
            run()
        }
    };

    let mut recalculated = 0;
    let mut failed = Vec::new();
    for r in results {
        match r {
            Ok(_) => recalculated += 1,
            Err(f) => {
                warn!(course_id, learner_id = %f.learner_id, error = %f.message, "learner recalc failed");
                failed.push(f);
            }
        }
    }

    info!(
        course_id,
        recalculated,
        failed = failed.len(),
        "course grades recalculated"
    );
    Ok(RecalcReport {
        course_id: course_id.to_string(),
        recalculated,
        failed,
    })
}

/// Staff-triggered full recalculation of a course.
pub fn recalculate_course_as(
    conn: &Connection,
    settings: &RecalcSettings,
    sink: &dyn CompletionSink,
    actor: &Actor,
    course_id: &str,
    now: DateTime<Utc>,
) -> Result<RecalcReport> {
    let course = repo::get_course(conn, course_id)?;
    authz::require_course_staff(actor, &course, "recalculate course grades")?;
    recalculate_course(conn, settings, sink, course_id, now)
}
