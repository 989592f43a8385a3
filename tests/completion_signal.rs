use chrono::{Duration, Utc};
use gradebookd::catalog::{self, EnrollmentInput};
use gradebookd::db;
use gradebookd::grading::{self, GradeInput};
use gradebookd::model::{Actor, Assignment, Course, Role, SubmissionContent, SubmissionFormat};
use gradebookd::signal::{self, CompletionSignal, CompletionSink, MemorySink};
use gradebookd::submission;
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::time::Duration as StdDuration;

struct FailingSink;

impl CompletionSink for FailingSink {
    fn deliver(&self, _signal: &CompletionSignal) -> anyhow::Result<()> {
        anyhow::bail!("certificate pipeline unreachable")
    }
}

fn admin() -> Actor {
    Actor::new("root", Role::Admin)
}

fn learner() -> Actor {
    Actor::new("ann", Role::Learner)
}

fn setup(dir: &tempfile::TempDir, sink: &dyn CompletionSink) -> Connection {
    let mut conn = db::open_db(dir.path(), StdDuration::from_secs(5)).expect("open db");
    catalog::upsert_course(
        &conn,
        &admin(),
        &Course {
            id: "c1".into(),
            title: "Physics".into(),
            instructor_id: "prof".into(),
        },
    )
    .expect("course");
    catalog::upsert_enrollment(
        &mut conn,
        sink,
        &admin(),
        EnrollmentInput {
            enrollment_id: Some("enr-ann".into()),
            course_id: "c1".into(),
            learner_id: "ann".into(),
            progress: Decimal::from(50),
        },
        Utc::now(),
    )
    .expect("enrollment");
    for id in ["a1", "a2"] {
        catalog::upsert_assignment(
            &conn,
            &admin(),
            &Assignment {
                id: id.into(),
                course_id: "c1".into(),
                category_id: None,
                title: id.into(),
                max_points: Decimal::from(100),
                due_date: None,
                available_from: None,
                available_until: None,
                allow_late: false,
                late_penalty_percentage: None,
                max_attempts: None,
                submission_format: SubmissionFormat::Text,
            },
        )
        .expect("assignment");
    }
    conn
}

fn submit_and_grade(
    conn: &mut Connection,
    sink: &dyn CompletionSink,
    assignment_id: &str,
    points: i64,
) -> grading::GradeOutcome {
    let sub = submission::submit(
        conn,
        &learner(),
        assignment_id,
        "ann",
        SubmissionContent {
            text: Some("answer".into()),
            file_ref: None,
        },
        Utc::now(),
    )
    .expect("submit");
    grading::grade_submission(
        conn,
        sink,
        &admin(),
        &sub.id,
        GradeInput {
            points_earned: Decimal::from(points),
            feedback: None,
            excused: false,
        },
        Utc::now(),
    )
    .expect("grade")
}

fn set_progress(conn: &mut Connection, sink: &dyn CompletionSink, progress: i64) {
    catalog::upsert_enrollment(
        conn,
        sink,
        &admin(),
        EnrollmentInput {
            enrollment_id: None,
            course_id: "c1".into(),
            learner_id: "ann".into(),
            progress: Decimal::from(progress),
        },
        Utc::now(),
    )
    .expect("progress");
}

#[test]
fn completion_fires_once_and_keeps_first_timestamp() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sink = MemorySink::new();
    let mut conn = setup(&dir, &sink);

    let first = submit_and_grade(&mut conn, &sink, "a1", 88);
    let cg = first.course_grade.expect("course grade");
    assert!(!cg.complete);
    assert!(sink.delivered().is_empty());

    set_progress(&mut conn, &sink, 100);
    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].enrollment_id, "enr-ann");
    assert_eq!(delivered[0].learner_id, "ann");
    assert_eq!(delivered[0].course_id, "c1");

    let stored = gradebookd::repo::find_course_grade(&conn, "c1", "ann")
        .expect("query")
        .expect("course grade");
    assert!(stored.complete);
    let stamped = stored.completion_date.expect("completion date");
    assert_eq!(stamped, delivered[0].completed_at);

    // A later, unrelated grade moves the percentage but not the completion.
    std::thread::sleep(std::time::Duration::from_millis(5));
    let later = submit_and_grade(&mut conn, &sink, "a2", 60);
    let cg = later.course_grade.expect("course grade");
    assert_eq!(cg.percentage, Decimal::from(74));
    assert!(cg.complete);
    assert_eq!(cg.completion_date, Some(stamped));
    assert!(cg.last_calculated > stamped);
    assert_eq!(sink.delivered().len(), 1);

    // Reporting full progress again changes nothing either.
    set_progress(&mut conn, &sink, 100);
    assert_eq!(sink.delivered().len(), 1);
}

#[test]
fn failing_sink_does_not_undo_the_course_grade() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sink = FailingSink;
    let mut conn = setup(&dir, &sink);

    submit_and_grade(&mut conn, &sink, "a1", 91);
    set_progress(&mut conn, &sink, 100);

    let stored = gradebookd::repo::find_course_grade(&conn, "c1", "ann")
        .expect("query")
        .expect("course grade");
    assert!(stored.complete);
    assert!(stored.completion_date.is_some());
    assert_eq!(stored.letter_grade, "A-");

    // The failed delivery is not retried by later recomputes.
    let recording = MemorySink::new();
    submit_and_grade(&mut conn, &recording, "a2", 95);
    assert!(recording.delivered().is_empty());
}

#[test]
fn outbox_sink_records_one_row_per_completion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sink = signal::OutboxSink::new(db::db_path(dir.path()), StdDuration::from_secs(5));
    let mut conn = setup(&dir, &sink);

    submit_and_grade(&mut conn, &sink, "a1", 70);
    set_progress(&mut conn, &sink, 100);
    set_progress(&mut conn, &sink, 100);
    submit_and_grade(&mut conn, &sink, "a2", 90);

    let rows = signal::list_outbox(&conn, Some("c1")).expect("outbox");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].signal.enrollment_id, "enr-ann");
    assert!(rows[0].signal.completed_at <= Utc::now() + Duration::seconds(1));
}
