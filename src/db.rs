use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE_NAME)
}

/// Opens (creating if needed) the workspace database and brings its schema up
/// to date.
pub fn open_db(workspace: &Path, busy_timeout: Duration) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = connect(&db_path(workspace), busy_timeout)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            instructor_id TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            learner_id TEXT NOT NULL,
            progress_percentage TEXT NOT NULL DEFAULT '0',
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, learner_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_course ON enrollments(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS gradebook_categories(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight TEXT NOT NULL DEFAULT '0',
            drop_lowest INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            position INTEGER NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_categories_course ON gradebook_categories(course_id, position)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            category_id TEXT,
            title TEXT NOT NULL,
            max_points TEXT NOT NULL,
            due_date TEXT,
            available_from TEXT,
            available_until TEXT,
            allow_late INTEGER NOT NULL DEFAULT 0,
            late_penalty_percentage TEXT,
            max_attempts INTEGER,
            submission_format TEXT NOT NULL DEFAULT 'text',
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(category_id) REFERENCES gradebook_categories(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_course ON assignments(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_category ON assignments(category_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            learner_id TEXT NOT NULL,
            attempt_number INTEGER NOT NULL,
            submitted_at TEXT NOT NULL,
            is_late INTEGER NOT NULL,
            status TEXT NOT NULL,
            content_text TEXT,
            content_file TEXT,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            UNIQUE(assignment_id, learner_id, attempt_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_assignment_learner ON submissions(assignment_id, learner_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            submission_id TEXT NOT NULL UNIQUE,
            assignment_id TEXT NOT NULL,
            learner_id TEXT NOT NULL,
            grader_id TEXT NOT NULL,
            points_earned TEXT NOT NULL,
            points_possible TEXT NOT NULL,
            percentage TEXT NOT NULL,
            letter_grade TEXT NOT NULL,
            late_penalty_applied TEXT NOT NULL DEFAULT '0',
            is_late INTEGER NOT NULL DEFAULT 0,
            excused INTEGER NOT NULL DEFAULT 0,
            feedback TEXT,
            released INTEGER NOT NULL DEFAULT 0,
            released_at TEXT,
            graded_at TEXT NOT NULL,
            FOREIGN KEY(submission_id) REFERENCES submissions(id),
            FOREIGN KEY(assignment_id) REFERENCES assignments(id)
        )",
        [],
    )?;
    ensure_grades_revision(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_assignment ON grades(assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_learner ON grades(learner_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_revisions(
            grade_id TEXT NOT NULL,
            revision INTEGER NOT NULL,
            grader_id TEXT NOT NULL,
            raw_points TEXT NOT NULL,
            late_penalty_applied TEXT NOT NULL,
            points_earned TEXT NOT NULL,
            percentage TEXT NOT NULL,
            excused INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY(grade_id, revision),
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_grades(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            learner_id TEXT NOT NULL,
            percentage TEXT NOT NULL,
            letter_grade TEXT NOT NULL,
            grade_points TEXT NOT NULL,
            passing INTEGER NOT NULL,
            complete INTEGER NOT NULL DEFAULT 0,
            completion_date TEXT,
            last_calculated TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, learner_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_grades_course ON course_grades(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS completion_outbox(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            learner_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            completed_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_completion_outbox_course ON completion_outbox(course_id)",
        [],
    )?;

    Ok(conn)
}

/// Opens a connection to an existing database file with the pragmas every
/// writer relies on. Bulk recalculation workers use this directly.
pub fn connect(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get::<_, String>(0))?;
    Ok(conn)
}

fn ensure_grades_revision(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before revision tracking start every grade at 1.
    if table_has_column(conn, "grades", "revision")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE grades ADD COLUMN revision INTEGER NOT NULL DEFAULT 1",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_db_is_idempotent_and_migrates_revision_column() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open_db(dir.path(), Duration::from_millis(500)).expect("first open");
        assert!(table_has_column(&conn, "grades", "revision").expect("pragma"));
        drop(conn);

        let conn = open_db(dir.path(), Duration::from_millis(500)).expect("second open");
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('courses','enrollments','gradebook_categories','assignments',
                              'submissions','grades','grade_revisions','course_grades',
                              'completion_outbox')",
                [],
                |r| r.get(0),
            )
            .expect("count tables");
        assert_eq!(tables, 9);
    }
}
