use crate::db;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Emitted once per enrollment, when the course grade first becomes complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSignal {
    pub enrollment_id: String,
    pub learner_id: String,
    pub course_id: String,
    pub completed_at: DateTime<Utc>,
}

/// Receiver of completion signals. Delivery happens after the course grade
/// has been committed; an error here is logged by the caller and never undoes
/// the grade.
pub trait CompletionSink: Send + Sync {
    fn deliver(&self, signal: &CompletionSignal) -> anyhow::Result<()>;
}

/// Writes signals to the `completion_outbox` table of the workspace database.
/// Uses its own connection so delivery never runs inside the grading
/// transaction.
#[derive(Debug, Clone)]
pub struct OutboxSink {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl OutboxSink {
    pub fn new(db_path: PathBuf, busy_timeout: Duration) -> Self {
        Self {
            db_path,
            busy_timeout,
        }
    }
}

impl CompletionSink for OutboxSink {
    fn deliver(&self, signal: &CompletionSignal) -> anyhow::Result<()> {
        let conn = db::connect(&self.db_path, self.busy_timeout)?;
        conn.execute(
            "INSERT INTO completion_outbox(id, enrollment_id, learner_id, course_id, completed_at, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                &signal.enrollment_id,
                &signal.learner_id,
                &signal.course_id,
                signal.completed_at,
                Utc::now(),
            ],
        )?;
        Ok(())
    }
}

/// Keeps delivered signals in memory. Handy for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<CompletionSignal>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<CompletionSignal> {
        match self.delivered.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CompletionSink for MemorySink {
    fn deliver(&self, signal: &CompletionSignal) -> anyhow::Result<()> {
        let mut guard = self
            .delivered
            .lock()
            .map_err(|_| anyhow::anyhow!("completion sink lock poisoned"))?;
        guard.push(signal.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: String,
    #[serde(flatten)]
    pub signal: CompletionSignal,
    pub created_at: DateTime<Utc>,
}

pub fn list_outbox(conn: &Connection, course_id: Option<&str>) -> Result<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, enrollment_id, learner_id, course_id, completed_at, created_at
         FROM completion_outbox
         WHERE (?1 IS NULL OR course_id = ?1)
         ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map([course_id], |r| {
            Ok(OutboxEntry {
                id: r.get(0)?,
                signal: CompletionSignal {
                    enrollment_id: r.get(1)?,
                    learner_id: r.get(2)?,
                    course_id: r.get(3)?,
                    completed_at: r.get(4)?,
                },
                created_at: r.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
