use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::DaemonConfig;
use crate::db;
use crate::recompute::RecalcSettings;
use crate::signal::{CompletionSink, OutboxSink};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub config: DaemonConfig,
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub sink: Option<Arc<dyn CompletionSink>>,
}

impl AppState {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            workspace: None,
            db: None,
            sink: None,
        }
    }

    /// Opens `path` as the active workspace. Completion signals go to the
    /// workspace's outbox table.
    pub fn open_workspace(&mut self, path: &Path) -> anyhow::Result<()> {
        let conn = db::open_db(path, self.config.busy_timeout)?;
        let sink = OutboxSink::new(db::db_path(path), self.config.busy_timeout);
        self.workspace = Some(path.to_path_buf());
        self.db = Some(conn);
        self.sink = Some(Arc::new(sink));
        Ok(())
    }
}

/// Borrowed view of an open workspace, split so handlers can hold the
/// connection mutably while reading the sink.
pub struct Session<'a> {
    pub conn: &'a mut Connection,
    pub sink: &'a dyn CompletionSink,
    pub recalc: RecalcSettings,
}

impl AppState {
    pub fn session(&mut self) -> Option<Session<'_>> {
        let AppState {
            config,
            workspace,
            db,
            sink,
        } = self;
        let (Some(ws), Some(conn), Some(sink)) = (workspace.as_ref(), db.as_mut(), sink.as_deref())
        else {
            return None;
        };
        Some(Session {
            conn,
            sink,
            recalc: RecalcSettings {
                db_path: db::db_path(ws),
                threads: config.recalc_threads,
                busy_timeout: config.busy_timeout,
            },
        })
    }
}
