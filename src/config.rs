use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Workspace opened before the first request, if any.
    pub workspace: Option<PathBuf>,
    pub recalc_threads: usize,
    pub busy_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            workspace: None,
            recalc_threads: default_threads(),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Unset and blank values fall
    /// back to defaults; malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        cfg.workspace = get("GRADEBOOKD_WORKSPACE").map(PathBuf::from);

        if let Some(raw) = get("GRADEBOOKD_RECALC_THREADS") {
            let n: usize = raw
                .parse()
                .with_context(|| format!("GRADEBOOKD_RECALC_THREADS is not a number: {raw}"))?;
            cfg.recalc_threads = n.max(1);
        }

        if let Some(raw) = get("GRADEBOOKD_BUSY_TIMEOUT_MS") {
            let ms: u64 = raw
                .parse()
                .with_context(|| format!("GRADEBOOKD_BUSY_TIMEOUT_MS is not a number: {raw}"))?;
            cfg.busy_timeout = Duration::from_millis(ms);
        }

        Ok(cfg)
    }
}
