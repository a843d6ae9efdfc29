use crate::error::{HiveError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const PLANNING_DIR: &str = ".planning";
pub const CONFIG_FILE: &str = ".planning/config.json";

pub const WORKERS_DIR: &str = ".hive-workers";
pub const SIGNALS_DIR: &str = ".hive-workers/signals";
pub const MERGE_QUEUE_FILE: &str = ".hive-workers/merge-queue.json";
pub const DEV_HEAD_SIGNAL: &str = "dev-head.json";

/// Line added to `.gitignore` so worker state is never committed.
pub const WORKERS_GITIGNORE_ENTRY: &str = ".hive-workers/";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn workers_dir(root: &Path) -> PathBuf {
    root.join(WORKERS_DIR)
}

pub fn signals_dir(root: &Path) -> PathBuf {
    root.join(SIGNALS_DIR)
}

pub fn merge_queue_path(root: &Path) -> PathBuf {
    root.join(MERGE_QUEUE_FILE)
}

pub fn merge_signal_path(root: &Path, plan_id: &str) -> PathBuf {
    signals_dir(root).join(format!("merge-{plan_id}.result.json"))
}

pub fn dev_head_signal_path(root: &Path) -> PathBuf {
    signals_dir(root).join(DEV_HEAD_SIGNAL)
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

static PLAN_ID_RE: OnceLock<Regex> = OnceLock::new();

fn plan_id_re() -> &'static Regex {
    PLAN_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*$").unwrap())
}

/// Plan ids become part of signal file names, so keep them path-safe.
pub fn validate_plan_id(plan_id: &str) -> Result<()> {
    if plan_id.is_empty()
        || plan_id.len() > 64
        || plan_id.contains("..")
        || !plan_id_re().is_match(plan_id)
    {
        return Err(HiveError::InvalidPlanId(plan_id.to_string()));
    }
    Ok(())
}

pub fn validate_branch(branch: &str) -> Result<()> {
    let bad = branch.is_empty()
        || branch.starts_with('-')
        || branch.chars().any(|c| c.is_whitespace() || c.is_control());
    if bad {
        return Err(HiveError::InvalidBranch(branch.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
