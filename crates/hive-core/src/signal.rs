//! Signal files: advisory completion notices for polling workers.
//!
//! Layout:
//!   .hive-workers/signals/merge-<plan_id>.result.json  # one per finished plan
//!   .hive-workers/signals/dev-head.json                # last merged dev head
//!
//! Signals are keyed by plan id so a worker that only knows its own plan can
//! poll without learning the queue entry id. They are written without the
//! queue lock; a missing or unreadable signal means "not known yet".

use crate::error::Result;
use crate::io;
use crate::paths;
use crate::queue::MergeStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSignal {
    pub plan_id: String,
    pub status: MergeStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub merge_sha: Option<String>,
    #[serde(default)]
    pub pr_number: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevHeadSignal {
    pub sha: String,
    pub updated_at: DateTime<Utc>,
    /// Plan id of the merge that moved the head.
    pub last_merged: String,
}

/// Merge metadata carried by a per-plan signal.
#[derive(Debug, Clone, Default)]
pub struct SignalDetails {
    pub error: Option<String>,
    pub merge_sha: Option<String>,
    pub pr_number: Option<u64>,
}

pub fn write_merge_signal(
    root: &Path,
    plan_id: &str,
    status: MergeStatus,
    details: SignalDetails,
) -> Result<()> {
    let signal = MergeSignal {
        plan_id: plan_id.to_string(),
        status,
        error: details.error,
        merge_sha: details.merge_sha,
        pr_number: details.pr_number,
        timestamp: Utc::now(),
    };
    let data = serde_json::to_string_pretty(&signal)?;
    io::atomic_write(&paths::merge_signal_path(root, plan_id), data.as_bytes())
}

pub fn write_dev_head_signal(root: &Path, sha: &str, last_merged: &str) -> Result<()> {
    let signal = DevHeadSignal {
        sha: sha.to_string(),
        updated_at: Utc::now(),
        last_merged: last_merged.to_string(),
    };
    let data = serde_json::to_string_pretty(&signal)?;
    io::atomic_write(&paths::dev_head_signal_path(root), data.as_bytes())
}

pub fn read_merge_signal(root: &Path, plan_id: &str) -> Option<MergeSignal> {
    read_signal(&paths::merge_signal_path(root, plan_id))
}

pub fn read_dev_head_signal(root: &Path) -> Option<DevHeadSignal> {
    read_signal(&paths::dev_head_signal_path(root))
}

/// Delete a plan's signal. Returns whether a file was removed.
pub fn remove_merge_signal(root: &Path, plan_id: &str) -> Result<bool> {
    io::remove_if_exists(&paths::merge_signal_path(root, plan_id))
}

fn read_signal<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match io::read_json(path) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "unreadable signal file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn merge_signal_roundtrip() {
        let dir = TempDir::new().unwrap();
        write_merge_signal(
            dir.path(),
            "03-02",
            MergeStatus::Conflict,
            SignalDetails {
                error: Some("src/lib.rs conflicts".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let signal = read_merge_signal(dir.path(), "03-02").unwrap();
        assert_eq!(signal.plan_id, "03-02");
        assert_eq!(signal.status, MergeStatus::Conflict);
        assert_eq!(signal.error.as_deref(), Some("src/lib.rs conflicts"));
        assert!(signal.merge_sha.is_none());
    }

    #[test]
    fn merge_signal_on_disk_shape() {
        let dir = TempDir::new().unwrap();
        write_merge_signal(
            dir.path(),
            "01-01",
            MergeStatus::Merged,
            SignalDetails {
                merge_sha: Some("abc123".to_string()),
                pr_number: Some(7),
                ..Default::default()
            },
        )
        .unwrap();
        let raw = std::fs::read_to_string(paths::merge_signal_path(dir.path(), "01-01")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["status"], "merged");
        assert_eq!(value["merge_sha"], "abc123");
        assert_eq!(value["pr_number"], 7);
        assert!(value["error"].is_null());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn dev_head_signal_is_overwritten() {
        let dir = TempDir::new().unwrap();
        write_dev_head_signal(dir.path(), "aaa", "01-01").unwrap();
        write_dev_head_signal(dir.path(), "bbb", "01-02").unwrap();
        let head = read_dev_head_signal(dir.path()).unwrap();
        assert_eq!(head.sha, "bbb");
        assert_eq!(head.last_merged, "01-02");
    }

    #[test]
    fn absent_or_corrupt_signals_read_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_merge_signal(dir.path(), "09-09").is_none());
        assert!(read_dev_head_signal(dir.path()).is_none());

        let path = paths::dev_head_signal_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();
        assert!(read_dev_head_signal(dir.path()).is_none());
    }

    #[test]
    fn remove_merge_signal_is_best_effort() {
        let dir = TempDir::new().unwrap();
        assert!(!remove_merge_signal(dir.path(), "02-01").unwrap());
        write_merge_signal(
            dir.path(),
            "02-01",
            MergeStatus::BuildFailed,
            SignalDetails::default(),
        )
        .unwrap();
        assert!(remove_merge_signal(dir.path(), "02-01").unwrap());
        assert!(read_merge_signal(dir.path(), "02-01").is_none());
    }
}
