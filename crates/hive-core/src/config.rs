use crate::error::Result;
use crate::lock::LockOptions;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// `git.flow` value that turns the merge queue off.
pub const GIT_FLOW_NONE: &str = "none";

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_seconds: u64,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay_ms: u64,
    #[serde(default = "default_lock_stale")]
    pub lock_stale_ms: u64,
}

fn default_lease_ttl() -> u64 {
    300
}

fn default_lock_retries() -> u32 {
    50
}

fn default_lock_retry_delay() -> u64 {
    100
}

fn default_lock_stale() -> u64 {
    10_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: default_lease_ttl(),
            lock_retries: default_lock_retries(),
            lock_retry_delay_ms: default_lock_retry_delay(),
            lock_stale_ms: default_lock_stale(),
        }
    }
}

impl QueueConfig {
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            retries: self.lock_retries,
            retry_delay: Duration::from_millis(self.lock_retry_delay_ms),
            stale_after: Duration::from_millis(self.lock_stale_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// GitConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitConfig {
    /// `github`, `local`, or `none`. Anything but `none` enables the queue.
    #[serde(default = "default_flow")]
    pub flow: String,
    #[serde(default = "default_dev_branch")]
    pub dev_branch: String,
    #[serde(default = "default_merge_strategy")]
    pub merge_strategy: String,
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_flow() -> String {
    "github".to_string()
}

fn default_dev_branch() -> String {
    "dev".to_string()
}

fn default_merge_strategy() -> String {
    "merge".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            flow: default_flow(),
            dev_branch: default_dev_branch(),
            merge_strategy: default_merge_strategy(),
            queue: QueueConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub git: GitConfig,
}

impl Config {
    /// Load `.planning/config.json`.
    ///
    /// Never fails: a missing file means defaults, and an unreadable one is
    /// logged and replaced by defaults so the queue gate always has an answer.
    pub fn load(root: &Path) -> Self {
        let path = paths::config_path(root);
        match crate::io::read_json::<Config>(&path) {
            Ok(Some(cfg)) => cfg,
            Ok(None) => Config::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config");
                Config::default()
            }
        }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_json::to_string_pretty(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn queue_enabled(&self) -> bool {
        self.git.flow != GIT_FLOW_NONE
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
