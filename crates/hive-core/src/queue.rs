//! Merge queue. Serializes plan-branch merges across worker processes.
//!
//! Layout:
//!   .hive-workers/merge-queue.json   # the queue document
//!
//! Every mutation loads the document under the directory lock, changes it,
//! and persists it with `atomic_write` before the lock is released. Status
//! reads skip the lock; the atomic rename means they only ever see a whole
//! document.
//!
//! Entry lifecycle:
//!
//! ```text
//! pending -> checking -> building -> merging -> merged
//!            checking -> conflict
//!                        building -> build_failed
//!                                    merging -> merge_failed
//! ```
//!
//! `merged` entries leave `queue` immediately and are kept in the bounded
//! `merged` history. Failed entries stay in `queue` until `drain`.

use crate::config::{Config, QueueConfig};
use crate::error::{HiveError, Result};
use crate::io;
use crate::lock;
use crate::paths;
use crate::signal::{self, SignalDetails};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Maximum number of records kept in the `merged` history.
pub const MERGED_HISTORY_CAP: usize = 50;

const ID_PREFIX: &str = "mr-";

// ---------------------------------------------------------------------------
// MergeStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    Checking,
    Building,
    Merging,
    Merged,
    Conflict,
    BuildFailed,
    MergeFailed,
}

impl MergeStatus {
    pub fn all() -> &'static [MergeStatus] {
        &[
            MergeStatus::Pending,
            MergeStatus::Checking,
            MergeStatus::Building,
            MergeStatus::Merging,
            MergeStatus::Merged,
            MergeStatus::Conflict,
            MergeStatus::BuildFailed,
            MergeStatus::MergeFailed,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MergeStatus::Pending => "pending",
            MergeStatus::Checking => "checking",
            MergeStatus::Building => "building",
            MergeStatus::Merging => "merging",
            MergeStatus::Merged => "merged",
            MergeStatus::Conflict => "conflict",
            MergeStatus::BuildFailed => "build_failed",
            MergeStatus::MergeFailed => "merge_failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MergeStatus::Merged
                | MergeStatus::Conflict
                | MergeStatus::BuildFailed
                | MergeStatus::MergeFailed
        )
    }

    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            MergeStatus::Checking | MergeStatus::Building | MergeStatus::Merging
        )
    }

    pub fn is_failure(self) -> bool {
        self.is_terminal() && self != MergeStatus::Merged
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MergeStatus {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        MergeStatus::all()
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| HiveError::InvalidStatus(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckResult {
    Pass,
    Fail,
}

impl std::str::FromStr for CheckResult {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pass" => Ok(CheckResult::Pass),
            "fail" => Ok(CheckResult::Fail),
            _ => Err(HiveError::InvalidCheck(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checks {
    #[serde(default)]
    pub conflicts: Option<CheckResult>,
    #[serde(default)]
    pub build: Option<CheckResult>,
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Ownership claim on an entry. On disk it is the `lease_owner` /
/// `lease_expires_at` pair, which is either fully set or fully null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

mod lease_fields {
    use super::Lease;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize)]
    struct Fields<'a> {
        lease_owner: Option<&'a str>,
        lease_expires_at: Option<DateTime<Utc>>,
    }

    #[derive(Deserialize)]
    struct OwnedFields {
        #[serde(default)]
        lease_owner: Option<String>,
        #[serde(default)]
        lease_expires_at: Option<DateTime<Utc>>,
    }

    pub fn serialize<S: Serializer>(lease: &Option<Lease>, s: S) -> Result<S::Ok, S::Error> {
        Fields {
            lease_owner: lease.as_ref().map(|l| l.owner.as_str()),
            lease_expires_at: lease.as_ref().map(|l| l.expires_at),
        }
        .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Lease>, D::Error> {
        let fields = OwnedFields::deserialize(d)?;
        // A half-set pair cannot express a lease; read it as no lease.
        Ok(match (fields.lease_owner, fields.lease_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: String,
    pub plan_id: String,
    pub phase: String,
    pub plan: String,
    pub branch: String,
    #[serde(default = "default_wave")]
    pub wave: u32,
    pub status: MergeStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub checks: Checks,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten, with = "lease_fields")]
    pub lease: Option<Lease>,
    #[serde(default)]
    pub merge_strategy: Option<String>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merge_sha: Option<String>,
}

fn default_wave() -> u32 {
    1
}

/// Compact audit record of a finished merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub id: String,
    pub plan_id: String,
    pub branch: String,
    pub merged_at: DateTime<Utc>,
    #[serde(default)]
    pub merge_sha: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueDocument {
    #[serde(default)]
    pub queue: Vec<MergeRequest>,
    #[serde(default)]
    pub merged: Vec<MergedRecord>,
    #[serde(default)]
    pub dev_head: Option<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// Highest entry number ever issued.
    #[serde(default)]
    pub seq: u64,
}

impl QueueDocument {
    /// Load for a read-modify-write cycle. Missing or corrupt documents start
    /// over empty; a corrupt one is copied aside first.
    fn load_for_update(path: &Path) -> Result<Self> {
        match io::read_json::<QueueDocument>(path) {
            Ok(doc) => Ok(doc.unwrap_or_default()),
            Err(HiveError::Json(e)) => {
                let backup = path.with_extension("json.corrupt");
                match std::fs::copy(path, &backup) {
                    Ok(_) => tracing::warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        error = %e,
                        "merge queue document is corrupt; starting from an empty queue"
                    ),
                    Err(copy_err) => tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        backup_error = %copy_err,
                        "merge queue document is corrupt and could not be backed up; starting from an empty queue"
                    ),
                }
                Ok(QueueDocument::default())
            }
            Err(e) => Err(e),
        }
    }

    fn save(&mut self, path: &Path, now: DateTime<Utc>) -> Result<()> {
        self.last_updated = Some(now);
        let data = serde_json::to_string_pretty(self)?;
        io::atomic_write(path, data.as_bytes())
    }

    /// Allocate the next `mr-NNN` id. Numbers are never reused, even after
    /// drained or evicted entries leave the document.
    fn allocate_id(&mut self) -> String {
        let highest_seen = self
            .queue
            .iter()
            .map(|e| e.id.as_str())
            .chain(self.merged.iter().map(|m| m.id.as_str()))
            .filter_map(parse_id)
            .max()
            .unwrap_or(0);
        let counted = (self.queue.len() + self.merged.len()) as u64;
        let n = self.seq.max(counted).max(highest_seen) + 1;
        self.seq = n;
        format!("{ID_PREFIX}{n:03}")
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.queue.iter().position(|e| e.id == id)
    }

    fn record_merged(&mut self, record: MergedRecord) {
        self.merged.push(record);
        if self.merged.len() > MERGED_HISTORY_CAP {
            let excess = self.merged.len() - MERGED_HISTORY_CAP;
            self.merged.drain(..excess);
        }
    }
}

fn parse_id(id: &str) -> Option<u64> {
    id.strip_prefix(ID_PREFIX)?.parse().ok()
}

/// Split `03-02` into phase `03` and plan `02`. Without a separator both are
/// the whole plan id.
pub fn split_plan_id(plan_id: &str) -> (String, String) {
    match plan_id.split_once('-') {
        Some((phase, plan)) if !phase.is_empty() && !plan.is_empty() => {
            (phase.to_string(), plan.to_string())
        }
        _ => (plan_id.to_string(), plan_id.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// Result of an operation that may be switched off by configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Gated<T> {
    Skipped { reason: &'static str },
    Ran(T),
}

impl<T> Gated<T> {
    pub fn ran(self) -> Option<T> {
        match self {
            Gated::Ran(value) => Some(value),
            Gated::Skipped { .. } => None,
        }
    }
}

pub const SKIP_REASON: &str = "git.flow is none";

#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub plan_id: String,
    pub branch: String,
    pub wave: Option<u32>,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub merge_strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub status: Option<MergeStatus>,
    pub error: Option<String>,
    pub merge_sha: Option<String>,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub lease_owner: Option<String>,
    /// Lease length; the configured default applies when `None`.
    pub lease_ttl_seconds: Option<u64>,
    pub conflicts: Option<CheckResult>,
    pub build: Option<CheckResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Updated {
        id: String,
        status: MergeStatus,
    },
    /// The id is not in `queue`: never submitted, already merged, or drained.
    NotFound {
        id: String,
    },
    /// The entry is terminal and the request tried to move it elsewhere.
    Rejected {
        id: String,
        from: MergeStatus,
        to: MergeStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub pending_count: usize,
    pub in_progress_count: usize,
    pub failed_count: usize,
    pub merged_count: usize,
    pub leased_count: usize,
    pub stale_lease_count: usize,
    pub dev_head: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub pending: Vec<MergeRequest>,
    pub in_progress: Vec<MergeRequest>,
    pub failed: Vec<MergeRequest>,
    pub leased: Vec<MergeRequest>,
    pub stale_leases: Vec<MergeRequest>,
}

impl QueueSnapshot {
    pub fn of(doc: &QueueDocument, now: DateTime<Utc>) -> Self {
        let pending = select(doc, |e| e.status == MergeStatus::Pending);
        let in_progress = select(doc, |e| e.status.is_in_progress());
        let failed = select(doc, |e| e.status.is_failure());
        let leased = select(doc, |e| {
            e.lease.as_ref().is_some_and(|l| !l.is_expired_at(now))
        });
        let stale_leases = select(doc, |e| {
            e.lease.as_ref().is_some_and(|l| l.is_expired_at(now))
        });

        QueueSnapshot {
            pending_count: pending.len(),
            in_progress_count: in_progress.len(),
            failed_count: failed.len(),
            merged_count: doc.merged.len(),
            leased_count: leased.len(),
            stale_lease_count: stale_leases.len(),
            dev_head: doc.dev_head.clone(),
            last_updated: doc.last_updated,
            pending,
            in_progress,
            failed,
            leased,
            stale_leases,
        }
    }
}

fn select(doc: &QueueDocument, pred: impl Fn(&MergeRequest) -> bool) -> Vec<MergeRequest> {
    doc.queue.iter().filter(|e| pred(e)).cloned().collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    /// No readable queue document exists yet.
    Empty,
    Snapshot(Box<QueueSnapshot>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub drained_count: usize,
    pub remaining_count: usize,
}

// ---------------------------------------------------------------------------
// MergeQueue
// ---------------------------------------------------------------------------

/// Handle on a project's merge queue. Holds no queue state of its own; every
/// call reads the document from disk.
#[derive(Debug, Clone)]
pub struct MergeQueue {
    root: PathBuf,
    enabled: bool,
    settings: QueueConfig,
}

impl MergeQueue {
    pub fn new(root: &Path, config: &Config) -> Self {
        Self {
            root: root.to_path_buf(),
            enabled: config.queue_enabled(),
            settings: config.git.queue.clone(),
        }
    }

    /// Open with the project's `.planning/config.json`.
    pub fn open(root: &Path) -> Self {
        Self::new(root, &Config::load(root))
    }

    pub fn document_path(&self) -> PathBuf {
        paths::merge_queue_path(&self.root)
    }

    pub fn submit(&self, req: &SubmitRequest) -> Result<Gated<SubmitReceipt>> {
        if !self.enabled {
            return Ok(Gated::Skipped {
                reason: SKIP_REASON,
            });
        }
        paths::validate_plan_id(&req.plan_id)?;
        paths::validate_branch(&req.branch)?;

        io::ensure_dir(&paths::workers_dir(&self.root))?;
        io::ensure_gitignore_entry(&self.root, paths::WORKERS_GITIGNORE_ENTRY)?;

        let (receipt, _guard) = self.mutate(|doc, now| {
            let id = doc.allocate_id();
            let (phase, plan) = split_plan_id(&req.plan_id);
            doc.queue.push(MergeRequest {
                id: id.clone(),
                plan_id: req.plan_id.clone(),
                phase,
                plan,
                branch: req.branch.clone(),
                wave: req.wave.unwrap_or_else(default_wave),
                status: MergeStatus::Pending,
                submitted_at: now,
                pr_number: req.pr_number,
                pr_url: req.pr_url.clone(),
                checks: Checks::default(),
                error: None,
                lease: None,
                merge_strategy: req.merge_strategy.clone(),
                merged_at: None,
                merge_sha: None,
            });
            tracing::debug!(id = %id, plan_id = %req.plan_id, "merge request submitted");
            Ok((
                true,
                SubmitReceipt {
                    id,
                    plan_id: req.plan_id.clone(),
                },
            ))
        })?;
        Ok(Gated::Ran(receipt))
    }

    pub fn status(&self) -> Result<Gated<StatusReport>> {
        if !self.enabled {
            return Ok(Gated::Skipped {
                reason: SKIP_REASON,
            });
        }
        let path = self.document_path();
        let report = match io::read_json::<QueueDocument>(&path) {
            Ok(Some(doc)) => StatusReport::Snapshot(Box::new(QueueSnapshot::of(&doc, Utc::now()))),
            Ok(None) => StatusReport::Empty,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable merge queue");
                StatusReport::Empty
            }
        };
        Ok(Gated::Ran(report))
    }

    pub fn update(&self, id: &str, req: &UpdateRequest) -> Result<Gated<UpdateOutcome>> {
        if !self.enabled {
            return Ok(Gated::Skipped {
                reason: SKIP_REASON,
            });
        }
        io::ensure_dir(&paths::workers_dir(&self.root))?;

        let ((outcome, finished), guard) = self.mutate(|doc, now| {
            let Some(idx) = doc.position(id) else {
                return Ok((false, (UpdateOutcome::NotFound { id: id.to_string() }, None)));
            };
            let entry = &mut doc.queue[idx];

            if let Some(to) = req.status {
                if entry.status.is_terminal() && entry.status != to {
                    let rejected = UpdateOutcome::Rejected {
                        id: id.to_string(),
                        from: entry.status,
                        to,
                    };
                    return Ok((false, (rejected, None)));
                }
            }

            apply_fields(entry, req);
            if let Some(owner) = &req.lease_owner {
                let ttl = req.lease_ttl_seconds.unwrap_or(self.settings.lease_ttl_seconds);
                let expires_at = i64::try_from(ttl)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                entry.lease = Some(Lease {
                    owner: owner.clone(),
                    expires_at,
                });
            }
            if let Some(to) = req.status {
                entry.status = to;
            }
            if entry.status.is_terminal() {
                entry.lease = None;
            }

            let status = entry.status;
            let finished = req
                .status
                .is_some_and(MergeStatus::is_terminal)
                .then(|| entry.clone());

            if req.status == Some(MergeStatus::Merged) {
                let mut entry = doc.queue.remove(idx);
                let merged_at = now;
                entry.merged_at = Some(merged_at);
                doc.record_merged(MergedRecord {
                    id: entry.id.clone(),
                    plan_id: entry.plan_id.clone(),
                    branch: entry.branch.clone(),
                    merged_at,
                    merge_sha: req.merge_sha.clone(),
                });
                if let Some(sha) = &req.merge_sha {
                    doc.dev_head = Some(sha.clone());
                }
            }

            tracing::debug!(id, status = %status, "merge request updated");
            let updated = UpdateOutcome::Updated {
                id: id.to_string(),
                status,
            };
            Ok((true, (updated, finished)))
        })?;

        // Signals go out before the lock is released so a concurrent drain
        // cannot leave one behind for an entry it already removed.
        if let Some(entry) = finished {
            self.emit_signals(&entry, req.merge_sha.as_deref());
        }
        guard.release();
        Ok(Gated::Ran(outcome))
    }

    pub fn drain(&self) -> Result<Gated<DrainReport>> {
        if !self.enabled {
            return Ok(Gated::Skipped {
                reason: SKIP_REASON,
            });
        }
        io::ensure_dir(&paths::workers_dir(&self.root))?;

        let (report, _guard) = self.mutate(|doc, _now| {
            let (drained, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut doc.queue)
                .into_iter()
                .partition(|e| e.status.is_terminal());

            for entry in &drained {
                if let Err(e) = signal::remove_merge_signal(&self.root, &entry.plan_id) {
                    tracing::debug!(plan_id = %entry.plan_id, error = %e, "could not remove signal");
                }
            }

            let report = DrainReport {
                drained_count: drained.len(),
                remaining_count: remaining.len(),
            };
            doc.queue = remaining;
            tracing::debug!(
                drained = report.drained_count,
                remaining = report.remaining_count,
                "merge queue drained"
            );
            Ok((true, report))
        })?;
        Ok(Gated::Ran(report))
    }

    /// Read the completion signal for `plan_id`; `None` means not known yet.
    pub fn merge_signal(&self, plan_id: &str) -> Result<Gated<Option<signal::MergeSignal>>> {
        if !self.enabled {
            return Ok(Gated::Skipped {
                reason: SKIP_REASON,
            });
        }
        paths::validate_plan_id(plan_id)?;
        Ok(Gated::Ran(signal::read_merge_signal(&self.root, plan_id)))
    }

    pub fn dev_head_signal(&self) -> Result<Gated<Option<signal::DevHeadSignal>>> {
        if !self.enabled {
            return Ok(Gated::Skipped {
                reason: SKIP_REASON,
            });
        }
        Ok(Gated::Ran(signal::read_dev_head_signal(&self.root)))
    }

    /// Run `f` on the document under the queue lock. `f` reports whether it
    /// changed the document; a changed document is persisted before this
    /// returns. The guard is handed back so follow-up work can stay inside
    /// the critical section.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut QueueDocument, DateTime<Utc>) -> Result<(bool, T)>,
    ) -> Result<(T, lock::LockGuard)> {
        let path = self.document_path();
        let guard = lock::acquire(&path, &self.settings.lock_options())?;
        let mut doc = QueueDocument::load_for_update(&path)?;
        let now = Utc::now();
        let (changed, value) = f(&mut doc, now)?;
        if changed {
            doc.save(&path, now)?;
        }
        Ok((value, guard))
    }

    fn emit_signals(&self, entry: &MergeRequest, merge_sha: Option<&str>) {
        let details = SignalDetails {
            error: entry.error.clone(),
            merge_sha: entry.merge_sha.clone(),
            pr_number: entry.pr_number,
        };
        if let Err(e) = signal::write_merge_signal(&self.root, &entry.plan_id, entry.status, details)
        {
            tracing::warn!(plan_id = %entry.plan_id, error = %e, "could not write merge signal");
        }
        if entry.status == MergeStatus::Merged {
            if let Some(sha) = merge_sha {
                if let Err(e) = signal::write_dev_head_signal(&self.root, sha, &entry.plan_id) {
                    tracing::warn!(error = %e, "could not write dev-head signal");
                }
            }
        }
    }
}

fn apply_fields(entry: &mut MergeRequest, req: &UpdateRequest) {
    if let Some(error) = &req.error {
        entry.error = Some(error.clone());
    }
    if let Some(sha) = &req.merge_sha {
        entry.merge_sha = Some(sha.clone());
    }
    if let Some(n) = req.pr_number {
        entry.pr_number = Some(n);
    }
    if let Some(url) = &req.pr_url {
        entry.pr_url = Some(url.clone());
    }
    if let Some(result) = req.conflicts {
        entry.checks.conflicts = Some(result);
    }
    if let Some(result) = req.build {
        entry.checks.build = Some(result);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
