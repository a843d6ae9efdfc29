use crate::output::{print_json, print_raw, skipped};
use anyhow::Context;
use clap::Subcommand;
use hive_core::queue::{
    CheckResult, Gated, MergeQueue, MergeStatus, StatusReport, SubmitRequest, UpdateOutcome,
    UpdateRequest,
};
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand tree
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// Enqueue a plan branch for merging into the dev branch
    Submit {
        /// Plan identifier, e.g. 03-02
        #[arg(long)]
        plan_id: String,

        /// Branch holding the plan's work
        #[arg(long)]
        branch: String,

        /// Execution wave the plan belongs to  [default: 1]
        #[arg(long)]
        wave: Option<u32>,

        #[arg(long)]
        pr_number: Option<u64>,

        #[arg(long)]
        pr_url: Option<String>,

        /// Override the configured merge strategy for this entry
        #[arg(long)]
        merge_strategy: Option<String>,
    },

    /// Show pending, in-progress, failed, and leased entries
    Status,

    /// Record progress or an outcome for a queue entry
    Update {
        /// Entry id (e.g. mr-004)
        #[arg(long)]
        id: String,

        /// pending | checking | building | merging | merged | conflict | build_failed | merge_failed
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        error: Option<String>,

        /// Merge commit; advances the recorded dev head when status is merged
        #[arg(long)]
        merge_sha: Option<String>,

        #[arg(long)]
        pr_number: Option<u64>,

        #[arg(long)]
        pr_url: Option<String>,

        /// Take or renew the lease on this entry
        #[arg(long)]
        lease_owner: Option<String>,

        /// Lease length in seconds  [default: git.queue.lease_ttl_seconds]
        #[arg(long = "lease-ttl")]
        lease_ttl: Option<u64>,

        /// Conflict check result: pass | fail
        #[arg(long)]
        conflicts: Option<String>,

        /// Build check result: pass | fail
        #[arg(long)]
        build: Option<String>,
    },

    /// Remove failed entries and their signal files
    Drain,

    /// Show the completion signal for a plan
    Signal {
        #[arg(long)]
        plan_id: String,
    },

    /// Show the last merged dev-branch head
    DevHead,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcommand: QueueSubcommand, json: bool) -> anyhow::Result<()> {
    let queue = MergeQueue::open(root);
    match subcommand {
        QueueSubcommand::Submit {
            plan_id,
            branch,
            wave,
            pr_number,
            pr_url,
            merge_strategy,
        } => {
            let req = SubmitRequest {
                plan_id,
                branch,
                wave,
                pr_number,
                pr_url,
                merge_strategy,
            };
            let receipt = match queue.submit(&req).context("failed to submit merge request")? {
                Gated::Ran(receipt) => receipt,
                Gated::Skipped { reason } => return report_skipped(reason, json),
            };
            if json {
                print_json(&serde_json::json!({
                    "success": true,
                    "id": receipt.id,
                    "plan_id": receipt.plan_id,
                }))?;
            } else {
                print_raw(&receipt.id);
            }
            Ok(())
        }

        QueueSubcommand::Status => {
            let report = match queue.status()? {
                Gated::Ran(report) => report,
                Gated::Skipped { reason } => return report_skipped(reason, json),
            };
            match report {
                StatusReport::Empty => {
                    if json {
                        print_json(&serde_json::json!({
                            "success": true,
                            "empty": true,
                            "queue": [],
                            "merged": [],
                            "dev_head": null,
                        }))?;
                    } else {
                        print_raw("empty");
                    }
                }
                StatusReport::Snapshot(snapshot) => {
                    if json {
                        let mut body = serde_json::to_value(&*snapshot)?;
                        body["success"] = serde_json::Value::Bool(true);
                        print_json(&body)?;
                    } else {
                        print_raw(serde_json::json!({
                            "pending_count": snapshot.pending_count,
                            "in_progress_count": snapshot.in_progress_count,
                            "failed_count": snapshot.failed_count,
                            "merged_count": snapshot.merged_count,
                            "leased_count": snapshot.leased_count,
                            "stale_lease_count": snapshot.stale_lease_count,
                        }));
                    }
                }
            }
            Ok(())
        }

        QueueSubcommand::Update {
            id,
            status,
            error,
            merge_sha,
            pr_number,
            pr_url,
            lease_owner,
            lease_ttl,
            conflicts,
            build,
        } => {
            let req = UpdateRequest {
                status: status.as_deref().map(str::parse::<MergeStatus>).transpose()?,
                error,
                merge_sha,
                pr_number,
                pr_url,
                lease_owner,
                lease_ttl_seconds: lease_ttl,
                conflicts: conflicts.as_deref().map(str::parse::<CheckResult>).transpose()?,
                build: build.as_deref().map(str::parse::<CheckResult>).transpose()?,
            };
            let outcome = match queue
                .update(&id, &req)
                .with_context(|| format!("failed to update '{id}'"))?
            {
                Gated::Ran(outcome) => outcome,
                Gated::Skipped { reason } => return report_skipped(reason, json),
            };
            match outcome {
                UpdateOutcome::Updated { id, status } => {
                    if json {
                        print_json(&serde_json::json!({
                            "success": true,
                            "id": id,
                            "status": status,
                        }))?;
                    } else {
                        print_raw(&id);
                    }
                    Ok(())
                }
                UpdateOutcome::NotFound { id } => {
                    fail(json, "not_found", format!("entry not found: {id}"))
                }
                UpdateOutcome::Rejected { id, from, to } => fail(
                    json,
                    "terminal",
                    format!("entry {id} is {from}; cannot move to {to}"),
                ),
            }
        }

        QueueSubcommand::Drain => {
            let report = match queue.drain().context("failed to drain merge queue")? {
                Gated::Ran(report) => report,
                Gated::Skipped { reason } => return report_skipped(reason, json),
            };
            if json {
                print_json(&serde_json::json!({
                    "success": true,
                    "drained_count": report.drained_count,
                    "remaining_count": report.remaining_count,
                }))?;
            } else {
                print_raw(report.drained_count);
            }
            Ok(())
        }

        QueueSubcommand::Signal { plan_id } => {
            let signal = match queue.merge_signal(&plan_id)? {
                Gated::Ran(signal) => signal,
                Gated::Skipped { reason } => return report_skipped(reason, json),
            };
            if json {
                print_json(&serde_json::json!({
                    "success": true,
                    "plan_id": plan_id,
                    "signal": signal,
                }))?;
            } else {
                match signal {
                    Some(s) => print_raw(s.status),
                    None => print_raw("unknown"),
                }
            }
            Ok(())
        }

        QueueSubcommand::DevHead => {
            let head = match queue.dev_head_signal()? {
                Gated::Ran(head) => head,
                Gated::Skipped { reason } => return report_skipped(reason, json),
            };
            if json {
                print_json(&serde_json::json!({
                    "success": true,
                    "dev_head": head,
                }))?;
            } else {
                match head {
                    Some(h) => print_raw(h.sha),
                    None => print_raw("unknown"),
                }
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn report_skipped(reason: &str, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(&skipped(reason))
    } else {
        print_raw("skipped");
        Ok(())
    }
}

/// Report a refused update. JSON callers get the structured body on stdout;
/// the process still exits non-zero.
fn fail(json: bool, code: &str, message: String) -> anyhow::Result<()> {
    if json {
        print_json(&serde_json::json!({
            "success": false,
            "code": code,
            "error": message,
        }))?;
    }
    anyhow::bail!(message)
}
