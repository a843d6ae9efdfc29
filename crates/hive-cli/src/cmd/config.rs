use crate::output::print_json;
use clap::Subcommand;
use hive_core::config::Config;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective git/queue configuration (defaults applied)
    Show,
}

pub fn run(root: &Path, subcommand: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcommand {
        ConfigSubcommand::Show => {
            let config = Config::load(root);
            if json {
                return print_json(&config);
            }
            let q = &config.git.queue;
            println!("git.flow:           {}", config.git.flow);
            println!("git.dev_branch:     {}", config.git.dev_branch);
            println!("git.merge_strategy: {}", config.git.merge_strategy);
            println!(
                "merge queue:        {}",
                if config.queue_enabled() {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!("lease ttl:          {}s", q.lease_ttl_seconds);
            println!(
                "lock:               {} retries, {}ms delay, stale after {}ms",
                q.lock_retries, q.lock_retry_delay_ms, q.lock_stale_ms
            );
            Ok(())
        }
    }
}
