//! Relay worker entrypoint.
//!
//! Invoked once per transport session (conventionally as an SSH forced
//! command): reads one request from stdin, answers on stdout.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};

use relay_worker::{Harness, WorkerConfig};

#[derive(Parser)]
#[command(name = "relay-worker")]
#[command(about = "Relay worker harness", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve one session on stdin/stdout
    Serve {
        /// Root directory for job workspaces
        #[arg(long)]
        work_root: Option<PathBuf>,

        /// Maximum concurrent jobs
        #[arg(long, default_value_t = 1)]
        max_concurrent_jobs: u32,

        /// Cadence of queued events in seconds
        #[arg(long, default_value_t = 10)]
        queue_interval_seconds: u64,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            work_root,
            max_concurrent_jobs,
            queue_interval_seconds,
        } => {
            let mut config = WorkerConfig {
                max_concurrent_jobs,
                queue_interval: Duration::from_secs(queue_interval_seconds),
                ..WorkerConfig::default()
            };
            if let Some(root) = work_root {
                config.work_root = root;
            }

            let harness = Harness::new(config);
            if let Err(e) = harness.run() {
                eprintln!("session failed: {}", e);
                process::exit(1);
            }
        }
    }
}
