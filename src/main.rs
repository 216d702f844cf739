//! Relay CLI
//!
//! Entry point for the `relay` command-line tool. Thin wrapper over the
//! orchestrator: probe a worker, run an action, cancel a job.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};

use relay_exec::orchestrator::{outcome_exit_code, Orchestrator, OrchestratorConfig};
use relay_exec::signal::CancellationCoordinator;
use relay_exec::{
    CommandTransport, ConfigInputs, RpcClient, SshConfig, Transport, WorkerInventory,
};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Remote job-execution lane", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe a worker's capabilities and load
    Probe {
        /// Worker name from the inventory
        #[arg(long, short = 'w')]
        worker: Option<String>,

        /// Path to workers inventory file (default: ~/.config/relay/workers.toml)
        #[arg(long, short = 'i')]
        inventory: Option<PathBuf>,

        /// Use a locally spawned worker instead of SSH
        #[arg(long)]
        local: bool,
    },

    /// Run one action on a worker
    Run {
        /// Action name
        #[arg(long, short = 'a', default_value = "build")]
        action: String,

        /// Source directory to hash and stage
        #[arg(long, short = 's', default_value = ".")]
        source: PathBuf,

        /// Worker name from the inventory
        #[arg(long, short = 'w')]
        worker: Option<String>,

        /// Path to workers inventory file
        #[arg(long, short = 'i')]
        inventory: Option<PathBuf>,

        /// Use a locally spawned worker instead of SSH
        #[arg(long)]
        local: bool,

        /// Overall job timeout in seconds
        #[arg(long, default_value_t = 1800)]
        timeout_seconds: u64,

        /// Request the event integrity hash chain
        #[arg(long)]
        integrity: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,

        /// The command to execute (after --)
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },

    /// Cancel a running job
    Cancel {
        /// Job ID to cancel
        job_id: String,

        /// Worker name from the inventory
        #[arg(long, short = 'w')]
        worker: Option<String>,

        /// Path to workers inventory file
        #[arg(long, short = 'i')]
        inventory: Option<PathBuf>,

        /// Use a locally spawned worker instead of SSH
        #[arg(long)]
        local: bool,
    },

    /// Worker inventory commands
    Workers {
        #[command(subcommand)]
        action: WorkersCommands,
    },
}

#[derive(Subcommand)]
enum WorkersCommands {
    /// List configured workers
    List {
        /// Filter workers by tags (comma-separated)
        #[arg(long, short = 't', value_delimiter = ',')]
        tag: Option<Vec<String>>,

        /// Path to workers inventory file
        #[arg(long, short = 'i')]
        inventory: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Probe {
            worker,
            inventory,
            local,
        } => {
            let transport = match transport_for(worker.as_deref(), inventory.as_deref(), local) {
                Ok(transport) => transport,
                Err(message) => fail(1, &message),
            };
            let mut client = RpcClient::new(transport);
            match client.probe() {
                Ok(capabilities) => match serde_json::to_string_pretty(&capabilities) {
                    Ok(json) => println!("{}", json),
                    Err(e) => fail(1, &format!("error serializing output: {}", e)),
                },
                Err(e) => fail(20, &format!("probe failed: {}", e)),
            }
        }

        Commands::Run {
            action,
            source,
            worker,
            inventory,
            local,
            timeout_seconds,
            integrity,
            json,
            cmd,
        } => {
            let transport = match transport_for(worker.as_deref(), inventory.as_deref(), local) {
                Ok(transport) => transport,
                Err(message) => fail(1, &message),
            };
            let config = OrchestratorConfig {
                worker: worker.unwrap_or_else(|| "local".to_string()),
                timeout: Duration::from_secs(timeout_seconds),
                integrity,
                ..OrchestratorConfig::default()
            };
            let mut orchestrator = Orchestrator::new(config, transport);

            let coordinator = CancellationCoordinator::new(orchestrator.cancel_flag());
            if let Err(e) = coordinator.install() {
                eprintln!("warning: could not install signal handler: {}", e);
            }

            let inputs = ConfigInputs::single(action, cmd);
            let plan = match orchestrator.plan(&inputs, &source) {
                Ok(plan) => plan,
                Err(e) => fail(e.exit_code(), &format!("planning failed: {}", e)),
            };
            if !json {
                eprintln!("run {} on worker '{}'", plan.run_id, plan.worker);
            }

            match orchestrator.execute(&plan, &inputs) {
                Ok(result) => {
                    if json {
                        let report = serde_json::json!({
                            "run_id": result.run_id,
                            "state": result.outcome,
                            "run_dir": result.run_dir,
                        });
                        println!("{}", report);
                    } else {
                        for step in &result.steps {
                            eprintln!(
                                "  [{}] {} -> {} (attempt {})",
                                step.job_id, step.action, step.terminal.state, step.attempt
                            );
                        }
                        eprintln!("run {}: {}", result.run_id, result.outcome);
                    }
                    process::exit(outcome_exit_code(result.outcome));
                }
                Err(e) => fail(e.exit_code(), &format!("run failed: {}", e)),
            }
        }

        Commands::Cancel {
            job_id,
            worker,
            inventory,
            local,
        } => {
            let transport = match transport_for(worker.as_deref(), inventory.as_deref(), local) {
                Ok(transport) => transport,
                Err(message) => fail(1, &message),
            };
            let client = RpcClient::new(transport);
            match client.cancel(&job_id) {
                Ok(response) => {
                    if response.acknowledged {
                        eprintln!("job {} signaled", response.job_id);
                    } else {
                        eprintln!("job {} not active (already gone)", response.job_id);
                    }
                }
                Err(e) => fail(20, &format!("cancel failed: {}", e)),
            }
        }

        Commands::Workers { action } => match action {
            WorkersCommands::List { tag, inventory } => {
                let inventory = match load_inventory(inventory.as_deref()) {
                    Ok(inventory) => inventory,
                    Err(message) => fail(1, &message),
                };
                let tags = tag.unwrap_or_default();
                for worker in inventory.with_tags(&tags) {
                    println!(
                        "{}\t{}\t[{}]",
                        worker.name,
                        worker.host,
                        worker.tags.join(",")
                    );
                }
            }
        },
    }
}

fn fail(code: i32, message: &str) -> ! {
    eprintln!("{}", message);
    process::exit(code)
}

fn default_inventory_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{}/.config/relay/workers.toml", home))
}

fn load_inventory(path: Option<&std::path::Path>) -> Result<WorkerInventory, String> {
    let path = path.map(PathBuf::from).unwrap_or_else(default_inventory_path);
    WorkerInventory::load(&path).map_err(|e| format!("error loading inventory: {}", e))
}

/// Build the transport for the selected worker: a locally spawned harness,
/// or SSH to an inventory entry.
fn transport_for(
    worker: Option<&str>,
    inventory: Option<&std::path::Path>,
    local: bool,
) -> Result<Box<dyn Transport>, String> {
    if local {
        return Ok(Box::new(CommandTransport::new(
            "relay-worker",
            vec!["serve".to_string()],
        )));
    }
    let name = worker.ok_or_else(|| "either --worker or --local is required".to_string())?;
    let inventory = load_inventory(inventory)?;
    let entry = inventory
        .find(name)
        .ok_or_else(|| format!("worker '{}' not found in inventory", name))?;
    Ok(Box::new(CommandTransport::ssh(&SshConfig {
        host: entry.host.clone(),
        user: entry.user.clone(),
        port: entry.port,
        remote_command: vec!["relay-worker".to_string(), "serve".to_string()],
    })))
}
