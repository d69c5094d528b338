//! `flowhub` CLI entry-point.
//!
//! Available sub-commands:
//! - `migrate`  — run pending database migrations.
//! - `validate` — validate a flow definition JSON file.
//! - `flows`    — list stored flows.
//! - `steps`    — list the steps of a flow.
//! - `import`   — store a flow definition file.
//! - `run`      — start a flow run, optionally waiting for it.
//!
//! Without `--database-url` everything lives in an in-memory store for the
//! lifetime of the process; `--definitions` preloads flow files into it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use capabilities::{CopyCollection, StepCapability};
use db::{DocumentStore, MemoryStore, PgDocumentStore};
use engine::{CapabilityRegistry, ExecutorConfig, FailurePolicy, Flow, FlowManager, JobStatus, StepType};

#[derive(Parser)]
#[command(name = "flowhub", about = "Flow and step orchestration engine", version)]
struct Cli {
    /// Postgres connection string. Without it an in-memory store is used.
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Directory of flow definition files to load before running the command.
    #[arg(long, global = true)]
    definitions: Option<PathBuf>,

    /// Retries for a step failing with a retryable error.
    #[arg(long, env = "FLOWHUB_MAX_RETRIES", default_value_t = 3, global = true)]
    max_retries: u32,

    /// `abort` skips the rest of a job after a failed step; `continue` keeps going.
    #[arg(long, env = "FLOWHUB_FAILURE_POLICY", default_value = "abort", global = true)]
    failure_policy: FailurePolicy,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations.
    Migrate,
    /// Validate a flow definition JSON file.
    Validate {
        /// Path to the flow JSON file.
        path: PathBuf,
    },
    /// List stored flows.
    Flows,
    /// List the steps of a flow in execution order.
    Steps { flow: String },
    /// Store a flow definition file.
    Import {
        path: PathBuf,
        /// Replace an existing flow of the same name.
        #[arg(long)]
        overwrite: bool,
    },
    /// Start a run of a flow.
    Run {
        flow: String,
        /// Only run this step; repeat to select several.
        #[arg(long = "step")]
        steps: Vec<String>,
        /// Block until the job finishes and print its record.
        #[arg(long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Migrate => {
            let database_url = cli
                .database_url
                .as_deref()
                .context("migrate needs --database-url or DATABASE_URL")?;
            info!("Running migrations");
            let pool = db::pool::create_pool(database_url, 2).await?;
            db::pool::run_migrations(&pool).await?;
            info!("Migrations applied successfully");
        }
        Command::Validate { path } => {
            let content = read(path)?;
            match Flow::from_json(&content) {
                Ok(flow) => {
                    let order: Vec<String> = flow
                        .steps
                        .iter()
                        .map(|(token, step)| format!("{token}:{}", step.id()))
                        .collect();
                    println!("✅ Flow '{}' is valid. Execution order: {order:?}", flow.name());
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Flows => {
            let manager = connect(&cli).await?;
            for flow in manager.flows().await? {
                println!("{}\t{} step(s)\tv{}", flow.name(), flow.steps.len(), flow.version());
            }
        }
        Command::Steps { flow } => {
            let manager = connect(&cli).await?;
            let views = manager.steps(flow).await?;
            println!("{}", serde_json::to_string_pretty(&views)?);
        }
        Command::Import { path, overwrite } => {
            let manager = connect(&cli).await?;
            let flow = manager.create_flow(&read(path)?, !overwrite).await?;
            println!("imported '{}' (version {})", flow.name(), flow.version());
        }
        Command::Run { flow, steps, wait } => {
            let manager = connect(&cli).await?;
            let response = if steps.is_empty() {
                manager.executor().run(flow).await?
            } else {
                manager.executor().run_steps(flow, steps).await?
            };
            println!("{}", serde_json::to_string_pretty(&response)?);

            if *wait {
                let record = manager
                    .jobs()
                    .wait(&response.job_id)
                    .await
                    .context("job disappeared while waiting")?;
                println!("{}", serde_json::to_string_pretty(&record)?);
                if record.status != JobStatus::Succeeded {
                    bail!("job {} finished {}", record.job_id, record.status);
                }
            } else if cli.database_url.is_none() {
                warn!("not waiting: the job stops when this process exits");
                // Give the job a chance to start before the runtime shuts down.
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    Ok(())
}

/// Build the store, capabilities and facade from the global flags.
async fn connect(cli: &Cli) -> anyhow::Result<FlowManager> {
    let store: Arc<dyn DocumentStore> = match &cli.database_url {
        Some(url) => {
            let pool = db::pool::create_pool(url, 10).await?;
            Arc::new(PgDocumentStore::new(pool))
        }
        None => {
            info!("No database configured, using an in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let copy: Arc<dyn StepCapability> = Arc::new(CopyCollection);
    let capabilities: CapabilityRegistry = StepType::ALL
        .iter()
        .map(|t| (t.as_str().to_owned(), Arc::clone(&copy)))
        .collect();

    let config = ExecutorConfig {
        max_retries: cli.max_retries,
        failure_policy: cli.failure_policy,
        ..ExecutorConfig::default()
    };
    let manager = FlowManager::new(store, capabilities, config);

    if let Some(dir) = &cli.definitions {
        preload(&manager, dir).await?;
    }
    Ok(manager)
}

/// Store every `*.json` file of `dir`, in file-name order, overwriting flows of the same name.
async fn preload(manager: &FlowManager, dir: &Path) -> anyhow::Result<()> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read definitions directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    for path in &paths {
        let flow = manager
            .create_flow(&read(path)?, false)
            .await
            .with_context(|| format!("cannot load {}", path.display()))?;
        info!(flow = %flow.name(), file = %path.display(), "definition loaded");
    }
    Ok(())
}

fn read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("cannot read file {}", path.display()))
}
