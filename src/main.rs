use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crucible::config::{CrucibleConfig, GatingMode};
use crucible::engine::{BuildOrchestrator, Services};
use crucible::plan::Plan;
use crucible::sandbox::LocalWorkspace;
use crucible::services::{HttpServiceClient, HttpServiceConfig};

#[derive(Parser)]
#[command(name = "crucible")]
#[command(version, about = "AI build-run orchestrator - merge concurrent AI-generated changes into one shared workspace")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a build plan against a workspace
    Run {
        /// Path to the plan JSON produced by the planner
        #[arg(long)]
        plan: PathBuf,

        /// Integration workspace directory
        #[arg(long, default_value = ".")]
        workspace: PathBuf,

        /// Defer the integration gate to one final bounded pass
        #[arg(long)]
        deferred_gate: bool,

        /// Requested generation concurrency (clamped to the hard cap)
        #[arg(long)]
        max_generate: Option<usize>,

        /// Skip the review gate entirely
        #[arg(long)]
        no_review: bool,

        /// Append every run event to this JSONL file
        #[arg(long)]
        event_log: Option<PathBuf>,
    },
    /// Parse and validate a plan without executing it
    Validate {
        /// Path to the plan JSON
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "crucible=debug" } else { "crucible=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    match cli.command {
        Commands::Run {
            plan,
            workspace,
            deferred_gate,
            max_generate,
            no_review,
            event_log,
        } => cmd_run(plan, workspace, deferred_gate, max_generate, no_review, event_log).await,
        Commands::Validate { plan } => cmd_validate(&plan),
    }
}

async fn cmd_run(
    plan_path: PathBuf,
    workspace_dir: PathBuf,
    deferred_gate: bool,
    max_generate: Option<usize>,
    no_review: bool,
    event_log: Option<PathBuf>,
) -> Result<()> {
    let plan = Plan::load(&plan_path)?;

    let mut config = CrucibleConfig::load(&workspace_dir)?;
    if deferred_gate {
        config = config.with_gating_mode(GatingMode::Deferred);
    }
    if let Some(requested) = max_generate {
        config = config.with_generation_concurrency(requested);
    }
    if no_review {
        config = config.with_review_enabled(false);
    }

    let provider = Arc::new(LocalWorkspace::new(
        workspace_dir
            .canonicalize()
            .context("Failed to resolve workspace directory")?,
    ));

    let client = Arc::new(HttpServiceClient::new(HttpServiceConfig {
        base_url: config.services_base_url.clone(),
        generate_timeout: config.generate_timeout,
        apply_timeout: config.apply_timeout,
        review_timeout: config.review_timeout,
    }));
    let services = Services {
        generation: client.clone(),
        apply: client.clone(),
        review: client,
    };

    let orchestrator = Arc::new(BuildOrchestrator::new());
    let started = orchestrator.start_run(plan, provider, services, config)?;
    let run_id = started.run_id;
    tracing::info!(%run_id, "run started");

    // Mirror the event stream into the log file and the terminal.
    let mut events = started.events;
    let log_file = match event_log {
        Some(path) => Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open event log {}", path.display()))?,
        ),
        None => None,
    };
    let printer = tokio::spawn(async move {
        let mut log_file = log_file;
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                tracing::debug!(event = %line, "run event");
                if let Some(ref mut file) = log_file {
                    writeln!(file, "{}", line).ok();
                }
            }
        }
    });

    // Ctrl-C cancels the run; the orchestrator resets in-flight tickets.
    let canceller = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            canceller.cancel(run_id).ok();
        }
    });

    let summary = started.handle.await.context("Run task panicked")??;
    printer.abort();

    println!();
    println!("Run {} {}", summary.run_id, summary.status);
    println!(
        "  {} done, {} failed, {} tickets total",
        summary.done_count(),
        summary.failed_count(),
        summary.ticket_statuses.len()
    );
    println!(
        "  final snapshot v{} after {:.1}s",
        summary.final_version,
        summary.duration.as_secs_f64()
    );
    for (ticket_id, status) in &summary.ticket_statuses {
        println!("  [{}] {}", status, ticket_id);
    }
    Ok(())
}

fn cmd_validate(plan_path: &PathBuf) -> Result<()> {
    let plan = Plan::load(plan_path)?;

    println!("Plan OK: {} tickets, data mode {:?}", plan.tickets.len(), plan.data_mode);
    for (level, ids) in plan.dependency_levels().iter().enumerate() {
        println!("  wave {}: {}", level, ids.join(", "));
    }

    let mut contended: Vec<String> = plan
        .tickets
        .iter()
        .filter_map(|t| t.contention_group().map(|g| format!("{} -> {}", t.id, g)))
        .collect();
    if !contended.is_empty() {
        contended.sort();
        println!("Contention groups:");
        for line in contended {
            println!("  {}", line);
        }
    }
    Ok(())
}
