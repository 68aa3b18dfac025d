//! `bowser-gen` -- queue ComfyUI workflow runs from the command line.
//!
//! Loads a workflow template from the workflow root, applies `--set`
//! overrides, submits one or more runs and waits until every run has
//! settled. Artifacts land under the output root with their sidecars.
//!
//! # Environment variables
//!
//! See [`ComfyUIConfig::from_env`]; a `.env` file is honoured.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bowser_comfyui::config::ComfyUIConfig;
use bowser_comfyui::{ComfyUIManager, JobEntry, JobState};
use bowser_core::params::ParamValue;
use bowser_core::template::WorkflowTemplate;
use bowser_core::types::EntryId;

/// Queue ComfyUI workflow runs and collect their outputs
#[derive(Parser)]
#[command(name = "bowser-gen")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Workflow directory (overrides BOWSER_WORKFLOW_ROOT)
    #[arg(long, global = true)]
    workflow_root: Option<PathBuf>,

    /// Output directory (overrides BOWSER_OUTPUT_ROOT)
    #[arg(long, global = true)]
    output_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit runs of a workflow and wait for them
    Run {
        /// Workflow name, resolved as `{workflow_root}/{name}.json`
        workflow: String,

        /// Number of runs
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Parameter override, `Title=value`; may be repeated
        #[arg(long = "set", value_parser = parse_assignment)]
        set: Vec<(String, String)>,

        /// First seed for auto-seeded runs
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the server's system stats
    Stats,

    /// List the parameters a workflow exposes
    Params {
        /// Workflow name
        workflow: String,
    },
}

fn parse_assignment(text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected Title=value, got '{text}'")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bowser_gen=info,bowser_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "bowser-gen failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = ComfyUIConfig::from_env().context("Invalid configuration")?;
    if let Some(root) = cli.workflow_root {
        config.workflow_root = root;
    }
    if let Some(root) = cli.output_root {
        config.output_root = root;
    }

    match cli.command {
        Commands::Params { workflow } => {
            let template = load_workflow(&config, &workflow)?;
            print_parameters(&template);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stats => {
            let manager = ComfyUIManager::start(config).await?;
            let stats = manager.refresh_stats().await;
            manager.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&stats?)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            workflow,
            count,
            set,
            seed,
        } => {
            let template = load_workflow(&config, &workflow)?;
            let mut params = template.default_parameters();
            for (name, text) in &set {
                let Some(spec) = template.parameter(name) else {
                    bail!("Workflow '{workflow}' has no parameter named '{name}'");
                };
                params.set(name.clone(), ParamValue::parse_for(name, &spec.kind, text)?);
            }

            tracing::info!(
                workflow = %workflow,
                server = %config.api_url,
                output_root = %config.output_root.display(),
                "Starting bowser-gen",
            );

            let manager = ComfyUIManager::start(config).await?;
            let outcome = submit_and_wait(&manager, &template, &params, count, seed).await;
            manager.shutdown().await;

            let entries = outcome?;
            report(&entries);
            let failed = entries
                .iter()
                .any(|e| matches!(e.state, JobState::Failed | JobState::Cancelled));
            Ok(if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

fn load_workflow(config: &ComfyUIConfig, name: &str) -> Result<WorkflowTemplate> {
    let path = config.workflow_root.join(format!("{name}.json"));
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read workflow {}", path.display()))?;
    WorkflowTemplate::parse(name, &text)
        .with_context(|| format!("Failed to load workflow {}", path.display()))
}

fn print_parameters(template: &WorkflowTemplate) {
    for spec in template.parameters() {
        let default = spec
            .default
            .as_ref()
            .map(|v| v.to_json().to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<24} {:<8} node {:<6} default {}",
            spec.name,
            spec.kind.label(),
            spec.node_id,
            default
        );
    }
}

/// Submit the batch and block until every run is settled.
///
/// The first Ctrl-C cancels the outstanding runs; a second one gives up.
async fn submit_and_wait(
    manager: &Arc<ComfyUIManager>,
    template: &WorkflowTemplate,
    params: &bowser_core::params::ParameterSet,
    count: u32,
    seed: Option<u64>,
) -> Result<Vec<Arc<JobEntry>>> {
    let submitted = manager.submit(template, params, count, seed).await?;
    let ids: Vec<EntryId> = submitted.iter().map(|e| e.id).collect();

    let mut view = manager.queue().watch();
    let mut last: HashMap<EntryId, (JobState, u64)> = HashMap::new();
    let mut interrupted = false;
    let mut ctrl_c = Signals::new(tokio::signal::ctrl_c);

    loop {
        let current = view.borrow_and_update().clone();
        let entries: Vec<Arc<JobEntry>> = ids.iter().filter_map(|id| current.get(*id).cloned()).collect();

        for entry in &entries {
            let key = (entry.state, entry.progress.current);
            if last.insert(entry.id, key) != Some(key) {
                tracing::info!(
                    id = %entry.id,
                    state = ?entry.state,
                    step = entry.progress.current,
                    steps = entry.progress.total,
                    node = ?entry.current_node,
                    "Run update",
                );
            }
        }
        if entries.len() == ids.len() && entries.iter().all(|e| e.is_settled()) {
            return Ok(entries);
        }

        tokio::select! {
            changed = view.changed() => changed.context("Job queue stopped")?,
            signal = ctrl_c.next() => {
                signal.context("Failed to listen for Ctrl-C")?;
                if interrupted {
                    bail!("Interrupted");
                }
                interrupted = true;
                tracing::warn!("Cancelling outstanding runs (Ctrl-C again to quit)");
                for id in &ids {
                    manager.cancel(*id).await?;
                }
            }
        }
    }
}

/// A repeating signal. One pending future is kept across `select!` passes
/// that another branch wins, and is re-armed after each delivery.
struct Signals<F, Fut> {
    make: F,
    pending: Pin<Box<Fut>>,
}

impl<F, Fut> Signals<F, Fut>
where
    F: FnMut() -> Fut,
    Fut: Future,
{
    fn new(mut make: F) -> Self {
        let pending = Box::pin(make());
        Self { make, pending }
    }

    async fn next(&mut self) -> Fut::Output {
        let output = self.pending.as_mut().await;
        self.pending = Box::pin((self.make)());
        output
    }
}

fn report(entries: &[Arc<JobEntry>]) {
    for entry in entries {
        match entry.state {
            JobState::Completed => {
                for artifact in &entry.materialized {
                    println!("{}", artifact.path.display());
                }
                if let Some(secs) = entry.generation_secs() {
                    tracing::info!(id = %entry.id, seed = ?entry.metadata.seed, secs, "Run completed");
                }
            }
            JobState::Failed => {
                let message = entry.error.as_ref().map(|e| e.message.as_str()).unwrap_or("unknown error");
                tracing::error!(id = %entry.id, error = message, "Run failed");
            }
            state => tracing::warn!(id = %entry.id, state = ?state, "Run did not complete"),
        }
        for diagnostic in &entry.diagnostics {
            tracing::warn!(id = %entry.id, "{diagnostic}");
        }
    }
}
