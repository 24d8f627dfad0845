//! Command-line interface for stagectl.
//!
//! Every pipeline command is translated into a service request, so the CLI
//! and `stagectl serve` share one code path and one error shape.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::BufReader;
use tracing::info;

use crate::adapters::local::describe_environment;
use crate::config;
use crate::core::LifecycleController;
use crate::domain::{Pipeline, PipelineState, RunOutcome};
use crate::service::{Detail, Operation, PipelineService, Reply, Request, ServiceError};

/// stagectl - Persistent pipeline lifecycle engine
#[derive(Parser, Debug)]
#[command(name = "stagectl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pipeline to operate on (defaults to the current pipeline)
    #[arg(short, long, global = true, env = "STAGECTL_PIPELINE")]
    pub pipeline: Option<String>,

    /// Print replies as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an empty pipeline and make it current
    Create {
        pipeline_id: String,
    },

    /// Select an existing pipeline as current
    Load {
        pipeline_id: Option<String>,
    },

    /// Append a stage
    Append {
        /// Registered stage type (see `stagectl config`)
        stage_type: String,

        /// Stage id (default: <type>-<n>)
        #[arg(long = "id")]
        stage_id: Option<String>,

        /// Store the config without marking the stage configured
        #[arg(long)]
        no_configure: bool,

        /// Configuration as key=value (values are parsed as JSON when possible)
        #[arg(value_parser = parse_key_value)]
        config: Vec<(String, Value)>,
    },

    /// Merge configuration into a stage
    Configure {
        stage_id: String,

        #[arg(value_parser = parse_key_value)]
        config: Vec<(String, Value)>,
    },

    /// Detach a stage from the active order (keeps its configuration)
    Unlink {
        stage_id: String,
    },

    /// Re-attach an unlinked stage
    Relink {
        stage_id: String,
    },

    /// Permanently delete a stage
    Remove {
        stage_id: String,
    },

    /// Materialize the pipeline environment
    Build,

    /// Run a built pipeline and wait for it to finish
    Run,

    /// Tear down and delete a pipeline
    Destroy {
        pipeline_id: Option<String>,
    },

    /// List stored pipelines
    List {
        /// Glob pattern to filter ids
        pattern: Option<String>,
    },

    /// Show a pipeline's stages and state
    Inspect {
        pipeline_id: Option<String>,
    },

    /// Serve JSON-lines requests on stdin/stdout
    Serve,

    /// Show resolved configuration (debug)
    Config,
}

/// Parse a `key=value` argument; the value is JSON if it parses, else a string
pub fn parse_key_value(arg: &str) -> std::result::Result<(String, Value), String> {
    let (key, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", arg))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", arg));
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let Cli {
            pipeline,
            json,
            command,
        } = self;

        if let Commands::Config = command {
            return show_config();
        }

        let cfg = config::config()?;
        let controller = Arc::new(
            LifecycleController::from_config(cfg).context("Failed to open pipeline store")?,
        );
        let service = PipelineService::new(controller.clone());

        match command {
            Commands::Serve => serve(&service).await,
            Commands::Run => run_pipeline(&service, pipeline.as_deref(), json).await,
            command => {
                let request = build_request(&controller, pipeline.as_deref(), command).await?;
                let reply = service.handle(request).await.map_err(|e| report(e, json))?;
                print_reply(&reply, json)
            }
        }
    }
}

/// Print a failure in the requested format and hand it back for exit status
fn report(error: ServiceError, json: bool) -> anyhow::Error {
    if json {
        println!("{}", error.envelope());
    }
    error.into()
}

/// Explicit id, `--pipeline`, or the current pipeline
async fn target(
    controller: &LifecycleController,
    explicit: Option<&str>,
    operation: Operation,
) -> std::result::Result<String, ServiceError> {
    controller
        .resolve(explicit)
        .await
        .map_err(|e| ServiceError::from_engine(operation, &e))
}

async fn build_request(
    controller: &LifecycleController,
    pipeline: Option<&str>,
    command: Commands,
) -> std::result::Result<Request, ServiceError> {
    Ok(match command {
        Commands::Create { pipeline_id } => Request::Create { pipeline_id },
        Commands::Load { pipeline_id } => Request::Load {
            pipeline_id: pipeline_id.or(pipeline.map(str::to_string)),
        },
        Commands::Append {
            stage_type,
            stage_id,
            no_configure,
            config,
        } => Request::Append {
            pipeline_id: target(controller, pipeline, Operation::Append).await?,
            stage_type,
            stage_id,
            configure_now: !no_configure,
            config: config.into_iter().collect(),
        },
        Commands::Configure { stage_id, config } => Request::Configure {
            pipeline_id: target(controller, pipeline, Operation::Configure).await?,
            stage_id,
            config: config.into_iter().collect(),
        },
        Commands::Unlink { stage_id } => Request::Unlink {
            pipeline_id: target(controller, pipeline, Operation::Unlink).await?,
            stage_id,
        },
        Commands::Relink { stage_id } => Request::Relink {
            pipeline_id: target(controller, pipeline, Operation::Relink).await?,
            stage_id,
        },
        Commands::Remove { stage_id } => Request::Remove {
            pipeline_id: target(controller, pipeline, Operation::Remove).await?,
            stage_id,
        },
        Commands::Build => Request::Build {
            pipeline_id: target(controller, pipeline, Operation::Build).await?,
        },
        Commands::Destroy { pipeline_id } => {
            let explicit = pipeline_id.as_deref().or(pipeline);
            Request::Destroy {
                pipeline_id: target(controller, explicit, Operation::Destroy).await?,
            }
        }
        Commands::List { pattern } => Request::List { pattern },
        Commands::Inspect { pipeline_id } => Request::Inspect {
            pipeline_id: pipeline_id.or(pipeline.map(str::to_string)),
        },
        Commands::Run | Commands::Serve | Commands::Config => {
            return Err(ServiceError::invalid_request("command is not a pipeline request"))
        }
    })
}

/// Print a reply for humans or as JSON
fn print_reply(reply: &Reply, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reply)?);
        return Ok(());
    }

    let id = reply.pipeline_id.as_deref().unwrap_or("-");
    match &reply.detail {
        Detail::Status(status) => {
            println!("Pipeline '{}': {}", id, status);
            if let Some(run_id) = reply.run_id {
                println!("Run ID: {}", run_id);
            }
        }
        Detail::Appended(stage_type) => println!(
            "Appended {} stage '{}' to '{}'",
            stage_type,
            reply.stage_id.as_deref().unwrap_or("?"),
            id
        ),
        Detail::Configured(stage) => println!("Configured stage '{}' in '{}'", stage, id),
        Detail::Unlinked(stage) => println!("Unlinked stage '{}' in '{}'", stage, id),
        Detail::Relinked(stage) => println!("Relinked stage '{}' in '{}'", stage, id),
        Detail::Removed(stage) => println!("Removed stage '{}' from '{}'", stage, id),
        Detail::Pipelines(ids) => {
            if ids.is_empty() {
                println!("No pipelines found");
            }
            for id in ids {
                println!("{}", id);
            }
        }
        Detail::Pipeline(pipeline) => show_pipeline(pipeline),
    }

    Ok(())
}

fn show_pipeline(pipeline: &Pipeline) {
    println!("Pipeline: {}", pipeline.id());
    println!("State: {}", pipeline.state());
    if pipeline.is_stale() {
        println!("Stale: stages changed during the current run");
    }
    println!("Created: {}", pipeline.created_at);
    println!("Updated: {}", pipeline.updated_at);

    println!("\n{:<24} {:<12} {:<11} {:<7}", "STAGE", "TYPE", "CONFIGURED", "LINKED");
    println!("{}", "-".repeat(58));
    for stage in pipeline.stages() {
        println!(
            "{:<24} {:<12} {:<11} {:<7}",
            stage.id,
            stage.kind(),
            if stage.configured { "yes" } else { "no" },
            if stage.linked { "yes" } else { "no" },
        );
    }

    if !pipeline.environment().is_empty() {
        println!("\nEnvironment:");
        for line in describe_environment(pipeline.environment()) {
            println!("  {}", line);
        }
    }

    if let Some(run) = pipeline.last_run() {
        println!("\nLast run: {} (started {})", run.run_id, run.started_at);
        match &run.outcome {
            Some(RunOutcome::Succeeded) => println!("  Outcome: succeeded"),
            Some(RunOutcome::Failed { error }) => println!("  Outcome: failed: {}", error),
            Some(RunOutcome::Cancelled) => println!("  Outcome: cancelled"),
            None => println!("  Outcome: (in progress)"),
        }
    }
}

/// Start a run and apply its completion before exiting
async fn run_pipeline(service: &PipelineService, pipeline: Option<&str>, json: bool) -> Result<()> {
    let controller = service.controller();
    let mut completions = controller
        .take_completions()
        .context("Completion channel already in use")?;

    let pipeline_id = target(controller, pipeline, Operation::Run)
        .await
        .map_err(|e| report(e, json))?;
    let reply = service
        .handle(Request::Run { pipeline_id })
        .await
        .map_err(|e| report(e, json))?;
    print_reply(&reply, json)?;

    let run_id = reply.run_id.context("Run reply is missing a run id")?;
    while let Some(completion) = completions.recv().await {
        if completion.run_id != run_id {
            continue;
        }

        let outcome = completion.outcome.clone();
        let updated = controller.complete(completion).await?;
        let state = updated
            .as_ref()
            .map(|p| p.state())
            .unwrap_or(PipelineState::Destroyed);
        info!(%run_id, %state, "Run finished");

        return match outcome {
            RunOutcome::Succeeded => {
                eprintln!("Run {} succeeded (pipeline is {})", run_id, state);
                Ok(())
            }
            RunOutcome::Failed { error } => anyhow::bail!("Run {} failed: {}", run_id, error),
            RunOutcome::Cancelled => anyhow::bail!("Run {} was cancelled", run_id),
        };
    }

    anyhow::bail!("Executor stopped without reporting run {}", run_id)
}

/// Serve the JSON-lines boundary on stdio
async fn serve(service: &PipelineService) -> Result<()> {
    let listener = service.controller().spawn_completion_listener();
    info!("Serving JSON-lines requests on stdin");

    let result = service
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await;

    if let Some(listener) = listener {
        listener.abort();
    }
    result
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;
    let registry = crate::core::StageRegistry::with_declared(&cfg.stage_types);

    println!("stagectl configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:  {}", cfg.home.display());
    println!("  Store: {} ({})", cfg.store_path.display(), cfg.store_backend);
    println!();
    println!("Executor:");
    println!("  Shell:         {}", cfg.executor.shell);
    println!("  Stage timeout: {}s", cfg.executor.stage_timeout_seconds);
    println!();
    println!("Stage types: {}", registry.names().join(", "));

    Ok(())
}
