//! Command handlers.

use crate::commands::{EventArgs, EventKind};
use crate::config::EngineConfig;
use anyhow::{Context, bail};
use console::style;
use gantry_cache::FilesystemCacheStore;
use gantry_core::events::Event;
use gantry_core::ports::AgentProvider;
use gantry_core::run::{JobResult, JobStatus, RunResult};
use gantry_core::workflow::WorkflowDefinition;
use gantry_core::JobId;
use gantry_runner::{OutputLine, OutputStream, ShellRunner};
use gantry_scheduler::{AgentPool, BroadcastEventBus, Engine, EventIngest, MatrixExpander, TriggerEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Exit code when the event matches no trigger or the invocation fails.
pub const EXIT_INVOCATION: u8 = 3;

fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let workflow: WorkflowDefinition = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    workflow.validate()?;
    debug!(path = %path.display(), jobs = workflow.jobs.len(), "Loaded workflow");
    Ok(workflow)
}

async fn head_sha(workspace: &Path) -> String {
    let output = tokio::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(workspace)
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
        _ => "unknown".to_string(),
    }
}

async fn trigger_event(args: &EventArgs, workspace: &Path) -> anyhow::Result<TriggerEvent> {
    let sha = match &args.sha {
        Some(sha) => sha.clone(),
        None => head_sha(workspace).await,
    };
    Ok(match args.event {
        EventKind::Push => TriggerEvent::Push {
            branch: args.branch.clone(),
            sha,
        },
        EventKind::PullRequest => TriggerEvent::PullRequest {
            number: args.pr.context("--pr is required for pull_request events")?,
            head_sha: sha,
            base_branch: args.branch.clone(),
        },
        EventKind::WorkflowDispatch => TriggerEvent::WorkflowDispatch {
            ref_name: args.branch.clone(),
            sha,
        },
    })
}

/// Validate a workflow file.
///
/// Label checks expand each job as a push of `main` would, so `runs_on`
/// labels built from run variables resolve to that event's values.
pub async fn validate(config: &EngineConfig, path: &Path) -> anyhow::Result<ExitCode> {
    let workflow = load_workflow(path)?;
    let pool = AgentPool::new(config.agents());
    let expander = MatrixExpander::new();
    let variables = EventIngest::new()
        .normalize(&TriggerEvent::Push {
            branch: "main".to_string(),
            sha: "0000000".to_string(),
        })
        .interpolation_context(&workflow.name);

    println!(
        "{} Workflow \"{}\" is valid",
        style("✓").green(),
        workflow.name
    );
    println!("  Jobs: {}", workflow.jobs.len());

    let mut unschedulable = 0;
    for template in &workflow.jobs {
        let instances = expander.expand_with(&Arc::new(template.clone()), &variables);
        println!(
            "    - {} ({} steps, {} instances)",
            template.name,
            template.steps.len(),
            instances.len()
        );
        for instance in instances {
            if !pool.can_satisfy(&instance.required_labels) {
                unschedulable += 1;
                println!(
                    "      {} {} needs [{}], which no configured agent has",
                    style("✗").red(),
                    instance.name,
                    instance
                        .required_labels
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
        }
    }

    if unschedulable > 0 {
        bail!("{} job instance(s) cannot be scheduled", unschedulable);
    }
    Ok(ExitCode::SUCCESS)
}

/// Print the instances a trigger would produce.
pub async fn expand(path: &Path, args: &EventArgs) -> anyhow::Result<ExitCode> {
    let workflow = load_workflow(path)?;
    let workspace = std::env::current_dir()?;
    let event = trigger_event(args, &workspace).await?;

    let Some(request) = EventIngest::new().ingest(&workflow, &event) else {
        println!("{} Event matches no trigger", style("!").yellow());
        return Ok(ExitCode::from(EXIT_INVOCATION));
    };
    let variables = request.interpolation_context(&workflow.name);
    let expander = MatrixExpander::new();

    for template in &workflow.jobs {
        for instance in expander.expand_with(&Arc::new(template.clone()), &variables) {
            println!("{} {}", style("•").cyan(), style(&instance.name).bold());
            if !instance.required_labels.is_empty() {
                let labels: Vec<_> = instance.required_labels.iter().cloned().collect();
                println!("    runs on: {}", labels.join(", "));
            }
            let mut env: Vec<_> = instance.env.iter().collect();
            env.sort();
            for (key, value) in env {
                println!("    {}={}", style(key).dim(), value);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Run a workflow locally with the shell runner.
pub async fn run(
    config: &EngineConfig,
    path: &Path,
    args: &EventArgs,
    workspace: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let workflow = load_workflow(path)?;
    let workflow_name = workflow.name.clone();
    let workspace = match workspace {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let event = trigger_event(args, &workspace).await?;

    let (output_tx, output_rx) = mpsc::channel(1024);
    let bus = BroadcastEventBus::default();
    let events_rx = bus.subscribe();

    let engine = Engine::new(
        workflow,
        Arc::new(AgentPool::new(config.agents())),
        Arc::new(ShellRunner::new().with_output(output_tx)),
        Arc::new(cache_store(config)?),
        Arc::new(bus),
        config.engine_options(workspace),
    )?;

    let printers = if json {
        None
    } else {
        Some((
            tokio::spawn(print_output(output_rx)),
            tokio::spawn(print_events(events_rx)),
        ))
    };

    let Some(ticket) = engine.handle_event(&event).await else {
        println!(
            "{} Event matches no trigger of \"{}\"",
            style("!").yellow(),
            workflow_name
        );
        return Ok(ExitCode::from(EXIT_INVOCATION));
    };
    if !json {
        println!(
            "{} Running {} {}",
            style("▶").cyan().bold(),
            style(&workflow_name).bold(),
            style(ticket.run_id).dim()
        );
    }

    let run_id = ticket.run_id;
    let wait = ticket.wait();
    tokio::pin!(wait);
    let result = tokio::select! {
        result = &mut wait => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{} Cancelling run...", style("!").yellow());
            engine.cancel(run_id);
            wait.await?
        }
    };

    // Dropping the engine closes the output and event channels.
    drop(engine);
    if let Some((output, events)) = printers {
        let _ = output.await;
        let _ = events.await;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }
    Ok(ExitCode::from(result.exit_code() as u8))
}

fn cache_store(config: &EngineConfig) -> anyhow::Result<FilesystemCacheStore> {
    match &config.cache_dir {
        Some(dir) => Ok(FilesystemCacheStore::new(dir.clone())),
        None => FilesystemCacheStore::default_location().context("could not determine cache directory"),
    }
}

async fn print_output(mut rx: mpsc::Receiver<OutputLine>) {
    while let Some(line) = rx.recv().await {
        let prefix = style(format!("[{}]", line.label)).dim();
        match line.stream {
            OutputStream::Stdout => println!("      {} {}", prefix, line.content),
            OutputStream::Stderr => eprintln!("      {} {}", prefix, line.content),
        }
    }
}

async fn print_events(mut rx: broadcast::Receiver<Event>) {
    let mut jobs: HashMap<JobId, String> = HashMap::new();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            Event::JobStarted(p) => {
                println!(
                    "{} {} on {}",
                    style("━━▶").cyan(),
                    style(&p.name).bold(),
                    p.agent
                );
                jobs.insert(p.job_id, p.name);
            }
            Event::StepRetrying(p) => println!(
                "    {} {} failed, retrying in {}ms (attempt {}/{})",
                style("↻").yellow(),
                style(&p.step).bold(),
                p.delay_ms,
                p.attempt + 1,
                p.max_attempts
            ),
            Event::StepCompleted(p) => {
                let job = jobs.get(&p.job_id).map(String::as_str).unwrap_or("?");
                let mark = if p.status.is_success() {
                    style("✓").green()
                } else {
                    style("✗").red()
                };
                println!(
                    "    {} {} / {} ({:?}, {}ms)",
                    mark,
                    style(job).dim(),
                    p.step,
                    p.status,
                    p.duration_ms
                );
            }
            Event::CacheHit(p) => println!("    {} cache hit {}", style("⚡").cyan(), style(&p.key).dim()),
            Event::CacheMiss(p) => println!("    {} cache miss {}", style("·").dim(), style(&p.key).dim()),
            Event::CacheSaved(p) => println!("    {} cache saved {}", style("💾").cyan(), style(&p.key).dim()),
            Event::RunCancelled(p) => println!("{} Run cancelled ({:?})", style("!").yellow(), p.reason),
            _ => {}
        }
    }
}

fn job_line(job: &JobResult) -> String {
    if let Some(step) = job.failed_step() {
        let code = step
            .exit_code
            .map_or_else(|| "no exit code".to_string(), |c| format!("exit code {}", c));
        return format!(
            "{}: step '{}' {:?} with {} after {} attempt(s)",
            job.name, step.name, step.status, code, step.attempts
        );
    }
    match &job.error {
        Some(error) => format!("{}: {}", job.name, error),
        None => job.name.clone(),
    }
}

fn print_summary(result: &RunResult) {
    println!();
    for job in &result.job_results {
        let mark = match job.status {
            JobStatus::Success => style("✓").green(),
            JobStatus::Failure => style("✗").red(),
            JobStatus::Cancelled => style("⊘").yellow(),
        };
        println!("{} {}", mark, job_line(job));
    }
    println!(
        "\n{} Run {:?}: {} passed, {} failed, {} cancelled",
        if result.exit_code() == 0 {
            style("✓").green().bold()
        } else {
            style("✗").red().bold()
        },
        result.overall_status,
        result.count(JobStatus::Success),
        result.count(JobStatus::Failure),
        result.count(JobStatus::Cancelled)
    );
}

/// Print the JSON schema for workflow files.
pub fn schema() -> anyhow::Result<ExitCode> {
    let schema = schemars::schema_for!(WorkflowDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(ExitCode::SUCCESS)
}

pub fn cache_path(config: &EngineConfig) -> anyhow::Result<ExitCode> {
    let store = cache_store(config)?;
    println!("{}", store.root_dir().display());
    Ok(ExitCode::SUCCESS)
}

pub async fn cache_clear(config: &EngineConfig) -> anyhow::Result<ExitCode> {
    let store = cache_store(config)?;
    let removed = store.clear().await?;
    println!(
        "{} Removed {} cache entr{}",
        style("✓").green(),
        removed,
        if removed == 1 { "y" } else { "ies" }
    );
    Ok(ExitCode::SUCCESS)
}
