//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow file and check its jobs can be placed on the
    /// configured agents
    Validate {
        /// Path to workflow file
        #[arg(default_value = "gantry.yaml")]
        path: PathBuf,
    },

    /// Print the job instances a trigger would produce
    Expand {
        /// Path to workflow file
        #[arg(default_value = "gantry.yaml")]
        path: PathBuf,

        #[command(flatten)]
        event: EventArgs,
    },

    /// Run a workflow locally
    Run {
        /// Path to workflow file
        #[arg(default_value = "gantry.yaml")]
        path: PathBuf,

        #[command(flatten)]
        event: EventArgs,

        /// Directory steps run in
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the JSON schema of workflow files
    Schema,

    /// Manage the local cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show the cache directory
    Path,

    /// Delete every cached payload
    Clear,
}

/// Trigger event to simulate.
#[derive(Args, Debug, Clone)]
pub struct EventArgs {
    /// Event type
    #[arg(short, long, value_enum, default_value_t = EventKind::Push)]
    pub event: EventKind,

    /// Branch pushed to, pull request base, or dispatched ref
    #[arg(short, long, default_value = "main")]
    pub branch: String,

    /// Pull request number
    #[arg(long)]
    pub pr: Option<u64>,

    /// Commit SHA; defaults to the workspace HEAD
    #[arg(long)]
    pub sha: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    WorkflowDispatch,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
