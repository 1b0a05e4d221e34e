//! Gantry CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::{CacheCommands, Commands, LogFormat};
use config::EngineConfig;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about = "Gantry workflow engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

fn init_logging(format: LogFormat, verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { path } => handlers::validate(&config, &path).await,
        Commands::Expand { path, event } => handlers::expand(&path, &event).await,
        Commands::Run {
            path,
            event,
            workspace,
            json,
        } => handlers::run(&config, &path, &event, workspace, json).await,
        Commands::Schema => handlers::schema(),
        Commands::Cache { command } => match command {
            CacheCommands::Path => handlers::cache_path(&config),
            CacheCommands::Clear => handlers::cache_clear(&config).await,
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            ExitCode::from(handlers::EXIT_INVOCATION)
        }
    }
}
