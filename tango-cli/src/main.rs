//! Tango CLI: run evaluation jobs against a local workspace.

mod commands;
mod job;

use clap::Parser;
use std::path::PathBuf;

/// Tango: cached, reproducible evaluation runs
#[derive(Parser, Debug)]
#[command(name = "tango", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds `tango.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Evaluate a model as described by a job file
    Eval {
        /// Job file path
        #[arg(short, long)]
        config: PathBuf,
        /// Name for this run (generated when omitted)
        #[arg(long)]
        run_name: Option<String>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default `tango.toml` into the workspace
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    // Logging settings come from the workspace config; a bad file is reported
    // by the command itself once tracing is up.
    let logging = tango_core::config::load_config(Some(&workspace), None)
        .map(|c| c.logging)
        .unwrap_or_default();
    let _guard = tango_core::logging::init_tracing(
        cli.verbose,
        cli.quiet,
        &logging.level,
        logging.json_dir.as_deref(),
    );

    commands::handle_command(cli.command, &workspace).await
}
