// relcut command line
// Runs matrix release pipelines and propagates version bumps

mod commands;
mod output;
mod telemetry;

use clap::{Parser, Subcommand};
use color_eyre::Result;

use commands::{matrix, propagate, restore, run, validate};

/// Matrix release pipelines and version propagation
#[derive(Parser, Debug)]
#[command(name = "relcut", version, about)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "RELCUT_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline for a trigger event
    Run(run::RunArgs),

    /// Validate a pipeline file without running it
    Validate(validate::ValidateArgs),

    /// List the matrix combinations and artifact names of a pipeline
    Matrix(matrix::MatrixArgs),

    /// Rewrite version strings across a source tree
    Propagate(propagate::PropagateArgs),

    /// Restore files from backups left by a failed propagation
    Restore(restore::RestoreArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    telemetry::init_tracing(cli.log_json, level);

    match cli.command {
        Command::Run(args) => run::execute(args).await,
        Command::Validate(args) => validate::execute(args),
        Command::Matrix(args) => matrix::execute(args),
        Command::Propagate(args) => propagate::execute(args),
        Command::Restore(args) => restore::execute(args),
    }
}
