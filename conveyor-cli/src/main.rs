mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use commands::plan::PlanArgs;
use commands::report::ReportArgs;
use commands::run::RunArgs;
use commands::validate::ValidateArgs;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Run DAG-based build and deploy workflows locally", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging (RUST_LOG directives still apply)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow
    Run(RunArgs),

    /// Check a workflow file without running it
    Validate(ValidateArgs),

    /// Show the execution order and parallel levels of a workflow
    Plan(PlanArgs),

    /// Summarize a saved run report
    Report(ReportArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run(args) => commands::run::execute(args).await,
        Commands::Validate(args) => commands::validate::execute(args),
        Commands::Plan(args) => commands::plan::execute(args),
        Commands::Report(args) => commands::report::execute(args),
    }
}

/// Diagnostics go to stderr; user-facing progress is printed by `output`
fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
