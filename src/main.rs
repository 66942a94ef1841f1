use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use doltkeeper::commands::branch::BranchCommand;
use doltkeeper::commands::init::InitArgs;
use doltkeeper::commands::probe::ProbeArgs;
use doltkeeper::commands::redispatch::RedispatchArgs;
use doltkeeper::commands::server::{StartArgs, StopArgs};
use doltkeeper::commands::status::StatusArgs;
use doltkeeper::commands::supervise::SuperviseArgs;
use doltkeeper::{commands, error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "doltkeeper",
    version,
    about = "Supervisor and branch-isolated write coordination for a shared Dolt SQL server"
)]
struct Cli {
    /// Run root (default: $DOLTKEEPER_ROOT, then ~/gt)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Keep the dolt server alive, answering and writable (Ctrl-C to stop)
    Supervise(SuperviseArgs),
    /// Start the local dolt server
    Start(StartArgs),
    /// Stop the local dolt server
    Stop(StopArgs),
    /// Show server state, health and the unhealthy signal
    Status(StatusArgs),
    /// Run the health query and write probe
    Probe(ProbeArgs),
    /// Per-worker branch operations
    Branch {
        #[command(subcommand)]
        command: BranchCommand,
    },
    /// Re-dispatch a failing work item, escalating after repeated failures
    Redispatch(RedispatchArgs),
    /// Write a default doltkeeper.toml
    Init(InitArgs),
    /// Print the JSON Schema for doltkeeper.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Supervise(_) => "supervise",
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Status(_) => "status",
            Self::Probe(_) => "probe",
            Self::Branch { command } => command.name(),
            Self::Redispatch(_) => "redispatch",
            Self::Init(_) => "init",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let root = cli.root.as_deref();
    let result = match cli.command {
        Commands::Supervise(args) => args.execute(root),
        Commands::Start(args) => args.execute(root),
        Commands::Stop(args) => args.execute(root),
        Commands::Status(args) => args.execute(root),
        Commands::Probe(args) => args.execute(root),
        Commands::Branch { command } => command.execute(root),
        Commands::Redispatch(args) => args.execute(root),
        Commands::Init(args) => args.execute(root),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
