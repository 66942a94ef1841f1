use std::path::Path;
use std::sync::Arc;

use clap::{Args, Subcommand};
use serde::Serialize;

use super::{OutputFormat, Runtime, print_json};
use crate::branch::{
    BranchCoordinator, BranchError, MergeOutcome, validate_branch_name, worker_branch_name,
};
use crate::error::ExitError;
use crate::routing::Actor;
use crate::server::DoltServer;
use crate::sql::{Sql, SqlError, validate_identifier};

#[derive(Debug, Subcommand)]
pub enum BranchCommand {
    /// Print a worker branch name (<role>-<worker>-<unix-ts>)
    Name {
        role: String,
        worker: String,
    },
    /// Create a branch from the current HEAD of main
    Create(BranchTarget),
    /// Commit pending writes on a branch (main when --branch is omitted)
    Commit {
        database: String,
        #[arg(long)]
        branch: Option<String>,
        #[arg(short, long)]
        message: String,
    },
    /// Merge a branch into main and delete it
    Merge {
        #[command(flatten)]
        target: BranchTarget,
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },
    /// Delete a branch (failures are reported, never fatal)
    Delete(BranchTarget),
    /// Print whether a branch exists
    Exists(BranchTarget),
}

#[derive(Debug, Args)]
pub struct BranchTarget {
    pub database: String,
    pub branch: String,
}

#[derive(Debug, Serialize)]
struct MergeReport<'a> {
    database: &'a str,
    branch: &'a str,
    outcome: MergeOutcome,
}

impl BranchCommand {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Name { .. } => "branch.name",
            Self::Create(_) => "branch.create",
            Self::Commit { .. } => "branch.commit",
            Self::Merge { .. } => "branch.merge",
            Self::Delete(_) => "branch.delete",
            Self::Exists(_) => "branch.exists",
        }
    }

    pub fn execute(&self, root: Option<&Path>) -> anyhow::Result<()> {
        if let Self::Name { role, worker } = self {
            println!(
                "{}",
                worker_branch_name(role, worker, chrono::Utc::now().timestamp())
            );
            return Ok(());
        }

        let rt = Runtime::load(root)?;
        let coordinator = coordinator(&rt);

        match self {
            Self::Name { .. } => {}
            Self::Create(t) => {
                let server = rt.dolt_server();
                preflight(&server, t)?;
                server
                    .sql()
                    .wait_for_catalog(&t.database)
                    .map_err(|e| to_exit(e.into()))?;
                coordinator
                    .create_branch(&t.database, &t.branch)
                    .map_err(to_exit)?;
                println!("created {}", t.branch);
            }
            Self::Commit {
                database,
                branch,
                message,
            } => {
                coordinator
                    .commit_working_set(database, branch.as_deref(), message)
                    .map_err(to_exit)?;
                println!("committed {}", branch.as_deref().unwrap_or("main"));
            }
            Self::Merge { target, format } => {
                preflight(&rt.dolt_server(), target)?;
                let outcome = coordinator
                    .merge_branch(&target.database, &target.branch)
                    .map_err(to_exit)?;
                match format {
                    OutputFormat::Json => print_json(&MergeReport {
                        database: &target.database,
                        branch: &target.branch,
                        outcome,
                    })?,
                    OutputFormat::Text => println!("merged {}: {outcome}", target.branch),
                }
            }
            Self::Delete(t) => {
                if let crate::error::BestEffort::Warned(msg) =
                    coordinator.delete_branch(&t.database, &t.branch)
                {
                    eprintln!("warning: {msg}");
                }
            }
            Self::Exists(t) => {
                let exists = coordinator
                    .branch_exists(&t.database, &t.branch)
                    .map_err(to_exit)?;
                println!("{exists}");
            }
        }
        Ok(())
    }
}

/// Local servers get read-only recovery through the supervisor; a remote
/// server is restarted by whoever runs it.
fn coordinator(rt: &Runtime) -> BranchCoordinator {
    let coordinator = BranchCoordinator::new(Sql::from_config(&rt.server), Actor::from_env());
    if rt.server.is_remote() {
        coordinator
    } else {
        coordinator.with_recovery(Arc::new(rt.supervisor()))
    }
}

/// Validate the target, then refuse new writes when the server is near its
/// connection limit. An unreadable count counts as full.
fn preflight(server: &DoltServer, t: &BranchTarget) -> anyhow::Result<()> {
    validate_identifier(&t.database).map_err(|e| to_exit(e.into()))?;
    validate_branch_name(&t.branch).map_err(to_exit)?;
    match server.has_connection_capacity() {
        Ok(true) => Ok(()),
        Ok(false) => Err(ExitError::Other(format!(
            "dolt server is near max connections ({}), try again later",
            server.config().effective_max_connections()
        ))
        .into()),
        Err(e) => Err(ExitError::Other(format!("cannot check connection capacity: {e:#}")).into()),
    }
}

fn to_exit(e: BranchError) -> anyhow::Error {
    match e {
        BranchError::InvalidName(_) | BranchError::Sql(SqlError::InvalidIdentifier(_)) => {
            ExitError::InvalidInput(e.to_string()).into()
        }
        BranchError::Sql(SqlError::NotFound) => ExitError::ToolNotFound {
            tool: "dolt".to_string(),
        }
        .into(),
        BranchError::Sql(SqlError::Timeout { secs }) => ExitError::Timeout {
            tool: "dolt".to_string(),
            timeout_secs: secs,
        }
        .into(),
        other => anyhow::Error::new(other),
    }
}
