use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use super::{OutputFormat, Runtime, print_json};
use crate::error::ExitError;
use crate::lock::KeyedMutex;
use crate::redispatch::{CommandDispatcher, RedispatchAction, RedispatchStore, Redispatcher};
use crate::routing::RoutesFile;

#[derive(Debug, Args)]
pub struct RedispatchArgs {
    /// Work item to re-dispatch
    #[arg(required_unless_present = "prune")]
    pub work_id: Option<String>,
    /// Target database/rig (default: resolved from routes.jsonl by prefix)
    #[arg(long)]
    pub target: Option<String>,
    /// Drop records for closed or unknown work items instead
    #[arg(long, conflicts_with_all = ["work_id", "target"])]
    pub prune: bool,
    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

impl RedispatchArgs {
    pub fn execute(&self, root: Option<&Path>) -> anyhow::Result<()> {
        let rt = Runtime::load(root)?;
        let rd = &rt.config.redispatch;
        let dispatcher = CommandDispatcher::new(
            rt.paths.root(),
            rd.status_command.clone(),
            rd.dispatch_command.clone(),
            rd.escalate_command.clone(),
        );
        let routes = RoutesFile::load(&rt.paths.routes_file())?;
        let store = RedispatchStore::new(rt.paths.redispatch_state(), Arc::new(KeyedMutex::new()));
        let redispatcher = Redispatcher::new(store, Arc::new(dispatcher), Arc::new(routes))
            .with_limits(rd.max_attempts, Duration::from_secs(rd.cooldown_secs));

        if self.prune {
            let pruned = redispatcher.prune()?;
            match self.format {
                OutputFormat::Json => print_json(&serde_json::json!({ "pruned": pruned }))?,
                OutputFormat::Text => println!("pruned {pruned} record(s)"),
            }
            return Ok(());
        }

        let work_id = self.work_id.as_deref().unwrap_or_default().trim();
        if work_id.is_empty() {
            return Err(ExitError::InvalidInput("work item id is empty".to_string()).into());
        }
        let result = redispatcher.redispatch(work_id, self.target.as_deref())?;
        match self.format {
            OutputFormat::Json => print_json(&result)?,
            OutputFormat::Text => println!("{work_id}: {}", result.message),
        }
        if result.action == RedispatchAction::Error {
            return Err(ExitError::Other(result.message).into());
        }
        Ok(())
    }
}
