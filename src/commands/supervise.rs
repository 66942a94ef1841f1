use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Args;

use super::Runtime;
use crate::supervisor::SupervisorError;

#[derive(Debug, Args)]
pub struct SuperviseArgs {
    /// Heartbeat interval in seconds (default: supervisor.health_check_secs)
    #[arg(long)]
    pub interval: Option<u64>,
    /// Run a single heartbeat and exit
    #[arg(long)]
    pub once: bool,
}

impl SuperviseArgs {
    pub fn execute(&self, root: Option<&Path>) -> anyhow::Result<()> {
        let rt = Runtime::load(root)?;
        let supervisor = rt.supervisor();

        if self.once {
            return supervisor
                .ensure_running()
                .map_err(SupervisorError::into_anyhow);
        }

        let interval = match self.interval {
            Some(0) | None => rt.server.health_check_interval,
            Some(secs) => Duration::from_secs(secs),
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            tracing::info!("interrupt received, stopping supervisor");
            flag.store(true, Ordering::SeqCst);
        })
        .context("installing Ctrl-C handler")?;

        supervisor.run(interval, &shutdown);
        Ok(())
    }
}
