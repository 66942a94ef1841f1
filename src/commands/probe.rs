use std::path::Path;

use clap::Args;

use super::Runtime;
use crate::error::ExitError;
use crate::server::ServerControl;
use crate::sql::ProbeOutcome;

#[derive(Debug, Args)]
pub struct ProbeArgs {}

impl ProbeArgs {
    /// Health query plus a real write. Exits non-zero unless writable.
    pub fn execute(&self, root: Option<&Path>) -> anyhow::Result<()> {
        let rt = Runtime::load(root)?;
        let server = rt.dolt_server();
        server.health_check()?;
        match server.write_probe() {
            ProbeOutcome::Writable => println!("writable"),
            ProbeOutcome::NoDatabase => println!("reachable (no databases to probe)"),
            ProbeOutcome::ReadOnly(msg) => {
                return Err(ExitError::Other(format!("server is read-only: {msg}")).into());
            }
            ProbeOutcome::Failed(msg) => {
                return Err(ExitError::Other(format!("write probe failed: {msg}")).into());
            }
        }
        Ok(())
    }
}
