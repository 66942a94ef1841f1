use std::path::Path;

use clap::Args;

use super::Runtime;
use crate::server::ServerControl;

#[derive(Debug, Args)]
pub struct StartArgs {}

impl StartArgs {
    pub fn execute(&self, root: Option<&Path>) -> anyhow::Result<()> {
        let rt = Runtime::load(root)?;
        let server = rt.dolt_server();
        server.start()?;
        let state = server.state();
        println!(
            "dolt server running (pid {}, port {}, data dir {})",
            state.pid,
            state.port,
            state.data_dir.display()
        );
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct StopArgs {}

impl StopArgs {
    pub fn execute(&self, root: Option<&Path>) -> anyhow::Result<()> {
        let rt = Runtime::load(root)?;
        rt.dolt_server().stop()?;
        println!("dolt server stopped");
        Ok(())
    }
}
