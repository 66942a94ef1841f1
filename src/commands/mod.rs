pub mod branch;
pub mod init;
pub mod probe;
pub mod redispatch;
pub mod schema;
pub mod server;
pub mod status;
pub mod supervise;

use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, ServerConfig};
use crate::paths::RunPaths;
use crate::server::DoltServer;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Run root plus loaded configuration, shared by every command.
pub struct Runtime {
    pub paths: RunPaths,
    pub config: Config,
    pub server: Arc<ServerConfig>,
}

impl Runtime {
    pub fn load(root: Option<&Path>) -> anyhow::Result<Self> {
        let paths = RunPaths::resolve(root)?;
        let config = Config::load(&paths)?;
        let server = Arc::new(config.server_config(&paths));
        tracing::debug!(
            root = %paths.root().display(),
            endpoint = %server.display_dsn(None),
            "loaded config"
        );
        Ok(Self {
            paths,
            config,
            server,
        })
    }

    pub fn dolt_server(&self) -> DoltServer {
        DoltServer::new(Arc::clone(&self.server))
    }

    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(&self.server, Arc::new(self.dolt_server()))
    }
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
