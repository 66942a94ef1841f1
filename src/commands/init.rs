use std::fs;
use std::path::Path;

use anyhow::Context;
use clap::Args;

use crate::config::Config;
use crate::error::ExitError;
use crate::paths::RunPaths;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Overwrite an existing doltkeeper.toml
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    /// Write a commented default config and create the daemon directory.
    pub fn execute(&self, root: Option<&Path>) -> anyhow::Result<()> {
        let paths = RunPaths::resolve(root)?;
        let config_path = paths.config_file();
        if config_path.exists() && !self.force {
            return Err(ExitError::InvalidInput(format!(
                "{} already exists (use --force to overwrite)",
                config_path.display()
            ))
            .into());
        }

        fs::create_dir_all(paths.daemon_dir())
            .with_context(|| format!("creating {}", paths.daemon_dir().display()))?;
        let contents = Config::default().to_toml()?;
        fs::write(&config_path, contents)
            .with_context(|| format!("writing {}", config_path.display()))?;

        tracing::info!(path = %config_path.display(), "wrote config");
        println!("Wrote {}", config_path.display());
        Ok(())
    }
}
