//! On-disk layout under the run root.
//!
//! ```text
//! <root>/doltkeeper.toml
//! <root>/routes.jsonl
//! <root>/.dolt-data/<database>/.dolt
//! <root>/daemon/dolt.pid | dolt.log | dolt.lock | dolt-state.json | DOLT_UNHEALTHY
//! <root>/supervisor/redispatch-state.json
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;

pub const CONFIG_FILE: &str = "doltkeeper.toml";
pub const UNHEALTHY_SIGNAL: &str = "DOLT_UNHEALTHY";

/// Resolved paths for one run root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    root: PathBuf,
}

impl RunPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Run root from `--root`, then `DOLTKEEPER_ROOT`, then `~/gt`.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(p) = explicit {
            return Ok(Self::new(p));
        }
        if let Ok(p) = std::env::var("DOLTKEEPER_ROOT")
            && !p.is_empty()
        {
            return Ok(Self::new(p));
        }
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(Self::new(home.join("gt")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn routes_file(&self) -> PathBuf {
        self.root.join("routes.jsonl")
    }

    pub fn default_data_dir(&self) -> PathBuf {
        self.root.join(".dolt-data")
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.daemon_dir().join("dolt.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.daemon_dir().join("dolt.log")
    }

    pub fn start_lock(&self) -> PathBuf {
        self.daemon_dir().join("dolt.lock")
    }

    pub fn state_file(&self) -> PathBuf {
        self.daemon_dir().join("dolt-state.json")
    }

    pub fn unhealthy_signal(&self) -> PathBuf {
        self.daemon_dir().join(UNHEALTHY_SIGNAL)
    }

    pub fn redispatch_state(&self) -> PathBuf {
        self.root.join("supervisor").join("redispatch-state.json")
    }
}

/// Write `contents` to `path` via a sibling temp file and rename, so
/// readers never observe a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temp file in {}", parent.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("writing {}", tmp.path().display()))?;
    tmp.as_file().sync_all().ok();
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}
