use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::paths::RunPaths;
use crate::retry::{ErrorSignatures, SignatureOverrides};

pub const DEFAULT_PORT: u16 = 3307;
pub const DEFAULT_USER: &str = "root";
/// Conservative default to prevent connection storms during mass dispatch.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 50;
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Top-level `doltkeeper.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub redispatch: RedispatchSection,
    /// Extra error signatures appended to the built-in lists.
    #[serde(default)]
    pub signatures: SignatureOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ServerSection {
    /// Server host. Empty or a loopback name means the local server.
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Directory holding one subdirectory per database. Defaults to
    /// `<root>/.dolt-data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            data_dir: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SupervisorSection {
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
    #[serde(default = "default_max_restart_delay")]
    pub max_restart_delay_secs: u64,
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts_in_window: usize,
    #[serde(default = "default_healthy_reset")]
    pub healthy_reset_secs: u64,
    #[serde(default = "default_health_check")]
    pub health_check_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            restart_delay_secs: default_restart_delay(),
            max_restart_delay_secs: default_max_restart_delay(),
            restart_window_secs: default_restart_window(),
            max_restarts_in_window: default_max_restarts(),
            healthy_reset_secs: default_healthy_reset(),
            health_check_secs: default_health_check(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct RedispatchSection {
    #[serde(default = "default_redispatch_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_redispatch_cooldown")]
    pub cooldown_secs: u64,
    /// Prints `[{"status": ...}]` for `{id}`.
    #[serde(default = "default_status_command")]
    pub status_command: Vec<String>,
    /// Re-dispatches `{id}` to `{target}`.
    #[serde(default = "default_dispatch_command")]
    pub dispatch_command: Vec<String>,
    /// Notifies a human about `{id}` after `{attempts}` attempts.
    #[serde(default = "default_escalate_command")]
    pub escalate_command: Vec<String>,
}

impl Default for RedispatchSection {
    fn default() -> Self {
        Self {
            max_attempts: default_redispatch_attempts(),
            cooldown_secs: default_redispatch_cooldown(),
            status_command: default_status_command(),
            dispatch_command: default_dispatch_command(),
            escalate_command: default_escalate_command(),
        }
    }
}

// Default value functions for serde
fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_user() -> String {
    DEFAULT_USER.into()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_restart_delay() -> u64 {
    5
}

fn default_max_restart_delay() -> u64 {
    300
}

fn default_restart_window() -> u64 {
    600
}

fn default_max_restarts() -> usize {
    5
}

fn default_healthy_reset() -> u64 {
    300
}

fn default_health_check() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL.as_secs()
}

fn default_redispatch_attempts() -> u32 {
    3
}

fn default_redispatch_cooldown() -> u64 {
    300
}

fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
    if let Some(tbl) = doc.get_mut(key).and_then(|item| item.as_table_mut()) {
        tbl.decor_mut().set_prefix(comment);
    }
}

fn num<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = get(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
        }
    }
}

fn words(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn default_status_command() -> Vec<String> {
    words(&["bd", "show", "{id}", "--json"])
}

fn default_dispatch_command() -> Vec<String> {
    words(&["gt", "sling", "{id}", "{target}", "--force", "--no-convoy"])
}

fn default_escalate_command() -> Vec<String> {
    words(&[
        "gt",
        "mail",
        "send",
        "mayor/",
        "-s",
        "RECOVERY_NEEDED {id}",
        "-m",
        "{id} failed {attempts} re-dispatches (last target {target})",
    ])
}

impl Config {
    /// Load `<root>/doltkeeper.toml` if present, then apply environment
    /// overrides.
    pub fn load(paths: &RunPaths) -> anyhow::Result<Self> {
        let path = paths.config_file();
        let mut config = if path.exists() {
            Self::load_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse_toml(&contents)
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid doltkeeper.toml: {e}")).into())
    }

    /// Apply `DOLTKEEPER_*` overrides. Unparseable numbers are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(h) = get("DOLTKEEPER_HOST") {
            self.server.host = h;
        }
        if let Some(u) = get("DOLTKEEPER_USER") {
            self.server.user = u;
        }
        if let Some(pw) = get("DOLTKEEPER_PASSWORD") {
            self.server.password = pw;
        }
        num(&get, "DOLTKEEPER_PORT", &mut self.server.port);
        num(&get, "DOLTKEEPER_MAX_CONNECTIONS", &mut self.server.max_connections);

        let sup = &mut self.supervisor;
        num(&get, "DOLTKEEPER_RESTART_DELAY_SECS", &mut sup.restart_delay_secs);
        num(&get, "DOLTKEEPER_MAX_RESTART_DELAY_SECS", &mut sup.max_restart_delay_secs);
        num(&get, "DOLTKEEPER_RESTART_WINDOW_SECS", &mut sup.restart_window_secs);
        num(&get, "DOLTKEEPER_MAX_RESTARTS", &mut sup.max_restarts_in_window);
        num(&get, "DOLTKEEPER_HEALTHY_RESET_SECS", &mut sup.healthy_reset_secs);
        num(&get, "DOLTKEEPER_HEALTH_CHECK_SECS", &mut sup.health_check_secs);

        let rd = &mut self.redispatch;
        num(&get, "DOLTKEEPER_REDISPATCH_MAX_ATTEMPTS", &mut rd.max_attempts);
        num(&get, "DOLTKEEPER_REDISPATCH_COOLDOWN_SECS", &mut rd.cooldown_secs);
    }

    /// Freeze into the immutable per-run server configuration.
    pub fn server_config(&self, paths: &RunPaths) -> ServerConfig {
        let sup = &self.supervisor;
        let restart_delay = Duration::from_secs(sup.restart_delay_secs);
        ServerConfig {
            paths: paths.clone(),
            host: self.server.host.clone(),
            port: self.server.port,
            user: self.server.user.clone(),
            password: self.server.password.clone(),
            data_dir: self
                .server
                .data_dir
                .clone()
                .unwrap_or_else(|| paths.default_data_dir()),
            max_connections: self.server.max_connections,
            restart_delay,
            // A cap below the base would break the doubling invariant.
            max_restart_delay: Duration::from_secs(sup.max_restart_delay_secs).max(restart_delay),
            restart_window: Duration::from_secs(sup.restart_window_secs),
            max_restarts_in_window: sup.max_restarts_in_window,
            healthy_reset_interval: Duration::from_secs(sup.healthy_reset_secs),
            health_check_interval: match sup.health_check_secs {
                0 => DEFAULT_HEALTH_CHECK_INTERVAL,
                s => Duration::from_secs(s),
            },
            signatures: ErrorSignatures::with_overrides(&self.signatures),
        }
    }

    /// Serialize config to a TOML string with section comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;

        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut().set_prefix(
            "# doltkeeper configuration\n\
             # DOLTKEEPER_* environment variables override these values.\n\n",
        );

        set_table_comment(
            &mut doc,
            "server",
            "# Dolt SQL server endpoint (empty host = local server)\n",
        );
        set_table_comment(
            &mut doc,
            "supervisor",
            "\n# Restart backoff, rate cap and heartbeat timing (seconds)\n",
        );
        set_table_comment(
            &mut doc,
            "redispatch",
            "\n# Recovery attempts per work item before escalation\n",
        );
        set_table_comment(
            &mut doc,
            "signatures",
            "\n# Extra error substrings (case-insensitive), appended to built-ins\n",
        );

        Ok(doc.to_string())
    }
}

/// Immutable per-run server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub paths: RunPaths,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub data_dir: PathBuf,
    pub max_connections: u32,
    pub restart_delay: Duration,
    pub max_restart_delay: Duration,
    pub restart_window: Duration,
    pub max_restarts_in_window: usize,
    pub healthy_reset_interval: Duration,
    pub health_check_interval: Duration,
    pub signatures: ErrorSignatures,
}

impl ServerConfig {
    /// Defaults rooted at `paths`, without reading any file or env.
    pub fn for_root(paths: &RunPaths) -> Self {
        Config::default().server_config(paths)
    }

    /// True when the endpoint is not a loopback address.
    pub fn is_remote(&self) -> bool {
        !matches!(
            self.host.to_lowercase().as_str(),
            "" | "127.0.0.1" | "localhost" | "::1" | "[::1]"
        )
    }

    /// `host:port`, defaulting host to 127.0.0.1.
    pub fn host_port(&self) -> String {
        let host = if self.host.is_empty() { "127.0.0.1" } else { &self.host };
        format!("{host}:{}", self.port)
    }

    /// Client connection flags. Empty for the local server, which the
    /// client auto-detects from the data directory.
    pub fn sql_args(&self) -> Vec<String> {
        if !self.is_remote() {
            return Vec::new();
        }
        vec![
            "--host".into(),
            self.host.clone(),
            "--port".into(),
            self.port.to_string(),
            "--user".into(),
            self.user.clone(),
            "--no-tls".into(),
        ]
    }

    /// Connection string for display, password masked.
    pub fn display_dsn(&self, database: Option<&str>) -> String {
        let user = if self.password.is_empty() {
            self.user.clone()
        } else {
            format!("{}:****", self.user)
        };
        format!("{user}@tcp({})/{}", self.host_port(), database.unwrap_or(""))
    }

    pub fn effective_max_connections(&self) -> u32 {
        // 0 means the server default.
        if self.max_connections == 0 { 1000 } else { self.max_connections }
    }
}
