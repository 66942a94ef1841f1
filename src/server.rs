//! Dolt `sql-server` process lifecycle.
//!
//! Local servers are tracked through `<root>/daemon/dolt.pid` plus a
//! process check. Remote servers are only ever probed over TCP; this
//! process never starts or stops them.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{
    Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System, UpdateKind,
};

use crate::config::ServerConfig;
use crate::error::{BestEffort, ExitError};
use crate::lock::{FileLock, LockError};
use crate::paths;
use crate::sql::{ProbeOutcome, Sql};
use crate::subprocess::Tool;

const REMOTE_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const SLOW_QUERY: Duration = Duration::from_secs(1);
/// Fraction of max connections above which the server counts as full.
const CAPACITY_THRESHOLD: f64 = 0.8;

/// The lifecycle operations the supervisor drives.
pub trait ServerControl: Send + Sync {
    fn is_running(&self) -> bool;
    /// Trivial query; proves the server answers.
    fn health_check(&self) -> anyhow::Result<()>;
    /// Real write against one database.
    fn write_probe(&self) -> ProbeOutcome;
    fn start(&self) -> anyhow::Result<()>;
    fn stop(&self) -> anyhow::Result<()>;
}

/// Persisted at `<root>/daemon/dolt-state.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    pub running: bool,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub databases: Vec<String>,
}

impl ServerState {
    /// Missing or unreadable state is the default (not running).
    pub fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> BestEffort {
        let result = serde_json::to_vec_pretty(self)
            .map_err(anyhow::Error::from)
            .and_then(|data| paths::write_atomic(path, &data));
        BestEffort::from_result("save server state", result.map_err(|e| format!("{e:#}")))
    }
}

/// Snapshot for `status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthMetrics {
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub connections: Option<u32>,
    pub max_connections: u32,
    pub connection_pct: Option<f64>,
    pub disk_usage_bytes: Option<u64>,
    pub read_only: bool,
    pub warnings: Vec<String>,
}

pub struct DoltServer {
    config: Arc<ServerConfig>,
    sql: Sql,
    program: String,
    child: Mutex<Option<Child>>,
    ready_attempts: u32,
    ready_interval: Duration,
}

impl DoltServer {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let sql = Sql::from_config(&config);
        Self {
            config,
            sql,
            program: "dolt".to_string(),
            child: Mutex::new(None),
            ready_attempts: 10,
            ready_interval: Duration::from_millis(500),
        }
    }

    pub fn with_sql(mut self, sql: Sql) -> Self {
        self.sql = sql;
        self
    }

    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sql(&self) -> &Sql {
        &self.sql
    }

    pub fn state(&self) -> ServerState {
        ServerState::load(&self.config.paths.state_file())
    }

    /// PID of the running local server, if any. Removes a stale PID file.
    pub fn running_pid(&self) -> Option<u32> {
        self.reap_child();
        let pid_file = self.config.paths.pid_file();
        if let Ok(raw) = fs::read_to_string(&pid_file) {
            match raw.trim().parse::<u32>() {
                Ok(pid) if process_alive(pid) && is_dolt_server(pid) => return Some(pid),
                _ => {
                    tracing::warn!(pid = raw.trim(), "removing stale PID file");
                    let _ = BestEffort::from_result(
                        "remove stale PID file",
                        fs::remove_file(&pid_file),
                    );
                }
            }
        }
        // Started outside doltkeeper: look for a listener on the port.
        let out = Tool::new("lsof")
            .args(&["-i", &format!(":{}", self.config.port), "-t"])
            .timeout(Duration::from_secs(5))
            .run()
            .ok()?;
        out.stdout
            .lines()
            .filter_map(|l| l.trim().parse::<u32>().ok())
            .find(|&pid| is_dolt_server(pid))
    }

    /// Wait on our own child if it exited, so it does not linger as a
    /// zombie that still answers `kill -0`.
    fn reap_child(&self) {
        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(child) = guard.as_mut()
            && let Ok(Some(status)) = child.try_wait()
        {
            tracing::info!(pid = child.id(), %status, "dolt server exited");
            *guard = None;
        }
    }

    fn tcp_reachable(&self) -> bool {
        let Ok(addrs) = self.config.host_port().to_socket_addrs() else {
            return false;
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, REMOTE_DIAL_TIMEOUT).is_ok())
    }

    /// Databases hosted by the server.
    pub fn list_databases(&self) -> anyhow::Result<Vec<String>> {
        if self.config.is_remote() {
            return Ok(self.sql.list_databases()?);
        }
        list_local_databases(&self.config.data_dir)
    }

    /// Remove `.dolt/noms/LOCK` files that no live process holds open.
    /// Skipped entirely when `lsof` is unavailable.
    pub fn cleanup_stale_locks(&self) -> anyhow::Result<usize> {
        let mut removed = 0;
        for db in list_local_databases(&self.config.data_dir)? {
            let lock = self.config.data_dir.join(&db).join(".dolt/noms/LOCK");
            if !lock.exists() {
                continue;
            }
            let held = match Tool::new("lsof")
                .args(&["-t", &lock.to_string_lossy()])
                .timeout(Duration::from_secs(5))
                .run()
            {
                Ok(out) => !out.stdout.trim().is_empty(),
                Err(e) => {
                    tracing::debug!(error = %e, "cannot check lock holders, leaving locks alone");
                    return Ok(removed);
                }
            };
            if !held {
                fs::remove_file(&lock).with_context(|| format!("removing {}", lock.display()))?;
                tracing::info!(database = %db, "removed stale noms LOCK");
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn active_connections(&self) -> anyhow::Result<u32> {
        Ok(self.sql.active_connections()?)
    }

    /// Whether another connection fits below 80% of max connections.
    /// Errors when the count cannot be read, so callers fail closed.
    pub fn has_connection_capacity(&self) -> anyhow::Result<bool> {
        let active = self.active_connections()?;
        Ok(has_capacity(active, self.config.effective_max_connections()))
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let mut m = HealthMetrics {
            max_connections: self.config.effective_max_connections(),
            ..HealthMetrics::default()
        };
        let started = Instant::now();
        match self.sql.health_check() {
            Ok(()) => {
                let latency = started.elapsed();
                m.reachable = true;
                m.latency_ms = Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
                if latency > SLOW_QUERY {
                    m.warnings
                        .push(format!("query latency {}ms exceeds 1s", latency.as_millis()));
                }
            }
            Err(e) => {
                m.warnings.push(format!("server unreachable: {e}"));
                return m;
            }
        }

        match self.sql.active_connections() {
            Ok(n) => {
                let pct = f64::from(n) / f64::from(m.max_connections) * 100.0;
                m.connections = Some(n);
                m.connection_pct = Some(pct);
                if !has_capacity(n, m.max_connections) {
                    m.warnings.push(format!(
                        "connections {n}/{} ({pct:.0}%) above 80% of max",
                        m.max_connections
                    ));
                }
            }
            Err(e) => m.warnings.push(format!("connection count unavailable: {e}")),
        }

        if !self.config.is_remote() {
            m.disk_usage_bytes = Some(dir_size(&self.config.data_dir));
        }

        if let ProbeOutcome::ReadOnly(msg) = self.write_probe() {
            m.read_only = true;
            m.warnings.push(format!("server is read-only: {msg}"));
        }
        m
    }

    fn spawn(&self) -> anyhow::Result<Child> {
        let log_path = self.config.paths.log_file();
        if let Some(dir) = log_path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening {}", log_path.display()))?;
        let log_err = log.try_clone().context("duplicating log handle")?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("sql-server")
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--data-dir")
            .arg(&self.config.data_dir);
        if self.config.max_connections > 0 {
            cmd.arg("--max-connections")
                .arg(self.config.max_connections.to_string());
        }
        cmd.current_dir(&self.config.data_dir)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);

        cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ExitError::ToolNotFound {
                    tool: self.program.clone(),
                }
                .into()
            } else {
                anyhow::Error::new(e).context(format!("spawning {}", self.program))
            }
        })
    }

    fn wait_until_ready(&self, pid: u32) -> anyhow::Result<()> {
        for _ in 0..self.ready_attempts {
            thread::sleep(self.ready_interval);
            self.reap_child();
            if !process_alive(pid) {
                bail!(
                    "dolt server exited during startup; see {}",
                    self.config.paths.log_file().display()
                );
            }
            if self.tcp_reachable() {
                return Ok(());
            }
        }
        bail!(
            "dolt server (pid {pid}) not accepting connections on port {} after startup wait; see {}",
            self.config.port,
            self.config.paths.log_file().display()
        )
    }
}

impl ServerControl for DoltServer {
    fn is_running(&self) -> bool {
        if self.config.is_remote() {
            return self.tcp_reachable();
        }
        self.running_pid().is_some()
    }

    fn health_check(&self) -> anyhow::Result<()> {
        self.sql.health_check().context("health check query failed")
    }

    fn write_probe(&self) -> ProbeOutcome {
        match self.list_databases() {
            Ok(dbs) => self.sql.write_probe(&dbs),
            Err(e) => ProbeOutcome::Failed(format!("listing databases: {e:#}")),
        }
    }

    fn start(&self) -> anyhow::Result<()> {
        if self.config.is_remote() {
            bail!(ExitError::InvalidInput(format!(
                "server at {} is remote; start it on that host",
                self.config.host_port()
            )));
        }
        let paths = &self.config.paths;
        let _lock = FileLock::try_acquire(&paths.start_lock()).map_err(|e| match e {
            LockError::Contended { .. } => {
                anyhow::anyhow!("another process is starting the dolt server")
            }
            other => anyhow::Error::new(other),
        })?;

        if let Some(pid) = self.running_pid() {
            tracing::info!(pid, "dolt server already running");
            return Ok(());
        }

        fs::create_dir_all(&self.config.data_dir)
            .with_context(|| format!("creating {}", self.config.data_dir.display()))?;
        if let Err(e) = self.cleanup_stale_locks() {
            tracing::warn!(error = %e, "stale lock cleanup failed");
        }

        let child = self.spawn()?;
        let pid = child.id();
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
        paths::write_atomic(&paths.pid_file(), pid.to_string().as_bytes())?;
        tracing::info!(
            pid,
            port = self.config.port,
            data_dir = %self.config.data_dir.display(),
            "started dolt server"
        );

        let state = ServerState {
            running: true,
            pid,
            port: self.config.port,
            started_at: Some(Utc::now()),
            data_dir: self.config.data_dir.clone(),
            databases: list_local_databases(&self.config.data_dir).unwrap_or_default(),
        };
        let _ = state.save(&paths.state_file());

        self.wait_until_ready(pid)
    }

    fn stop(&self) -> anyhow::Result<()> {
        if self.config.is_remote() {
            bail!(ExitError::InvalidInput(format!(
                "server at {} is remote; stop it on that host",
                self.config.host_port()
            )));
        }
        let paths = &self.config.paths;
        let Some(pid) = self.running_pid() else {
            tracing::info!("dolt server not running");
            let _ = mark_stopped(&self.config);
            return Ok(());
        };

        send_signal(pid, Signal::Term)?;
        let mut exited = false;
        for _ in 0..10 {
            thread::sleep(Duration::from_millis(500));
            self.reap_child();
            if !process_alive(pid) {
                exited = true;
                break;
            }
        }
        if !exited {
            tracing::warn!(pid, "dolt server ignored SIGTERM, sending SIGKILL");
            send_signal(pid, Signal::Kill)?;
            thread::sleep(Duration::from_millis(100));
            self.reap_child();
        }

        let _ = BestEffort::from_result("remove PID file", remove_if_exists(&paths.pid_file()));
        let _ = mark_stopped(&self.config);
        tracing::info!(pid, "stopped dolt server");
        Ok(())
    }
}

fn mark_stopped(config: &ServerConfig) -> BestEffort {
    let path = config.paths.state_file();
    let mut state = ServerState::load(&path);
    state.running = false;
    state.pid = 0;
    state.save(&path)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn has_capacity(active: u32, max: u32) -> bool {
    f64::from(active) < f64::from(max) * CAPACITY_THRESHOLD
}

/// Subdirectories of `data_dir` that hold a `.dolt` directory.
pub fn list_local_databases(data_dir: &Path) -> anyhow::Result<Vec<String>> {
    let entries = match fs::read_dir(data_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", data_dir.display())),
    };
    let mut dbs: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().join(".dolt").is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    dbs.sort();
    Ok(dbs)
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|e| match e.file_type() {
            Ok(t) if t.is_dir() => dir_size(&e.path()),
            Ok(_) => e.metadata().map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        })
        .sum()
}

/// Run `f` against a fresh snapshot of `pid`, or `None` if it is gone.
fn inspect_process<T>(pid: u32, f: impl FnOnce(&Process) -> T) -> Option<T> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    sys.process(pid).map(f)
}

fn is_dolt_server(pid: u32) -> bool {
    inspect_process(pid, |p| {
        let cmd = p
            .cmd()
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        cmd.contains("dolt") && cmd.contains("sql-server")
    })
    .unwrap_or(false)
}

/// A zombie has exited; only its exit status is left to collect.
fn process_alive(pid: u32) -> bool {
    inspect_process(pid, |p| p.status() != ProcessStatus::Zombie).unwrap_or(false)
}

/// Deliver `signal`. A process that is already gone counts as delivered.
fn send_signal(pid: u32, signal: Signal) -> anyhow::Result<()> {
    match inspect_process(pid, |p| p.kill_with(signal)) {
        None | Some(Some(true)) => Ok(()),
        Some(Some(false)) => bail!("sending {signal:?} to {pid} failed"),
        Some(None) => bail!("{signal:?} is not supported on this platform"),
    }
}
