//! SQL execution through the `dolt` command-line client.
//!
//! Every statement is sent with an explicit `USE <db>;` prefix instead of
//! a default-database flag. Multi-step work that depends on session state
//! (checkout, autocommit) must go through [`SqlExecutor::run_script`]:
//! two separate calls never share a connection.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::ExitError;
use crate::retry::{ErrorSignatures, RetryError, RetryPolicy};
use crate::subprocess::Tool;

pub const STATEMENT_TIMEOUT: Duration = Duration::from_secs(15);
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

const PROBE_TABLE: &str = "__doltkeeper_health_probe";
const SYSTEM_DATABASES: &[&str] = &["information_schema", "mysql"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SqlError {
    #[error("{message}")]
    Failed { message: String },
    #[error("sql timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("dolt client not found on PATH")]
    NotFound,
    #[error("running dolt client: {0}")]
    Io(String),
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("{original} (read-only recovery failed: {recovery})")]
    RecoveryFailed { original: String, recovery: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl OutputFormat {
    const fn flag(self) -> Option<&'static str> {
        match self {
            Self::Table => None,
            Self::Json => Some("json"),
            Self::Csv => Some("csv"),
        }
    }
}

/// One call = one client process = one server connection.
pub trait SqlExecutor: Send + Sync {
    fn run_statement(
        &self,
        sql: &str,
        format: OutputFormat,
        timeout: Duration,
    ) -> Result<String, SqlError>;

    /// Run a multi-statement script over a single connection.
    fn run_script(&self, script: &str, timeout: Duration) -> Result<String, SqlError>;
}

/// Restarts a read-only server and confirms it accepts writes again.
pub trait ReadOnlyRecovery: Send + Sync {
    fn recover_read_only(&self) -> anyhow::Result<()>;
}

/// [`SqlExecutor`] backed by the `dolt sql` client.
pub struct DoltCli {
    program: String,
    config: Arc<ServerConfig>,
}

impl DoltCli {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            program: "dolt".to_string(),
            config,
        }
    }

    /// Use a different client binary.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    fn tool(&self, timeout: Duration) -> Tool {
        let mut tool = Tool::new(&self.program)
            .args(self.config.sql_args().as_slice())
            .arg("sql")
            .timeout(timeout);
        if self.config.is_remote() {
            if !self.config.password.is_empty() {
                tool = tool.env("DOLT_CLI_PASSWORD", &self.config.password);
            }
        } else {
            tool = tool.current_dir(&self.config.data_dir);
        }
        tool
    }
}

impl SqlExecutor for DoltCli {
    fn run_statement(
        &self,
        sql: &str,
        format: OutputFormat,
        timeout: Duration,
    ) -> Result<String, SqlError> {
        let mut tool = self.tool(timeout);
        if let Some(flag) = format.flag() {
            tool = tool.args(&["-r", flag]);
        }
        tool.args(&["-q", sql])
            .run_ok()
            .map(|out| out.stdout)
            .map_err(classify_tool_error)
    }

    fn run_script(&self, script: &str, timeout: Duration) -> Result<String, SqlError> {
        // Large scripts overflow argv limits, so go through a file. The
        // file is created exclusively with a random name and removed on drop.
        let mut file = tempfile::Builder::new()
            .prefix("doltkeeper-")
            .suffix(".sql")
            .tempfile()
            .map_err(|e| SqlError::Io(format!("creating script file: {e}")))?;
        file.write_all(script.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| SqlError::Io(format!("writing script: {e}")))?;
        self.tool(timeout)
            .arg("--file")
            .arg(&file.path().to_string_lossy())
            .run_ok()
            .map(|out| out.stdout)
            .map_err(classify_tool_error)
    }
}

fn classify_tool_error(err: anyhow::Error) -> SqlError {
    match err.downcast_ref::<ExitError>() {
        Some(ExitError::ToolFailed { message, code, .. }) => SqlError::Failed {
            message: if message.is_empty() {
                format!("dolt exited with status {code}")
            } else {
                message.clone()
            },
        },
        Some(ExitError::Timeout { timeout_secs, .. }) => SqlError::Timeout {
            secs: *timeout_secs,
        },
        Some(ExitError::ToolNotFound { .. }) => SqlError::NotFound,
        _ => SqlError::Io(format!("{err:#}")),
    }
}

/// Reject anything that is not a plain database identifier.
pub fn validate_identifier(name: &str) -> Result<(), SqlError> {
    let ok = (1..=64).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(SqlError::InvalidIdentifier(name.to_string()))
    }
}

/// Backtick-quote a validated identifier.
pub fn quote_ident(name: &str) -> Result<String, SqlError> {
    validate_identifier(name)?;
    Ok(format!("`{name}`"))
}

/// Single-quoted SQL string literal.
pub fn string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// Result of the write probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Writable,
    /// The write failed with a read-only signature.
    ReadOnly(String),
    /// Nothing to probe against.
    NoDatabase,
    /// The write failed for some other reason.
    Failed(String),
}

/// Retry budgets used by [`Sql`].
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub statement: RetryPolicy,
    pub script: RetryPolicy,
    pub catalog: RetryPolicy,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            statement: RetryPolicy::STATEMENT,
            script: RetryPolicy::SCRIPT,
            catalog: RetryPolicy::CATALOG,
        }
    }
}

/// SQL layer: identifier validation, `USE` prefixing, classification and
/// retry on top of an executor.
#[derive(Clone)]
pub struct Sql {
    exec: Arc<dyn SqlExecutor>,
    signatures: ErrorSignatures,
    budget: RetryBudget,
}

impl Sql {
    pub fn new(exec: Arc<dyn SqlExecutor>, signatures: ErrorSignatures) -> Self {
        Self {
            exec,
            signatures,
            budget: RetryBudget::default(),
        }
    }

    pub fn from_config(config: &Arc<ServerConfig>) -> Self {
        Self::new(Arc::new(DoltCli::new(Arc::clone(config))), config.signatures.clone())
    }

    pub fn with_budget(mut self, budget: RetryBudget) -> Self {
        self.budget = budget;
        self
    }


    /// One statement against `db`.
    pub fn statement(&self, db: &str, sql: &str, format: OutputFormat) -> Result<String, SqlError> {
        let db = quote_ident(db)?;
        self.exec
            .run_statement(&format!("USE {db}; {sql}"), format, STATEMENT_TIMEOUT)
    }

    /// One statement with no database selected.
    pub fn server_exec(&self, sql: &str, format: OutputFormat) -> Result<String, SqlError> {
        self.exec.run_statement(sql, format, STATEMENT_TIMEOUT)
    }

    pub fn statement_with_retry(&self, db: &str, sql: &str) -> Result<String, SqlError> {
        quote_ident(db)?;
        self.budget
            .statement
            .run(
                |_| self.statement(db, sql, OutputFormat::Table),
                |e| self.is_retryable(e),
            )
            .map_err(|e| log_retry_failure("statement", e))
    }

    /// Like [`Self::statement_with_retry`], but a read-only failure
    /// triggers `recovery` and one final attempt.
    pub fn statement_with_recovery(
        &self,
        db: &str,
        sql: &str,
        recovery: Option<&dyn ReadOnlyRecovery>,
    ) -> Result<String, SqlError> {
        match self.statement_with_retry(db, sql) {
            Err(e) if self.signatures.is_read_only(&e.to_string()) => {
                let Some(recovery) = recovery else {
                    return Err(e);
                };
                tracing::warn!(database = %db, error = %e, "read-only error, attempting recovery");
                recovery
                    .recover_read_only()
                    .map_err(|re| SqlError::RecoveryFailed {
                        original: e.to_string(),
                        recovery: format!("{re:#}"),
                    })?;
                self.statement(db, sql, OutputFormat::Table)
            }
            other => other,
        }
    }

    /// Run a script over one connection, retrying transient failures.
    pub fn script_with_retry(&self, script: &str) -> Result<String, SqlError> {
        self.budget
            .script
            .run(
                |_| self.exec.run_script(script, SCRIPT_TIMEOUT),
                |e| self.is_retryable(e),
            )
            .map_err(|e| log_retry_failure("script", e))
    }

    /// Rows of a JSON-formatted query.
    pub fn query_json(
        &self,
        db: Option<&str>,
        sql: &str,
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, SqlError> {
        let out = match db {
            Some(db) => self.statement(db, sql, OutputFormat::Json)?,
            None => self.server_exec(sql, OutputFormat::Json)?,
        };
        parse_rows(&out)
    }

    /// Wait until a newly created database is visible to new connections.
    /// Only the catalog-race signature is retried.
    pub fn wait_for_catalog(&self, db: &str) -> Result<(), SqlError> {
        let quoted = quote_ident(db)?;
        self.budget
            .catalog
            .run(
                |_| self.server_exec(&format!("USE {quoted}"), OutputFormat::Table),
                |e| self.signatures.is_catalog_race(&e.to_string()),
            )
            .map(|_| ())
            .map_err(|e| log_retry_failure("catalog wait", e))
    }

    /// `SHOW DATABASES` minus system schemas.
    pub fn list_databases(&self) -> Result<Vec<String>, SqlError> {
        let rows = self.query_json(None, "SHOW DATABASES")?;
        let mut dbs: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("Database").and_then(|v| v.as_str()))
            .filter(|name| !SYSTEM_DATABASES.contains(&name.to_lowercase().as_str()))
            .map(str::to_string)
            .collect();
        dbs.sort();
        Ok(dbs)
    }

    /// Trivial connectivity query.
    pub fn health_check(&self) -> Result<(), SqlError> {
        self.exec
            .run_statement("SELECT 1", OutputFormat::Table, HEALTH_TIMEOUT)
            .map(|_| ())
    }

    /// Create, upsert into and drop a scratch table in the first database.
    pub fn write_probe(&self, databases: &[String]) -> ProbeOutcome {
        let Some(db) = databases.first() else {
            return ProbeOutcome::NoDatabase;
        };
        let quoted = match quote_ident(db) {
            Ok(q) => q,
            Err(e) => return ProbeOutcome::Failed(e.to_string()),
        };
        let script = format!(
            "USE {quoted};\n\
             CREATE TABLE IF NOT EXISTS `{PROBE_TABLE}` (v INT PRIMARY KEY);\n\
             REPLACE INTO `{PROBE_TABLE}` VALUES (1);\n\
             DROP TABLE IF EXISTS `{PROBE_TABLE}`;\n"
        );
        match self.exec.run_script(&script, PROBE_TIMEOUT) {
            Ok(_) => ProbeOutcome::Writable,
            Err(e) if self.signatures.is_read_only(&e.to_string()) => {
                ProbeOutcome::ReadOnly(e.to_string())
            }
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        }
    }

    /// Open connections as reported by the server.
    pub fn active_connections(&self) -> Result<u32, SqlError> {
        let rows = self.query_json(
            None,
            "SELECT COUNT(*) AS cnt FROM information_schema.PROCESSLIST",
        )?;
        let cnt = rows.first().and_then(|row| row.get("cnt"));
        match cnt {
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| unexpected("connection count", &n.to_string())),
            Some(serde_json::Value::String(s)) => {
                s.trim().parse().map_err(|_| unexpected("connection count", s))
            }
            other => Err(unexpected("connection count", &format!("{other:?}"))),
        }
    }

    fn is_retryable(&self, e: &SqlError) -> bool {
        match e {
            SqlError::Failed { message } => self.signatures.is_retryable(message),
            SqlError::Timeout { .. } => self.signatures.is_retryable(&e.to_string()),
            _ => false,
        }
    }
}

fn log_retry_failure(what: &str, err: RetryError<SqlError>) -> SqlError {
    if let RetryError::Exhausted { attempts, last } = &err {
        tracing::warn!(operation = what, attempts, error = %last, "retries exhausted");
    }
    err.into_inner()
}

fn unexpected(what: &str, got: &str) -> SqlError {
    SqlError::Failed {
        message: format!("unexpected {what} in dolt output: {got}"),
    }
}

fn parse_rows(out: &str) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, SqlError> {
    // A statement with an empty result prints nothing at all.
    if out.trim().is_empty() {
        return Ok(Vec::new());
    }
    // Scripts with a USE prefix may print one JSON document per statement;
    // the last one carries the rows.
    let doc = out
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .unwrap_or(out.trim());
    let value: serde_json::Value = serde_json::from_str(doc)
        .or_else(|_| serde_json::from_str(out.trim()))
        .map_err(|e| unexpected("JSON", &e.to_string()))?;
    Ok(value
        .get("rows")
        .and_then(|r| r.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|r| r.as_object().cloned())
                .collect()
        })
        .unwrap_or_default())
}
