use std::process::ExitCode;

/// Errors that cause doltkeeper to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("restart cap exceeded: {count} restarts within {window_secs}s, manual intervention required")]
    RestartCapExceeded { count: usize, window_secs: u64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::RestartCapExceeded { .. } => ExitCode::from(6),
            ExitError::InvalidInput(_) => ExitCode::from(7),
            ExitError::Other(_) => ExitCode::from(1),
        }
    }
}

/// Outcome of a cleanup step whose failure must not fail the caller.
///
/// Failures are logged at `warn` when the value is produced, so callers
/// may ignore it; tests inspect it to assert that a warning was emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum BestEffort {
    Completed,
    Warned(String),
}

impl BestEffort {
    /// Log a failed cleanup step and convert it into a `BestEffort`.
    pub fn from_result<E: std::fmt::Display>(operation: &str, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => BestEffort::Completed,
            Err(e) => {
                tracing::warn!(operation, error = %e, "best-effort step failed");
                BestEffort::Warned(format!("{operation}: {e}"))
            }
        }
    }

    pub fn is_warned(&self) -> bool {
        matches!(self, BestEffort::Warned(_))
    }
}
