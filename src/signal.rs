//! The `DOLT_UNHEALTHY` signal file.
//!
//! Presence means degraded; absence means healthy. Other tools poll for
//! the file instead of querying SQL themselves.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BestEffort;
use crate::paths::{self, RunPaths};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReason {
    ServerDead,
    ReadOnly,
    Unhealthy,
}

impl fmt::Display for SignalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ServerDead => "server_dead",
            Self::ReadOnly => "read_only",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Contents of the signal file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub reason: SignalReason,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UnhealthySignal {
    path: PathBuf,
}

impl UnhealthySignal {
    pub fn new(paths: &RunPaths) -> Self {
        Self::at(paths.unhealthy_signal())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, reason: SignalReason, message: &str) -> BestEffort {
        let record = SignalRecord {
            reason,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        let result = serde_json::to_vec_pretty(&record)
            .map_err(anyhow::Error::from)
            .and_then(|data| paths::write_atomic(&self.path, &data));
        if result.is_ok() {
            tracing::warn!(%reason, message, "server marked unhealthy");
        }
        BestEffort::from_result("write unhealthy signal", result.map_err(|e| format!("{e:#}")))
    }

    /// Remove the signal. A missing file is already the healthy state.
    pub fn clear(&self) -> BestEffort {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!("unhealthy signal cleared");
                BestEffort::Completed
            }
            Err(e) if e.kind() == ErrorKind::NotFound => BestEffort::Completed,
            Err(e) => BestEffort::from_result(
                "clear unhealthy signal",
                Err(format!("{}: {e}", self.path.display())),
            ),
        }
    }

    pub fn is_present(&self) -> bool {
        self.path.exists()
    }

    /// Read the record. A file that exists but does not parse still
    /// counts as unhealthy, with reason `unhealthy`.
    pub fn read(&self) -> Option<SignalRecord> {
        let data = fs::read_to_string(&self.path).ok()?;
        Some(serde_json::from_str(&data).unwrap_or_else(|_| SignalRecord {
            reason: SignalReason::Unhealthy,
            message: data.trim().to_string(),
            timestamp: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_clear() {
        let dir = tempfile::tempdir().unwrap();
        let signal = UnhealthySignal::new(&RunPaths::new(dir.path()));
        assert!(!signal.is_present());

        assert_eq!(signal.write(SignalReason::ReadOnly, "probe failed"), BestEffort::Completed);
        assert!(signal.is_present());
        let raw = fs::read_to_string(signal.path()).unwrap();
        assert!(raw.contains("\"read_only\""), "{raw}");

        let record = signal.read().unwrap();
        assert_eq!(record.reason, SignalReason::ReadOnly);
        assert_eq!(record.message, "probe failed");

        assert_eq!(signal.clear(), BestEffort::Completed);
        assert!(!signal.is_present());
        // Clearing twice is fine.
        assert_eq!(signal.clear(), BestEffort::Completed);
    }

    #[test]
    fn overwrite_keeps_latest_reason() {
        let dir = tempfile::tempdir().unwrap();
        let signal = UnhealthySignal::new(&RunPaths::new(dir.path()));
        let _ = signal.write(SignalReason::ServerDead, "not running");
        let _ = signal.write(SignalReason::ReadOnly, "read only");
        assert_eq!(signal.read().unwrap().reason, SignalReason::ReadOnly);
    }

    #[test]
    fn unparseable_file_reads_as_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let signal = UnhealthySignal::at(dir.path().join("DOLT_UNHEALTHY"));
        fs::write(signal.path(), "legacy text\n").unwrap();
        let record = signal.read().unwrap();
        assert_eq!(record.reason, SignalReason::Unhealthy);
        assert_eq!(record.message, "legacy text");
    }

    #[test]
    fn write_failure_is_warned_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // Parent path is a regular file, so the directory cannot be created.
        let blocker = dir.path().join("daemon");
        fs::write(&blocker, "").unwrap();
        let signal = UnhealthySignal::at(blocker.join("DOLT_UNHEALTHY"));
        assert!(signal.write(SignalReason::ServerDead, "down").is_warned());
    }

    #[test]
    fn reason_strings() {
        assert_eq!(SignalReason::ServerDead.to_string(), "server_dead");
        assert_eq!(SignalReason::ReadOnly.to_string(), "read_only");
        assert_eq!(
            serde_json::to_string(&SignalReason::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }
}
