//! Transient-error classification and exponential backoff.
//!
//! The signature lists are empirical: they are the substrings Dolt has been
//! observed to emit for each failure class. They are configuration, not
//! protocol, so [`ErrorSignatures`] can be extended from `[signatures]` in
//! the config file without touching code.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Substrings that mark a transient failure worth retrying.
pub const DEFAULT_RETRYABLE: &[&str] = &[
    "cannot update manifest",
    "optimistic lock",
    "serialization failure",
    "lock wait timeout",
    "try restarting transaction",
    "database is locked",
    "unknown database",
];

/// Substrings that mark the server as demoted to read-only.
pub const DEFAULT_READ_ONLY: &[&str] = &["read only", "read-only", "readonly"];

/// Substrings that mark a catalog-propagation race after `CREATE DATABASE`.
pub const DEFAULT_CATALOG: &[&str] = &["unknown database"];

/// Classifier over error messages. All matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSignatures {
    retryable: Vec<String>,
    read_only: Vec<String>,
    catalog: Vec<String>,
}

impl Default for ErrorSignatures {
    fn default() -> Self {
        Self {
            retryable: lowered(DEFAULT_RETRYABLE.iter().copied()),
            read_only: lowered(DEFAULT_READ_ONLY.iter().copied()),
            catalog: lowered(DEFAULT_CATALOG.iter().copied()),
        }
    }
}

/// Extra signatures loaded from config; appended to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SignatureOverrides {
    #[serde(default)]
    pub retryable: Vec<String>,
    #[serde(default)]
    pub read_only: Vec<String>,
    #[serde(default)]
    pub catalog: Vec<String>,
}

impl ErrorSignatures {
    /// Defaults extended with the configured extra signatures.
    pub fn with_overrides(overrides: &SignatureOverrides) -> Self {
        let mut sigs = Self::default();
        sigs.retryable.extend(lowered(overrides.retryable.iter().map(String::as_str)));
        sigs.read_only.extend(lowered(overrides.read_only.iter().map(String::as_str)));
        sigs.catalog.extend(lowered(overrides.catalog.iter().map(String::as_str)));
        sigs
    }

    /// True if the message indicates the server has gone read-only.
    pub fn is_read_only(&self, msg: &str) -> bool {
        contains_any(msg, &self.read_only)
    }

    /// True if the message indicates a catalog-visibility race.
    pub fn is_catalog_race(&self, msg: &str) -> bool {
        contains_any(msg, &self.catalog)
    }

    /// True if the message is a transient failure that a retry can fix.
    ///
    /// Read-only degradation is never retryable here even when the message
    /// also carries a manifest signature ("cannot update manifest: database
    /// is read only"): only a server restart clears it.
    pub fn is_retryable(&self, msg: &str) -> bool {
        if msg.is_empty() || self.is_read_only(msg) {
            return false;
        }
        contains_any(msg, &self.retryable)
    }
}

fn lowered<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    items
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn contains_any(msg: &str, needles: &[String]) -> bool {
    let lower = msg.to_lowercase();
    needles.iter().any(|n| lower.contains(n.as_str()))
}

/// Exponential backoff budget for one class of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// Single statements: 5 attempts, 500ms doubling to 15s.
    pub const STATEMENT: Self = Self {
        max_attempts: 5,
        base: Duration::from_millis(500),
        cap: Duration::from_secs(15),
    };

    /// Multi-statement scripts are costlier: 3 attempts, 500ms to 8s.
    pub const SCRIPT: Self = Self {
        max_attempts: 3,
        base: Duration::from_millis(500),
        cap: Duration::from_secs(8),
    };

    /// Catalog visibility polling: 5 attempts, 100ms to 2s.
    pub const CATALOG: Self = Self {
        max_attempts: 5,
        base: Duration::from_millis(100),
        cap: Duration::from_secs(2),
    };

    /// Post-restart writability verification: 5 attempts, 500ms to 8s.
    pub const RECOVERY: Self = Self {
        max_attempts: 5,
        base: Duration::from_millis(500),
        cap: Duration::from_secs(8),
    };

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.base;
        for _ in 1..attempt {
            delay = delay.saturating_mul(2);
            if delay >= self.cap {
                return self.cap;
            }
        }
        delay.min(self.cap)
    }

    /// Run `op` until it succeeds, fails with an error `should_retry`
    /// rejects, or the attempt budget is spent. Returns the last error.
    pub fn run<T, E: std::fmt::Display>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, E>,
        should_retry: impl Fn(&E) -> bool,
    ) -> Result<T, RetryError<E>> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if !should_retry(&e) => return Err(RetryError::Fatal(e)),
                Err(e) if attempt >= attempts => {
                    return Err(RetryError::Exhausted { attempts, last: e });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    tracing::debug!(
                        attempt,
                        delay_ms,
                        error = %e,
                        "retrying after transient error"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::fmt::Display> {
    #[error("{0}")]
    Fatal(E),
    #[error("after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E: std::fmt::Display> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) | RetryError::Exhausted { last: e, .. } => e,
        }
    }
}
