//! Rate-limited re-dispatch of failing work items.
//!
//! Each work item gets a small record (attempts, last attempt, last
//! target, escalated). An item is re-dispatched at most once per cooldown,
//! and after `max_attempts` it is escalated once instead.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock::{FileLock, KeyedMutex};
use crate::paths;
use crate::routing::RouteResolver;
use crate::subprocess::Tool;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_target: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
}

impl ItemRecord {
    pub fn cooldown_remaining(&self, cooldown: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.last_attempt_time?;
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    fn record_attempt(&mut self, target: &str, now: DateTime<Utc>) {
        self.attempt_count += 1;
        self.last_attempt_time = Some(now);
        self.last_target = Some(target.to_string());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedispatchState {
    #[serde(default)]
    pub items: BTreeMap<String, ItemRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// The state file, guarded in-process by a keyed mutex and across
/// processes by a sibling `.lock` file.
#[derive(Clone)]
pub struct RedispatchStore {
    path: PathBuf,
    locks: Arc<KeyedMutex>,
}

impl RedispatchStore {
    pub fn new(path: impl Into<PathBuf>, locks: Arc<KeyedMutex>) -> Self {
        Self {
            path: path.into(),
            locks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<RedispatchState> {
        match fs::read_to_string(&self.path) {
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("parsing {}", self.path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(RedispatchState::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    fn save(&self, state: &mut RedispatchState) -> anyhow::Result<()> {
        state.last_updated = Some(Utc::now());
        let data = serde_json::to_vec_pretty(state).context("serializing redispatch state")?;
        paths::write_atomic(&self.path, &data)
    }

    /// Read-modify-write under both locks. The state is saved only when
    /// `f` returns `(_, true)`.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut RedispatchState) -> (T, bool),
    ) -> anyhow::Result<T> {
        let key = self.path.to_string_lossy().into_owned();
        self.locks.with_lock(&key, || -> anyhow::Result<T> {
            let _file_lock = FileLock::acquire(&self.path.with_extension("lock"))?;
            let mut state = self.load()?;
            let (out, dirty) = f(&mut state);
            if dirty {
                self.save(&mut state)?;
            }
            Ok(out)
        })
    }
}

/// External work-tracking operations.
pub trait Dispatcher: Send + Sync {
    /// Current status (`open`, `closed`, ...), or `None` if unknown.
    fn status(&self, work_id: &str) -> Option<String>;
    fn dispatch(&self, work_id: &str, target: &str) -> anyhow::Result<()>;
    fn escalate(&self, work_id: &str, record: &ItemRecord) -> anyhow::Result<()>;
}

/// [`Dispatcher`] that shells out to configured command templates.
/// `{id}`, `{target}` and `{attempts}` are substituted per argument.
pub struct CommandDispatcher {
    root: PathBuf,
    status_command: Vec<String>,
    dispatch_command: Vec<String>,
    escalate_command: Vec<String>,
}

impl CommandDispatcher {
    pub fn new(
        root: &Path,
        status_command: Vec<String>,
        dispatch_command: Vec<String>,
        escalate_command: Vec<String>,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            status_command,
            dispatch_command,
            escalate_command,
        }
    }

    fn tool(&self, template: &[String], vars: &[(&str, &str)]) -> anyhow::Result<Tool> {
        let (program, args) = template
            .split_first()
            .context("command template is empty")?;
        let expand = |s: &str| {
            vars.iter()
                .fold(s.to_string(), |acc, (k, v)| acc.replace(&format!("{{{k}}}"), v))
        };
        let args: Vec<String> = args.iter().map(|a| expand(a)).collect();
        Ok(Tool::new(&expand(program))
            .args(args.as_slice())
            .current_dir(&self.root)
            .timeout(Duration::from_secs(60)))
    }
}

impl Dispatcher for CommandDispatcher {
    fn status(&self, work_id: &str) -> Option<String> {
        let out = self
            .tool(&self.status_command, &[("id", work_id)])
            .ok()?
            .run_ok()
            .ok()?;
        status_field(&out.parse_json().ok()?)
    }

    fn dispatch(&self, work_id: &str, target: &str) -> anyhow::Result<()> {
        self.tool(&self.dispatch_command, &[("id", work_id), ("target", target)])?
            .run_ok()?;
        Ok(())
    }

    fn escalate(&self, work_id: &str, record: &ItemRecord) -> anyhow::Result<()> {
        let attempts = record.attempt_count.to_string();
        let target = record.last_target.clone().unwrap_or_default();
        self.tool(
            &self.escalate_command,
            &[("id", work_id), ("target", &target), ("attempts", &attempts)],
        )?
        .run_ok()?;
        Ok(())
    }
}

/// Status from `[{"status": ...}]` or `{"status": ...}`.
fn status_field(value: &serde_json::Value) -> Option<String> {
    let obj = match value {
        serde_json::Value::Array(items) => items.first()?,
        other => other,
    };
    obj.get("status")?.as_str().map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedispatchAction {
    AlreadyEscalated,
    Cooldown,
    Escalated,
    Error,
    Skipped,
    Redispatched,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedispatchResult {
    pub work_id: String,
    pub action: RedispatchAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub attempts: u32,
    pub message: String,
}

pub struct Redispatcher {
    store: RedispatchStore,
    dispatcher: Arc<dyn Dispatcher>,
    routes: Arc<dyn RouteResolver>,
    max_attempts: u32,
    cooldown: Duration,
}

impl Redispatcher {
    pub fn new(
        store: RedispatchStore,
        dispatcher: Arc<dyn Dispatcher>,
        routes: Arc<dyn RouteResolver>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            routes,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cooldown: DEFAULT_COOLDOWN,
        }
    }

    /// Zero values keep the defaults.
    pub fn with_limits(mut self, max_attempts: u32, cooldown: Duration) -> Self {
        if max_attempts > 0 {
            self.max_attempts = max_attempts;
        }
        if !cooldown.is_zero() {
            self.cooldown = cooldown;
        }
        self
    }

    pub fn redispatch(
        &self,
        work_id: &str,
        target: Option<&str>,
    ) -> anyhow::Result<RedispatchResult> {
        self.redispatch_at(work_id, target, Utc::now())
    }

    pub fn redispatch_at(
        &self,
        work_id: &str,
        target: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RedispatchResult> {
        let result = self.store.update(|state| {
            let record = state.items.entry(work_id.to_string()).or_default();
            self.decide(work_id, target, record, now)
        })?;
        tracing::info!(
            work_id,
            action = ?result.action,
            attempts = result.attempts,
            message = %result.message,
            "redispatch"
        );
        Ok(result)
    }

    fn decide(
        &self,
        work_id: &str,
        target: Option<&str>,
        record: &mut ItemRecord,
        now: DateTime<Utc>,
    ) -> (RedispatchResult, bool) {
        let mut result = RedispatchResult {
            work_id: work_id.to_string(),
            action: RedispatchAction::Error,
            target: None,
            attempts: record.attempt_count,
            message: String::new(),
        };

        if record.escalated {
            result.action = RedispatchAction::AlreadyEscalated;
            result.message = match record.escalated_at {
                Some(at) => format!("already escalated at {}", at.to_rfc3339()),
                None => "already escalated".to_string(),
            };
            return (result, false);
        }

        if let Some(remaining) = record.cooldown_remaining(self.cooldown, now) {
            result.action = RedispatchAction::Cooldown;
            result.message = format!("in cooldown ({}s remaining)", remaining.as_secs());
            return (result, false);
        }

        if record.attempt_count >= self.max_attempts {
            return match self.dispatcher.escalate(work_id, record) {
                Ok(()) => {
                    record.escalated = true;
                    record.escalated_at = Some(now);
                    result.action = RedispatchAction::Escalated;
                    result.message =
                        format!("escalated after {} failed re-dispatches", record.attempt_count);
                    (result, true)
                }
                Err(e) => {
                    result.message = format!(
                        "escalation after {} attempts failed: {e:#}",
                        record.attempt_count
                    );
                    (result, false)
                }
            };
        }

        let Some(target) = target
            .map(str::to_string)
            .or_else(|| self.routes.database_for_item(work_id))
        else {
            result.message = format!("cannot determine target for {work_id}");
            return (result, false);
        };
        result.target = Some(target.clone());

        // Unknown status is not a reason to skip.
        if let Some(status) = self.dispatcher.status(work_id)
            && status != "open"
        {
            result.action = RedispatchAction::Skipped;
            result.message = format!("status is {status:?}, expected open");
            return (result, false);
        }

        let dispatched = self.dispatcher.dispatch(work_id, &target);
        // A failed dispatch still counts toward escalation.
        record.record_attempt(&target, now);
        result.attempts = record.attempt_count;
        match dispatched {
            Ok(()) => {
                result.action = RedispatchAction::Redispatched;
                result.message = format!(
                    "re-dispatched to {target} (attempt {}/{})",
                    record.attempt_count, self.max_attempts
                );
            }
            Err(e) => {
                result.message = format!("dispatching to {target}: {e:#}");
            }
        }
        (result, true)
    }

    /// Drop records whose work items are closed or unknown.
    pub fn prune(&self) -> anyhow::Result<usize> {
        self.store.update(|state| {
            let before = state.items.len();
            state.items.retain(|id, _| {
                self.dispatcher
                    .status(id)
                    .is_some_and(|s| s != "closed")
            });
            let pruned = before - state.items.len();
            (pruned, pruned > 0)
        })
    }
}
