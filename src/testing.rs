//! Test doubles shared by the unit tests.

#![allow(clippy::unwrap_used)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::sql::{OutputFormat, RetryBudget, SqlError, SqlExecutor};

/// Retry budgets with no real waiting.
pub fn fast_budget() -> RetryBudget {
    let p = |max_attempts| RetryPolicy {
        max_attempts,
        base: Duration::from_millis(1),
        cap: Duration::from_millis(2),
    };
    RetryBudget {
        statement: p(5),
        script: p(3),
        catalog: p(5),
    }
}

/// Executor that replays queued results and records what it was sent.
/// An empty queue answers `Ok("")`.
#[derive(Default)]
pub struct ScriptedExecutor {
    results: Mutex<VecDeque<Result<String, SqlError>>>,
    statements: Mutex<Vec<String>>,
    scripts: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: Result<String, SqlError>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn push_ok(&self, out: &str) {
        self.push(Ok(out.to_string()));
    }

    pub fn push_err(&self, message: &str) {
        self.push(Err(SqlError::Failed {
            message: message.to_string(),
        }));
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    fn next(&self) -> Result<String, SqlError> {
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

impl SqlExecutor for ScriptedExecutor {
    fn run_statement(&self, sql: &str, _: OutputFormat, _: Duration) -> Result<String, SqlError> {
        self.statements.lock().unwrap().push(sql.to_string());
        self.next()
    }

    fn run_script(&self, script: &str, _: Duration) -> Result<String, SqlError> {
        self.scripts.lock().unwrap().push(script.to_string());
        self.next()
    }
}

type Rows = BTreeMap<String, String>;

#[derive(Debug, Clone, Default)]
struct BranchState {
    head: Rows,
    working: Rows,
    /// Snapshot of the parent's head when the branch was forked.
    base: Rows,
}

#[derive(Debug, Clone, Default)]
struct Repo {
    branches: BTreeMap<String, BranchState>,
    /// Staged conflicts per branch: key -> their value.
    conflicts: BTreeMap<String, Rows>,
    commits: Vec<(String, String)>,
}

struct Injected {
    needle: String,
    message: String,
    remaining: usize,
}

/// In-memory stand-in for a Dolt server that interprets the branch,
/// commit and merge procedures. Each call is its own session starting on
/// `main` with autocommit on.
pub struct FakeDolt {
    repo: Mutex<Repo>,
    failures: Mutex<Vec<Injected>>,
    log: Mutex<Vec<String>>,
}

struct Session {
    branch: String,
    autocommit: bool,
    txn_snapshot: Option<Repo>,
}

impl FakeDolt {
    pub fn new() -> Self {
        let mut repo = Repo::default();
        repo.branches.insert("main".into(), BranchState::default());
        Self {
            repo: Mutex::new(repo),
            failures: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Uncommitted write on `branch`, as a worker or another actor would
    /// leave it.
    pub fn write(&self, branch: &str, key: &str, value: &str) {
        let mut repo = self.repo.lock().unwrap();
        let b = repo.branches.get_mut(branch).unwrap();
        b.working.insert(key.into(), value.into());
    }

    /// Committed value of `key` on `branch`.
    pub fn head_value(&self, branch: &str, key: &str) -> Option<String> {
        let repo = self.repo.lock().unwrap();
        repo.branches.get(branch)?.head.get(key).cloned()
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.repo.lock().unwrap().branches.contains_key(branch)
    }

    pub fn commit_messages(&self, branch: &str) -> Vec<String> {
        let repo = self.repo.lock().unwrap();
        repo.commits
            .iter()
            .filter(|(b, _)| b == branch)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Every statement executed, in order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Fail the next `times` statements containing `needle`.
    pub fn fail_on(&self, needle: &str, message: &str, times: usize) {
        self.failures.lock().unwrap().push(Injected {
            needle: needle.to_string(),
            message: message.to_string(),
            remaining: times,
        });
    }

    fn injected(&self, stmt: &str) -> Option<String> {
        let mut failures = self.failures.lock().unwrap();
        let hit = failures
            .iter_mut()
            .find(|f| f.remaining > 0 && stmt.contains(&f.needle))?;
        hit.remaining -= 1;
        Some(hit.message.clone())
    }

    fn run(&self, text: &str) -> Result<String, SqlError> {
        let mut session = Session {
            branch: "main".into(),
            autocommit: true,
            txn_snapshot: None,
        };
        let mut out = String::new();
        for stmt in split_statements(text) {
            self.log.lock().unwrap().push(stmt.clone());
            let result = match self.injected(&stmt) {
                Some(message) => Err(message),
                None => self.exec(&mut session, &stmt),
            };
            match result {
                Ok(o) => out.push_str(&o),
                Err(message) => {
                    if let Some(snapshot) = session.txn_snapshot.take() {
                        *self.repo.lock().unwrap() = snapshot;
                    }
                    return Err(SqlError::Failed { message });
                }
            }
        }
        Ok(out)
    }

    fn exec(&self, s: &mut Session, stmt: &str) -> Result<String, String> {
        let upper = stmt.to_uppercase();
        if upper.starts_with("USE ") || upper == "SELECT 1" {
            return Ok(String::new());
        }
        if let Some(rest) = upper.strip_prefix("SET @@AUTOCOMMIT") {
            let on = rest.trim().trim_start_matches('=').trim() == "1";
            if !on && s.autocommit {
                s.txn_snapshot = Some(self.repo.lock().unwrap().clone());
            }
            if on {
                s.txn_snapshot = None;
            }
            s.autocommit = on;
            return Ok(String::new());
        }
        if upper.starts_with("SELECT NAME FROM DOLT_BRANCHES") {
            let wanted = quoted_args(stmt).into_iter().next().unwrap_or_default();
            let repo = self.repo.lock().unwrap();
            return Ok(if repo.branches.contains_key(&wanted) {
                format!("{{\"rows\": [{{\"name\": \"{wanted}\"}}]}}\n")
            } else {
                "{\"rows\": []}\n".to_string()
            });
        }
        let Some(call) = upper.strip_prefix("CALL ") else {
            return Err(format!("fake dolt: unsupported statement {stmt}"));
        };
        let args = quoted_args(stmt);
        let proc_name = call.split('(').next().unwrap_or_default().trim().to_string();
        let mut repo = self.repo.lock().unwrap();
        match proc_name.as_str() {
            "DOLT_ADD" => Ok(String::new()),
            "DOLT_CHECKOUT" => {
                let target = args.first().cloned().unwrap_or_default();
                if !repo.branches.contains_key(&target) {
                    return Err(format!("branch not found: {target}"));
                }
                s.branch = target;
                Ok(String::new())
            }
            "DOLT_BRANCH" => {
                if args.first().map(String::as_str) == Some("-d") {
                    let target = args.get(1).cloned().unwrap_or_default();
                    if repo.branches.remove(&target).is_none() {
                        return Err(format!("branch not found: {target}"));
                    }
                    return Ok(String::new());
                }
                let name = args.first().cloned().unwrap_or_default();
                if repo.branches.contains_key(&name) {
                    return Err(format!("fatal: A branch named '{name}' already exists."));
                }
                let head = repo.branches[&s.branch].head.clone();
                repo.branches.insert(
                    name,
                    BranchState {
                        working: head.clone(),
                        base: head.clone(),
                        head,
                    },
                );
                Ok(String::new())
            }
            "DOLT_COMMIT" => {
                if repo.conflicts.get(&s.branch).is_some_and(|c| !c.is_empty()) {
                    return Err("error: cannot commit with unresolved conflicts".into());
                }
                let allow_empty = args.iter().any(|a| a == "--allow-empty");
                let msg = args
                    .iter()
                    .position(|a| a == "-m")
                    .and_then(|i| args.get(i + 1))
                    .cloned()
                    .unwrap_or_default();
                let branch = s.branch.clone();
                let b = repo.branches.get_mut(&branch).ok_or("no branch")?;
                if b.head == b.working && !allow_empty {
                    return Err("nothing to commit".into());
                }
                b.head = b.working.clone();
                repo.commits.push((branch, msg));
                Ok(String::new())
            }
            "DOLT_MERGE" => {
                let theirs_name = args.first().cloned().unwrap_or_default();
                let theirs = repo
                    .branches
                    .get(&theirs_name)
                    .ok_or_else(|| format!("branch not found: {theirs_name}"))?
                    .clone();
                let ours = repo.branches[&s.branch].clone();
                let mut merged = ours.head.clone();
                let mut conflicts = Rows::new();
                let keys: Vec<String> =
                    ours.head.keys().chain(theirs.head.keys()).cloned().collect();
                for key in keys {
                    let base = theirs.base.get(&key);
                    let o = ours.head.get(&key);
                    let t = theirs.head.get(&key);
                    if t == base || o == t {
                        continue;
                    }
                    if o == base {
                        if let Some(t) = t {
                            merged.insert(key, t.clone());
                        } else {
                            merged.remove(&key);
                        }
                    } else {
                        conflicts.insert(key, t.cloned().unwrap_or_default());
                    }
                }
                if !conflicts.is_empty() && s.autocommit {
                    return Err("Merge conflict detected, @autocommit transaction rolled back. \
                                @autocommit must be disabled so that merge conflicts can be resolved"
                        .into());
                }
                let branch = s.branch.clone();
                let b = repo.branches.get_mut(&branch).ok_or("no branch")?;
                b.working = merged.clone();
                if conflicts.is_empty() {
                    b.head = merged;
                    repo.commits.push((branch, format!("Merge branch '{theirs_name}'")));
                } else {
                    repo.conflicts.insert(branch, conflicts);
                }
                Ok(String::new())
            }
            "DOLT_CONFLICTS_RESOLVE" => {
                if args.first().map(String::as_str) != Some("--theirs") {
                    return Err("fake dolt: only --theirs is supported".into());
                }
                let branch = s.branch.clone();
                let staged = repo.conflicts.remove(&branch).unwrap_or_default();
                let b = repo.branches.get_mut(&branch).ok_or("no branch")?;
                b.working.extend(staged);
                Ok(String::new())
            }
            other => Err(format!("fake dolt: unknown procedure {other}")),
        }
    }
}

impl SqlExecutor for FakeDolt {
    fn run_statement(&self, sql: &str, _: OutputFormat, _: Duration) -> Result<String, SqlError> {
        self.run(sql)
    }

    fn run_script(&self, script: &str, _: Duration) -> Result<String, SqlError> {
        self.run(script)
    }
}

/// Split on `;` outside single-quoted literals.
fn split_statements(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_quote = false;
    for ch in text.chars() {
        match ch {
            '\'' => {
                in_quote = !in_quote;
                cur.push(ch);
            }
            ';' if !in_quote => {
                let t = cur.trim();
                if !t.is_empty() {
                    out.push(t.to_string());
                }
                cur.clear();
            }
            _ => cur.push(ch),
        }
    }
    let t = cur.trim();
    if !t.is_empty() {
        out.push(t.to_string());
    }
    out
}

/// Contents of every single-quoted literal, with `''` unescaped.
fn quoted_args(stmt: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = stmt.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\'' {
            continue;
        }
        let mut lit = String::new();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    lit.push('\'');
                } else {
                    break;
                }
            } else {
                lit.push(c);
            }
        }
        args.push(lit);
    }
    args
}

#[test]
fn fake_splits_on_unquoted_semicolons() {
    let parts = split_statements("USE `db`; CALL DOLT_COMMIT('-m', 'a; b''s'); ");
    assert_eq!(parts, vec!["USE `db`", "CALL DOLT_COMMIT('-m', 'a; b''s')"]);
    assert_eq!(quoted_args(&parts[1]), vec!["-m", "a; b's"]);
}
