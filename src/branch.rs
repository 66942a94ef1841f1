//! Per-worker branches and the merge-back protocol.
//!
//! Checkout state in Dolt belongs to the connection, so every sequence
//! that checks out a branch and then writes or merges runs as one script.
//! Sent as separate statements, the merge would see main's HEAD without
//! the worker's writes.

use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;

use crate::error::BestEffort;
use crate::routing::Actor;
use crate::sql::{ReadOnlyRecovery, Sql, SqlError, quote_ident, string_literal};

pub const MAIN_BRANCH: &str = "main";

/// Substring of the error Dolt returns when a merge with autocommit on
/// hits conflicts.
const MERGE_CONFLICT: &str = "merge conflict";

#[derive(Debug, thiserror::Error)]
pub enum BranchError {
    #[error("invalid branch name {0:?}: only letters, digits, '.', '_', '/' and '-' are allowed")]
    InvalidName(String),
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error("merging {branch} into main failed, branch kept for retry: {source}")]
    Merge { branch: String, source: SqlError },
}

fn re_branch() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._/-]+$").ok()).as_ref()
}

/// Reject names that are unsafe to interpolate into SQL, or that the
/// branch procedures would parse as flags.
pub fn validate_branch_name(name: &str) -> Result<(), BranchError> {
    let ok = !name.starts_with('-')
        && !name.contains("..")
        && re_branch().is_some_and(|re| re.is_match(name));
    if ok {
        Ok(())
    } else {
        Err(BranchError::InvalidName(name.to_string()))
    }
}

/// `<role>-<worker>-<unix-ts>`, lowercased.
pub fn worker_branch_name(role: &str, worker: &str, unix_ts: i64) -> String {
    format!("{role}-{worker}-{unix_ts}").to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Merged without conflicts.
    Clean,
    /// Conflicts were resolved in the worker's favor and committed.
    ConflictsResolved,
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Clean => "clean",
            Self::ConflictsResolved => "conflicts resolved (worker wins)",
        })
    }
}

pub struct BranchCoordinator {
    sql: Sql,
    recovery: Option<Arc<dyn ReadOnlyRecovery>>,
    actor: Actor,
}

impl BranchCoordinator {
    pub fn new(sql: Sql, actor: Actor) -> Self {
        Self {
            sql,
            recovery: None,
            actor,
        }
    }

    /// Restart hook used when a write hits a read-only server.
    pub fn with_recovery(mut self, recovery: Arc<dyn ReadOnlyRecovery>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    fn recovery(&self) -> Option<&dyn ReadOnlyRecovery> {
        self.recovery.as_deref()
    }

    pub fn create_branch(&self, db: &str, branch: &str) -> Result<(), BranchError> {
        validate_branch_name(branch)?;
        self.sql.statement_with_recovery(
            db,
            &format!("CALL DOLT_BRANCH({})", string_literal(branch)),
            self.recovery(),
        )?;
        tracing::info!(database = %db, branch, "created branch");
        Ok(())
    }

    /// Stage and commit everything pending on `branch` (main when `None`),
    /// allowing an empty commit. Branches forked from HEAD afterwards see
    /// writes other actors left uncommitted.
    pub fn commit_working_set(
        &self,
        db: &str,
        branch: Option<&str>,
        message: &str,
    ) -> Result<(), BranchError> {
        let message = format!("{message} [{}]", self.actor);
        match branch {
            None | Some(MAIN_BRANCH) => {
                self.sql
                    .statement_with_recovery(db, "CALL DOLT_ADD('-A')", self.recovery())?;
                self.sql.statement_with_recovery(
                    db,
                    &format!(
                        "CALL DOLT_COMMIT('--allow-empty', '-m', {})",
                        string_literal(&message)
                    ),
                    self.recovery(),
                )?;
            }
            Some(branch) => {
                validate_branch_name(branch)?;
                let script = format!(
                    "USE {db};\n\
                     CALL DOLT_CHECKOUT({branch});\n\
                     CALL DOLT_ADD('-A');\n\
                     CALL DOLT_COMMIT('--allow-empty', '-m', {message});\n",
                    db = quote_ident(db)?,
                    branch = string_literal(branch),
                    message = string_literal(&message),
                );
                self.sql.script_with_retry(&script)?;
            }
        }
        tracing::debug!(
            database = %db,
            branch = branch.unwrap_or(MAIN_BRANCH),
            "committed working set"
        );
        Ok(())
    }

    /// Merge `branch` into main and delete it.
    ///
    /// Conflicts are resolved in the worker's favor. If neither the clean
    /// path nor the conflict path completes, the branch is left in place.
    pub fn merge_branch(&self, db: &str, branch: &str) -> Result<MergeOutcome, BranchError> {
        validate_branch_name(branch)?;
        let db_q = quote_ident(db)?;
        let b = string_literal(branch);
        let main = string_literal(MAIN_BRANCH);

        let flush_main = string_literal(&format!(
            "auto-flush main before merge of {branch} [{}]",
            self.actor
        ));
        let flush_branch = string_literal(&format!("{branch} final state [{}]", self.actor));
        let merge_script = format!(
            "USE {db_q};\n\
             CALL DOLT_ADD('-A');\n\
             CALL DOLT_COMMIT('--allow-empty', '-m', {flush_main});\n\
             CALL DOLT_CHECKOUT({b});\n\
             CALL DOLT_ADD('-A');\n\
             CALL DOLT_COMMIT('--allow-empty', '-m', {flush_branch});\n\
             CALL DOLT_CHECKOUT({main});\n\
             CALL DOLT_MERGE({b});\n"
        );

        let outcome = match self.sql.script_with_retry(&merge_script) {
            Ok(_) => MergeOutcome::Clean,
            Err(e) if e.to_string().to_lowercase().contains(MERGE_CONFLICT) => {
                tracing::info!(
                    database = %db,
                    branch,
                    "merge conflict, resolving with branch values"
                );
                // Autocommit off so the conflict is staged instead of
                // rolled back.
                let resolved = string_literal(&format!(
                    "merge {branch} (conflicts auto-resolved) [{}]",
                    self.actor
                ));
                let resolve_script = format!(
                    "USE {db_q};\n\
                     SET @@autocommit = 0;\n\
                     CALL DOLT_CHECKOUT({main});\n\
                     CALL DOLT_MERGE({b});\n\
                     CALL DOLT_CONFLICTS_RESOLVE('--theirs', '.');\n\
                     CALL DOLT_COMMIT('-m', {resolved});\n\
                     SET @@autocommit = 1;\n"
                );
                self.sql
                    .script_with_retry(&resolve_script)
                    .map_err(|source| BranchError::Merge {
                        branch: branch.to_string(),
                        source,
                    })?;
                MergeOutcome::ConflictsResolved
            }
            Err(source) => {
                return Err(BranchError::Merge {
                    branch: branch.to_string(),
                    source,
                });
            }
        };

        tracing::info!(database = %db, branch, %outcome, "merged branch into main");
        let _ = self.delete_branch(db, branch);
        Ok(outcome)
    }

    /// Delete `branch`. Failure (including an already-deleted branch) is
    /// logged and reported, never raised.
    pub fn delete_branch(&self, db: &str, branch: &str) -> BestEffort {
        let result = validate_branch_name(branch)
            .map_err(|e| e.to_string())
            .and_then(|()| {
                self.sql
                    .statement_with_retry(
                        db,
                        &format!("CALL DOLT_BRANCH('-d', {})", string_literal(branch)),
                    )
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            });
        BestEffort::from_result(&format!("delete branch {branch}"), result)
    }

    pub fn branch_exists(&self, db: &str, branch: &str) -> Result<bool, BranchError> {
        validate_branch_name(branch)?;
        let rows = self.sql.query_json(
            Some(db),
            &format!(
                "SELECT name FROM dolt_branches WHERE name = {}",
                string_literal(branch)
            ),
        )?;
        Ok(!rows.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ErrorSignatures;
    use crate::sql::SqlExecutor;
    use crate::testing::{FakeDolt, fast_budget};

    fn coordinator(fake: &Arc<FakeDolt>) -> BranchCoordinator {
        let sql = Sql::new(Arc::clone(fake) as Arc<dyn SqlExecutor>, ErrorSignatures::default())
            .with_budget(fast_budget());
        BranchCoordinator::new(sql, Actor::new("tester"))
    }

    #[test]
    fn branch_names_are_validated() {
        for ok in ["polecat-nux-1700000000", "feature/x.y_z", "a"] {
            assert!(validate_branch_name(ok).is_ok(), "{ok}");
        }
        for bad in [
            "",
            "x'); DROP DATABASE gastown; --",
            "has space",
            "semi;colon",
            "back`tick",
            "-d",
            "a..b",
            "quote\"",
        ] {
            assert!(
                matches!(validate_branch_name(bad), Err(BranchError::InvalidName(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn worker_branch_name_is_lowercased() {
        assert_eq!(
            worker_branch_name("polecat", "Nux", 1_700_000_000),
            "polecat-nux-1700000000"
        );
    }

    #[test]
    fn invalid_name_is_rejected_before_any_sql() {
        let fake = Arc::new(FakeDolt::new());
        let c = coordinator(&fake);
        assert!(c.create_branch("gastown", "bad name").is_err());
        assert!(c.merge_branch("gastown", "x';--").is_err());
        assert!(c.branch_exists("gastown", "a b").is_err());
        assert!(fake.log().is_empty());
    }

    #[test]
    fn clean_merge_brings_worker_rows_and_deletes_branch() {
        let fake = Arc::new(FakeDolt::new());
        let c = coordinator(&fake);
        c.create_branch("gastown", "polecat-nux-1").unwrap();
        fake.write("polecat-nux-1", "gt-1", "closed");

        let outcome = c.merge_branch("gastown", "polecat-nux-1").unwrap();
        assert_eq!(outcome, MergeOutcome::Clean);
        assert_eq!(fake.head_value("main", "gt-1").as_deref(), Some("closed"));
        assert!(!fake.has_branch("polecat-nux-1"));
        assert!(!c.branch_exists("gastown", "polecat-nux-1").unwrap());
    }

    #[test]
    fn merge_flushes_uncommitted_main_writes() {
        let fake = Arc::new(FakeDolt::new());
        let c = coordinator(&fake);
        c.create_branch("gastown", "polecat-a-1").unwrap();
        // Another actor left an uncommitted write on main.
        fake.write("main", "gt-9", "open");
        fake.write("polecat-a-1", "gt-1", "done");

        c.merge_branch("gastown", "polecat-a-1").unwrap();
        assert_eq!(fake.head_value("main", "gt-9").as_deref(), Some("open"));
        assert_eq!(fake.head_value("main", "gt-1").as_deref(), Some("done"));
        let msgs = fake.commit_messages("main");
        assert!(msgs[0].starts_with("auto-flush main before merge of polecat-a-1"), "{msgs:?}");
    }

    #[test]
    fn conflict_resolves_in_favor_of_worker() {
        let fake = Arc::new(FakeDolt::new());
        let c = coordinator(&fake);
        fake.write("main", "gt-1", "open");
        c.commit_working_set("gastown", None, "seed").unwrap();

        c.create_branch("gastown", "polecat-nux-2").unwrap();
        fake.write("main", "gt-1", "blocked");
        fake.write("polecat-nux-2", "gt-1", "closed");

        let outcome = c.merge_branch("gastown", "polecat-nux-2").unwrap();
        assert_eq!(outcome, MergeOutcome::ConflictsResolved);
        assert_eq!(fake.head_value("main", "gt-1").as_deref(), Some("closed"));
        assert!(!fake.has_branch("polecat-nux-2"));
        assert!(
            fake.commit_messages("main")
                .iter()
                .any(|m| m.contains("conflicts auto-resolved"))
        );
        assert!(fake.log().iter().any(|s| s == "SET @@autocommit = 0"));
    }

    #[test]
    fn failed_merge_keeps_branch_and_retry_succeeds() {
        let fake = Arc::new(FakeDolt::new());
        let c = coordinator(&fake);
        c.create_branch("gastown", "polecat-nux-3").unwrap();
        fake.write("polecat-nux-3", "gt-5", "closed");
        fake.fail_on("CALL DOLT_MERGE", "connection reset by peer", 1);

        let err = c.merge_branch("gastown", "polecat-nux-3").unwrap_err();
        assert!(matches!(err, BranchError::Merge { .. }));
        assert!(c.branch_exists("gastown", "polecat-nux-3").unwrap());
        assert_eq!(fake.head_value("main", "gt-5"), None);

        let outcome = c.merge_branch("gastown", "polecat-nux-3").unwrap();
        assert_eq!(outcome, MergeOutcome::Clean);
        assert_eq!(fake.head_value("main", "gt-5").as_deref(), Some("closed"));
        assert!(!fake.has_branch("polecat-nux-3"));
    }

    #[test]
    fn failed_conflict_resolution_keeps_branch() {
        let fake = Arc::new(FakeDolt::new());
        let c = coordinator(&fake);
        fake.write("main", "gt-1", "open");
        c.commit_working_set("gastown", None, "seed").unwrap();
        c.create_branch("gastown", "polecat-b-1").unwrap();
        fake.write("main", "gt-1", "blocked");
        fake.write("polecat-b-1", "gt-1", "closed");
        fake.fail_on("DOLT_CONFLICTS_RESOLVE", "disk full", 5);

        assert!(c.merge_branch("gastown", "polecat-b-1").is_err());
        assert!(fake.has_branch("polecat-b-1"));
        // Rolled back: main still holds its own committed value.
        assert_eq!(fake.head_value("main", "gt-1").as_deref(), Some("blocked"));
    }

    #[test]
    fn transient_merge_failure_is_retried() {
        let fake = Arc::new(FakeDolt::new());
        let c = coordinator(&fake);
        c.create_branch("gastown", "polecat-r-1").unwrap();
        fake.write("polecat-r-1", "gt-2", "x");
        fake.fail_on("CALL DOLT_MERGE", "cannot update manifest: optimistic lock", 1);
        assert_eq!(c.merge_branch("gastown", "polecat-r-1").unwrap(), MergeOutcome::Clean);
        assert_eq!(fake.head_value("main", "gt-2").as_deref(), Some("x"));
    }

    #[test]
    fn commit_on_branch_uses_checkout_script() {
        let fake = Arc::new(FakeDolt::new());
        let c = coordinator(&fake);
        c.create_branch("gastown", "polecat-c-1").unwrap();
        fake.write("polecat-c-1", "gt-3", "wip");
        c.commit_working_set("gastown", Some("polecat-c-1"), "checkpoint").unwrap();
        assert_eq!(fake.head_value("polecat-c-1", "gt-3").as_deref(), Some("wip"));
        assert_eq!(fake.head_value("main", "gt-3"), None);
        assert_eq!(
            fake.commit_messages("polecat-c-1"),
            vec!["checkpoint [tester]".to_string()]
        );
    }

    #[test]
    fn delete_missing_branch_is_warned_not_failed() {
        let fake = Arc::new(FakeDolt::new());
        let c = coordinator(&fake);
        let outcome = c.delete_branch("gastown", "polecat-gone-1");
        assert!(outcome.is_warned());
    }

    #[test]
    fn create_branch_recovers_from_read_only() {
        struct Recover;
        impl ReadOnlyRecovery for Recover {
            fn recover_read_only(&self) -> anyhow::Result<()> {
                Ok(())
            }
        }
        let fake = Arc::new(FakeDolt::new());
        fake.fail_on("DOLT_BRANCH", "database is read only", 1);
        let c = coordinator(&fake).with_recovery(Arc::new(Recover));
        c.create_branch("gastown", "polecat-ro-1").unwrap();
        assert!(fake.has_branch("polecat-ro-1"));
    }
}
