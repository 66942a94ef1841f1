//! Work-item prefix routing and actor identity.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Maps a work item's namespace prefix to the database it lives in.
pub trait RouteResolver: Send + Sync {
    fn database_for_prefix(&self, prefix: &str) -> Option<String>;

    fn database_for_item(&self, work_id: &str) -> Option<String> {
        extract_prefix(work_id).and_then(|p| self.database_for_prefix(p))
    }
}

/// Text up to and including the first `-`: `gt-abc12` -> `gt-`.
pub fn extract_prefix(work_id: &str) -> Option<&str> {
    let idx = work_id.find('-')?;
    (idx > 0).then(|| &work_id[..=idx])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    pub database: String,
}

/// `routes.jsonl`: one [`Route`] per line.
#[derive(Debug, Clone, Default)]
pub struct RoutesFile {
    routes: BTreeMap<String, String>,
}

impl RoutesFile {
    /// Load routes. A missing file is an empty table; malformed lines are
    /// skipped with a warning.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut routes = BTreeMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<Route>(line) {
                Ok(r) => {
                    routes.insert(r.prefix, r.database);
                }
                Err(e) => {
                    tracing::warn!(line = lineno + 1, error = %e, "skipping malformed route");
                }
            }
        }
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl RouteResolver for RoutesFile {
    fn database_for_prefix(&self, prefix: &str) -> Option<String> {
        self.routes.get(prefix).cloned()
    }
}

/// Who is acting, for audit text in synthetic commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(String);

impl Actor {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    /// `DOLTKEEPER_ACTOR`, then `USER`, then `doltkeeper`.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        ["DOLTKEEPER_ACTOR", "USER"]
            .iter()
            .find_map(|k| lookup(k).filter(|v| !v.trim().is_empty()))
            .map_or_else(|| Self::new("doltkeeper"), |v| Self(v.trim().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_extraction() {
        assert_eq!(extract_prefix("gt-abc12"), Some("gt-"));
        assert_eq!(extract_prefix("hq-cv-9"), Some("hq-"));
        assert_eq!(extract_prefix("noprefix"), None);
        assert_eq!(extract_prefix("-x"), None);
    }

    #[test]
    fn routes_file_resolves_items() {
        let routes = RoutesFile::parse(
            r#"{"prefix": "gt-", "database": "gastown"}
# comment
not json
{"prefix": "wl-", "database": "wl_commons"}
"#,
        );
        assert_eq!(routes.len(), 2);
        assert_eq!(routes.database_for_item("gt-123"), Some("gastown".into()));
        assert_eq!(routes.database_for_item("wl-9"), Some("wl_commons".into()));
        assert_eq!(routes.database_for_item("zz-1"), None);
    }

    #[test]
    fn missing_routes_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let routes = RoutesFile::load(&dir.path().join("routes.jsonl")).unwrap();
        assert!(routes.is_empty());
    }

    #[test]
    fn actor_fallback_order() {
        let a = Actor::from_lookup(|k| (k == "USER").then(|| "alice".to_string()));
        assert_eq!(a.as_str(), "alice");
        let a = Actor::from_lookup(|k| match k {
            "DOLTKEEPER_ACTOR" => Some("deacon".into()),
            _ => Some("alice".into()),
        });
        assert_eq!(a.to_string(), "deacon");
        let a = Actor::from_lookup(|_| Some("  ".into()));
        assert_eq!(a.as_str(), "doltkeeper");
    }
}
