use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::Serialize;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
        };
        f.write_str(s)
    }
}

impl FromStr for HttpMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            other => Err(EngineError::invalid(
                "method",
                format!("unsupported method '{other}'"),
            )),
        }
    }
}

/// What a route resolves to: a named handler inside a script, or asset bytes
/// served without touching any sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RouteTarget {
    Handler {
        script_uri: String,
        handler_name: String,
    },
    Asset {
        script_uri: String,
        asset_uri: String,
    },
}

impl RouteTarget {
    pub fn script_uri(&self) -> &str {
        match self {
            Self::Handler { script_uri, .. } | Self::Asset { script_uri, .. } => script_uri,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct RouteEntry {
    target: RouteTarget,
    seq: u64,
}

/// Listing view of one live route.
#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub path: String,
    pub method: HttpMethod,
    pub target: RouteTarget,
}

/// The HTTP route table. Keyed by `(path, method)`; each key holds a stack of
/// registrations so that unloading the current winner restores the previous
/// owner if its script is still loaded. Paths ending in `*` match by prefix;
/// exact beats prefix, longer prefix beats shorter, newer beats older.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    entries: RwLock<HashMap<(String, HttpMethod), Vec<RouteEntry>>>,
    seq: AtomicU64,
}

fn validate_path(path: &str) -> EngineResult<()> {
    if !path.starts_with('/') {
        return Err(EngineError::invalid("path", "must start with '/'"));
    }
    // A '*' is only meaningful as the final character.
    if let Some(idx) = path.find('*') {
        if idx != path.len() - 1 {
            return Err(EngineError::invalid("path", "'*' only allowed at the end"));
        }
    }
    Ok(())
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        path: &str,
        method: HttpMethod,
        target: RouteTarget,
    ) -> EngineResult<()> {
        validate_path(path)?;
        if let RouteTarget::Handler { handler_name, .. } = &target {
            if handler_name.is_empty() {
                return Err(EngineError::invalid("handler", "handler name required"));
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().expect("route registry poisoned");
        let stack = entries
            .entry((path.to_string(), method))
            .or_default();
        // Re-registration by the same script replaces its prior claim.
        stack.retain(|e| e.target.script_uri() != target.script_uri());
        stack.push(RouteEntry { target, seq });
        Ok(())
    }

    /// Resolve a request path: exact `(path, method)` first, then the longest
    /// matching `*`-suffixed prefix route (ties by most recent registration).
    pub fn resolve(&self, path: &str, method: HttpMethod) -> Option<RouteTarget> {
        let entries = self.entries.read().expect("route registry poisoned");

        if let Some(stack) = entries.get(&(path.to_string(), method)) {
            if let Some(entry) = stack.last() {
                return Some(entry.target.clone());
            }
        }

        let mut best: Option<(usize, u64, &RouteTarget)> = None;
        for ((candidate, m), stack) in entries.iter() {
            if *m != method || !candidate.ends_with('*') {
                continue;
            }
            let prefix = &candidate[..candidate.len() - 1];
            if !path.starts_with(prefix) {
                continue;
            }
            let Some(entry) = stack.last() else { continue };
            let better = match best {
                None => true,
                Some((len, seq, _)) => {
                    prefix.len() > len || (prefix.len() == len && entry.seq > seq)
                }
            };
            if better {
                best = Some((prefix.len(), entry.seq, &entry.target));
            }
        }
        best.map(|(_, _, t)| t.clone())
    }

    /// Remove every registration owned by a script. Keys whose stacks empty
    /// out disappear; shadowed prior owners become live again.
    pub fn purge_script(&self, script_uri: &str) {
        let mut entries = self.entries.write().expect("route registry poisoned");
        entries.retain(|_, stack| {
            stack.retain(|e| e.target.script_uri() != script_uri);
            !stack.is_empty()
        });
    }

    /// Live (winning) routes, for listing.
    pub fn list(&self) -> Vec<RouteInfo> {
        let entries = self.entries.read().expect("route registry poisoned");
        let mut routes: Vec<RouteInfo> = entries
            .iter()
            .filter_map(|((path, method), stack)| {
                stack.last().map(|e| RouteInfo {
                    path: path.clone(),
                    method: *method,
                    target: e.target.clone(),
                })
            })
            .collect();
        routes.sort_by(|a, b| a.path.cmp(&b.path));
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(script: &str, name: &str) -> RouteTarget {
        RouteTarget::Handler {
            script_uri: script.to_string(),
            handler_name: name.to_string(),
        }
    }

    #[test]
    fn exact_match_resolves() {
        let reg = RouteRegistry::new();
        reg.register("/hello", HttpMethod::Get, handler("s1", "h"))
            .unwrap();

        assert_eq!(
            reg.resolve("/hello", HttpMethod::Get),
            Some(handler("s1", "h"))
        );
        assert_eq!(reg.resolve("/hello", HttpMethod::Post), None);
        assert_eq!(reg.resolve("/other", HttpMethod::Get), None);
    }

    #[test]
    fn most_recent_registration_wins_key() {
        let reg = RouteRegistry::new();
        reg.register("/x", HttpMethod::Get, handler("s1", "a")).unwrap();
        reg.register("/x", HttpMethod::Get, handler("s2", "b")).unwrap();

        assert_eq!(reg.resolve("/x", HttpMethod::Get), Some(handler("s2", "b")));
    }

    #[test]
    fn unloading_winner_restores_prior_owner() {
        let reg = RouteRegistry::new();
        reg.register("/x", HttpMethod::Get, handler("s1", "a")).unwrap();
        reg.register("/x", HttpMethod::Get, handler("s2", "b")).unwrap();

        reg.purge_script("s2");
        assert_eq!(reg.resolve("/x", HttpMethod::Get), Some(handler("s1", "a")));

        reg.purge_script("s1");
        assert_eq!(reg.resolve("/x", HttpMethod::Get), None);
    }

    #[test]
    fn reregistration_by_same_script_does_not_stack() {
        let reg = RouteRegistry::new();
        reg.register("/x", HttpMethod::Get, handler("s1", "a")).unwrap();
        reg.register("/x", HttpMethod::Get, handler("s1", "b")).unwrap();

        assert_eq!(reg.resolve("/x", HttpMethod::Get), Some(handler("s1", "b")));
        reg.purge_script("s1");
        assert_eq!(reg.resolve("/x", HttpMethod::Get), None);
    }

    #[test]
    fn prefix_route_matches_under_prefix() {
        let reg = RouteRegistry::new();
        reg.register("/files/*", HttpMethod::Get, handler("s1", "files"))
            .unwrap();

        assert_eq!(
            reg.resolve("/files/a/b.txt", HttpMethod::Get),
            Some(handler("s1", "files"))
        );
        assert_eq!(reg.resolve("/filesystem", HttpMethod::Get), None);
    }

    #[test]
    fn exact_beats_prefix() {
        let reg = RouteRegistry::new();
        reg.register("/api/*", HttpMethod::Get, handler("s1", "wild"))
            .unwrap();
        reg.register("/api/info", HttpMethod::Get, handler("s2", "info"))
            .unwrap();

        assert_eq!(
            reg.resolve("/api/info", HttpMethod::Get),
            Some(handler("s2", "info"))
        );
        assert_eq!(
            reg.resolve("/api/other", HttpMethod::Get),
            Some(handler("s1", "wild"))
        );
    }

    #[test]
    fn longest_prefix_wins() {
        let reg = RouteRegistry::new();
        reg.register("/a/*", HttpMethod::Get, handler("s1", "short")).unwrap();
        reg.register("/a/b/*", HttpMethod::Get, handler("s2", "long")).unwrap();

        assert_eq!(
            reg.resolve("/a/b/c", HttpMethod::Get),
            Some(handler("s2", "long"))
        );
        assert_eq!(
            reg.resolve("/a/z", HttpMethod::Get),
            Some(handler("s1", "short"))
        );
    }

    #[test]
    fn equal_length_prefix_ties_break_to_newest() {
        let reg = RouteRegistry::new();
        reg.register("/p/*", HttpMethod::Get, handler("s1", "old")).unwrap();
        // Different key is impossible at equal prefix, so the tie is between
        // stacks at the same key: newest registration wins it outright.
        reg.register("/p/*", HttpMethod::Get, handler("s2", "new")).unwrap();

        assert_eq!(
            reg.resolve("/p/x", HttpMethod::Get),
            Some(handler("s2", "new"))
        );
    }

    #[test]
    fn invalid_paths_rejected() {
        let reg = RouteRegistry::new();
        assert!(reg
            .register("no-slash", HttpMethod::Get, handler("s", "h"))
            .is_err());
        assert!(reg
            .register("/a/*/b", HttpMethod::Get, handler("s", "h"))
            .is_err());
        assert!(reg
            .register(
                "/a",
                HttpMethod::Get,
                RouteTarget::Handler {
                    script_uri: "s".into(),
                    handler_name: String::new(),
                },
            )
            .is_err());
    }

    #[test]
    fn method_parsing() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("PATCH".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!("TRACE".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn list_reports_only_winners() {
        let reg = RouteRegistry::new();
        reg.register("/x", HttpMethod::Get, handler("s1", "a")).unwrap();
        reg.register("/x", HttpMethod::Get, handler("s2", "b")).unwrap();
        reg.register("/y", HttpMethod::Post, handler("s1", "c")).unwrap();

        let list = reg.list();
        assert_eq!(list.len(), 2);
        let x = list.iter().find(|r| r.path == "/x").unwrap();
        assert_eq!(x.target, handler("s2", "b"));
    }
}
