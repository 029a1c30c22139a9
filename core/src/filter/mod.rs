//! Block-list of destination hosts, with wildcard suffix matching.
//!
//! Rules are loaded from a flat text file: one rule per line, `#`
//! starts a comment, the remainder is lowercased and classified as
//! either an IP literal or a domain pattern. Loading replaces the
//! prior rule set atomically under an exclusive lock; lookups take a
//! shared lock — many readers, an infrequent writer, same discipline
//! the teacher's connection pool uses around its node map.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use parking_lot::RwLock;

#[derive(Debug, Default)]
struct RuleSet {
    domains: HashSet<String>,
    ips: HashSet<String>,
}

/// the blocked-host rule set. Cheap to clone-share via `Arc` since all
/// state lives behind the inner lock.
#[derive(Debug, Default)]
pub struct Filter {
    rules: RwLock<RuleSet>,
}

impl Filter {
    pub fn new() -> Self {
        Filter {
            rules: RwLock::new(RuleSet::default()),
        }
    }

    /// load rules from `path`. A missing file is not an error — the
    /// rule set becomes empty.
    pub fn load(&self, path: &Path) -> std::io::Result<()> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        let mut domains = HashSet::new();
        let mut ips = HashSet::new();
        for line in text.lines() {
            let rule = strip_comment(line).trim();
            if rule.is_empty() {
                continue;
            }
            let rule = rule.to_lowercase();
            if rule.parse::<IpAddr>().is_ok() {
                ips.insert(rule);
            } else {
                domains.insert(rule);
            }
        }
        let mut guard = self.rules.write();
        *guard = RuleSet { domains, ips };
        Ok(())
    }

    /// `host` must already be lowercased. Returns whether it's blocked
    /// and, if so, the rule text that matched.
    pub fn is_blocked(&self, host: &str) -> (bool, Option<String>) {
        let rules = self.rules.read();
        if rules.ips.contains(host) {
            return (true, Some(host.to_string()));
        }
        if rules.domains.contains(host) {
            return (true, Some(host.to_string()));
        }
        for rule in &rules.domains {
            if let Some(suffix) = rule.strip_prefix("*.") {
                if host == suffix || host.ends_with(&format!(".{suffix}")) {
                    return (true, Some(rule.clone()));
                }
            }
        }
        (false, None)
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_rules(text: &str) -> tempfile_path::TempFile {
        tempfile_path::TempFile::new(text)
    }

    mod tempfile_path {
        use std::io::Write;
        use std::path::{Path, PathBuf};

        pub struct TempFile {
            path: PathBuf,
        }

        impl TempFile {
            pub fn new(text: &str) -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!(
                    "proxy-core-filter-test-{}-{}.txt",
                    std::process::id(),
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap()
                        .as_nanos()
                ));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(text.as_bytes()).unwrap();
                TempFile { path }
            }

            pub fn path(&self) -> &Path {
                &self.path
            }
        }

        impl Drop for TempFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn exact_domain_blocked() {
        let f = Filter::new();
        let tmp = write_rules("example.com\n");
        f.load(tmp.path()).unwrap();
        let (blocked, rule) = f.is_blocked("example.com");
        assert!(blocked);
        assert_eq!(rule.as_deref(), Some("example.com"));
    }

    #[test]
    fn wildcard_matches_suffix_and_bare_domain_only() {
        let f = Filter::new();
        let tmp = write_rules("*.mal.test\n");
        f.load(tmp.path()).unwrap();

        let (blocked, rule) = f.is_blocked("a.b.mal.test");
        assert!(blocked);
        assert_eq!(rule.as_deref(), Some("*.mal.test"));

        let (blocked, _) = f.is_blocked("mal.test");
        assert!(blocked);

        let (blocked, _) = f.is_blocked("notmal.test");
        assert!(!blocked);
    }

    #[test]
    fn ip_literal_classified_separately_from_domain() {
        let f = Filter::new();
        let tmp = write_rules("10.0.0.1\nexample.com\n");
        f.load(tmp.path()).unwrap();
        assert!(f.is_blocked("10.0.0.1").0);
        assert!(f.is_blocked("example.com").0);
        assert!(!f.is_blocked("10.0.0.2").0);
    }

    #[test]
    fn missing_file_yields_empty_rule_set() {
        let f = Filter::new();
        f.load(Path::new("/nonexistent/path/to/rules.txt")).unwrap();
        assert!(!f.is_blocked("example.com").0);
    }

    #[test]
    fn comments_and_case_are_normalized() {
        let f = Filter::new();
        let tmp = write_rules("  EXAMPLE.com  # block this one\n");
        f.load(tmp.path()).unwrap();
        assert!(f.is_blocked("example.com").0);
    }

    #[test]
    fn reloading_twice_is_idempotent() {
        let f = Filter::new();
        let tmp = write_rules("example.com\n");
        f.load(tmp.path()).unwrap();
        let first = f.is_blocked("example.com");
        f.load(tmp.path()).unwrap();
        let second = f.is_blocked("example.com");
        assert_eq!(first, second);
    }
}
