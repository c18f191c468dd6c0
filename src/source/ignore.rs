use crate::error::{LayerstackError, Result};
use glob::{MatchOptions, Pattern};
use std::path::Path;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

struct Rule {
    pattern: Pattern,
    exclusion: bool,
}

impl Rule {
    fn matches(&self, path: &str) -> bool {
        self.pattern.matches_with(path, MATCH_OPTIONS)
    }
}

/// Ignore rules with .dockerignore semantics.
///
/// Patterns are evaluated in order and the last one that matches a path or
/// one of its parent directories decides. A leading `!` re-includes.
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

impl IgnoreRules {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Build rules from configured patterns
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut rules = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let mut line = raw.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let exclusion = line.starts_with('!');
            if exclusion {
                line = line[1..].trim();
                if line.is_empty() {
                    return Err(LayerstackError::InvalidConfig(format!(
                        "illegal exclusion pattern: {:?}",
                        raw.as_ref()
                    )));
                }
            }
            let cleaned = clean_pattern(line);
            let pattern = Pattern::new(&cleaned).map_err(|e| {
                LayerstackError::InvalidConfig(format!(
                    "invalid ignore pattern {:?}: {}",
                    raw.as_ref(),
                    e
                ))
            })?;
            rules.push(Rule { pattern, exclusion });
        }
        Ok(Self { rules })
    }

    /// Parse newline separated rules, e.g. the content of a .dockerignore
    pub fn parse(content: &str) -> Result<Self> {
        let lines: Vec<&str> = content.lines().collect();
        Self::new(&lines)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns true if the given path (relative to the source root, slash separated) should be ignored
    pub fn matches_or_parent_matches(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./").trim_start_matches('/');
        if path.is_empty() || path == "." {
            return false;
        }
        let parts: Vec<&str> = path.split('/').collect();
        let mut matched = false;
        for rule in &self.rules {
            // an inclusion can't change an already ignored path, nor an exclusion a kept one
            if rule.exclusion != matched {
                continue;
            }
            let mut hit = rule.matches(path);
            if !hit {
                for i in 1..parts.len() {
                    if rule.matches(&parts[..i].join("/")) {
                        hit = true;
                        break;
                    }
                }
            }
            if hit {
                matched = !rule.exclusion;
            }
        }
        matched
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        let joined = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        self.matches_or_parent_matches(&joined)
    }
}

fn clean_pattern(pattern: &str) -> String {
    let mut p = pattern.trim_start_matches("./");
    p = p.trim_start_matches('/');
    p = p.trim_end_matches('/');
    if p.is_empty() {
        ".".to_string()
    } else {
        p.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let rules = IgnoreRules::parse("node_modules\n.git").unwrap();
        assert!(rules.is_ignored(Path::new("node_modules")));
        assert!(rules.is_ignored(Path::new(".git")));
        assert!(!rules.is_ignored(Path::new("src")));
    }

    #[test]
    fn test_wildcard() {
        let rules = IgnoreRules::parse("*.log").unwrap();
        assert!(rules.is_ignored(Path::new("build.log")));
        assert!(!rules.is_ignored(Path::new("main.rs")));
        // a single star does not cross directories
        assert!(!rules.is_ignored(Path::new("logs/build.log")));
    }

    #[test]
    fn test_parent_match_wins() {
        let rules = IgnoreRules::new(&["target"]).unwrap();
        assert!(rules.matches_or_parent_matches("target/debug/app"));
        assert!(!rules.matches_or_parent_matches("src/target.rs"));
    }

    #[test]
    fn test_negation_overrides_broader_ignore() {
        let rules = IgnoreRules::new(&["*.txt", "!keep.txt"]).unwrap();
        assert!(rules.matches_or_parent_matches("drop.txt"));
        assert!(!rules.matches_or_parent_matches("keep.txt"));
    }

    #[test]
    fn test_negation_inside_ignored_dir() {
        let rules = IgnoreRules::new(&["docs", "!docs/README.md"]).unwrap();
        assert!(rules.matches_or_parent_matches("docs/guide.md"));
        assert!(!rules.matches_or_parent_matches("docs/README.md"));
    }

    #[test]
    fn test_last_matching_rule_decides() {
        let rules = IgnoreRules::new(&["!a.txt", "*.txt"]).unwrap();
        assert!(rules.matches_or_parent_matches("a.txt"));
    }

    #[test]
    fn test_double_star() {
        let rules = IgnoreRules::new(&["**/*.tmp"]).unwrap();
        assert!(rules.matches_or_parent_matches("a/b/c.tmp"));
        assert!(rules.matches_or_parent_matches("c.tmp"));
    }

    #[test]
    fn test_bare_exclusion_is_rejected() {
        assert!(IgnoreRules::new(&["!"]).is_err());
    }

    #[test]
    fn test_empty_rules_match_nothing() {
        let rules = IgnoreRules::parse("").unwrap();
        assert!(rules.is_empty());
        assert!(!rules.matches_or_parent_matches("anything"));
    }
}
