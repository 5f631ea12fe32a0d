use std::path::Path;

use glob::Pattern;

/// Default ignore file name, read from the scan root.
pub const DEFAULT_IGNORE_FILE: &str = ".enrichignore";

/// One ignore line compiled twice: as written, and wrapped in `*…*` so a
/// bare name matches anywhere in the path.
#[derive(Debug, Clone)]
struct IgnorePattern {
    raw: String,
    exact: Pattern,
    wrapped: Option<Pattern>,
}

impl IgnorePattern {
    fn compile(raw: &str) -> Option<Self> {
        let exact = match Pattern::new(raw) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(pattern = raw, error = %e, "Invalid ignore pattern, skipping");
                return None;
            }
        };
        // Leading/trailing stars are trimmed first: `**` glued to other
        // characters is rejected by the glob parser.
        let core = raw.trim_matches('*');
        let wrapped = if core.is_empty() {
            None
        } else {
            Pattern::new(&format!("*{core}*")).ok()
        };
        Some(Self {
            raw: raw.to_string(),
            exact,
            wrapped,
        })
    }

    fn matches(&self, path: &str) -> bool {
        self.exact.matches(path) || self.wrapped.as_ref().is_some_and(|w| w.matches(path))
    }
}

/// Ordered glob patterns for one scan invocation. Read-only after load.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRuleSet {
    patterns: Vec<IgnorePattern>,
}

impl IgnoreRuleSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse ignore-file text: one pattern per line, blank lines and `#`
    /// comments skipped, invalid globs dropped with a warning.
    pub fn parse(content: &str) -> Self {
        let patterns = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(IgnorePattern::compile)
            .collect();
        Self { patterns }
    }

    /// Load `file_name` from `root`. A missing or unreadable file yields an
    /// empty rule set.
    pub fn load(root: &Path, file_name: &str) -> Self {
        let path = root.join(file_name);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let rules = Self::parse(&content);
                tracing::debug!(
                    path = %path.display(),
                    patterns = rules.len(),
                    "Loaded ignore rules"
                );
                rules
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::empty(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Could not read ignore file, scanning without rules"
                );
                Self::empty()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.raw.as_str())
    }

    /// Test a root-relative, `/`-separated path against every pattern.
    pub fn is_ignored(&self, relative_path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(relative_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments_and_blanks() {
        let rules = IgnoreRuleSet::parse("# caches\n\n*.tmp\n  node_modules  \n#x\n");
        assert_eq!(rules.patterns().collect::<Vec<_>>(), vec!["*.tmp", "node_modules"]);
    }

    #[test]
    fn extension_glob_matches_nested_files() {
        let rules = IgnoreRuleSet::parse("*.tmp");
        assert!(rules.is_ignored("cache/tmp.tmp"));
        assert!(rules.is_ignored("a.tmp"));
        assert!(!rules.is_ignored("photos/summer.jpg"));
    }

    #[test]
    fn bare_name_matches_anywhere_in_path() {
        let rules = IgnoreRuleSet::parse("cache");
        assert!(rules.is_ignored("cache"));
        assert!(rules.is_ignored("build/cache"));
        assert!(rules.is_ignored("build/cache/x.png"));
        // Substring matching is intentionally loose.
        assert!(rules.is_ignored("photos/cached_thumb.png"));
        assert!(!rules.is_ignored("photos/summer.jpg"));
    }

    #[test]
    fn invalid_pattern_is_dropped() {
        let rules = IgnoreRuleSet::parse("[unclosed\n*.log");
        assert_eq!(rules.len(), 1);
        assert!(rules.is_ignored("server.log"));
    }

    #[test]
    fn star_only_pattern_matches_everything() {
        let rules = IgnoreRuleSet::parse("*");
        assert!(rules.is_ignored("anything/at/all.png"));
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let rules = IgnoreRuleSet::load(dir.path(), DEFAULT_IGNORE_FILE);
        assert!(rules.is_empty());
    }

    #[test]
    fn load_reads_root_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".customignore"), "*.bak\n").unwrap();
        let rules = IgnoreRuleSet::load(dir.path(), ".customignore");
        assert_eq!(rules.len(), 1);
        assert!(rules.is_ignored("notes/old.bak"));
    }
}
