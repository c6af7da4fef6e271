//! Auto-managed paths that never count as uncommitted agent work.

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathExclusions {
    patterns: Vec<String>,
}

pub const DEFAULT_EXCLUDED_PATHS: [&str; 3] = [".beads/", ".kb/", ".orch/"];

fn normalize(path: &str) -> String {
    let mut trimmed = path.trim();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.trim_end_matches('/').to_string()
}

impl PathExclusions {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| normalize(pattern.as_ref()))
            .filter(|pattern| !pattern.is_empty() && pattern != ".")
            .collect();
        Self { patterns }
    }

    pub fn defaults() -> Self {
        Self::new(DEFAULT_EXCLUDED_PATHS)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// True when `changed` is an excluded path, lies under an excluded
    /// directory, or is a directory containing an excluded path.
    pub fn is_excluded(&self, changed: &str) -> bool {
        let changed = normalize(changed);
        if changed.is_empty() {
            return false;
        }
        self.patterns
            .iter()
            .any(|pattern| same_or_nested(&changed, pattern) || same_or_nested(pattern, &changed))
    }
}

/// `path` equals `dir` or sits below it, matching whole components only.
fn same_or_nested(path: &str, dir: &str) -> bool {
    path == dir
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}
