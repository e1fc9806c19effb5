use glob::{MatchOptions, Pattern};
use std::path::Path;

/// Name of the ignore file honoured inside a build context
pub const IGNORE_FILE: &str = ".dockerignore";

/// Parsed ignore rules from a context's .dockerignore
#[derive(Debug, Default)]
pub struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads `.dockerignore` from a context directory; a missing file means no rules
    pub fn for_context(context: &Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(context.join(IGNORE_FILE)) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::empty()),
            Err(e) => Err(e),
        }
    }

    /// Parse rules from a string using the glob crate for reliability.
    pub fn parse(content: &str) -> Self {
        let patterns = content
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| l.trim_start_matches("./").trim_end_matches('/'))
            .filter_map(|l| Pattern::new(l).ok())
            .collect();
        Self { patterns }
    }

    /// Returns true if the given path (relative to the build context root) should be ignored
    pub fn is_ignored(&self, path: &Path) -> bool {
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        // Check the path itself and all its parents
        for ancestor in path.ancestors() {
            let path_str = ancestor.to_string_lossy();
            if path_str.is_empty() || path_str == "." {
                continue;
            }
            for pattern in &self.patterns {
                if pattern.matches_with(&path_str, options) {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let rules = IgnoreRules::parse("node_modules\n.git");
        assert!(rules.is_ignored(Path::new("node_modules")));
        assert!(rules.is_ignored(Path::new("node_modules/pkg/index.js")));
        assert!(rules.is_ignored(Path::new(".git")));
        assert!(!rules.is_ignored(Path::new("src")));
    }

    #[test]
    fn test_wildcard_stays_in_directory() {
        let rules = IgnoreRules::parse("*.log\n# comment\n./build/");
        assert!(rules.is_ignored(Path::new("build.log")));
        assert!(rules.is_ignored(Path::new("build/out.bin")));
        assert!(!rules.is_ignored(Path::new("logs/today.log")));
        assert!(!rules.is_ignored(Path::new("main.rs")));
    }
}
