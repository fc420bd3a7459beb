// exemption.rs — `.gitignore`-style pattern files.
//
// Two independent uses share this mechanism: the Command Classifier's
// PROJECT-mode executable allow-list, and the Content Inspector's optional
// path-based scan exemptions (e.g. never scan `*.lock` bodies for secrets —
// lockfiles are large, low-risk, and expensive to scan). Both are plain
// glob pattern files: `#` comments and blank lines ignored, one pattern per
// line, matched against either the full path or the bare filename.

use glob::Pattern;

/// A set of glob patterns loaded from a pattern file.
#[derive(Debug, Clone)]
pub struct ExemptionPatterns {
    patterns: Vec<Pattern>,
    raw_patterns: Vec<String>,
}

impl ExemptionPatterns {
    /// Load patterns from a file. Each non-empty, non-comment line is a glob pattern.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse_content(&content))
    }

    /// Parse patterns from a string (the file contents).
    pub fn parse_content(content: &str) -> Self {
        let mut patterns = Vec::new();
        let mut raw_patterns = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            raw_patterns.push(trimmed.to_string());
            if let Ok(pattern) = Pattern::new(trimmed) {
                patterns.push(pattern);
            }
        }

        Self {
            patterns,
            raw_patterns,
        }
    }

    /// Load from file if it exists, otherwise an empty pattern set (matches
    /// nothing — an absent allow-list file means no PROJECT-mode
    /// executables are pre-approved, not that all of them are).
    pub fn load_or_empty(path: &std::path::Path) -> Self {
        if path.exists() {
            Self::from_file(path).unwrap_or_else(|_| Self::parse_content(""))
        } else {
            Self::parse_content("")
        }
    }

    /// Default inspection-exemption patterns for the Content Inspector:
    /// lockfiles and vendored dependency manifests, which are large,
    /// machine-generated, and not where secrets get committed by accident.
    pub fn inspection_defaults() -> Self {
        Self::parse_content(DEFAULT_INSPECTION_EXEMPT_PATTERNS)
    }

    /// Check whether `candidate` (a path, URI, or bare executable name)
    /// matches this pattern set.
    pub fn is_exempt(&self, candidate: &str) -> bool {
        let path = candidate.strip_prefix("fs://workspace/").unwrap_or(candidate);
        self.patterns.iter().any(|p| {
            p.matches(path)
                || path
                    .rsplit('/')
                    .next()
                    .map(|filename| p.matches(filename))
                    .unwrap_or(false)
        })
    }

    /// Return the raw pattern strings (for display/debugging).
    pub fn raw_patterns(&self) -> &[String] {
        &self.raw_patterns
    }
}

const DEFAULT_INSPECTION_EXEMPT_PATTERNS: &str = r#"# Default Content Inspector scan exemptions.
# Format: .gitignore-style glob patterns, one per line.

Cargo.lock
package-lock.json
yarn.lock
pnpm-lock.yaml
Gemfile.lock
poetry.lock
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspection_defaults_match_lockfiles() {
        let patterns = ExemptionPatterns::inspection_defaults();
        assert!(patterns.is_exempt("fs://workspace/Cargo.lock"));
        assert!(patterns.is_exempt("fs://workspace/package-lock.json"));
        assert!(patterns.is_exempt("fs://workspace/deep/path/pnpm-lock.yaml"));
    }

    #[test]
    fn inspection_defaults_do_not_match_source_files() {
        let patterns = ExemptionPatterns::inspection_defaults();
        assert!(!patterns.is_exempt("fs://workspace/src/main.rs"));
        assert!(!patterns.is_exempt("fs://workspace/src/lib.rs"));
    }

    #[test]
    fn custom_patterns_override_defaults() {
        let content = "*.lock\n*.md\n";
        let patterns = ExemptionPatterns::parse_content(content);
        assert!(patterns.is_exempt("fs://workspace/Cargo.lock"));
        assert!(patterns.is_exempt("fs://workspace/README.md"));
        assert!(!patterns.is_exempt("fs://workspace/Cargo.toml"));
    }

    #[test]
    fn comments_and_blanks_are_ignored() {
        let content = "# This is a comment\n\n*.lock\n  # Another comment\n";
        let patterns = ExemptionPatterns::parse_content(content);
        assert_eq!(patterns.raw_patterns().len(), 1);
        assert!(patterns.is_exempt("fs://workspace/Cargo.lock"));
    }

    #[test]
    fn glob_star_patterns() {
        let content = "**/*.generated.*\n";
        let patterns = ExemptionPatterns::parse_content(content);
        assert!(patterns.is_exempt("fs://workspace/src/types.generated.ts"));
        assert!(!patterns.is_exempt("fs://workspace/src/main.rs"));
    }

    #[test]
    fn empty_patterns_exempt_nothing() {
        let patterns = ExemptionPatterns::parse_content("");
        assert!(!patterns.is_exempt("fs://workspace/anything.rs"));
    }

    #[test]
    fn load_or_empty_returns_empty_for_missing_file() {
        let patterns = ExemptionPatterns::load_or_empty(std::path::Path::new("/nonexistent/path"));
        assert!(!patterns.is_exempt("Cargo.lock"));
    }

    #[test]
    fn load_from_tempfile_matches_project_allowlist_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowed-commands");
        std::fs::write(&path, "/usr/bin/cargo\nnpm\n").unwrap();

        let patterns = ExemptionPatterns::from_file(&path).unwrap();
        assert!(patterns.is_exempt("/usr/bin/cargo"));
        assert!(patterns.is_exempt("npm"));
        assert!(!patterns.is_exempt("/usr/bin/sudo"));
    }

    #[test]
    fn raw_patterns_accessible() {
        let patterns = ExemptionPatterns::parse_content("*.lock\n*.toml\n");
        assert_eq!(patterns.raw_patterns().len(), 2);
    }
}
