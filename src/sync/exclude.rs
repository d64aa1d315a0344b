//! Exclude pattern matching for sync operations.
//!
//! Patterns are anchored at the sync root and matched against forward-slash
//! relative paths. Supported shapes:
//!
//! - `*.ext` matches by basename glob anywhere in the tree
//! - `dirname/` matches when any path segment equals `dirname`
//! - `a/b/*` matches by path glob from the root
//! - `**/x` matches `x` at any depth

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::SyncError;

/// Compiled exclusion filter.
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    /// Globs containing a separator, matched against the whole relative path.
    path_globs: GlobSet,
    /// Separator-free globs, matched against the basename alone.
    basename_globs: GlobSet,
    /// Trailing-slash patterns, matched against every path segment.
    dir_names: Vec<String>,
    patterns: Vec<String>,
}

impl ExcludeMatcher {
    /// Compile a pattern list. Invalid globs are a configuration error.
    pub fn new(patterns: &[String]) -> Result<Self, SyncError> {
        let mut path_builder = GlobSetBuilder::new();
        let mut base_builder = GlobSetBuilder::new();
        let mut dir_names = Vec::new();
        let mut kept = Vec::new();

        for raw in patterns {
            let pattern = raw.trim().replace('\\', "/");
            if pattern.is_empty() {
                continue;
            }
            kept.push(pattern.clone());

            if let Some(dirname) = pattern.strip_suffix('/') {
                dir_names.push(dirname.to_string());
                continue;
            }

            let glob = Glob::new(&pattern).map_err(|err| {
                SyncError::validation("exclude", format!("bad pattern {pattern:?}: {err}"))
            })?;
            if pattern.contains('/') {
                path_builder.add(glob);
            } else {
                base_builder.add(glob);
            }
        }

        let path_globs = path_builder
            .build()
            .map_err(|err| SyncError::validation("exclude", err.to_string()))?;
        let basename_globs = base_builder
            .build()
            .map_err(|err| SyncError::validation("exclude", err.to_string()))?;

        Ok(Self {
            path_globs,
            basename_globs,
            dir_names,
            patterns: kept,
        })
    }

    pub fn empty() -> Self {
        Self {
            path_globs: GlobSet::empty(),
            basename_globs: GlobSet::empty(),
            dir_names: Vec::new(),
            patterns: Vec::new(),
        }
    }

    /// Whether a relative path should be skipped.
    pub fn is_excluded(&self, path: &str) -> bool {
        let path = path.replace('\\', "/");
        let path = path.trim_matches('/');
        if path.is_empty() {
            return false;
        }

        if !self.dir_names.is_empty()
            && path.split('/').any(|seg| self.dir_names.iter().any(|d| d == seg))
        {
            return true;
        }

        if self.path_globs.is_match(path) {
            return true;
        }

        let basename = path.rsplit('/').next().unwrap_or(path);
        self.basename_globs.is_match(basename)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Default for ExcludeMatcher {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> ExcludeMatcher {
        let owned: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        ExcludeMatcher::new(&owned).unwrap()
    }

    #[test]
    fn extension_pattern_matches_basename_at_any_depth() {
        let m = matcher(&["*.tmp"]);
        assert!(m.is_excluded("scratch.tmp"));
        assert!(m.is_excluded("deep/nested/scratch.tmp"));
        assert!(!m.is_excluded("scratch.txt"));
    }

    #[test]
    fn trailing_slash_matches_any_segment() {
        let m = matcher(&["node_modules/"]);
        assert!(m.is_excluded("node_modules"));
        assert!(m.is_excluded("app/node_modules/left-pad/index.js"));
        assert!(!m.is_excluded("src/node_modules.rs"));
    }

    #[test]
    fn path_glob_is_anchored() {
        let m = matcher(&["build/out/*"]);
        assert!(m.is_excluded("build/out/app.bin"));
        assert!(!m.is_excluded("other/build/out/app.bin"));
    }

    #[test]
    fn double_star_matches_any_depth() {
        let m = matcher(&["**/secrets.env"]);
        assert!(m.is_excluded("secrets.env"));
        assert!(m.is_excluded("a/b/c/secrets.env"));
        assert!(!m.is_excluded("a/secrets.env.bak"));
    }

    #[test]
    fn invalid_pattern_is_a_validation_error() {
        let err = ExcludeMatcher::new(&["a/[".to_string()]).unwrap_err();
        assert!(matches!(err, SyncError::Validation { field: "exclude", .. }));
    }
}
