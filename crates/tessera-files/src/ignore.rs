//! Ignore patterns.
//!
//! Patterns come from folder configuration and from `.tesseraignore` files.
//! A pattern in `dir/.tesseraignore` is anchored at `dir/`; a pattern without
//! a slash matches at any depth below its anchor. A matching directory
//! excludes everything beneath it. Lines starting with `#` are comments and
//! `\#` escapes a literal leading hash. Absolute and `..` patterns are
//! rejected with a warning.
//!
//! The system directory and in-progress temporary files are always ignored.

use crate::error::{FilesError, Result};
use crate::{IGNORE_FILE, SYSTEM_DIR, TEMP_PREFIX};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Compiled ignore rules for one folder.
#[derive(Debug, Clone)]
pub struct IgnoreList {
    set: GlobSet,
    patterns: Vec<String>,
}

impl IgnoreList {
    /// Build from explicit patterns only, anchored at the folder root.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::IgnorePattern`] if a pattern does not compile.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = Builder::default();
        for p in patterns {
            builder.add("", p);
        }
        builder.build()
    }

    /// Build from `patterns` plus every ignore file under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::IgnorePattern`] if a pattern does not compile.
    pub fn load(root: &Path, patterns: &[String]) -> Result<Self> {
        let mut builder = Builder::default();
        for p in patterns {
            builder.add("", p);
        }
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.file_name() != SYSTEM_DIR);
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || entry.file_name() != IGNORE_FILE {
                continue;
            }
            let Ok(text) = fs::read_to_string(entry.path()) else {
                tracing::warn!("unreadable ignore file {}", entry.path().display());
                continue;
            };
            let anchor = entry
                .path()
                .parent()
                .and_then(|dir| crate::path::normalize(root, dir).ok())
                .unwrap_or_default();
            for line in text.lines() {
                builder.add(&anchor, line);
            }
        }
        builder.build()
    }

    /// Whether a normalized relative path is excluded from sync.
    #[must_use]
    pub fn is_ignored(&self, rel: &str) -> bool {
        if crate::path::is_system(rel) {
            return true;
        }
        let name = rel.rsplit('/').next().unwrap_or(rel);
        if name.starts_with(TEMP_PREFIX) {
            return true;
        }
        self.set.is_match(rel)
    }

    /// Effective glob patterns, for diagnostics.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for IgnoreList {
    fn default() -> Self {
        Self {
            set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Builder {
    globs: Vec<String>,
}

impl Builder {
    fn add(&mut self, anchor: &str, line: &str) {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        let pattern = line.strip_prefix('\\').unwrap_or(line);
        let pattern = pattern.trim_end_matches('/');
        if pattern.starts_with('/') || pattern.split('/').any(|p| p == "..") {
            tracing::warn!("ignoring unsafe ignore pattern {:?}", line);
            return;
        }
        if pattern.is_empty() {
            return;
        }
        let prefix = if anchor.is_empty() {
            String::new()
        } else {
            format!("{anchor}/")
        };
        let base = if pattern.contains('/') {
            format!("{prefix}{pattern}")
        } else {
            format!("{prefix}**/{pattern}")
        };
        self.globs.push(format!("{base}/**"));
        self.globs.push(base);
    }

    fn build(self) -> Result<IgnoreList> {
        let mut builder = GlobSetBuilder::new();
        for g in &self.globs {
            let glob = Glob::new(g).map_err(|e| FilesError::IgnorePattern {
                pattern: g.clone(),
                reason: e.to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| FilesError::IgnorePattern {
            pattern: String::new(),
            reason: e.to_string(),
        })?;
        Ok(IgnoreList {
            set,
            patterns: self.globs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_system_dir_always_ignored() {
        let list = IgnoreList::default();
        assert!(list.is_ignored(".tessera"));
        assert!(list.is_ignored(".tessera/meta.db"));
        assert!(list.is_ignored("dir/.tessera-tmp-abc"));
        assert!(!list.is_ignored("notes.txt"));
    }

    #[test]
    fn test_unanchored_pattern_matches_any_depth() {
        let list = IgnoreList::new(&["*.tmp".into(), "build".into()]).unwrap();
        assert!(list.is_ignored("a.tmp"));
        assert!(list.is_ignored("x/y/a.tmp"));
        assert!(list.is_ignored("build/out.o"));
        assert!(list.is_ignored("src/build/out.o"));
        assert!(!list.is_ignored("a.txt"));
    }

    #[test]
    fn test_anchored_pattern() {
        let list = IgnoreList::new(&["docs/private".into()]).unwrap();
        assert!(list.is_ignored("docs/private/secret.txt"));
        assert!(!list.is_ignored("other/docs/private/secret.txt"));
    }

    #[test]
    fn test_ignore_file_scoped_to_directory() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(
            dir.path().join("sub").join(IGNORE_FILE),
            "# comment\n*.log\n../escape\n/abs\n\\#hash\n",
        )
        .unwrap();
        let list = IgnoreList::load(dir.path(), &[]).unwrap();
        assert!(list.is_ignored("sub/a.log"));
        assert!(list.is_ignored("sub/deep/a.log"));
        assert!(!list.is_ignored("a.log"));
        assert!(list.is_ignored("sub/#hash"));
        assert!(!list.is_ignored("escape"));
    }
}
