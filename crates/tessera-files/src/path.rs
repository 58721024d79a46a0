//! Folder-relative path handling.
//!
//! Paths are stored and sent as `/`-separated strings relative to the folder
//! root, with no leading or trailing slash and no `.` or `..` components.
//! Anything a peer sends is validated before it touches the filesystem.

use crate::error::{FilesError, Result};
use std::path::{Component, Path, PathBuf};

/// Check a relative path is safe to join onto a folder root.
///
/// # Errors
///
/// Returns [`FilesError::InvalidPath`] for empty, absolute or traversing paths.
pub fn validate(rel: &str) -> Result<()> {
    if rel.is_empty() {
        return Err(FilesError::InvalidPath("empty path".into()));
    }
    if rel.starts_with('/') || rel.ends_with('/') || rel.contains('\0') || rel.contains('\\') {
        return Err(FilesError::InvalidPath(rel.to_string()));
    }
    for part in rel.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(FilesError::InvalidPath(rel.to_string()));
        }
    }
    Ok(())
}

/// Convert an absolute path under `root` to its normalized relative form.
///
/// # Errors
///
/// Returns [`FilesError::InvalidPath`] if `abs` is not under `root` or has
/// non-UTF-8 components.
pub fn normalize(root: &Path, abs: &Path) -> Result<String> {
    let rel = abs
        .strip_prefix(root)
        .map_err(|_| FilesError::InvalidPath(abs.display().to_string()))?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(os) => {
                let s = os
                    .to_str()
                    .ok_or_else(|| FilesError::InvalidPath(abs.display().to_string()))?;
                parts.push(s);
            }
            Component::CurDir => {}
            _ => return Err(FilesError::InvalidPath(abs.display().to_string())),
        }
    }
    let joined = parts.join("/");
    validate(&joined)?;
    Ok(joined)
}

/// Resolve a validated relative path under `root`.
///
/// # Errors
///
/// Returns [`FilesError::InvalidPath`] if `rel` fails [`validate`].
pub fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    validate(rel)?;
    let mut out = root.to_path_buf();
    for part in rel.split('/') {
        out.push(part);
    }
    Ok(out)
}

/// Split `dir/name.ext` into (`dir/name`, `.ext`). Dotfiles have no extension.
#[must_use]
pub fn split_extension(rel: &str) -> (&str, &str) {
    let name_start = rel.rfind('/').map_or(0, |i| i + 1);
    match rel[name_start..].rfind('.') {
        Some(0) | None => (rel, ""),
        Some(dot) => rel.split_at(name_start + dot),
    }
}

/// Whether `rel` is inside the system directory.
#[must_use]
pub fn is_system(rel: &str) -> bool {
    rel == crate::SYSTEM_DIR || rel.starts_with(&format!("{}/", crate::SYSTEM_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(validate("a.txt").is_ok());
        assert!(validate("dir/sub/a.txt").is_ok());
        for bad in ["", "/a", "a/", "a//b", "../a", "a/../b", "./a", "a\\b"] {
            assert!(validate(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_normalize_roundtrip() {
        let root = Path::new("/sync/folder");
        let abs = Path::new("/sync/folder/docs/report.pdf");
        let rel = normalize(root, abs).unwrap();
        assert_eq!(rel, "docs/report.pdf");
        assert_eq!(resolve(root, &rel).unwrap(), abs);
    }

    #[test]
    fn test_normalize_outside_root() {
        assert!(normalize(Path::new("/a"), Path::new("/b/c")).is_err());
        assert!(normalize(Path::new("/a"), Path::new("/a")).is_err());
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("a.txt"), ("a", ".txt"));
        assert_eq!(split_extension("dir.d/file"), ("dir.d/file", ""));
        assert_eq!(split_extension("dir/.hidden"), ("dir/.hidden", ""));
        assert_eq!(split_extension("x/y.tar.gz"), ("x/y.tar", ".gz"));
    }

    #[test]
    fn test_is_system() {
        assert!(is_system(".tessera"));
        assert!(is_system(".tessera/archive/a"));
        assert!(!is_system(".tesseraignore"));
    }
}
