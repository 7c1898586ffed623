//! Lexical path resolution shared by the safety gate and builtin tools.
//!
//! Paths are never touched on disk: `..` is folded textually and symlinks are
//! not followed, so a link inside the workspace cannot vouch for its target.
//! Both `/` and `\` separate components, and a leading drive letter (`C:`)
//! roots a Windows-style path whose components compare case-insensitively.

use std::path::Path;

/// An absolute path reduced to its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexicalPath {
    /// Lowercased drive letter for `X:` paths, `None` for `/`-rooted paths.
    drive: Option<char>,
    components: Vec<String>,
}

impl LexicalPath {
    /// Resolve `raw` against `base` (which must itself be absolute).
    ///
    /// Returns `None` when the path cannot be resolved: an empty string, a
    /// relative path with a relative base, a home-relative or variable path,
    /// or `..` escaping above the root.
    pub fn resolve(raw: &str, base: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('~') || raw.contains('$') {
            return None;
        }
        let raw = raw.replace('\\', "/");

        if let Some((drive, rest)) = split_drive(&raw) {
            // `C:foo` is drive-relative; only `C:/foo` is absolute.
            if !rest.is_empty() && !rest.starts_with('/') {
                return None;
            }
            return Self::from_parts(Some(drive), Vec::new(), rest);
        }
        if raw.starts_with('/') {
            return Self::from_parts(None, Vec::new(), &raw);
        }

        let base = Self::resolve_absolute(base)?;
        Self::from_parts(base.drive, base.components, &raw)
    }

    /// Resolve a path that must already be absolute.
    pub fn resolve_absolute(raw: &str) -> Option<Self> {
        let normalized = raw.trim().replace('\\', "/");
        if let Some((drive, rest)) = split_drive(&normalized) {
            return Self::from_parts(Some(drive), Vec::new(), rest);
        }
        if normalized.starts_with('/') {
            return Self::from_parts(None, Vec::new(), &normalized);
        }
        None
    }

    /// Convenience wrapper for `std::path::Path` inputs.
    pub fn from_path(path: &Path) -> Option<Self> {
        Self::resolve_absolute(&path.to_string_lossy())
    }

    /// True when `self` equals `root` or lies beneath it.
    pub fn is_within(&self, root: &LexicalPath) -> bool {
        if self.drive != root.drive || self.components.len() < root.components.len() {
            return false;
        }
        let fold_case = self.drive.is_some();
        self.components
            .iter()
            .zip(&root.components)
            .all(|(a, b)| if fold_case { a.eq_ignore_ascii_case(b) } else { a == b })
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    fn from_parts(drive: Option<char>, mut components: Vec<String>, rest: &str) -> Option<Self> {
        for part in rest.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    components.pop()?;
                }
                other => components.push(other.to_string()),
            }
        }
        Some(Self { drive, components })
    }
}

impl std::fmt::Display for LexicalPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.drive {
            Some(drive) => write!(f, "{}:\\{}", drive.to_ascii_uppercase(), self.components.join("\\")),
            None => write!(f, "/{}", self.components.join("/")),
        }
    }
}

fn split_drive(path: &str) -> Option<(char, &str)> {
    let mut chars = path.chars();
    let letter = chars.next()?;
    if letter.is_ascii_alphabetic() && chars.next() == Some(':') {
        Some((letter.to_ascii_lowercase(), &path[2..]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(raw: &str, base: &str) -> String {
        LexicalPath::resolve(raw, base)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    }

    #[test]
    fn resolves_relative_against_base() {
        assert_eq!(resolve("./src/../lib.rs", "/work"), "/work/lib.rs");
        assert_eq!(resolve(r".\work\file", r"C:\"), r"C:\work\file");
        assert_eq!(resolve("notes.txt", "/srv/app"), "/srv/app/notes.txt");
    }

    #[test]
    fn absolute_paths_ignore_base() {
        assert_eq!(resolve(r"C:\outside\file", r"C:\work"), r"C:\outside\file");
        assert_eq!(resolve("/etc/passwd", "/work"), "/etc/passwd");
        assert_eq!(resolve("d:/Data", "/work"), r"D:\Data");
    }

    #[test]
    fn unresolvable_paths_are_none() {
        assert_eq!(resolve("", "/work"), "<none>");
        assert_eq!(resolve("~/secret", "/work"), "<none>");
        assert_eq!(resolve("$HOME/x", "/work"), "<none>");
        assert_eq!(resolve("../../..", "/work"), "<none>");
        assert_eq!(resolve("x", "relative/base"), "<none>");
        assert_eq!(resolve("C:foo", "/work"), "<none>");
    }

    #[test]
    fn containment_is_component_wise() {
        let root = LexicalPath::resolve_absolute("/work").expect("root");
        let inside = LexicalPath::resolve("/work/a/b", "/").expect("inside");
        let sibling = LexicalPath::resolve("/workshop/a", "/").expect("sibling");
        assert!(inside.is_within(&root));
        assert!(root.is_within(&root));
        assert!(!sibling.is_within(&root));
    }

    #[test]
    fn drive_paths_compare_case_insensitively() {
        let root = LexicalPath::resolve_absolute(r"C:\Work").expect("root");
        let inside = LexicalPath::resolve(r"c:\work\FILE.txt", "/").expect("inside");
        assert!(inside.is_within(&root));

        let unix_root = LexicalPath::resolve_absolute("/Work").expect("root");
        let other = LexicalPath::resolve_absolute("/work/x").expect("other");
        assert!(!other.is_within(&unix_root));
    }
}
