//! Tree path addressing.
//!
//! Paths handed out by the tree watcher are relative to the watched root and
//! use `/` as separator (the canonical form). `"."` names the root itself.
//! Native forms only matter when touching the host filesystem.

use std::path::{Path, PathBuf, MAIN_SEPARATOR};

/// The canonical name of the root directory.
pub const ROOT: &str = ".";

/// Replace every backslash with a forward slash.
pub fn to_posix(path: &str) -> String {
    path.replace('\\', "/")
}

/// Replace every forward slash with a backslash.
pub fn to_windows(path: &str) -> String {
    path.replace('/', "\\")
}

/// Rewrite both separator styles to the host separator.
pub fn to_native(path: &str) -> String {
    path.chars()
        .map(|c| if c == '/' || c == '\\' { MAIN_SEPARATOR } else { c })
        .collect()
}

/// Normalize a user-supplied relative path to canonical form.
///
/// Accepts either separator, strips `./` prefixes, empty components and
/// trailing slashes. An empty result is the root.
pub fn normalize(path: &str) -> String {
    let posix = to_posix(path);
    let parts: Vec<&str> = posix
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    if parts.is_empty() {
        ROOT.to_string()
    } else {
        parts.join("/")
    }
}

/// Canonical path of the entry `name` inside directory `dir`.
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Canonical parent of `path`, `None` for the root.
pub fn parent(path: &str) -> Option<String> {
    let path = normalize(path);
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(idx) => Some(path[..idx].to_string()),
        None => Some(ROOT.to_string()),
    }
}

/// Number of components below the root (`"."` has depth 0).
pub fn depth(path: &str) -> usize {
    let path = normalize(path);
    if path == ROOT {
        0
    } else {
        path.split('/').count()
    }
}

/// Absolute host path of a tree path under `root`.
pub fn resolve(root: &Path, path: &str) -> PathBuf {
    let path = normalize(path);
    if path == ROOT {
        root.to_path_buf()
    } else {
        root.join(to_native(&path))
    }
}

/// Whether `child` is a direct child of `parent`.
pub fn is_child(parent: &str, child: &str) -> bool {
    let child = normalize(child);
    if child == ROOT {
        return false;
    }
    self::parent(&child).as_deref() == Some(normalize(parent).as_str())
}

/// Whether `path` lies strictly below `ancestor`.
pub fn is_descendant(ancestor: &str, path: &str) -> bool {
    let ancestor = normalize(ancestor);
    let path = normalize(path);
    if path == ROOT || path == ancestor {
        return false;
    }
    if ancestor == ROOT {
        return true;
    }
    path.strip_prefix(&ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Select the direct children of `parent` among `paths`, keeping order.
pub fn find_children<'a, I>(parent: &str, paths: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    paths
        .into_iter()
        .filter(|path| is_child(parent, path))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_round_trip_between_styles() {
        assert_eq!(to_posix(r"foo\bar\baz"), "foo/bar/baz");
        assert_eq!(to_windows("foo/bar/baz"), r"foo\bar\baz");
        assert_eq!(to_posix("a/b\\c"), "a/b/c");
    }

    #[test]
    fn to_native_uses_host_separator() {
        let expected = format!("foo{}bar{}baz", MAIN_SEPARATOR, MAIN_SEPARATOR);
        assert_eq!(to_native("foo/bar\\baz"), expected);
    }

    #[test]
    fn normalize_collapses_noise() {
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("."), ".");
        assert_eq!(normalize("./"), ".");
        assert_eq!(normalize("./foo/"), "foo");
        assert_eq!(normalize(r"foo\\bar"), "foo/bar");
        assert_eq!(normalize("foo/./bar//"), "foo/bar");
    }

    #[test]
    fn join_under_root_drops_dot() {
        assert_eq!(join(".", "foo"), "foo");
        assert_eq!(join("foo", "bar"), "foo/bar");
    }

    #[test]
    fn parent_of_paths() {
        assert_eq!(parent("."), None);
        assert_eq!(parent("foo").as_deref(), Some("."));
        assert_eq!(parent("foo/bar/baz").as_deref(), Some("foo/bar"));
    }

    #[test]
    fn depth_counts_components() {
        assert_eq!(depth("."), 0);
        assert_eq!(depth("foo"), 1);
        assert_eq!(depth("foo/bar/baz"), 3);
    }

    #[test]
    fn resolve_root_is_root_dir() {
        let root = Path::new("/tmp/tree");
        assert_eq!(resolve(root, "."), PathBuf::from("/tmp/tree"));
        assert_eq!(resolve(root, "foo/bar"), root.join("foo").join("bar"));
    }

    #[test]
    fn is_child_matches_direct_children_only() {
        assert!(is_child(".", "foo"));
        assert!(is_child(".", "foo/"));
        assert!(!is_child(".", "foo/bar"));
        assert!(!is_child(".", "."));
        assert!(is_child("foo", "foo/bar"));
        assert!(is_child("foo/", r"foo\bar"));
        assert!(!is_child("foo", "foo/bar/baz"));
        assert!(!is_child("foo", "foobar/baz"));
        assert!(!is_child("foo", "foo"));
    }

    #[test]
    fn is_descendant_requires_separator_boundary() {
        assert!(is_descendant(".", "foo/bar"));
        assert!(is_descendant("foo", "foo/bar/baz"));
        assert!(!is_descendant("foo", "foobar"));
        assert!(!is_descendant("foo", "foo"));
        assert!(!is_descendant("foo/bar", "foo"));
    }

    #[test]
    fn find_children_filters_in_order() {
        let paths: Vec<String> = ["foo", "foo/alpha", "foo/alpha/x", "foo/beta", "bar"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(find_children("foo", &paths), vec!["foo/alpha", "foo/beta"]);
        assert_eq!(find_children(".", &paths), vec!["foo", "bar"]);
    }
}
