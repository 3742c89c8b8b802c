//! Path-string utilities.
//!
//! The VFS works on absolute, forward-slash separated, collapsed path
//! strings. All helpers here are purely lexical; nothing touches a backend.

use crate::errno::err;
use crate::errno::Errno;
use crate::errno::Result;

/// Normalize a path: reject NUL bytes and empty strings, root relative
/// paths at `/`, collapse repeated separators and resolve `.` and `..`
/// segments without consulting the file system.
pub fn normalize(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(err(Errno::EINVAL, "normalize", path));
    }
    if path.contains('\0') {
        return Err(err(Errno::EINVAL, "normalize", path));
    }

    let mut stack: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        return Ok("/".to_string());
    }
    let mut out = String::with_capacity(path.len());
    for component in stack {
        out.push('/');
        out.push_str(component);
    }
    Ok(out)
}

/// The directory part of a normalized path. `dirname("/a/b") == "/a"`,
/// `dirname("/a") == "/"`, `dirname("/") == "/"`.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// The final component of a normalized path; empty only for the root.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join a base path and a component (or relative path) and normalize the
/// result. An absolute `rest` replaces `base` entirely.
pub fn join(base: &str, rest: &str) -> Result<String> {
    if rest.starts_with('/') {
        return normalize(rest);
    }
    if base == "/" {
        return normalize(&format!("/{rest}"));
    }
    normalize(&format!("{base}/{rest}"))
}

/// The non-empty components of a normalized path, leftmost first.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// True if `path` lies at or below `ancestor` (both normalized).
pub fn is_within(ancestor: &str, path: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses() {
        assert_eq!(normalize("/a//b///c").unwrap(), "/a/b/c");
        assert_eq!(normalize("/a/./b/..").unwrap(), "/a");
        assert_eq!(normalize("/../..").unwrap(), "/");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("relative/x").unwrap(), "/relative/x");
    }

    #[test]
    fn normalize_is_idempotent() {
        for p in ["/a//b/./../c", "/x", "/", "a/b/c/../.."] {
            let once = normalize(p).unwrap();
            assert_eq!(normalize(&once).unwrap(), once);
            assert!(!once.contains("//"));
            assert!(!components(&once).any(|c| c == "." || c == ".."));
        }
    }

    #[test]
    fn rejects_empty_and_nul() {
        assert_eq!(normalize("").unwrap_err().errno, Errno::EINVAL);
        assert_eq!(normalize("/a\0b").unwrap_err().errno, Errno::EINVAL);
    }

    #[test]
    fn dirname_basename() {
        assert_eq!(dirname("/a/b/c"), "/a/b");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("/"), "/");
        assert_eq!(basename("/a/b/c"), "c");
        assert_eq!(basename("/"), "");
    }

    #[test]
    fn join_handles_absolute_and_relative() {
        assert_eq!(join("/a/b", "c").unwrap(), "/a/b/c");
        assert_eq!(join("/a/b", "../c").unwrap(), "/a/c");
        assert_eq!(join("/a/b", "/x").unwrap(), "/x");
        assert_eq!(join("/", "x").unwrap(), "/x");
    }

    #[test]
    fn within() {
        assert!(is_within("/", "/anything"));
        assert!(is_within("/a", "/a"));
        assert!(is_within("/a", "/a/b"));
        assert!(!is_within("/a", "/ab"));
    }
}
