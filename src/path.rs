//! Absolute path normalization.
//!
//! Paths are plain strings with `/` separators so that locations inside
//! archives (`/repo/lib.zip/org/A.class`) and filesystem locations share one
//! key space for the content cache, the path synchronizer and the scan cache.

use std::path::{Path, PathBuf};

/// Suffix that marks an archive boundary in a conventioned path.
pub const ARCHIVE_PATH_SUFFIX: &str = "///";

/// Turns caller-supplied roots into normalized absolute paths.
pub trait PathResolver: Send + Sync {
    fn normalize(&self, raw: &str) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsPathResolver;

impl PathResolver for FsPathResolver {
    fn normalize(&self, raw: &str) -> String {
        let path = Path::new(raw);
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        clean(&absolute.to_string_lossy())
    }
}

/// Lexically normalizes a path: unifies separators, drops `.` and empty
/// segments, resolves `..` and strips the trailing separator.
pub fn clean(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

pub fn join(container: &str, name: &str) -> String {
    clean(&format!("{container}/{name}"))
}

/// Entry name with its leading separator stripped.
pub fn clean_entry_name(name: &str) -> String {
    match name.strip_prefix('/') {
        Some(rest) => rest.to_string(),
        None => name.to_string(),
    }
}

pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

pub(crate) fn parent_of(path: &str) -> Option<&str> {
    let idx = path.trim_end_matches('/').rfind('/')?;
    if idx == 0 { None } else { Some(&path[..idx]) }
}

/// Nearest ancestor (or the path itself) that exists on the filesystem.
pub fn nearest_existing_ancestor(path: &str) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        let p = Path::new(candidate);
        if p.exists() {
            return Some(p.to_path_buf());
        }
        current = parent_of(candidate);
    }
    None
}
