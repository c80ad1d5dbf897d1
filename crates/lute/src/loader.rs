// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Template source loading.
//!
//! This module provides the [`SourceLoader`] trait used by the include
//! resolver and the assembly-reference preloader, with two implementations:
//!
//! - [`FileSystemLoader`]: loads sources from disk relative to a root
//!   directory (native builds, `filesystem` feature)
//! - [`MemoryLoader`]: loads sources from an in-memory map (tests, WASM-like
//!   embedding)
//!
//! # Resolution
//!
//! `resolve(base, relative)` joins a relative name against the directory of
//! the including item. Item names are not required to be filesystem paths;
//! when `base` has no directory component, `resolve` degrades to identity on
//! `relative`.

use crate::error::{Error, Result};

/// Trait for locating and loading template sources.
///
/// Implementations must be thread-safe; engines holding a loader may be
/// published through the process-wide engine cache.
pub trait SourceLoader: Send + Sync + 'static {
    /// Returns true when `path` can be read by this loader.
    fn exists(&self, path: &str) -> bool;

    /// Reads the source at `path`.
    fn read(&self, path: &str) -> Result<String>;

    /// Resolves `relative` against the directory of `base`.
    fn resolve(&self, base: &str, relative: &str) -> String;

    /// Creates a boxed clone (for use in closures).
    fn clone_box(&self) -> Box<dyn SourceLoader>;
}

impl Clone for Box<dyn SourceLoader> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Joins `relative` onto the directory of `base` and textually normalizes
/// `.` and `..` segments. Forward and backward slashes are both treated as
/// separators; output uses forward slashes.
pub(crate) fn join_relative(base: &str, relative: &str) -> String {
    let normalized_base = base.replace('\\', "/");
    let dir = match normalized_base.rsplit_once('/') {
        Some((dir, _file)) => dir,
        None => return relative.to_string(),
    };

    let mut parts: Vec<&str> = dir.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    let normalized_relative = relative.replace('\\', "/");
    for part in normalized_relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if normalized_base.starts_with('/') {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Filesystem-based source loader.
///
/// Paths are resolved relative to a root directory. Only available on
/// native builds with the `filesystem` feature enabled.
#[cfg(feature = "filesystem")]
#[derive(Debug, Clone)]
pub struct FileSystemLoader {
    /// The root directory prepended to relative paths.
    pub root_dir: String,
}

#[cfg(feature = "filesystem")]
impl FileSystemLoader {
    /// Creates a new loader with the given root directory.
    pub fn new<P: AsRef<std::path::Path>>(root_dir: P) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_string_lossy().to_string(),
        }
    }

    fn full_path(&self, path: &str) -> std::path::PathBuf {
        let as_path = std::path::Path::new(path);
        if as_path.is_absolute() {
            as_path.to_path_buf()
        } else {
            std::path::Path::new(&self.root_dir).join(as_path)
        }
    }
}

#[cfg(feature = "filesystem")]
impl Default for FileSystemLoader {
    fn default() -> Self {
        Self::new(".")
    }
}

#[cfg(feature = "filesystem")]
impl SourceLoader for FileSystemLoader {
    fn exists(&self, path: &str) -> bool {
        self.full_path(path).is_file()
    }

    fn read(&self, path: &str) -> Result<String> {
        let full = self.full_path(path);
        tracing::debug!(path = %full.display(), "loading template source");
        std::fs::read_to_string(&full)
            .map_err(|e| Error::Resolution(format!("cannot read '{}': {}", full.display(), e)))
    }

    fn resolve(&self, base: &str, relative: &str) -> String {
        join_relative(base, relative)
    }

    fn clone_box(&self) -> Box<dyn SourceLoader> {
        Box::new(self.clone())
    }
}

/// Simple in-memory source loader.
///
/// Stores sources in a map for quick access without a filesystem.
/// Primarily used for unit tests and for embedding templates in binaries.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    /// Map of path → template source.
    pub sources: std::collections::HashMap<String, String>,
}

impl MemoryLoader {
    /// Creates an empty memory loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source under a virtual path.
    pub fn add_source(&mut self, path: &str, source: &str) {
        self.sources.insert(path.to_string(), source.to_string());
    }

    /// Builder-style variant of [`add_source`](Self::add_source).
    pub fn with_source(mut self, path: &str, source: &str) -> Self {
        self.add_source(path, source);
        self
    }
}

impl SourceLoader for MemoryLoader {
    fn exists(&self, path: &str) -> bool {
        self.sources.contains_key(path)
    }

    fn read(&self, path: &str) -> Result<String> {
        self.sources
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Resolution(format!("'{}' not found in memory sources", path)))
    }

    fn resolve(&self, base: &str, relative: &str) -> String {
        let joined = join_relative(base, relative);
        // Prefer the joined path, but fall back to the bare name so logical
        // (non-path) names keep resolving as themselves.
        if !self.sources.contains_key(&joined) && self.sources.contains_key(relative) {
            relative.to_string()
        } else {
            joined
        }
    }

    fn clone_box(&self) -> Box<dyn SourceLoader> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_relative() {
        assert_eq!(join_relative("mail/Welcome.tpl", "Footer.tpl"), "mail/Footer.tpl");
        assert_eq!(join_relative("mail/Welcome.tpl", "../Shared.tpl"), "Shared.tpl");
        assert_eq!(join_relative("mail/a/b.tpl", "./c.tpl"), "mail/a/c.tpl");
        // A base without a directory component is an identity resolve.
        assert_eq!(join_relative("Welcome", "tail"), "tail");
        assert_eq!(join_relative(r"mail\Welcome.tpl", "Footer.tpl"), "mail/Footer.tpl");
    }

    #[test]
    fn test_memory_loader() {
        let loader = MemoryLoader::new().with_source("a/b.tpl", "B");
        assert!(loader.exists("a/b.tpl"));
        assert!(!loader.exists("a/missing.tpl"));
        assert_eq!(loader.read("a/b.tpl").unwrap(), "B");
        assert!(matches!(loader.read("nope"), Err(Error::Resolution(_))));
    }

    #[test]
    fn test_memory_loader_resolve_falls_back_to_logical_name() {
        let loader = MemoryLoader::new().with_source("tail", "T");
        assert_eq!(loader.resolve("dir/main", "tail"), "tail");

        let loader = MemoryLoader::new().with_source("dir/tail", "T");
        assert_eq!(loader.resolve("dir/main", "tail"), "dir/tail");
    }

    #[cfg(feature = "filesystem")]
    #[test]
    fn test_filesystem_loader() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("hello.tpl"), "Hello").unwrap();

        let loader = FileSystemLoader::new(temp_dir.path());
        assert!(loader.exists("hello.tpl"));
        assert!(!loader.exists("missing.tpl"));
        assert_eq!(loader.read("hello.tpl").unwrap(), "Hello");
        assert!(loader.read("missing.tpl").is_err());
    }

    #[cfg(feature = "filesystem")]
    #[test]
    fn test_filesystem_loader_relative_resolve() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("mail")).unwrap();
        std::fs::write(temp_dir.path().join("mail/footer.tpl"), "F").unwrap();

        let loader = FileSystemLoader::new(temp_dir.path());
        let resolved = loader.resolve("mail/welcome.tpl", "footer.tpl");
        assert_eq!(resolved, "mail/footer.tpl");
        assert!(loader.exists(&resolved));
    }
}
