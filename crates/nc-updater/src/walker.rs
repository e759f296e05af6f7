// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Children-before-parent directory traversal with exclusion prefixes

use crate::error::{Result, UpdaterError};
use crate::layout::ExclusionSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One visited entry below the walked root
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: PathBuf,
    /// Path relative to the walked root
    pub relative: PathBuf,
    pub is_dir: bool,
    pub is_symlink: bool,
}

impl TreeEntry {
    fn new(entry: &walkdir::DirEntry, relative: PathBuf) -> Self {
        let file_type = entry.file_type();
        Self {
            path: entry.path().to_path_buf(),
            relative,
            is_dir: file_type.is_dir(),
            is_symlink: file_type.is_symlink(),
        }
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir && !self.is_symlink
    }
}

/// Unreadable entries are yielded as errors; the walk carries on after them
pub type WalkItem = std::result::Result<TreeEntry, walkdir::Error>;

/// Depth-first walk over `root` that never yields excluded paths
#[derive(Debug, Clone)]
pub struct TreeWalker {
    root: PathBuf,
    excluded: Vec<PathBuf>,
}

impl TreeWalker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excluded: Vec::new(),
        }
    }

    pub fn excluding(mut self, set: &ExclusionSet) -> Self {
        tracing::debug!(
            "Walking {} with {} exclusions rev {}",
            self.root.display(),
            set.operation,
            set.revision
        );
        self.excluded
            .extend(set.entries.iter().map(PathBuf::from));
        self
    }

    pub fn excluding_path(mut self, relative: impl Into<PathBuf>) -> Self {
        self.excluded.push(relative.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_excluded(&self, relative: &Path) -> bool {
        self.excluded.iter().any(|prefix| relative.starts_with(prefix))
    }

    pub fn walk(&self) -> Walk<'_> {
        Walk {
            walker: self,
            top: WalkDir::new(&self.root)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter(),
            current: None,
        }
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map_or_else(|_| path.to_path_buf(), Path::to_path_buf)
    }
}

/// Lazy iterator returned by [`TreeWalker::walk`]
///
/// Excluded top-level entries are never descended; deeper exclusions are
/// filtered as the subtree is walked.
#[derive(Debug)]
pub struct Walk<'a> {
    walker: &'a TreeWalker,
    top: walkdir::IntoIter,
    current: Option<walkdir::IntoIter>,
}

impl Iterator for Walk<'_> {
    type Item = WalkItem;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(subtree) = self.current.as_mut() {
                match subtree.next() {
                    Some(Ok(entry)) => {
                        let relative = self.walker.relative(entry.path());
                        if !self.walker.is_excluded(&relative) {
                            return Some(Ok(TreeEntry::new(&entry, relative)));
                        }
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => self.current = None,
                }
                continue;
            }

            match self.top.next()? {
                Err(e) => return Some(Err(e)),
                Ok(entry) => {
                    let relative = self.walker.relative(entry.path());
                    if self.walker.is_excluded(&relative) {
                        continue;
                    }
                    if entry.file_type().is_dir() {
                        self.current = Some(
                            WalkDir::new(entry.path())
                                .contents_first(true)
                                .sort_by_file_name()
                                .into_iter(),
                        );
                    } else {
                        return Some(Ok(TreeEntry::new(&entry, relative)));
                    }
                }
            }
        }
    }
}

/// Turn an unreadable walk entry into an I/O error naming the path
pub fn unreadable(err: walkdir::Error) -> UpdaterError {
    let context = match err.path() {
        Some(path) => format!("could not read {}", path.display()),
        None => "could not read directory entry".to_string(),
    };
    UpdaterError::io(context, err.into())
}

/// Delete `path` and everything below it; a missing path is not an error
pub fn remove_tree(path: &Path) -> Result<()> {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return Ok(());
    };
    if !metadata.is_dir() {
        return std::fs::remove_file(path).map_err(|e| UpdaterError::io_at("unlink", path, e));
    }

    for item in TreeWalker::new(path).walk() {
        let entry = item.map_err(unreadable)?;
        if entry.is_dir {
            std::fs::remove_dir(&entry.path)
                .map_err(|e| UpdaterError::io_at("rmdir", &entry.path, e))?;
        } else {
            std::fs::remove_file(&entry.path)
                .map_err(|e| UpdaterError::io_at("unlink", &entry.path, e))?;
        }
    }
    std::fs::remove_dir(path).map_err(|e| UpdaterError::io_at("rmdir", path, e))
}
