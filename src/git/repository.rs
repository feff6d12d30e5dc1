//! Git repository discovery
//!
//! Sessions started inside a repository are grouped under the repository name
//! unless the caller picks a group explicitly.

use git2::Repository;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during git operations
#[derive(Error, Debug)]
pub enum GitError {
    #[error("Not a git repository: {0}")]
    NotARepository(String),
    #[error("Repository has no working directory: {0}")]
    Bare(String),
}

/// Top-level directory of the main working tree containing `path`
///
/// For a linked worktree this is the main checkout, so every worktree of one
/// repository resolves to the same root.
pub fn repository_root(path: &Path) -> Result<PathBuf, GitError> {
    let repo = Repository::discover(path)
        .map_err(|_| GitError::NotARepository(path.display().to_string()))?;

    if repo.is_worktree() {
        // commondir is <main>/.git
        if let Some(main) = repo.commondir().parent() {
            return Ok(main.to_path_buf());
        }
    }

    repo.workdir()
        .map(Path::to_path_buf)
        .ok_or_else(|| GitError::Bare(path.display().to_string()))
}

/// Human-facing label for the repository containing `path`
pub fn repository_label(path: &Path) -> Option<String> {
    let root = repository_root(path).ok()?;
    let root = root.canonicalize().unwrap_or(root);
    root.file_name()
        .and_then(|name| name.to_str())
        .map(String::from)
}
