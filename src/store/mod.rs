//! Versioned storage of recordings in an external git repository

mod assets;
mod breadcrumb;
mod git;
mod git_store;

use std::path::{Path, PathBuf};

pub use assets::{strip_comments, GitAssetsConfiguration, ASSETS_FOLDER, ASSETS_JSON};
pub use breadcrumb::{short_sha, Breadcrumb};
pub use git::{
    check_min_version, is_retriable, parse_git_version, CommandResult, GitProcessHandler,
    RetryPolicy, MIN_GIT_VERSION,
};
pub use git_store::GitStore;

use crate::Result;

/// Operations on recordings pinned by an `assets.json`.
///
/// Implementations block on subprocesses and file I/O; async callers should
/// run them on a blocking thread.
pub trait AssetsStore: Send + Sync {
    /// Make the pinned recordings available locally, returning the directory
    /// recordings resolve against
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or git fails
    fn restore(&self, assets_json: &Path) -> Result<PathBuf>;

    /// Commit and push local recording changes, then pin the new commit
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or git fails
    fn push(&self, assets_json: &Path) -> Result<()>;

    /// Discard local recording changes
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or git fails
    fn reset(&self, assets_json: &Path) -> Result<()>;
}
