//! Git-backed recording store

use std::path::{Path, PathBuf};

use tracing::info;

use super::assets::GitAssetsConfiguration;
use super::breadcrumb::{short_sha, Breadcrumb};
use super::git::{GitProcessHandler, RetryPolicy};
use super::AssetsStore;
use crate::config::GitConfig;
use crate::Result;

const COMMIT_MESSAGE: &str = "Automatic asset update from recproxy.";

/// Restores, pushes and resets recordings kept in a separate git repository
#[derive(Debug)]
pub struct GitStore {
    git: GitProcessHandler,
    config: GitConfig,
    breadcrumb: Breadcrumb,
}

impl GitStore {
    /// Create a store from git settings
    #[must_use]
    pub fn new(config: GitConfig) -> Self {
        Self {
            git: GitProcessHandler::new(RetryPolicy::from_config(&config)),
            config,
            breadcrumb: Breadcrumb::new(),
        }
    }

    /// Check the installed git unless disabled in the settings
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::GitVersion` if git is too old
    pub fn check_version(&self) -> Result<()> {
        if self.config.skip_version_check {
            return Ok(());
        }
        self.git.assert_git_version()
    }

    /// Parse an `assets.json`
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` for an unusable file
    pub fn parse_configuration(&self, path: &Path) -> Result<GitAssetsConfiguration> {
        GitAssetsConfiguration::load(path)
    }

    fn is_initialized(location: &Path) -> bool {
        location.join(".git").exists()
    }

    /// Clone the assets repository without checking anything out, then
    /// restrict the working tree to the checkout path.
    ///
    /// An existing clone is shared by every `assets.json` with the same repo,
    /// prefix and branch, so reusing it widens the sparse checkout instead.
    fn initialize(&self, config: &GitAssetsConfiguration) -> Result<PathBuf> {
        let location = config.assets_repo_location();
        if Self::is_initialized(&location) {
            self.include_checkout_path(&config.checkout_path(), &location)?;
            return Ok(location);
        }

        std::fs::create_dir_all(&location)?;
        let url = config.clone_url(&self.config.remote_base);
        info!("Initializing assets clone of {url} at {}", location.display());

        self.git
            .run(&["clone", "--no-checkout", "--filter=tree:0", &url, "."], &location)?;
        self.git.run(&["sparse-checkout", "init"], &location)?;
        self.git
            .run(&["sparse-checkout", "set", &config.checkout_path()], &location)?;
        Ok(location)
    }

    fn include_checkout_path(&self, checkout: &str, location: &Path) -> Result<()> {
        let listed = self.git.run(&["sparse-checkout", "list"], location)?;
        let mut paths: Vec<&str> = listed
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if paths.iter().any(|path| path.trim_matches('/') == checkout.trim_matches('/')) {
            return Ok(());
        }

        info!("Adding {checkout} to the sparse checkout at {}", location.display());
        paths.push(checkout);
        let mut args = vec!["sparse-checkout", "set"];
        args.extend(paths);
        self.git.run(&args, location)?;
        Ok(())
    }

    fn checkout(&self, config: &GitAssetsConfiguration, location: &Path) -> Result<()> {
        let Some(target) = config.target_ref() else {
            info!(
                "{} pins no tag or SHA, leaving an empty checkout",
                config.assets_json_relative_path.display()
            );
            return Ok(());
        };

        if config.sha.is_empty() {
            let refspec = format!("refs/tags/{target}:refs/tags/{target}");
            self.git.run(&["fetch", "origin", &refspec], location)?;
        } else {
            self.git.run(&["fetch", "origin", target], location)?;
        }
        self.git
            .run(&["-c", "advice.detachedHead=false", "checkout", target], location)?;
        Ok(())
    }

    fn head_sha(&self, location: &Path) -> Result<String> {
        Ok(self.git.run(&["rev-parse", "HEAD"], location)?.stdout.trim().to_string())
    }

    fn record_breadcrumb(&self, config: &GitAssetsConfiguration, sha: &str) -> Result<()> {
        self.breadcrumb.append(
            &config.breadcrumb_path(),
            &config.assets_json_relative_path,
            sha,
            &config.tag,
        )
    }

    fn identity_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(name) = &self.config.user_name {
            args.push("-c".to_string());
            args.push(format!("user.name={name}"));
        }
        if let Some(email) = &self.config.user_email {
            args.push("-c".to_string());
            args.push(format!("user.email={email}"));
        }
        args
    }
}

impl AssetsStore for GitStore {
    fn restore(&self, assets_json: &Path) -> Result<PathBuf> {
        let config = self.parse_configuration(assets_json)?;
        let location = self.initialize(&config)?;
        self.checkout(&config, &location)?;

        if config.target_ref().is_some() {
            let sha = self.head_sha(&location)?;
            self.record_breadcrumb(&config, &sha)?;
        }

        let root = config.recordings_root();
        std::fs::create_dir_all(&root)?;
        info!(
            "Restored {} into {}",
            config.assets_json_relative_path.display(),
            root.display()
        );
        Ok(root)
    }

    fn push(&self, assets_json: &Path) -> Result<()> {
        let mut config = self.parse_configuration(assets_json)?;
        let location = self.initialize(&config)?;
        let checkout = config.checkout_path();

        self.git.run(&["add", "-A", "--", &checkout], &location)?;
        let status = self.git.run(&["status", "--porcelain"], &location)?;
        if status.stdout.trim().is_empty() {
            info!(
                "No changes to push for {}",
                config.assets_json_relative_path.display()
            );
            return Ok(());
        }

        let identity = self.identity_args();
        let mut commit: Vec<&str> = identity.iter().map(String::as_str).collect();
        commit.extend(["commit", "--no-gpg-sign", "-m", COMMIT_MESSAGE]);
        self.git.run(&commit, &location)?;

        let sha = self.head_sha(&location)?;
        let branch = config.push_branch();
        let branch_ref = format!("HEAD:refs/heads/{branch}");
        self.git.run(&["push", "origin", &branch_ref], &location)?;

        let tag = if config.tag_prefix.is_empty() {
            None
        } else {
            let tag = format!("{}_{}", config.tag_prefix, short_sha(&sha));
            self.git.run(&["tag", &tag], &location)?;
            self.git.run(&["push", "origin", &tag], &location)?;
            Some(tag)
        };

        config.update_pins(&sha, tag.as_deref())?;
        self.record_breadcrumb(&config, &sha)?;
        info!(
            "Pushed {} to {branch} at {}",
            config.assets_json_relative_path.display(),
            short_sha(&sha)
        );
        Ok(())
    }

    fn reset(&self, assets_json: &Path) -> Result<()> {
        let config = self.parse_configuration(assets_json)?;
        let location = config.assets_repo_location();
        if !Self::is_initialized(&location) {
            self.restore(assets_json)?;
            return Ok(());
        }

        self.git.run(&["reset", "--hard"], &location)?;
        self.git.run(&["clean", "-xdf"], &location)?;
        self.checkout(&config, &location)?;
        info!(
            "Reset {} to {}",
            config.assets_json_relative_path.display(),
            config.target_ref().unwrap_or("an empty checkout")
        );
        Ok(())
    }
}
