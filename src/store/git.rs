//! Serialized, retrying invocation of the `git` binary

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::GitConfig;
use crate::{ProxyError, Result};

/// Oldest git release with the sparse checkout behaviour the store relies on
pub const MIN_GIT_VERSION: (u32, u32, u32) = (2, 25, 0);

/// Output of one git invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// Arguments passed to git
    pub arguments: String,
    /// Exit code, -1 if the process was killed
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandResult {
    /// Whether git exited with status 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// How many times to run a failing command and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay unit, multiplied by the attempt number
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&GitConfig::default())
    }
}

impl RetryPolicy {
    /// Policy from git settings
    #[must_use]
    pub fn from_config(config: &GitConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay_ms: config.retry_delay_ms,
        }
    }

    /// Delay before the attempt following `attempt` (1-indexed)
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

fn retriable_timeout_regex() -> &'static Regex {
    static AFTER_MS: OnceLock<Regex> = OnceLock::new();
    AFTER_MS.get_or_init(|| {
        Regex::new(r"Failed to connect to github\.com port 443 after \d+ ms: Couldn't connect to server")
            .expect("timeout pattern is valid")
    })
}

/// Whether a failed command's stderr indicates a transient network failure.
///
/// Classification is substring based and tied to the exact wording git and
/// curl use today.
#[must_use]
pub fn is_retriable(stderr: &str) -> bool {
    if stderr.trim().is_empty() {
        return false;
    }
    stderr.contains("The requested URL returned error: 429")
        || stderr.contains("Failed to connect to github.com port 443: Connection timed out")
        || stderr.contains("Failed to connect to github.com port 443: Operation timed out")
        || retriable_timeout_regex().is_match(stderr)
}

/// Parse `git --version` output into a version triple
#[must_use]
pub fn parse_git_version(output: &str) -> Option<(u32, u32, u32)> {
    static VERSION: OnceLock<Regex> = OnceLock::new();
    let regex = VERSION.get_or_init(|| {
        Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("version pattern is valid")
    });
    let caps = regex.captures(output)?;
    let part = |i: usize| -> Option<u32> {
        caps.get(i).map_or(Some(0), |m| m.as_str().parse().ok())
    };
    Some((part(1)?, part(2)?, part(3)?))
}

/// Check `git --version` output against [`MIN_GIT_VERSION`]
///
/// # Errors
///
/// Returns `ProxyError::GitVersion` if the version is older or unreadable
pub fn check_min_version(output: &str) -> Result<()> {
    let (major, minor, patch) = MIN_GIT_VERSION;
    let minimum = format!("{major}.{minor}.{patch}");
    let version = parse_git_version(output).ok_or_else(|| {
        ProxyError::GitVersion(format!(
            "Unable to determine the local git version from \"{}\". The minimum supported version is {minimum}.",
            output.trim()
        ))
    })?;

    if version < MIN_GIT_VERSION {
        return Err(ProxyError::GitVersion(format!(
            "{} is less than the minimum supported Git version {minimum}",
            output.trim()
        )));
    }
    Ok(())
}

/// Runs git with per-directory serialization and retry on transient errors
#[derive(Debug)]
pub struct GitProcessHandler {
    retry: RetryPolicy,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl Default for GitProcessHandler {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl GitProcessHandler {
    /// Create a handler
    #[must_use]
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            locks: DashMap::new(),
        }
    }

    fn directory_lock(&self, working_dir: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(working_dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn invoke(args: &[&str], working_dir: &Path) -> Result<CommandResult> {
        let output = Command::new("git")
            .args(args)
            .current_dir(working_dir)
            .output()?;

        Ok(CommandResult {
            arguments: args.join(" "),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        })
    }

    fn check_args(args: &[&str]) -> Result<()> {
        if args.first().is_some_and(|first| first.starts_with("git")) {
            return Err(ProxyError::Other(
                "Git commands should not start with 'git'".to_string(),
            ));
        }
        Ok(())
    }

    /// Run a command, retrying transient failures.
    ///
    /// Commands against the same working directory never overlap.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Git` with the raw stderr on a fatal failure or
    /// once retries are exhausted
    pub fn run(&self, args: &[&str], working_dir: &Path) -> Result<CommandResult> {
        Self::check_args(args)?;
        let lock = self.directory_lock(working_dir);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut attempt = 1;
        loop {
            info!("git {}", args.join(" "));
            let result = Self::invoke(args, working_dir).map_err(|e| ProxyError::Git {
                command: args.join(" "),
                exit_code: -1,
                stderr: e.to_string(),
                attempts: attempt,
            })?;
            debug!("stdout: {}", result.stdout);
            debug!("stderr: {}", result.stderr);

            if result.success() {
                return Ok(result);
            }

            if !is_retriable(&result.stderr) || attempt >= self.retry.max_attempts {
                return Err(ProxyError::Git {
                    command: result.arguments,
                    exit_code: result.exit_code,
                    stderr: result.stderr,
                    attempts: attempt,
                });
            }

            let delay = self.retry.delay_after(attempt);
            warn!(
                "git {} failed with a transient error (attempt {}/{}), retrying in {:?}",
                result.arguments, attempt, self.retry.max_attempts, delay
            );
            std::thread::sleep(delay);
            attempt += 1;
        }
    }

    /// Run a command once and return its result whatever the exit code
    ///
    /// # Errors
    ///
    /// Returns error only if git could not be started
    pub fn try_run(&self, args: &[&str], working_dir: &Path) -> Result<CommandResult> {
        Self::check_args(args)?;
        let lock = self.directory_lock(working_dir);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("git {}", args.join(" "));
        Self::invoke(args, working_dir)
    }

    /// Verify the installed git meets the minimum version
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::GitVersion` if git is missing, unreadable or too old
    pub fn assert_git_version(&self) -> Result<()> {
        let cwd = std::env::current_dir()?;
        let result = self.try_run(&["--version"], &cwd).map_err(|e| {
            ProxyError::GitVersion(format!("Unable to run git --version: {e}"))
        })?;
        check_min_version(&result.stdout)
    }
}
