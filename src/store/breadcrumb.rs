//! Audit log of restored and pushed assets

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use tracing::debug;

use crate::Result;

/// Appends `<relative assets.json>;<short sha>;<tag or sha>` lines
#[derive(Debug, Default)]
pub struct Breadcrumb {
    lock: Mutex<()>,
}

impl Breadcrumb {
    /// Create a writer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line, creating the file and its directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the log cannot be written
    pub fn append(&self, log: &Path, assets_json: &Path, sha: &str, reference: &str) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(parent) = log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = format_line(assets_json, sha, reference);
        debug!("Breadcrumb: {line}");

        let mut file = OpenOptions::new().create(true).append(true).open(log)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Short form of a commit id
#[must_use]
pub fn short_sha(sha: &str) -> &str {
    sha.get(..10).unwrap_or(sha)
}

fn format_line(assets_json: &Path, sha: &str, reference: &str) -> String {
    let reference = if reference.is_empty() { sha } else { reference };
    format!(
        "{};{};{}",
        assets_json.to_string_lossy().replace('\\', "/"),
        short_sha(sha),
        reference
    )
}
