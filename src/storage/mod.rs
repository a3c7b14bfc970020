//! JSON storage of recordings

pub mod format;
mod reader;
mod writer;

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub use reader::{parse_session, read_session, LoadedRecording};
pub use writer::{serialize_session, write_session};

/// SHA-256 hex digest of a recording's bytes
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content hash of the file at `path`, `None` if it cannot be read
#[must_use]
pub fn file_hash(path: &Path) -> Option<String> {
    std::fs::read(path).ok().map(|bytes| content_hash(&bytes))
}

/// Resolve a recording file name against a context directory.
///
/// A `.json` suffix is appended when missing. Absolute paths are kept.
#[must_use]
pub fn recording_path(context_dir: &Path, file: &str) -> PathBuf {
    let mut name = file.trim().to_string();
    if !Path::new(&name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
    {
        name.push_str(".json");
    }
    context_dir.join(name)
}
