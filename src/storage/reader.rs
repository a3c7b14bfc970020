//! Recording file reader

use std::path::Path;

use tracing::debug;

use crate::model::RecordSession;
use crate::{ProxyError, Result};

use super::{content_hash, format};

/// A session loaded from disk together with the hash of the bytes it came from
#[derive(Debug, Clone)]
pub struct LoadedRecording {
    /// Parsed session
    pub session: RecordSession,
    /// SHA-256 hex of the file contents
    pub hash: String,
}

/// Parse a recording from raw file bytes
///
/// # Errors
///
/// Returns error if the bytes are not a valid recording document
pub fn parse_session(bytes: &[u8]) -> Result<RecordSession> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    format::session_from_json(&value)
}

/// Load a recording file
///
/// # Errors
///
/// Returns `ProxyError::NotFound` if the file does not exist, or a parse error
pub fn read_session(path: &Path) -> Result<LoadedRecording> {
    if !path.is_file() {
        return Err(ProxyError::NotFound(format!(
            "Recording file path {} does not exist.",
            path.display()
        )));
    }

    let bytes = std::fs::read(path)?;
    let session = parse_session(&bytes)?;
    debug!(
        "Loaded {} entries from {}",
        session.entries.len(),
        path.display()
    );

    Ok(LoadedRecording {
        session,
        hash: content_hash(&bytes),
    })
}
