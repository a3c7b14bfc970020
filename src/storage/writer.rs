//! Recording file writer

use std::path::Path;

use tracing::{debug, info};

use crate::model::RecordSession;
use crate::Result;

use super::{content_hash, format};

/// Serialize a session as indented JSON followed by a newline
///
/// # Errors
///
/// Returns error if serialization fails
pub fn serialize_session(session: &RecordSession) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(&format::session_to_json(session))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write a session to `path`, creating parent directories.
///
/// Returns the content hash of the written document. When the file on disk
/// already holds identical bytes it is left untouched.
///
/// # Errors
///
/// Returns error if serialization or any filesystem operation fails
pub fn write_session(path: &Path, session: &RecordSession) -> Result<String> {
    let bytes = serialize_session(session)?;
    let hash = content_hash(&bytes);

    if let Ok(existing) = std::fs::read(path) {
        if content_hash(&existing) == hash {
            debug!("Recording {} unchanged, skipping write", path.display());
            return Ok(hash);
        }
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    std::fs::write(path, &bytes)?;
    info!(
        "Wrote {} entries to {}",
        session.entries.len(),
        path.display()
    );

    Ok(hash)
}
