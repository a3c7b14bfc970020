//! In-memory representation of recorded HTTP traffic

mod entry;
mod headers;
mod session;

pub use entry::{
    is_json_content_type, is_text_content_type, multipart_boundary, RecordEntry,
    RequestOrResponse,
};
pub use headers::Headers;
pub use session::RecordSession;

/// Replacement value used by sanitizers when none is configured
pub const SANITIZE_VALUE: &str = "Sanitized";
