//! Session management for recording and playback
//!
//! The [`RecordingHandler`] owns three registries (active recordings, active
//! playbacks and finished in-memory recordings), proxies live traffic while
//! recording and serves stored traffic during playback.

mod handler;
mod policy;
mod session;

pub use handler::{PlaybackSource, RecordingHandler};
pub use policy::{EffectivePolicy, Policy, RegisteredSanitizer, SessionPolicy};
pub use session::ModifiableRecordSession;

use hyper::Method;

use crate::model::Headers;

/// Session id header, request and response
pub const RECORDING_ID: &str = "x-recording-id";
/// Recording file, relative to the storage location
pub const RECORDING_FILE: &str = "x-recording-file";
/// Explicit `record` or `playback` for proxied traffic
pub const RECORDING_MODE: &str = "x-recording-mode";
/// Scheme and host the proxied request is meant for
pub const UPSTREAM_BASE_URI: &str = "x-recording-upstream-base-uri";
/// Overrides the `Host` header sent upstream
pub const UPSTREAM_HOST_HEADER: &str = "x-recording-upstream-host-header";
/// `request-body` or `request-response`
pub const RECORDING_SKIP: &str = "x-recording-skip";
/// `false` keeps a matched entry in the playback pool
pub const RECORDING_REMOVE: &str = "x-recording-remove";
/// `false` discards a recording on stop
pub const RECORDING_SAVE: &str = "x-recording-save";
/// `assets.json` to restore before resolving the recording file
pub const ASSETS_FILE: &str = "x-recording-assets-file";
/// Names the sanitizer, transform or matcher on admin calls
pub const ABSTRACTION_IDENTIFIER: &str = "x-abstraction-identifier";
/// `true` drops the in-memory source of a stopped playback
pub const PURGE_IN_MEMORY: &str = "x-purge-inmemory-recording";

/// Prefix shared by every proxy control header
pub const CONTROL_HEADER_PREFIX: &str = "x-recording-";

/// A request as received by the proxy, before any normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    /// HTTP verb
    pub method: Method,
    /// Path and query
    pub target: String,
    /// Headers as sent by the client
    pub headers: Headers,
    /// Raw body
    pub body: Vec<u8>,
}

impl IncomingRequest {
    /// Create a request without headers or body
    #[must_use]
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get_first(name)
    }
}

/// A response produced by the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingResponse {
    /// Status code
    pub status: u16,
    /// Headers
    pub headers: Headers,
    /// Body bytes as sent on the wire
    pub body: Vec<u8>,
}
