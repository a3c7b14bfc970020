//! Playback-time response rewrites
//!
//! Transforms run on a copy of the matched entry just before it is served.
//! They never reach the persisted recording.

use tracing::debug;

use crate::model::RecordEntry;
use crate::pattern::ApplyCondition;

const CLIENT_REQUEST_ID: &str = "x-ms-client-request-id";
const CLIENT_ID: &str = "x-ms-client-id";
const RETRY_AFTER_HEADERS: &[&str] = &["Retry-After", "retry-after-ms", "x-ms-retry-after-ms"];
const LOCATION_HEADERS: &[&str] = &["Location", "Operation-Location", "Azure-AsyncOperation"];

/// Default header mirrored by the api-version transform
pub const DEFAULT_API_VERSION_HEADER: &str = "x-ms-version";

/// Concrete transform behaviours
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformKind {
    /// Mirror an api version header from the live request
    ApiVersion {
        /// Header name
        header: String,
    },
    /// Mirror `x-ms-client-request-id`
    StorageRequestId,
    /// Mirror `x-ms-client-id`
    ClientId,
    /// Overwrite a response header that is present
    Header {
        /// Header name
        key: String,
        /// New value
        value: String,
    },
    /// Zero out retry delays
    RetryAfterZero,
    /// Point recorded absolute URLs at the live upstream host
    UrlHost,
}

impl TransformKind {
    /// Identifier of the variant as used by the admin surface
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApiVersion { .. } => "ApiVersionTransform",
            Self::StorageRequestId => "StorageRequestIdTransform",
            Self::ClientId => "ClientIdTransform",
            Self::Header { .. } => "HeaderTransform",
            Self::RetryAfterZero => "RetryAfterZeroTransform",
            Self::UrlHost => "UrlHostTransform",
        }
    }
}

/// A transform with its optional condition
#[derive(Debug, Clone)]
pub struct Transform {
    kind: TransformKind,
    condition: Option<ApplyCondition>,
}

impl Transform {
    /// Create a transform
    #[must_use]
    pub fn new(kind: TransformKind, condition: Option<ApplyCondition>) -> Self {
        Self { kind, condition }
    }

    /// The behaviour
    #[must_use]
    pub fn kind(&self) -> &TransformKind {
        &self.kind
    }

    /// Rewrite `served` for the live request `live`.
    ///
    /// The condition is checked against the live request URI.
    pub fn apply(&self, live: &RecordEntry, served: &mut RecordEntry) {
        if let Some(condition) = &self.condition {
            if !condition.matches_uri(&live.request_uri) {
                return;
            }
        }

        match &self.kind {
            TransformKind::ApiVersion { header } => mirror_header(live, served, header),
            TransformKind::StorageRequestId => mirror_header(live, served, CLIENT_REQUEST_ID),
            TransformKind::ClientId => mirror_header(live, served, CLIENT_ID),
            TransformKind::Header { key, value } => {
                if served.response.headers.contains(key) {
                    served.response.headers.set(key.clone(), value.clone());
                }
            }
            TransformKind::RetryAfterZero => {
                for name in RETRY_AFTER_HEADERS {
                    if served.response.headers.contains(name) {
                        served.response.headers.set(*name, "0");
                    }
                }
            }
            TransformKind::UrlHost => rewrite_host(live, served),
        }
    }
}

fn mirror_header(live: &RecordEntry, served: &mut RecordEntry, name: &str) {
    if let Some(values) = live.request.headers.get(name) {
        served.response.headers.insert(name, values.to_vec());
    }
}

/// `scheme://authority` prefix of an absolute URI
fn origin(uri: &str) -> Option<&str> {
    let scheme_end = uri.find("://")? + 3;
    let end = uri[scheme_end..]
        .find(['/', '?', '#'])
        .map_or(uri.len(), |i| scheme_end + i);
    Some(&uri[..end])
}

fn rewrite_host(live: &RecordEntry, served: &mut RecordEntry) {
    let (Some(recorded), Some(current)) = (origin(&served.request_uri), origin(&live.request_uri))
    else {
        return;
    };
    if recorded.eq_ignore_ascii_case(current) {
        return;
    }
    let (recorded, current) = (recorded.to_string(), current.to_string());
    debug!("Rewriting recorded host {recorded} to {current}");

    for name in LOCATION_HEADERS {
        if let Some(values) = served.response.headers.get_mut(name) {
            for value in values.iter_mut() {
                *value = value.replace(&recorded, &current);
            }
        }
    }

    let rewritten = served
        .response
        .text_body()
        .filter(|text| text.contains(&recorded))
        .map(|text| text.replace(&recorded, &current).into_bytes());
    if let Some(body) = rewritten {
        served.response.body = Some(body);
        served.response.update_content_length();
    }
}
