//! A single recorded HTTP exchange

use hyper::Method;

use super::Headers;

/// Headers or body of one side of an exchange
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOrResponse {
    /// Header map
    pub headers: Headers,
    /// Raw body bytes, `None` when the message had no body at all
    pub body: Option<Vec<u8>>,
}

impl RequestOrResponse {
    /// Declared `Content-Type`, if any
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get_first("Content-Type")
    }

    /// Whether the declared content type is textual
    #[must_use]
    pub fn has_text_content(&self) -> bool {
        self.content_type().is_some_and(is_text_content_type)
    }

    /// Whether the declared content type is JSON
    #[must_use]
    pub fn has_json_content(&self) -> bool {
        self.content_type().is_some_and(is_json_content_type)
    }

    /// Body as UTF-8 text, only when the content type is textual
    #[must_use]
    pub fn text_body(&self) -> Option<&str> {
        if !self.has_text_content() {
            return None;
        }
        self.body
            .as_deref()
            .and_then(|body| std::str::from_utf8(body).ok())
    }

    /// Rewrite `Content-Length` after a body change, only if the header exists
    pub fn update_content_length(&mut self) {
        if self.headers.contains("Content-Length") {
            let length = self.body.as_ref().map_or(0, Vec::len);
            self.headers.set("Content-Length", length.to_string());
        }
    }
}

/// One HTTP request/response exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    /// Absolute URI of the upstream request
    pub request_uri: String,
    /// HTTP verb
    pub request_method: Method,
    /// Request headers and body
    pub request: RequestOrResponse,
    /// Response headers and body
    pub response: RequestOrResponse,
    /// Response status code
    pub status_code: u16,
}

impl RecordEntry {
    /// Create an entry with empty request and response
    #[must_use]
    pub fn new(request_method: Method, request_uri: impl Into<String>) -> Self {
        Self {
            request_uri: request_uri.into(),
            request_method,
            request: RequestOrResponse::default(),
            response: RequestOrResponse::default(),
            status_code: 0,
        }
    }
}

/// Whether a content type carries text that can be safely edited as UTF-8
#[must_use]
pub fn is_text_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("text/")
        || lower.contains("json")
        || lower.contains("xml")
        || lower.contains("x-www-form-urlencoded")
        || lower.contains("javascript")
}

/// Whether a content type is JSON
#[must_use]
pub fn is_json_content_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("json")
}

/// Boundary parameter of a `multipart/*` content type
#[must_use]
pub fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    let media = parts.next()?.trim();
    if !media.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }

    parts.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}
