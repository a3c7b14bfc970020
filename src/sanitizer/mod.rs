//! Sanitizer pipeline
//!
//! Sanitizers scrub secrets out of recorded traffic. Entry level variants
//! edit one exchange at a time; session level variants (OAuth removal, regex
//! entry removal, continuation tokens) look at the whole session. Every
//! sanitizer may carry an [`ApplyCondition`] restricting it to matching
//! request URIs.
//!
//! Absence of a sanitizer's target is never an error. A sanitizer that does
//! fail is logged and skipped, leaving the entry as it was before that
//! sanitizer ran.

mod json_path;

use std::sync::{Arc, OnceLock};

use fancy_regex::Regex;
use hyper::Method;
use serde_json::Value;
use tracing::warn;

use crate::model::{multipart_boundary, RecordEntry, RecordSession, RequestOrResponse};
use crate::multipart;
use crate::pattern::{self, ApplyCondition};
use crate::Result;

pub use json_path::JsonPath;

/// Default value written over a subscription id
pub const EMPTY_SUBSCRIPTION_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Which part of a request a regex entry sanitizer inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySection {
    /// Request URI
    Uri,
    /// Request header names
    Header,
    /// Request body text
    Body,
}

impl EntrySection {
    /// Parse `uri`, `header` or `body`
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` listing the accepted values
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "uri" => Ok(Self::Uri),
            "header" => Ok(Self::Header),
            "body" => Ok(Self::Body),
            _ => Err(crate::ProxyError::BadRequest(format!(
                "When defining which section of a request the regex should target, only values \"uri\", \"header\" and \"body\" are accepted. Provided value \"{value}\" is invalid."
            ))),
        }
    }
}

/// Concrete sanitizer behaviours
#[derive(Debug, Clone)]
pub enum SanitizerKind {
    /// Replace regex matches (or the whole value) inside one header
    HeaderRegex {
        /// Header name
        key: String,
        /// Replacement
        value: String,
        /// Pattern, whole value when absent
        regex: Option<Regex>,
        /// Named group to replace instead of the full match
        group: Option<String>,
    },
    /// Replace regex matches (or everything) inside textual bodies
    BodyRegex {
        /// Replacement
        value: String,
        /// Pattern, whole body when absent
        regex: Option<Regex>,
        /// Named group to replace instead of the full match
        group: Option<String>,
    },
    /// Replace JSON values selected by a path
    BodyKey {
        /// Selected nodes
        json_path: JsonPath,
        /// Replacement
        value: String,
        /// Pattern applied to the selected value, whole value when absent
        regex: Option<Regex>,
        /// Named group to replace instead of the full match
        group: Option<String>,
    },
    /// Replace regex matches inside the request URI
    UriRegex {
        /// Replacement
        value: String,
        /// Pattern
        regex: Regex,
        /// Named group to replace instead of the full match
        group: Option<String>,
    },
    /// Replace the id following `/subscriptions/` in the URI
    UriSubscriptionId {
        /// Replacement, length preserving by default
        value: String,
    },
    /// Replace regex matches in URI, headers and bodies at once
    GeneralRegex {
        /// Replacement
        value: String,
        /// Pattern
        regex: Regex,
        /// Named group to replace instead of the full match
        group: Option<String>,
    },
    /// Drop headers by name
    RemoveHeader {
        /// Header names
        headers: Vec<String>,
    },
    /// Normalize path separators in multipart filenames
    ContentDispositionFilePath,
    /// Drop OAuth token exchanges from a session
    OAuthResponse,
    /// Drop entries whose request section matches a pattern
    RegexEntry {
        /// Inspected section
        target: EntrySection,
        /// Pattern
        regex: Regex,
    },
    /// Replace a continuation token consistently across a response and the next request
    Continuation {
        /// Header carrying the token
        key: String,
        /// `guid` generates a fresh guid per token; anything else writes the default value
        method: String,
        /// Clear the token after the first request that used it
        reset_after_first: bool,
    },
}

impl SanitizerKind {
    /// Identifier of the variant as used by the admin surface
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::HeaderRegex { .. } => "HeaderRegexSanitizer",
            Self::BodyRegex { .. } => "BodyRegexSanitizer",
            Self::BodyKey { .. } => "BodyKeySanitizer",
            Self::UriRegex { .. } => "UriRegexSanitizer",
            Self::UriSubscriptionId { .. } => "UriSubscriptionIdSanitizer",
            Self::GeneralRegex { .. } => "GeneralRegexSanitizer",
            Self::RemoveHeader { .. } => "RemoveHeaderSanitizer",
            Self::ContentDispositionFilePath => "ContentDispositionFilePathSanitizer",
            Self::OAuthResponse => "OAuthResponseSanitizer",
            Self::RegexEntry { .. } => "RegexEntrySanitizer",
            Self::Continuation { .. } => "ContinuationSanitizer",
        }
    }

    /// Whether the variant operates on whole sessions
    #[must_use]
    pub fn is_session_level(&self) -> bool {
        matches!(
            self,
            Self::OAuthResponse | Self::RegexEntry { .. } | Self::Continuation { .. }
        )
    }
}

/// A sanitizer with its optional condition
#[derive(Debug, Clone)]
pub struct Sanitizer {
    kind: SanitizerKind,
    condition: Option<ApplyCondition>,
}

impl Sanitizer {
    /// Create a sanitizer
    #[must_use]
    pub fn new(kind: SanitizerKind, condition: Option<ApplyCondition>) -> Self {
        Self { kind, condition }
    }

    /// Replace the `Authorization` header value, the baseline secret scrub
    #[must_use]
    pub fn authorization() -> Self {
        Self::new(
            SanitizerKind::HeaderRegex {
                key: "Authorization".to_string(),
                value: crate::model::SANITIZE_VALUE.to_string(),
                regex: None,
                group: None,
            },
            None,
        )
    }

    /// The behaviour
    #[must_use]
    pub fn kind(&self) -> &SanitizerKind {
        &self.kind
    }

    /// The condition, if any
    #[must_use]
    pub fn condition(&self) -> Option<&ApplyCondition> {
        self.condition.as_ref()
    }

    fn applies_to(&self, entry: &RecordEntry) -> bool {
        self.condition.as_ref().map_or(true, |c| c.is_met(entry))
    }

    /// Sanitize one entry. Session level variants do nothing here.
    ///
    /// # Errors
    ///
    /// Returns error if a rewritten JSON body cannot be serialized
    pub fn sanitize_entry(&self, entry: &mut RecordEntry) -> Result<()> {
        if self.kind.is_session_level() || !self.applies_to(entry) {
            return Ok(());
        }

        let skip_response_body = entry.request_method == Method::HEAD;
        match &self.kind {
            SanitizerKind::HeaderRegex {
                key,
                value,
                regex,
                group,
            } => {
                sanitize_header(&mut entry.request, key, value, regex.as_ref(), group.as_deref());
                sanitize_header(&mut entry.response, key, value, regex.as_ref(), group.as_deref());
            }
            SanitizerKind::BodyRegex {
                value,
                regex,
                group,
            } => {
                sanitize_text_body(&mut entry.request, value, regex.as_ref(), group.as_deref());
                if !skip_response_body {
                    sanitize_text_body(&mut entry.response, value, regex.as_ref(), group.as_deref());
                }
            }
            SanitizerKind::BodyKey {
                json_path,
                value,
                regex,
                group,
            } => {
                sanitize_json_body(&mut entry.request, json_path, value, regex.as_ref(), group.as_deref())?;
                if !skip_response_body {
                    sanitize_json_body(&mut entry.response, json_path, value, regex.as_ref(), group.as_deref())?;
                }
            }
            SanitizerKind::UriRegex {
                value,
                regex,
                group,
            } => {
                entry.request_uri =
                    pattern::replace_matches(&entry.request_uri, regex, value, group.as_deref());
            }
            SanitizerKind::UriSubscriptionId { value } => {
                entry.request_uri = pattern::replace_matches(
                    &entry.request_uri,
                    subscription_regex(),
                    value,
                    Some("subscription"),
                );
            }
            SanitizerKind::GeneralRegex {
                value,
                regex,
                group,
            } => {
                let group = group.as_deref();
                entry.request_uri = pattern::replace_matches(&entry.request_uri, regex, value, group);
                for message in [&mut entry.request, &mut entry.response] {
                    for values in message.headers.values_mut() {
                        for header_value in values.iter_mut() {
                            *header_value = pattern::replace_matches(header_value, regex, value, group);
                        }
                    }
                }
                sanitize_text_body(&mut entry.request, value, Some(regex), group);
                if !skip_response_body {
                    sanitize_text_body(&mut entry.response, value, Some(regex), group);
                }
            }
            SanitizerKind::RemoveHeader { headers } => {
                for name in headers {
                    entry.request.headers.remove(name);
                    entry.response.headers.remove(name);
                }
            }
            SanitizerKind::ContentDispositionFilePath => {
                normalize_multipart_filenames(&mut entry.request);
            }
            SanitizerKind::OAuthResponse
            | SanitizerKind::RegexEntry { .. }
            | SanitizerKind::Continuation { .. } => {}
        }

        Ok(())
    }

    /// Apply a session level variant. Entry level variants do nothing here.
    pub fn sanitize_session(&self, session: &mut RecordSession) {
        match &self.kind {
            SanitizerKind::OAuthResponse => {
                session.entries.retain(|entry| {
                    !(self.applies_to(entry) && pattern::is_match(oauth_regex(), &entry.request_uri))
                });
            }
            SanitizerKind::RegexEntry { target, regex } => {
                session.entries.retain(|entry| {
                    !(self.applies_to(entry) && section_matches(entry, *target, regex))
                });
            }
            SanitizerKind::Continuation {
                key,
                method,
                reset_after_first,
            } => {
                let mut token: Option<String> = None;
                for entry in &mut session.entries {
                    if !self.applies_to(entry) {
                        continue;
                    }
                    if let Some(current) = &token {
                        if entry.request.headers.contains(key) {
                            entry.request.headers.set(key.clone(), current.clone());
                            if *reset_after_first {
                                token = None;
                            }
                        }
                    }
                    if entry.response.headers.contains(key) {
                        let replacement = if method.eq_ignore_ascii_case("guid") {
                            uuid::Uuid::new_v4().to_string()
                        } else {
                            crate::model::SANITIZE_VALUE.to_string()
                        };
                        entry.response.headers.set(key.clone(), replacement.clone());
                        token = Some(replacement);
                    }
                }
            }
            _ => {}
        }
    }
}

fn subscription_regex() -> &'static Regex {
    static SUBSCRIPTION: OnceLock<Regex> = OnceLock::new();
    SUBSCRIPTION.get_or_init(|| {
        Regex::new(r"(?i)/subscriptions/(?P<subscription>[^/?#]+)")
            .expect("subscription pattern is valid")
    })
}

fn oauth_regex() -> &'static Regex {
    static OAUTH: OnceLock<Regex> = OnceLock::new();
    OAUTH.get_or_init(|| {
        Regex::new(r"/oauth2(?:/v2\.0)?/token").expect("oauth pattern is valid")
    })
}

fn section_matches(entry: &RecordEntry, section: EntrySection, regex: &Regex) -> bool {
    match section {
        EntrySection::Uri => pattern::is_match(regex, &entry.request_uri),
        EntrySection::Header => entry
            .request
            .headers
            .iter()
            .any(|(name, _)| pattern::is_match(regex, name)),
        EntrySection::Body => entry
            .request
            .body
            .as_deref()
            .and_then(|body| std::str::from_utf8(body).ok())
            .is_some_and(|text| pattern::is_match(regex, text)),
    }
}

fn sanitize_header(
    message: &mut RequestOrResponse,
    key: &str,
    value: &str,
    regex: Option<&Regex>,
    group: Option<&str>,
) {
    if let Some(values) = message.headers.get_mut(key) {
        for header_value in values.iter_mut() {
            *header_value = pattern::replace_value(header_value, regex, value, group);
        }
    }
}

fn sanitize_text_body(
    message: &mut RequestOrResponse,
    value: &str,
    regex: Option<&Regex>,
    group: Option<&str>,
) {
    let boundary = message.content_type().and_then(multipart_boundary);
    let updated = match (&message.body, boundary) {
        (Some(body), Some(boundary)) => multipart::edit_text_parts(body, &boundary, &mut |text, _| {
            Some(pattern::replace_value(text, regex, value, group))
        }),
        (Some(_), None) => message.text_body().and_then(|text| {
            let replaced = pattern::replace_value(text, regex, value, group);
            (replaced != text).then(|| replaced.into_bytes())
        }),
        (None, _) => None,
    };

    if let Some(updated) = updated {
        message.body = Some(updated);
        message.update_content_length();
    }
}

fn replace_json_text(
    text: &str,
    json_path: &JsonPath,
    value: &str,
    regex: Option<&Regex>,
    group: Option<&str>,
) -> Result<Option<String>> {
    let Ok(mut document) = serde_json::from_str::<Value>(text) else {
        return Ok(None);
    };

    let changed = json_path.update(&mut document, &mut |node| {
        let current = match &*node {
            Value::Null => return false,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let replaced = pattern::replace_value(&current, regex, value, group);
        if replaced == current {
            return false;
        }
        *node = Value::String(replaced);
        true
    });

    if changed {
        Ok(Some(serde_json::to_string(&document)?))
    } else {
        Ok(None)
    }
}

fn sanitize_json_body(
    message: &mut RequestOrResponse,
    json_path: &JsonPath,
    value: &str,
    regex: Option<&Regex>,
    group: Option<&str>,
) -> Result<()> {
    let Some(body) = message.body.as_deref() else {
        return Ok(());
    };

    let updated = if let Some(boundary) = message.content_type().and_then(multipart_boundary) {
        let mut failure = None;
        let updated = multipart::edit_text_parts(body, &boundary, &mut |text, _| {
            match replace_json_text(text, json_path, value, regex, group) {
                Ok(replaced) => replaced,
                Err(e) => {
                    failure = Some(e);
                    None
                }
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        updated
    } else {
        let Ok(text) = std::str::from_utf8(body) else {
            return Ok(());
        };
        replace_json_text(text, json_path, value, regex, group)?.map(String::into_bytes)
    };

    if let Some(updated) = updated {
        message.body = Some(updated);
        message.update_content_length();
    }
    Ok(())
}

fn normalize_multipart_filenames(message: &mut RequestOrResponse) {
    let Some(boundary) = message.content_type().and_then(multipart_boundary) else {
        return;
    };
    let updated = message
        .body
        .as_deref()
        .and_then(|body| multipart::normalize_filename_separators(body, &boundary));
    if let Some(updated) = updated {
        message.body = Some(updated);
    }
}

/// Run entry level sanitizers over one entry in order.
///
/// Each sanitizer works on a copy that is committed only if it succeeds.
pub fn apply_to_entry(sanitizers: &[Arc<Sanitizer>], entry: &mut RecordEntry) {
    for sanitizer in sanitizers {
        if sanitizer.kind.is_session_level() {
            continue;
        }
        let mut candidate = entry.clone();
        match sanitizer.sanitize_entry(&mut candidate) {
            Ok(()) => *entry = candidate,
            Err(e) => warn!(
                "{} failed on {} {}, keeping entry unchanged: {}",
                sanitizer.kind.name(),
                entry.request_method,
                entry.request_uri,
                e
            ),
        }
    }
}

/// Run session level sanitizers over a session in order
pub fn apply_to_session(sanitizers: &[Arc<Sanitizer>], session: &mut RecordSession) {
    for sanitizer in sanitizers {
        if sanitizer.kind.is_session_level() {
            sanitizer.sanitize_session(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_entry(uri: &str, body: &str) -> RecordEntry {
        let mut entry = RecordEntry::new(Method::POST, uri);
        entry.request.headers.set("Content-Type", "application/json");
        entry.response.headers.set("Content-Type", "application/json");
        entry.response.body = Some(body.as_bytes().to_vec());
        entry.status_code = 200;
        entry
    }

    fn body_key(path: &str, value: &str, regex: Option<&str>, group: Option<&str>) -> Sanitizer {
        Sanitizer::new(
            SanitizerKind::BodyKey {
                json_path: JsonPath::parse(path).unwrap(),
                value: value.to_string(),
                regex: regex.map(|r| pattern::compile(r).unwrap()),
                group: group.map(str::to_string),
            },
            None,
        )
    }

    #[test]
    fn test_body_key_replaces_value() {
        let mut entry = json_entry(
            "https://acct.table.core.windows.net/Tables",
            r#"{"TableName":"listtable09bf2a3d"}"#,
        );
        body_key("$.TableName", "afaketable", None, None)
            .sanitize_entry(&mut entry)
            .unwrap();

        assert_eq!(
            entry.response.body.as_deref(),
            Some(&br#"{"TableName":"afaketable"}"#[..])
        );
    }

    #[test]
    fn test_body_key_with_group() {
        let mut entry = json_entry(
            "https://acct.table.core.windows.net/Tables",
            r#"{"TableName":"listtable09bf2a3d","odata.metadata":"m"}"#,
        );
        body_key(
            "$.TableName",
            "afaketable",
            Some(r"(?<=listtable)(?P<tableid>[a-z0-9]+)"),
            Some("tableid"),
        )
        .sanitize_entry(&mut entry)
        .unwrap();

        assert_eq!(
            entry.response.body.as_deref(),
            Some(&br#"{"TableName":"listtableafaketable","odata.metadata":"m"}"#[..])
        );
    }

    #[test]
    fn test_body_key_replaces_non_string_value() {
        let mut entry = json_entry("https://example.com/items", r#"{"count":42,"name":"n"}"#);
        body_key("$.count", "0", None, None)
            .sanitize_entry(&mut entry)
            .unwrap();

        assert_eq!(
            entry.response.body.as_deref(),
            Some(&br#"{"count":"0","name":"n"}"#[..])
        );
    }

    #[test]
    fn test_body_key_non_json_is_noop() {
        let mut entry = json_entry("https://example.com", "not json");
        let before = entry.clone();
        body_key("$.a", "x", None, None).sanitize_entry(&mut entry).unwrap();
        assert_eq!(entry, before);
    }

    #[test]
    fn test_header_regex_lookahead() {
        let mut entry = json_entry("https://example.com", "{}");
        entry.response.headers.set(
            "Location",
            "https://realacct.table.core.windows.net/Tables('t1')",
        );
        let sanitizer = Sanitizer::new(
            SanitizerKind::HeaderRegex {
                key: "Location".to_string(),
                value: "fakeaccount".to_string(),
                regex: Some(
                    pattern::compile(r"[a-z]+(?=\.(?:table|blob|queue)\.core\.windows\.net)")
                        .unwrap(),
                ),
                group: None,
            },
            None,
        );

        sanitizer.sanitize_entry(&mut entry).unwrap();
        assert_eq!(
            entry.response.headers.get_first("Location"),
            Some("https://fakeaccount.table.core.windows.net/Tables('t1')")
        );
    }

    #[test]
    fn test_header_regex_multi_value_replaces_matching_only() {
        let mut entry = json_entry("https://example.com", "{}");
        entry
            .request
            .headers
            .insert("Cookie", vec!["session=abc".to_string(), "theme=dark".to_string()]);
        let sanitizer = Sanitizer::new(
            SanitizerKind::HeaderRegex {
                key: "Cookie".to_string(),
                value: "session=Sanitized".to_string(),
                regex: Some(pattern::compile("session=[a-z]+").unwrap()),
                group: None,
            },
            None,
        );

        sanitizer.sanitize_entry(&mut entry).unwrap();
        assert_eq!(
            entry.request.headers.get("Cookie").unwrap(),
            ["session=Sanitized", "theme=dark"]
        );
    }

    #[test]
    fn test_missing_header_is_noop() {
        let mut entry = json_entry("https://example.com", "{}");
        let before = entry.clone();
        Sanitizer::authorization().sanitize_entry(&mut entry).unwrap();
        assert_eq!(entry, before);
    }

    #[test]
    fn test_condition_gates_sanitizer() {
        let mut entry = json_entry("https://acct.blob.core.windows.net/c", r#"{"TableName":"t"}"#);
        let before = entry.clone();
        let sanitizer = Sanitizer::new(
            body_key("$.TableName", "x", None, None).kind.clone(),
            Some(ApplyCondition::new(".+/Tables.*").unwrap()),
        );

        sanitizer.sanitize_entry(&mut entry).unwrap();
        assert_eq!(entry, before);

        let mut tables = json_entry("https://acct.table.core.windows.net/Tables", r#"{"TableName":"t"}"#);
        sanitizer.sanitize_entry(&mut tables).unwrap();
        assert_eq!(tables.response.body.as_deref(), Some(&br#"{"TableName":"x"}"#[..]));
    }

    #[test]
    fn test_subscription_id_is_length_preserving() {
        let uri = "https://management.azure.com/subscriptions/12345678-1234-1234-1234-123456789abc/resourceGroups/rg";
        let mut entry = json_entry(uri, "{}");
        Sanitizer::new(
            SanitizerKind::UriSubscriptionId {
                value: EMPTY_SUBSCRIPTION_ID.to_string(),
            },
            None,
        )
        .sanitize_entry(&mut entry)
        .unwrap();

        assert_eq!(entry.request_uri.len(), uri.len());
        assert!(entry
            .request_uri
            .contains("/subscriptions/00000000-0000-0000-0000-000000000000/"));
    }

    #[test]
    fn test_subscription_absent_is_noop() {
        let mut entry = json_entry("https://management.azure.com/providers", "{}");
        Sanitizer::new(
            SanitizerKind::UriSubscriptionId {
                value: EMPTY_SUBSCRIPTION_ID.to_string(),
            },
            None,
        )
        .sanitize_entry(&mut entry)
        .unwrap();
        assert_eq!(entry.request_uri, "https://management.azure.com/providers");
    }

    #[test]
    fn test_body_regex_updates_content_length() {
        let mut entry = json_entry("https://example.com", r#"{"secret":"abc"}"#);
        entry.response.headers.set("Content-Length", "16");
        Sanitizer::new(
            SanitizerKind::BodyRegex {
                value: "Sanitized".to_string(),
                regex: Some(pattern::compile("abc").unwrap()),
                group: None,
            },
            None,
        )
        .sanitize_entry(&mut entry)
        .unwrap();

        assert_eq!(
            entry.response.body.as_deref(),
            Some(&br#"{"secret":"Sanitized"}"#[..])
        );
        assert_eq!(entry.response.headers.get_first("Content-Length"), Some("22"));
    }

    #[test]
    fn test_body_regex_on_binary_is_noop() {
        let mut entry = RecordEntry::new(Method::PUT, "https://example.com/blob");
        entry.request.headers.set("Content-Type", "application/octet-stream");
        entry.request.body = Some(b"abc".to_vec());
        let before = entry.clone();
        Sanitizer::new(
            SanitizerKind::BodyRegex {
                value: "x".to_string(),
                regex: Some(pattern::compile("abc").unwrap()),
                group: None,
            },
            None,
        )
        .sanitize_entry(&mut entry)
        .unwrap();
        assert_eq!(entry, before);
    }

    #[test]
    fn test_multipart_untouched_when_nothing_matches() {
        let body = b"--b\r\nContent-Type: application/json\r\n\r\n{\"a\": 1}\r\n--b\r\nContent-Type: application/octet-stream\r\n\r\n\xff\xfe\r\n--b--\r\n".to_vec();
        let mut entry = RecordEntry::new(Method::POST, "https://example.com/batch");
        entry
            .request
            .headers
            .set("Content-Type", "multipart/mixed; boundary=b");
        entry.request.body = Some(body.clone());

        let sanitizers = vec![
            Arc::new(body_key("$.missing", "x", None, None)),
            Arc::new(Sanitizer::new(
                SanitizerKind::BodyRegex {
                    value: "x".to_string(),
                    regex: Some(pattern::compile("nomatch").unwrap()),
                    group: None,
                },
                None,
            )),
        ];
        apply_to_entry(&sanitizers, &mut entry);

        assert_eq!(entry.request.body, Some(body));
    }

    #[test]
    fn test_remove_header() {
        let mut entry = json_entry("https://example.com", "{}");
        entry.request.headers.set("x-secret", "1");
        entry.response.headers.set("X-Secret", "2");
        Sanitizer::new(
            SanitizerKind::RemoveHeader {
                headers: vec!["x-secret".to_string(), "absent".to_string()],
            },
            None,
        )
        .sanitize_entry(&mut entry)
        .unwrap();

        assert!(!entry.request.headers.contains("x-secret"));
        assert!(!entry.response.headers.contains("x-secret"));
    }

    #[test]
    fn test_general_regex_touches_uri_headers_and_bodies() {
        let mut entry = json_entry("https://secret.example.com/secret", r#"{"v":"secret"}"#);
        entry.response.headers.set("Location", "https://secret.example.com");
        Sanitizer::new(
            SanitizerKind::GeneralRegex {
                value: "fake".to_string(),
                regex: pattern::compile("secret").unwrap(),
                group: None,
            },
            None,
        )
        .sanitize_entry(&mut entry)
        .unwrap();

        assert_eq!(entry.request_uri, "https://fake.example.com/fake");
        assert_eq!(
            entry.response.headers.get_first("Location"),
            Some("https://fake.example.com")
        );
        assert_eq!(entry.response.body.as_deref(), Some(&br#"{"v":"fake"}"#[..]));
    }

    #[test]
    fn test_oauth_entries_removed() {
        let mut session = RecordSession::new();
        session.entries.push(json_entry(
            "https://login.microsoftonline.com/tenant/oauth2/v2.0/token",
            "{}",
        ));
        session.entries.push(json_entry("https://example.com/data", "{}"));

        apply_to_session(
            &[Arc::new(Sanitizer::new(SanitizerKind::OAuthResponse, None))],
            &mut session,
        );

        assert_eq!(session.entries.len(), 1);
        assert_eq!(session.entries[0].request_uri, "https://example.com/data");
    }

    #[test]
    fn test_regex_entry_by_uri() {
        let mut session = RecordSession::new();
        session.entries.push(json_entry("https://example.com/keep", "{}"));
        session.entries.push(json_entry("https://example.com/drop/1", "{}"));

        Sanitizer::new(
            SanitizerKind::RegexEntry {
                target: EntrySection::Uri,
                regex: pattern::compile("/drop/").unwrap(),
            },
            None,
        )
        .sanitize_session(&mut session);

        assert_eq!(session.entries.len(), 1);
    }

    #[test]
    fn test_entry_section_parse() {
        assert_eq!(EntrySection::parse("URI").unwrap(), EntrySection::Uri);
        let err = EntrySection::parse("query").unwrap_err();
        assert!(err
            .to_string()
            .starts_with("When defining which section of a request the regex should target"));
    }

    #[test]
    fn test_continuation_links_response_to_next_request() {
        let mut session = RecordSession::new();
        let mut first = json_entry("https://example.com/list", "{}");
        first.response.headers.set("x-ms-continuation-next", "real-token");
        let mut second = json_entry("https://example.com/list", "{}");
        second.request.headers.set("x-ms-continuation-next", "real-token");
        session.entries.push(first);
        session.entries.push(second);

        Sanitizer::new(
            SanitizerKind::Continuation {
                key: "x-ms-continuation-next".to_string(),
                method: "guid".to_string(),
                reset_after_first: false,
            },
            None,
        )
        .sanitize_session(&mut session);

        let issued = session.entries[0]
            .response
            .headers
            .get_first("x-ms-continuation-next")
            .unwrap()
            .to_string();
        assert_ne!(issued, "real-token");
        assert_eq!(
            session.entries[1].request.headers.get_first("x-ms-continuation-next"),
            Some(issued.as_str())
        );
    }
}
