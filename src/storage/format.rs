//! JSON recording format
//!
//! A recording file is an object with `Entries` and `Variables`. Each entry
//! carries `RequestUri`, `RequestMethod`, a `Request` object with `Headers`
//! and `Body`, and a `Response` object that additionally holds `StatusCode`.
//!
//! Body encoding:
//! - `null` when the message had no body, `""` when it was empty
//! - JSON objects that re-serialize to the exact same bytes are inlined
//! - single-line text with a textual content type is a plain string
//! - multi-line text and multipart bodies are arrays of line segments; any
//!   segment that is not UTF-8 (or starts with [`BINARY_SEGMENT_PREFIX`])
//!   is written as the prefix followed by base64
//! - everything else is a base64 string
//!
//! The flat layout (`RequestHeaders`, `RequestBody`, `ResponseHeaders`,
//! `ResponseBody`, `StatusCode` directly on the entry) is accepted on read.

use std::collections::BTreeMap;

use base64::{engine::general_purpose, Engine as _};
use hyper::Method;
use serde_json::{Map, Value};

use crate::model::{
    is_text_content_type, multipart_boundary, Headers, RecordEntry, RecordSession,
    RequestOrResponse,
};
use crate::{ProxyError, Result};

/// Marks a base64 encoded segment inside a segmented body
pub const BINARY_SEGMENT_PREFIX: &str = "b64:";

/// Convert a session to its JSON document
#[must_use]
pub fn session_to_json(session: &RecordSession) -> Value {
    let entries = session.entries.iter().map(entry_to_json).collect();

    let variables = session
        .variables
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect::<Map<String, Value>>();

    let mut root = Map::new();
    root.insert("Entries".to_string(), Value::Array(entries));
    root.insert("Variables".to_string(), Value::Object(variables));
    Value::Object(root)
}

/// Parse a session from its JSON document
///
/// # Errors
///
/// Returns error if the document does not follow the recording layout
pub fn session_from_json(value: &Value) -> Result<RecordSession> {
    let root = value
        .as_object()
        .ok_or_else(|| invalid("recording root must be an object"))?;

    let entries = match root.get("Entries") {
        Some(Value::Array(items)) => items
            .iter()
            .map(entry_from_json)
            .collect::<Result<Vec<_>>>()?,
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return Err(invalid("Entries must be an array")),
    };

    let mut variables = BTreeMap::new();
    if let Some(Value::Object(map)) = root.get("Variables") {
        for (key, value) in map {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            variables.insert(key.clone(), text);
        }
    }

    Ok(RecordSession { entries, variables })
}

/// Convert one entry to JSON
#[must_use]
pub fn entry_to_json(entry: &RecordEntry) -> Value {
    let mut request = Map::new();
    request.insert(
        "Headers".to_string(),
        headers_to_json(&entry.request.headers),
    );
    request.insert("Body".to_string(), encode_body(&entry.request));

    let mut response = Map::new();
    response.insert(
        "StatusCode".to_string(),
        Value::from(entry.status_code),
    );
    response.insert(
        "Headers".to_string(),
        headers_to_json(&entry.response.headers),
    );
    response.insert("Body".to_string(), encode_body(&entry.response));

    let mut object = Map::new();
    object.insert(
        "RequestUri".to_string(),
        Value::String(entry.request_uri.clone()),
    );
    object.insert(
        "RequestMethod".to_string(),
        Value::String(entry.request_method.to_string()),
    );
    object.insert("Request".to_string(), Value::Object(request));
    object.insert("Response".to_string(), Value::Object(response));
    Value::Object(object)
}

/// Parse one entry from JSON, nested or flat layout
///
/// # Errors
///
/// Returns error on a missing URI/method, a bad header shape or an undecodable body
pub fn entry_from_json(value: &Value) -> Result<RecordEntry> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid("entry must be an object"))?;

    let request_uri = object
        .get("RequestUri")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("entry is missing RequestUri"))?
        .to_string();

    let method_name = object
        .get("RequestMethod")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("entry is missing RequestMethod"))?;
    let request_method = Method::from_bytes(method_name.as_bytes())
        .map_err(|e| invalid(&format!("invalid RequestMethod '{method_name}': {e}")))?;

    let (request, response, status_code) = if object.contains_key("Request") {
        let request = object.get("Request").unwrap_or(&Value::Null);
        let response = object.get("Response").unwrap_or(&Value::Null);
        let status_code = status_from(response.get("StatusCode"))?;
        (
            message_from(request.get("Headers"), request.get("Body"))?,
            message_from(response.get("Headers"), response.get("Body"))?,
            status_code,
        )
    } else {
        (
            message_from(object.get("RequestHeaders"), object.get("RequestBody"))?,
            message_from(object.get("ResponseHeaders"), object.get("ResponseBody"))?,
            status_from(object.get("StatusCode"))?,
        )
    };

    Ok(RecordEntry {
        request_uri,
        request_method,
        request,
        response,
        status_code,
    })
}

fn status_from(value: Option<&Value>) -> Result<u16> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value
            .as_u64()
            .and_then(|code| u16::try_from(code).ok())
            .ok_or_else(|| invalid("StatusCode must be a number")),
    }
}

fn message_from(headers: Option<&Value>, body: Option<&Value>) -> Result<RequestOrResponse> {
    let headers = match headers {
        Some(value) => headers_from_json(value)?,
        None => Headers::new(),
    };
    let body = decode_body(body.unwrap_or(&Value::Null), &headers)?;
    Ok(RequestOrResponse { headers, body })
}

/// Serialize headers: one value as a string, several as an array
#[must_use]
pub fn headers_to_json(headers: &Headers) -> Value {
    let map = headers
        .iter()
        .map(|(name, values)| {
            let value = match values {
                [single] => Value::String(single.clone()),
                many => Value::Array(many.iter().cloned().map(Value::String).collect()),
            };
            (name.to_string(), value)
        })
        .collect::<Map<String, Value>>();
    Value::Object(map)
}

/// Parse a header object
///
/// # Errors
///
/// Returns error if a header value is neither a string nor an array of strings
pub fn headers_from_json(value: &Value) -> Result<Headers> {
    let Some(map) = value.as_object() else {
        return match value {
            Value::Null => Ok(Headers::new()),
            _ => Err(invalid("Headers must be an object")),
        };
    };

    let mut headers = Headers::new();
    for (name, value) in map {
        let values = match value {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid(&format!("header '{name}' has a non-string value")))
                })
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(invalid(&format!("header '{name}' has an unsupported value"))),
        };
        headers.insert(name.clone(), values);
    }
    Ok(headers)
}

/// Encode a message body for the recording file
#[must_use]
pub fn encode_body(message: &RequestOrResponse) -> Value {
    let Some(body) = message.body.as_deref() else {
        return Value::Null;
    };
    if body.is_empty() {
        return Value::String(String::new());
    }

    let content_type = message.content_type().unwrap_or_default();
    let textual = is_text_content_type(content_type);
    let multipart = multipart_boundary(content_type).is_some();

    if !textual && !multipart {
        return Value::String(general_purpose::STANDARD.encode(body));
    }

    if textual {
        if let Ok(text) = std::str::from_utf8(body) {
            if let Some(inline) = inline_json(text) {
                return inline;
            }
            if !text.contains('\n') {
                return Value::String(text.to_string());
            }
        }
    }

    Value::Array(split_segments(body))
}

/// Decode a body written by [`encode_body`]
///
/// # Errors
///
/// Returns error if a base64 payload is malformed or the body has an unsupported shape
pub fn decode_body(value: &Value, headers: &Headers) -> Result<Option<Vec<u8>>> {
    let textual = headers
        .get_first("Content-Type")
        .is_some_and(is_text_content_type);

    match value {
        Value::Null => Ok(None),
        Value::String(text) if textual || text.is_empty() => Ok(Some(text.as_bytes().to_vec())),
        Value::String(encoded) => general_purpose::STANDARD
            .decode(encoded)
            .map(Some)
            .map_err(|e| invalid(&format!("body is not valid base64: {e}"))),
        Value::Array(segments) => {
            let mut body = Vec::new();
            for segment in segments {
                let text = segment
                    .as_str()
                    .ok_or_else(|| invalid("body segments must be strings"))?;
                match text.strip_prefix(BINARY_SEGMENT_PREFIX) {
                    Some(encoded) => body.extend(
                        general_purpose::STANDARD
                            .decode(encoded)
                            .map_err(|e| invalid(&format!("body segment is not valid base64: {e}")))?,
                    ),
                    None => body.extend_from_slice(text.as_bytes()),
                }
            }
            Ok(Some(body))
        }
        Value::Object(_) => Ok(Some(serde_json::to_vec(value)?)),
        _ => Err(invalid("unsupported body encoding")),
    }
}

fn inline_json(text: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(text).ok()?;
    if !value.is_object() {
        return None;
    }
    let compact = serde_json::to_string(&value).ok()?;
    (compact == text).then_some(value)
}

fn split_segments(body: &[u8]) -> Vec<Value> {
    body.split_inclusive(|byte| *byte == b'\n')
        .map(|segment| match std::str::from_utf8(segment) {
            Ok(text) if !text.starts_with(BINARY_SEGMENT_PREFIX) => Value::String(text.to_string()),
            _ => Value::String(format!(
                "{BINARY_SEGMENT_PREFIX}{}",
                general_purpose::STANDARD.encode(segment)
            )),
        })
        .collect()
}

fn invalid(message: &str) -> ProxyError {
    ProxyError::Other(format!("Invalid recording format: {message}"))
}
