//! HTTP routing for control endpoints and proxied traffic

use std::collections::BTreeMap;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::config::LimitsConfig;
use crate::model::Headers;
use crate::recording::{
    IncomingRequest, OutgoingResponse, PlaybackSource, RecordingHandler, ABSTRACTION_IDENTIFIER,
    ASSETS_FILE, PURGE_IN_MEMORY, RECORDING_FILE, RECORDING_ID, RECORDING_SAVE,
};
use crate::{ProxyError, Result};

/// Routes requests to the recording handler and renders its results
pub struct HttpHandler;

impl HttpHandler {
    /// Handle one request end to end. Errors become JSON error responses.
    pub async fn handle<B>(
        recording: &RecordingHandler,
        limits: &LimitsConfig,
        request: Request<B>,
    ) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let result = match Self::into_incoming(request, limits).await {
            Ok(incoming) => Self::dispatch(recording, incoming).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                if e.is_client_error() {
                    warn!("{method} {path} failed: {e}");
                } else {
                    error!("{method} {path} failed: {e}");
                }
                Self::error_response(&e)
            }
        }
    }

    async fn into_incoming<B>(request: Request<B>, limits: &LimitsConfig) -> Result<IncomingRequest>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        Self::validate_request(&request, limits)?;

        let (parts, body) = request.into_parts();
        let body = Self::read_body(body, limits.max_request_size).await?;
        let headers = parts
            .headers
            .iter()
            .fold(Headers::new(), |mut headers, (name, value)| {
                headers.append(
                    name.as_str(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                );
                headers
            });

        Ok(IncomingRequest {
            method: parts.method,
            target: parts
                .uri
                .path_and_query()
                .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string()),
            headers,
            body: body.to_vec(),
        })
    }

    async fn dispatch(recording: &RecordingHandler, request: IncomingRequest) -> Result<Response<Full<Bytes>>> {
        let route = if request.method == Method::POST {
            request.target.split('?').next().unwrap_or_default().to_ascii_lowercase()
        } else {
            String::new()
        };
        debug!("{} {}", request.method, request.target);

        match route.as_str() {
            "/record/start" => {
                let file = file_parameter(&request)?;
                let id = recording
                    .start_recording(file.as_deref(), request.header(ASSETS_FILE))
                    .await?;
                Ok(with_recording_id(Self::json_response(StatusCode::OK, None), &id))
            }
            "/record/stop" => {
                let id = required_header(&request, RECORDING_ID)?;
                let variables = variables_from_body(&request.body)?;
                let save = !header_is_false(&request, RECORDING_SAVE);
                recording.stop_recording(id, variables, save).await?;
                Ok(Self::json_response(StatusCode::OK, None))
            }
            "/playback/start" => {
                let source = match (file_parameter(&request)?, request.header(RECORDING_ID)) {
                    (Some(file), _) => PlaybackSource::File(file),
                    (None, Some(id)) => PlaybackSource::InMemory(id.to_string()),
                    (None, None) => {
                        return Err(ProxyError::BadRequest(format!(
                            "Either header {RECORDING_FILE} or {RECORDING_ID} must be provided to start playback."
                        )))
                    }
                };
                let (id, variables) = recording
                    .start_playback(source, request.header(ASSETS_FILE))
                    .await?;
                let body = json!(variables);
                Ok(with_recording_id(
                    Self::json_response(StatusCode::OK, Some(&body)),
                    &id,
                ))
            }
            "/playback/stop" => {
                let id = required_header(&request, RECORDING_ID)?;
                let purge = request
                    .header(PURGE_IN_MEMORY)
                    .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"));
                recording.stop_playback(id, purge).await?;
                Ok(Self::json_response(StatusCode::OK, None))
            }
            "/admin/addsanitizer" => {
                let identifier = required_header(&request, ABSTRACTION_IDENTIFIER)?;
                let id = recording
                    .add_sanitizer(identifier, &request.body, request.header(RECORDING_ID))
                    .await?;
                Ok(Self::json_response(StatusCode::OK, Some(&json!({ "Sanitizer": id }))))
            }
            "/admin/removesanitizers" => {
                let ids = sanitizer_ids(&request.body)?;
                let removed = recording
                    .remove_sanitizers(&ids, request.header(RECORDING_ID))
                    .await?;
                Ok(Self::json_response(StatusCode::OK, Some(&json!({ "Removed": removed }))))
            }
            "/admin/addtransform" => {
                let identifier = required_header(&request, ABSTRACTION_IDENTIFIER)?;
                recording
                    .add_transform(identifier, &request.body, request.header(RECORDING_ID))
                    .await?;
                Ok(Self::json_response(StatusCode::OK, None))
            }
            "/admin/setmatcher" => {
                let identifier = required_header(&request, ABSTRACTION_IDENTIFIER)?;
                recording
                    .set_matcher(identifier, &request.body, request.header(RECORDING_ID))
                    .await?;
                Ok(Self::json_response(StatusCode::OK, None))
            }
            "/admin/reset" => {
                recording.reset(request.header(RECORDING_ID)).await?;
                Ok(Self::json_response(StatusCode::OK, None))
            }
            _ => {
                let response = recording.handle_request(request).await?;
                Ok(Self::proxied_response(response))
            }
        }
    }

    /// Render a proxied or played back response
    #[must_use]
    pub fn proxied_response(response: OutgoingResponse) -> Response<Full<Bytes>> {
        let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut rendered = Self::create_response(status, Bytes::from(response.body));

        for (name, values) in response.headers.iter() {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                warn!("Dropping response header with invalid name {name}");
                continue;
            };
            for value in values {
                match HeaderValue::from_str(value) {
                    Ok(value) => {
                        rendered.headers_mut().append(name.clone(), value);
                    }
                    Err(_) => warn!("Dropping invalid value for response header {name}"),
                }
            }
        }
        rendered
    }

    /// Create a response with a body
    #[must_use]
    pub fn create_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        response
    }

    fn json_response(status: StatusCode, body: Option<&Value>) -> Response<Full<Bytes>> {
        let Some(body) = body else {
            let mut response = Self::create_response(status, Bytes::new());
            response
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            return response;
        };

        let mut response = Self::create_response(status, Bytes::from(body.to_string()));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    /// HTTP status for an error
    #[must_use]
    pub fn status_for(error: &ProxyError) -> StatusCode {
        match error {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::NotFound(_) | ProxyError::Mismatch(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Create a JSON error response
    #[must_use]
    pub fn error_response(error: &ProxyError) -> Response<Full<Bytes>> {
        let status = Self::status_for(error);
        let body = json!({
            "Message": error.to_string(),
            "Status": status.canonical_reason().unwrap_or_default(),
        });
        Self::json_response(status, Some(&body))
    }

    /// Check declared size and header count
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if the request exceeds a limit
    pub fn validate_request<B>(request: &Request<B>, limits: &LimitsConfig) -> Result<()> {
        let declared = request
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if let Some(length) = declared {
            if length > limits.max_request_size {
                return Err(ProxyError::BadRequest(format!(
                    "Request body of {length} bytes exceeds the limit of {} bytes.",
                    limits.max_request_size
                )));
            }
        }

        let header_count = request.headers().len();
        if header_count > limits.max_headers {
            return Err(ProxyError::BadRequest(format!(
                "Too many headers: {header_count}"
            )));
        }

        Ok(())
    }

    /// Read request body with size limit
    ///
    /// # Errors
    ///
    /// Returns error if the body is too large or the read fails
    pub async fn read_body<B>(body: B, max_size: usize) -> Result<Bytes>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        let bytes = body
            .collect()
            .await
            .map_err(|e| ProxyError::Other(format!("Failed to read body: {e}")))?
            .to_bytes();

        if bytes.len() > max_size {
            return Err(ProxyError::BadRequest(format!(
                "Request body of {} bytes exceeds the limit of {max_size} bytes.",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

fn with_recording_id(mut response: Response<Full<Bytes>>, id: &str) -> Response<Full<Bytes>> {
    if let Ok(value) = HeaderValue::from_str(id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(RECORDING_ID), value);
    }
    response
}

fn required_header<'a>(request: &'a IncomingRequest, name: &str) -> Result<&'a str> {
    request
        .header(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ProxyError::BadRequest(format!("Header {name} is required for this call.")))
}

fn header_is_false(request: &IncomingRequest, name: &str) -> bool {
    request
        .header(name)
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("false"))
}

/// Recording file from the header, or from a `{"x-recording-file": ...}` body
fn file_parameter(request: &IncomingRequest) -> Result<Option<String>> {
    if let Some(file) = request.header(RECORDING_FILE) {
        return Ok(Some(file.to_string()));
    }
    if request.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let body: Value = serde_json::from_slice(&request.body)
        .map_err(|e| ProxyError::BadRequest(format!("Unable to parse the request body as json: {e}")))?;
    Ok(body
        .get(RECORDING_FILE)
        .and_then(Value::as_str)
        .map(str::to_string))
}

fn variables_from_body(body: &[u8]) -> Result<BTreeMap<String, String>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::BadRequest(format!("Unable to parse the variables body as json: {e}")))?;
    let Value::Object(map) = value else {
        return Err(ProxyError::BadRequest(
            "Variables must be a json object of string values.".to_string(),
        ));
    };

    Ok(map
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(text) => (key, text),
            other => (key, other.to_string()),
        })
        .collect())
}

fn sanitizer_ids(body: &[u8]) -> Result<Vec<String>> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::BadRequest(format!("Unable to parse the request body as json: {e}")))?;
    value
        .get("Sanitizers")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| {
            ProxyError::BadRequest(
                "The request body must contain a \"Sanitizers\" array of sanitizer ids.".to_string(),
            )
        })
}
