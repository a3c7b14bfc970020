//! HTTP client for forwarding recorded traffic to the real service

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::model::Headers;
use crate::{ProxyError, Result};

/// HTTP client for forwarding requests upstream
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpClient {
    /// Create a new HTTP client
    #[must_use]
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build_http();

        Self { client }
    }

    /// Send one request and collect the full response
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Upstream` if the request cannot be built or sent,
    /// or the response body cannot be read
    pub async fn forward(
        &self,
        method: &Method,
        uri: &str,
        headers: &Headers,
        body: Vec<u8>,
    ) -> Result<ForwardedResponse> {
        let uri = parse_uri(uri)?;
        debug!("Forwarding {method} to {uri}");

        let mut builder = Request::builder().method(method.clone()).uri(uri);
        for (name, values) in headers.iter() {
            for value in values {
                builder = builder.header(name, value.as_str());
            }
        }

        let request = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ProxyError::Upstream(format!("Failed to build request: {e}")))?;

        let response = self.client.request(request).await.map_err(|e| {
            warn!("Upstream request failed: {e}");
            ProxyError::Upstream(e.to_string())
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .fold(Headers::new(), |mut headers, (name, value)| {
                headers.append(name, value);
                headers
            });

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::Upstream(format!("Failed to read response body: {e}")))?
            .to_bytes();

        Ok(ForwardedResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Response from a forwarded request
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers, names as received
    pub headers: Headers,
    /// Response body exactly as received
    pub body: Vec<u8>,
}

/// Join the upstream base URI and a request target
#[must_use]
pub fn upstream_uri(base: &str, target: &str) -> String {
    let base = base.trim_end_matches('/');
    if target.is_empty() || target == "/" {
        return format!("{base}/");
    }
    if target.starts_with('/') {
        format!("{base}{target}")
    } else {
        format!("{base}/{target}")
    }
}

/// Parse a URI, percent-encoding characters that are not legal as sent.
fn parse_uri(uri: &str) -> Result<Uri> {
    if let Ok(parsed) = uri.parse::<Uri>() {
        return Ok(parsed);
    }

    let encoded: String = uri
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() {
                c.to_string()
            } else {
                urlencoding::encode(&c.to_string()).into_owned()
            }
        })
        .collect();

    encoded
        .parse::<Uri>()
        .map_err(|e| ProxyError::Upstream(format!("Invalid URI '{uri}': {e}")))
}
