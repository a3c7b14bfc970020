//! Integration tests for the record/playback cycle

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use proptest::prelude::*;
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;

use recproxy::config::Config;
use recproxy::model::{Headers, RecordEntry, RecordSession};
use recproxy::network::ProxyServer;
use recproxy::recording::{
    IncomingRequest, PlaybackSource, RecordingHandler, ABSTRACTION_IDENTIFIER, PURGE_IN_MEMORY,
    RECORDING_ID, RECORDING_REMOVE, UPSTREAM_BASE_URI,
};
use recproxy::storage::{parse_session, read_session, serialize_session, write_session};
use recproxy::store::AssetsStore;
use recproxy::{ProxyError, Result};

const TABLE_LOCATION: &str = "https://realacct.table.core.windows.net/Tables('listtable09bf2a3d')";

/// Asset store for tests that never touch git
struct NoStore;

impl AssetsStore for NoStore {
    fn restore(&self, _: &Path) -> Result<PathBuf> {
        Err(ProxyError::Other("asset store disabled in tests".to_string()))
    }
    fn push(&self, _: &Path) -> Result<()> {
        Ok(())
    }
    fn reset(&self, _: &Path) -> Result<()> {
        Ok(())
    }
}

fn recording_handler(dir: &TempDir) -> RecordingHandler {
    RecordingHandler::new(dir.path(), Arc::new(NoStore)).unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::new();
    GzDecoder::new(data).read_to_end(&mut decoded).unwrap();
    decoded
}

async fn upstream_response(
    request: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let path = request.uri().path().to_string();
    let response = match path.as_str() {
        "/Tables" => Response::builder()
            .status(StatusCode::CREATED)
            .header("Content-Type", "application/json")
            .header("Location", TABLE_LOCATION)
            .body(Full::new(Bytes::from(
                r#"{"odata.metadata":"https://realacct.table.core.windows.net/$metadata#Tables/@Element","TableName":"listtable09bf2a3d"}"#,
            ))),
        "/gzip" => Response::builder()
            .header("Content-Type", "text/plain")
            .header("Content-Encoding", "gzip")
            .body(Full::new(Bytes::from(gzip(b"compressed payload")))),
        _ => Response::builder()
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from(format!("hello from {path}")))),
    };
    Ok(response.unwrap())
}

async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(upstream_response))
                    .await;
            });
        }
    });
    addr
}

fn proxied(method: Method, target: &str, upstream: SocketAddr) -> IncomingRequest {
    IncomingRequest::new(method, target).with_header(UPSTREAM_BASE_URI, &format!("http://{upstream}"))
}

struct TestClient {
    client: Client<HttpConnector, Full<Bytes>>,
    proxy: SocketAddr,
}

impl TestClient {
    fn new(proxy: SocketAddr) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            proxy,
        }
    }

    async fn send(&self, method: Method, path: &str, headers: &[(&str, &str)]) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://{}{path}", self.proxy));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let response = self
            .client
            .request(builder.body(Full::new(Bytes::new())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }
}

#[tokio::test]
async fn test_record_sanitizes_and_persists() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_upstream().await;
    let handler = recording_handler(&dir);

    let id = handler.start_recording(Some("tables/create"), None).await.unwrap();
    handler
        .add_sanitizer(
            "BodyKeySanitizer",
            br#"{"jsonPath": "$.TableName", "value": "afaketable"}"#,
            Some(&id),
        )
        .await
        .unwrap();
    handler
        .add_sanitizer(
            "HeaderRegexSanitizer",
            br#"{"key": "Location", "value": "fakeaccount", "regex": "[a-z]+(?=\\.(?:table|blob|queue)\\.core\\.windows\\.net)"}"#,
            Some(&id),
        )
        .await
        .unwrap();

    let request = proxied(Method::POST, "/Tables", upstream)
        .with_header("Authorization", "SharedKey realacct:c2VjcmV0")
        .with_header("Content-Type", "application/json")
        .with_body(r#"{"TableName":"listtable09bf2a3d"}"#);
    let response = handler.handle_record_request(&id, request).await.unwrap();

    // The live response is passed through untouched
    assert_eq!(response.status, 201);
    assert_eq!(response.headers.get_first("Location"), Some(TABLE_LOCATION));

    handler.stop_recording(&id, BTreeMap::new(), true).await.unwrap();

    let loaded = read_session(&dir.path().join("tables/create.json")).unwrap();
    let entry = &loaded.session.entries[0];
    assert_eq!(entry.request_method, Method::POST);
    assert_eq!(entry.request_uri, format!("http://{upstream}/Tables"));
    assert_eq!(entry.request.headers.get_first("Authorization"), Some("Sanitized"));
    assert!(!entry.request.headers.contains(UPSTREAM_BASE_URI));
    assert_eq!(
        entry.response.headers.get_first("Location"),
        Some("https://fakeaccount.table.core.windows.net/Tables('listtable09bf2a3d')")
    );

    let body: Value = serde_json::from_slice(entry.response.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["TableName"], "afaketable");
    assert_eq!(
        body["odata.metadata"],
        "https://realacct.table.core.windows.net/$metadata#Tables/@Element"
    );
}

#[tokio::test]
async fn test_condition_that_does_not_match_is_noop() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_upstream().await;
    let handler = recording_handler(&dir);

    let id = handler.start_recording(Some("conditional"), None).await.unwrap();
    handler
        .add_sanitizer(
            "BodyKeySanitizer",
            br#"{"jsonPath": "$.TableName", "value": "afaketable", "condition": {"uriRegex": ".+/Queues"}}"#,
            Some(&id),
        )
        .await
        .unwrap();

    let request = proxied(Method::POST, "/Tables", upstream);
    handler.handle_record_request(&id, request).await.unwrap();
    handler.stop_recording(&id, BTreeMap::new(), true).await.unwrap();

    let loaded = read_session(&dir.path().join("conditional.json")).unwrap();
    let body: Value =
        serde_json::from_slice(loaded.session.entries[0].response.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["TableName"], "listtable09bf2a3d");
}

#[tokio::test]
async fn test_skip_request_response_stores_nothing() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_upstream().await;
    let handler = recording_handler(&dir);

    let id = handler.start_recording(Some("skipped"), None).await.unwrap();
    let request = proxied(Method::GET, "/ignored", upstream).with_header("x-recording-skip", "request-response");
    let response = handler.handle_record_request(&id, request).await.unwrap();
    assert_eq!(response.body, b"hello from /ignored");

    handler.stop_recording(&id, BTreeMap::new(), true).await.unwrap();
    let loaded = read_session(&dir.path().join("skipped.json")).unwrap();
    assert!(loaded.session.entries.is_empty());
}

#[tokio::test]
async fn test_unknown_playback_id_is_not_found() {
    let dir = TempDir::new().unwrap();
    let handler = recording_handler(&dir);

    let err = handler
        .start_playback(PlaybackSource::InMemory("0f4e7d9c-unknown".to_string()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::NotFound(_)));
    assert_eq!(handler.active_sessions(), 0);
    assert!(!handler.has_in_memory("0f4e7d9c-unknown"));
}

#[tokio::test]
async fn test_admin_parameter_errors() {
    let dir = TempDir::new().unwrap();
    let handler = recording_handler(&dir);

    let err = handler
        .add_sanitizer(
            "BodyKeySanitizer",
            br#"{"jsonPath": "$.a", "value": "b", "valu": "typo"}"#,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::BadRequest(_)));
    assert!(err.to_string().contains("is an extra key"));

    let err = handler
        .add_sanitizer("BodyKeySanitizer", br#"{"value": "b"}"#, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Required parameter key \"jsonPath\""));

    let err = handler
        .add_transform("NoSuchTransform", b"", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("is not a recognized"));

    let err = handler
        .add_sanitizer("UriRegexSanitizer", br#"{"regex": "(unclosed"}"#, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does not successfully compile"));
}

fn multipart_entry(filename: &str) -> RecordEntry {
    let mut entry = RecordEntry::new(Method::POST, "https://files.example.com/upload");
    entry
        .request
        .headers
        .set("Content-Type", "multipart/form-data; boundary=formboundary");
    entry.request.body = Some(multipart_body(filename));
    entry.response.headers.set("Content-Type", "text/plain");
    entry.response.body = Some(b"uploaded".to_vec());
    entry.status_code = 200;
    entry
}

fn multipart_body(filename: &str) -> Vec<u8> {
    format!(
        "--formboundary\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         contents\r\n\
         --formboundary--\r\n"
    )
    .into_bytes()
}

#[tokio::test]
async fn test_multipart_separators_match_across_platforms() {
    let dir = TempDir::new().unwrap();
    let handler = recording_handler(&dir);

    let mut session = RecordSession::new();
    session.entries.push(multipart_entry("data\\inputs\\file.txt"));
    write_session(&dir.path().join("multipart.json"), &session).unwrap();

    let (id, _) = handler
        .start_playback(PlaybackSource::File("multipart".to_string()), None)
        .await
        .unwrap();

    let request = IncomingRequest::new(Method::POST, "/upload")
        .with_header(UPSTREAM_BASE_URI, "https://files.example.com")
        .with_header("Content-Type", "multipart/form-data; boundary=formboundary")
        .with_body(multipart_body("data/inputs/file.txt"));
    let response = handler.handle_playback_request(&id, request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"uploaded");
}

#[tokio::test]
async fn test_playback_without_removal_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let handler = recording_handler(&dir);

    let mut session = RecordSession::new();
    for body in ["first", "second"] {
        let mut entry = RecordEntry::new(Method::GET, "https://example.com/page");
        entry.response.headers.set("Content-Type", "text/plain");
        entry.response.body = Some(body.as_bytes().to_vec());
        entry.status_code = 200;
        session.entries.push(entry);
    }
    write_session(&dir.path().join("pages.json"), &session).unwrap();

    let (id, _) = handler
        .start_playback(PlaybackSource::File("pages".to_string()), None)
        .await
        .unwrap();

    for _ in 0..3 {
        let request = IncomingRequest::new(Method::GET, "/page")
            .with_header(UPSTREAM_BASE_URI, "https://example.com")
            .with_header(RECORDING_REMOVE, "false");
        let response = handler.handle_playback_request(&id, request).await.unwrap();
        assert_eq!(response.body, b"first");
    }

    let request = IncomingRequest::new(Method::GET, "/page").with_header(UPSTREAM_BASE_URI, "https://example.com");
    let first = handler.handle_playback_request(&id, request.clone()).await.unwrap();
    let second = handler.handle_playback_request(&id, request.clone()).await.unwrap();
    assert_eq!(first.body, b"first");
    assert_eq!(second.body, b"second");

    let err = handler.handle_playback_request(&id, request).await.unwrap_err();
    match err {
        ProxyError::Mismatch(diagnostic) => assert!(diagnostic.contains("No records to match.")),
        other => panic!("expected a mismatch, got {other}"),
    }
}

#[tokio::test]
async fn test_full_cycle_over_the_wire() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_upstream().await;
    let upstream_base = format!("http://{upstream}");

    let recording = Arc::new(recording_handler(&dir));
    let server = ProxyServer::new(
        Config {
            storage_location: dir.path().to_path_buf(),
            ..Config::default()
        },
        Arc::clone(&recording),
    );
    let shutdown = server.shutdown_handle();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { server.serve(listener).await });

    let client = TestClient::new(proxy);

    // Record
    let (status, headers, _) = client.send(Method::POST, "/Record/Start", &[]).await;
    assert_eq!(status, StatusCode::OK);
    let record_id = headers[RECORDING_ID].to_str().unwrap().to_string();

    let (status, headers, body) = client
        .send(
            Method::GET,
            "/gzip",
            &[(RECORDING_ID, record_id.as_str()), (UPSTREAM_BASE_URI, upstream_base.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-encoding"], "gzip");
    assert_eq!(gunzip(&body), b"compressed payload");

    let (status, _, _) = client
        .send(Method::POST, "/Record/Stop", &[(RECORDING_ID, record_id.as_str())])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(recording.has_in_memory(&record_id));

    // Play back the in-memory recording
    let (status, headers, _) = client
        .send(Method::POST, "/Playback/Start", &[(RECORDING_ID, record_id.as_str())])
        .await;
    assert_eq!(status, StatusCode::OK);
    let playback_id = headers[RECORDING_ID].to_str().unwrap().to_string();

    let (status, headers, body) = client
        .send(
            Method::GET,
            "/gzip",
            &[(RECORDING_ID, playback_id.as_str()), (UPSTREAM_BASE_URI, upstream_base.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-encoding"], "gzip");
    assert!(headers.get("transfer-encoding").is_none());
    assert_eq!(gunzip(&body), b"compressed payload");

    let (status, _, body) = client
        .send(
            Method::GET,
            "/gzip",
            &[(RECORDING_ID, playback_id.as_str()), (UPSTREAM_BASE_URI, upstream_base.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert!(error["Message"]
        .as_str()
        .unwrap()
        .contains("No records to match."));

    let (status, _, _) = client
        .send(
            Method::POST,
            "/Playback/Stop",
            &[(RECORDING_ID, playback_id.as_str()), (PURGE_IN_MEMORY, "true")],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!recording.has_in_memory(&record_id));

    // Unknown playback id over the wire
    let (status, _, body) = client
        .send(Method::POST, "/Playback/Start", &[(RECORDING_ID, "no-such-id")])
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["Status"], "Not Found");

    // Admin errors come back as 400
    let (status, _, _) = client
        .send(
            Method::POST,
            "/Admin/AddTransform",
            &[(ABSTRACTION_IDENTIFIER, "NoSuchTransform")],
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    shutdown.send(()).ok();
    let finished = tokio::time::timeout(Duration::from_secs(10), server).await;
    assert!(finished.is_ok());
    assert_eq!(recording.active_sessions(), 0);
}

fn method_strategy() -> impl Strategy<Value = Method> {
    prop_oneof![
        Just(Method::GET),
        Just(Method::POST),
        Just(Method::PUT),
        Just(Method::DELETE),
        Just(Method::HEAD),
    ]
}

fn content_type_strategy() -> impl Strategy<Value = Option<&'static str>> {
    prop_oneof![
        Just(None),
        Just(Some("text/plain")),
        Just(Some("application/json")),
        Just(Some("application/octet-stream")),
        Just(Some("multipart/form-data; boundary=b")),
    ]
}

fn body_strategy() -> impl Strategy<Value = Option<Vec<u8>>> {
    prop_oneof![
        Just(None),
        proptest::collection::vec(any::<u8>(), 0..48).prop_map(Some),
        "[ -~\n]{0,40}".prop_map(|text| Some(text.into_bytes())),
        Just(Some(br#"{"a":1,"b":[true,null],"c":{"d":"e"}}"#.to_vec())),
    ]
}

fn headers_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<String>>> {
    proptest::collection::btree_map(
        "x-[a-z]{1,6}",
        proptest::collection::vec("[ -~]{0,12}", 1..3),
        0..4,
    )
}

fn message_strategy() -> impl Strategy<Value = (Headers, Option<Vec<u8>>)> {
    (content_type_strategy(), headers_strategy(), body_strategy()).prop_map(
        |(content_type, extra, body)| {
            let mut headers = Headers::new();
            if let Some(content_type) = content_type {
                headers.set("Content-Type", content_type);
            }
            for (name, values) in extra {
                headers.insert(name, values);
            }
            (headers, body)
        },
    )
}

fn entry_strategy() -> impl Strategy<Value = RecordEntry> {
    (
        method_strategy(),
        "[a-z/]{0,12}",
        message_strategy(),
        message_strategy(),
        100u16..600,
    )
        .prop_map(|(method, path, request, response, status)| {
            let mut entry = RecordEntry::new(method, format!("https://example.com/{path}"));
            entry.request.headers = request.0;
            entry.request.body = request.1;
            entry.response.headers = response.0;
            entry.response.body = response.1;
            entry.status_code = status;
            entry
        })
}

proptest! {
    #[test]
    fn test_recording_round_trip_preserves_entries(
        entries in proptest::collection::vec(entry_strategy(), 0..5),
        variables in proptest::collection::btree_map("[a-z]{1,8}", "[ -~]{0,16}", 0..4),
    ) {
        let session = RecordSession { entries, variables };
        let bytes = serialize_session(&session).unwrap();
        let parsed = parse_session(&bytes).unwrap();
        prop_assert_eq!(&parsed, &session);
        prop_assert_eq!(serialize_session(&parsed).unwrap(), bytes);
    }
}
