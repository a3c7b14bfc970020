//! Recording and playback orchestration

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use hyper::Method;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compression::{compress_body, decompress_body};
use crate::model::{multipart_boundary, Headers, RecordEntry, RecordSession, RequestOrResponse};
use crate::multipart::normalize_filename_separators;
use crate::network::{upstream_uri, HttpClient};
use crate::registry::Registry;
use crate::sanitizer;
use crate::storage::{file_hash, read_session, recording_path, write_session};
use crate::store::AssetsStore;
use crate::{ProxyError, Result};

use super::policy::{EffectivePolicy, Policy, RegisteredSanitizer, SessionPolicy};
use super::session::ModifiableRecordSession;
use super::{
    IncomingRequest, OutgoingResponse, CONTROL_HEADER_PREFIX, RECORDING_ID, RECORDING_MODE,
    RECORDING_REMOVE, RECORDING_SKIP, UPSTREAM_BASE_URI, UPSTREAM_HOST_HEADER,
};

/// Request headers never forwarded upstream nor stored
const HOP_HEADERS: &[&str] = &["Host", "Proxy-Connection", "Connection"];

/// Where a playback session gets its entries from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSource {
    /// A recording file, relative to the storage location or restored assets
    File(String),
    /// A stopped in-memory recording, by its recording id
    InMemory(String),
}

/// Owns the session registries and the policy in force
pub struct RecordingHandler {
    recording_sessions: DashMap<String, Arc<ModifiableRecordSession>>,
    playback_sessions: DashMap<String, Arc<ModifiableRecordSession>>,
    in_memory_sessions: DashMap<String, Arc<ModifiableRecordSession>>,
    base_policy: RwLock<Arc<Policy>>,
    registry: Registry,
    client: HttpClient,
    store: Arc<dyn AssetsStore>,
    context_dir: PathBuf,
    sanitizer_counter: AtomicUsize,
}

impl std::fmt::Debug for RecordingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingHandler")
            .field("recording_sessions", &self.recording_sessions.len())
            .field("playback_sessions", &self.playback_sessions.len())
            .field("in_memory_sessions", &self.in_memory_sessions.len())
            .field("context_dir", &self.context_dir)
            .finish_non_exhaustive()
    }
}

impl RecordingHandler {
    /// Create a handler resolving recordings against `context_dir`
    ///
    /// # Errors
    ///
    /// Returns error if the default policy cannot be built
    pub fn new(context_dir: impl Into<PathBuf>, store: Arc<dyn AssetsStore>) -> Result<Self> {
        Ok(Self {
            recording_sessions: DashMap::new(),
            playback_sessions: DashMap::new(),
            in_memory_sessions: DashMap::new(),
            base_policy: RwLock::new(Arc::new(Policy::default_policy()?)),
            registry: Registry::builtin(),
            client: HttpClient::new(),
            store,
            context_dir: context_dir.into(),
            sanitizer_counter: AtomicUsize::new(0),
        })
    }

    /// Directory relative recording paths resolve against
    #[must_use]
    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    /// Number of active recording and playback sessions
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.recording_sessions.len() + self.playback_sessions.len()
    }

    /// Whether `id` names an active recording
    #[must_use]
    pub fn is_recording(&self, id: &str) -> bool {
        self.recording_sessions.contains_key(id)
    }

    /// Whether `id` names an active playback
    #[must_use]
    pub fn is_playing_back(&self, id: &str) -> bool {
        self.playback_sessions.contains_key(id)
    }

    /// Whether `id` names a stopped in-memory recording
    #[must_use]
    pub fn has_in_memory(&self, id: &str) -> bool {
        self.in_memory_sessions.contains_key(id)
    }

    /// Snapshot of the base policy
    pub async fn base_policy(&self) -> Arc<Policy> {
        Arc::clone(&*self.base_policy.read().await)
    }

    async fn effective_policy(&self, session: &ModifiableRecordSession) -> EffectivePolicy {
        let base = self.base_policy().await;
        EffectivePolicy::resolve(&base, &session.policy().await)
    }

    async fn resolve_recording_path(&self, file: &str, assets_file: Option<&str>) -> Result<PathBuf> {
        let Some(assets_file) = assets_file else {
            return Ok(recording_path(&self.context_dir, file));
        };

        let assets_json = self.context_dir.join(assets_file);
        let store = Arc::clone(&self.store);
        let root = tokio::task::spawn_blocking(move || store.restore(&assets_json))
            .await
            .map_err(|e| ProxyError::Other(format!("Asset restore task failed: {e}")))??;
        Ok(recording_path(&root, file))
    }

    /// Start recording, to `file` when given or in memory otherwise
    ///
    /// # Errors
    ///
    /// Returns error if restoring `assets_file` fails
    pub async fn start_recording(&self, file: Option<&str>, assets_file: Option<&str>) -> Result<String> {
        let path = match file {
            Some(file) if !file.trim().is_empty() => {
                Some(self.resolve_recording_path(file, assets_file).await?)
            }
            _ => None,
        };

        let id = Uuid::new_v4().to_string();
        match &path {
            Some(path) => info!("Recording {id} started for {}", path.display()),
            None => info!("In-memory recording {id} started"),
        }

        let existing = path.as_deref().and_then(file_hash);
        let mut recording = ModifiableRecordSession::new(RecordSession::new(), path);
        if let Some(hash) = existing {
            recording = recording.with_hash(hash);
        }
        self.recording_sessions.insert(id.clone(), Arc::new(recording));
        Ok(id)
    }

    /// Finish a recording, persisting it unless `save` is false.
    ///
    /// The whole sanitizer pipeline runs here, once over the whole recording.
    /// Recordings without a file move to the in-memory registry under the
    /// same id. If the file cannot be written the session stays active so
    /// the stop can be retried.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::NotFound` for an unknown id, or error if the file
    /// cannot be written
    pub async fn stop_recording(
        &self,
        id: &str,
        variables: BTreeMap<String, String>,
        save: bool,
    ) -> Result<()> {
        let (_, recording) = self.recording_sessions.remove(id).ok_or_else(|| {
            ProxyError::NotFound(format!("There is no active recording session under id {id}."))
        })?;

        let policy = self.effective_policy(&recording).await;
        let session = {
            let mut session = recording.lock().await;
            session.variables.extend(variables);
            session.sanitize(&policy.sanitizers);
            session.clone()
        };

        if !save {
            info!("Recording {id} stopped, discarding {} entries", session.entries.len());
            return Ok(());
        }

        let Some(path) = recording.path().map(Path::to_path_buf) else {
            info!(
                "Recording {id} stopped, keeping {} entries in memory",
                session.entries.len()
            );
            let stored = ModifiableRecordSession::new(session, None);
            self.in_memory_sessions.insert(id.to_string(), Arc::new(stored));
            return Ok(());
        };

        if file_hash(&path).as_deref() != recording.hash() {
            warn!(
                "{} changed on disk since recording {id} started, overwriting",
                path.display()
            );
        }

        match write_session(&path, &session) {
            Ok(hash) => {
                info!(
                    "Recording {id} stopped, wrote {} entries to {} ({})",
                    session.entries.len(),
                    path.display(),
                    hash
                );
                Ok(())
            }
            Err(e) => {
                warn!("Recording {id} could not be written, keeping it active: {e}");
                self.recording_sessions.insert(id.to_string(), recording);
                Err(e)
            }
        }
    }

    /// Start playback, returning the new session id and the recorded variables
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::NotFound` if the recording does not exist; no
    /// session is registered in that case
    pub async fn start_playback(
        &self,
        source: PlaybackSource,
        assets_file: Option<&str>,
    ) -> Result<(String, BTreeMap<String, String>)> {
        let id = Uuid::new_v4().to_string();

        let mut playback = match &source {
            PlaybackSource::File(file) => {
                let path = self.resolve_recording_path(file, assets_file).await?;
                let loaded = read_session(&path)?;
                info!(
                    "Playback {id} started from {} with {} entries",
                    path.display(),
                    loaded.session.entries.len()
                );
                (loaded.session, Some(path), Some(loaded.hash), None)
            }
            PlaybackSource::InMemory(source_id) => {
                let stored = self
                    .in_memory_sessions
                    .get(source_id)
                    .map(|entry| Arc::clone(entry.value()))
                    .ok_or_else(|| {
                        ProxyError::NotFound(format!(
                            "There is no in-memory session with id {source_id} available for playback retrieval."
                        ))
                    })?;
                let session = stored.lock().await.clone();
                info!(
                    "Playback {id} started from in-memory recording {source_id} with {} entries",
                    session.entries.len()
                );
                (session, None, None, Some(source_id.clone()))
            }
        };

        for entry in &mut playback.0.entries {
            normalize_multipart(&mut entry.request);
        }

        let (session, path, hash, source_id) = playback;
        let variables = session.variables.clone();
        let mut modifiable = ModifiableRecordSession::new(session, path);
        if let Some(hash) = hash {
            modifiable = modifiable.with_hash(hash);
        }
        if let Some(source_id) = source_id {
            modifiable = modifiable.with_source(source_id);
        }

        self.playback_sessions.insert(id.clone(), Arc::new(modifiable));
        Ok((id, variables))
    }

    /// Stop playback. With `purge` an in-memory source recording is dropped too.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::NotFound` for an unknown id
    pub async fn stop_playback(&self, id: &str, purge: bool) -> Result<()> {
        let (_, playback) = self.playback_sessions.remove(id).ok_or_else(|| {
            ProxyError::NotFound(format!("There is no active playback session under id {id}."))
        })?;

        if purge {
            if let Some(source_id) = playback.source_id() {
                self.in_memory_sessions.remove(source_id);
                debug!("Purged in-memory recording {source_id}");
            }
        }

        info!(
            "Playback {id} stopped after {} requests",
            playback.request_count()
        );
        Ok(())
    }

    /// Route proxied traffic by `x-recording-mode`, or by which registry
    /// holds the `x-recording-id`
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` without an id or with an unknown
    /// mode, and whatever recording or playback returns
    pub async fn handle_request(&self, request: IncomingRequest) -> Result<OutgoingResponse> {
        let id = request
            .header(RECORDING_ID)
            .map(str::to_string)
            .ok_or_else(|| {
                ProxyError::BadRequest(format!(
                    "Proxied requests must carry the {RECORDING_ID} header."
                ))
            })?;

        match request.header(RECORDING_MODE).map(str::to_ascii_lowercase).as_deref() {
            Some("record") => self.handle_record_request(&id, request).await,
            Some("playback") => self.handle_playback_request(&id, request).await,
            Some(other) => Err(ProxyError::BadRequest(format!(
                "{other} is not a supported value for header {RECORDING_MODE}. Use \"record\" or \"playback\"."
            ))),
            None if self.is_recording(&id) => self.handle_record_request(&id, request).await,
            None => self.handle_playback_request(&id, request).await,
        }
    }

    /// Forward a request upstream, record the exchange and return the live response
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::NotFound` for an unknown id,
    /// `ProxyError::BadRequest` for missing or invalid control headers and
    /// `ProxyError::Upstream` if the service cannot be reached
    pub async fn handle_record_request(&self, id: &str, request: IncomingRequest) -> Result<OutgoingResponse> {
        let recording = self
            .recording_sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ProxyError::NotFound(format!("There is no active recording session under id {id}."))
            })?;

        let skip = SkipMode::parse(request.header(RECORDING_SKIP))?;
        let uri = target_uri(&request)?;

        let stored_headers = strip_proxy_headers(&request.headers);
        let mut upstream_headers = stored_headers.clone();
        if let Some(host) = request.header(UPSTREAM_HOST_HEADER) {
            upstream_headers.set("Host", host);
        }

        let upstream = self
            .client
            .forward(&request.method, &uri, &upstream_headers, request.body.clone())
            .await?;
        debug!("Recording {id}: {} {uri} -> {}", request.method, upstream.status);

        if skip != SkipMode::RequestResponse {
            let mut entry = RecordEntry::new(request.method.clone(), uri);
            entry.request.headers = stored_headers;
            if skip == SkipMode::None {
                entry.request.body = body_or_none(decompress_body(&request.body, &request.headers));
            }
            entry.response.headers = upstream.headers.clone();
            entry.response.body = body_or_none(decompress_body(&upstream.body, &upstream.headers));
            entry.status_code = upstream.status;

            let policy = self.effective_policy(&recording).await;
            sanitizer::apply_to_entry(&policy.sanitizers, &mut entry);
            recording.lock().await.entries.push(entry);
        }
        recording.record_request();

        let mut headers = upstream.headers;
        headers.remove("Transfer-Encoding");
        headers.remove("Connection");
        Ok(OutgoingResponse {
            status: upstream.status,
            headers,
            body: upstream.body,
        })
    }

    /// Answer a request from the playback session's entry pool
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::NotFound` for an unknown id and
    /// `ProxyError::Mismatch` with the matcher diagnostic if nothing matches
    pub async fn handle_playback_request(
        &self,
        id: &str,
        request: IncomingRequest,
    ) -> Result<OutgoingResponse> {
        let playback = self
            .playback_sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ProxyError::NotFound(format!("There is no active playback session under id {id}."))
            })?;

        let remove = !request
            .header(RECORDING_REMOVE)
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("false"));

        let mut live = RecordEntry::new(request.method.clone(), target_uri(&request)?);
        live.request.headers = strip_proxy_headers(&request.headers);
        live.request.body = body_or_none(decompress_body(&request.body, &request.headers));
        normalize_json(&mut live.request);
        normalize_multipart(&mut live.request);

        let policy = self.effective_policy(&playback).await;
        let matched = playback
            .lock()
            .await
            .lookup(&live, &policy.matcher, &policy.sanitizers, remove)?;
        playback.record_request();

        let mut served = matched;
        for transform in &policy.transforms {
            transform.apply(&live, &mut served);
        }

        let mut headers = served.response.headers;
        headers.remove("Transfer-Encoding");
        let body = match served.response.body {
            Some(body) => compress_body(&body, &headers)?,
            None => Vec::new(),
        };
        if request.method != Method::HEAD {
            headers.set("Content-Length", body.len().to_string());
        }

        debug!(
            "Playback {id}: {} {} -> {}",
            live.request_method, live.request_uri, served.status_code
        );
        Ok(OutgoingResponse {
            status: served.status_code,
            headers,
            body,
        })
    }

    fn session_for(&self, id: &str) -> Result<Arc<ModifiableRecordSession>> {
        self.recording_sessions
            .get(id)
            .or_else(|| self.playback_sessions.get(id))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ProxyError::NotFound(format!("Unable to find a session with id {id}.")))
    }

    fn next_sanitizer_id(&self) -> String {
        (self.sanitizer_counter.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Register a sanitizer globally or for one session, returning its id
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` for an unknown identifier or invalid
    /// parameters, `ProxyError::NotFound` for an unknown session
    pub async fn add_sanitizer(&self, identifier: &str, body: &[u8], session_id: Option<&str>) -> Result<String> {
        let sanitizer = self.registry.build_sanitizer(identifier, body)?;
        let id = self.next_sanitizer_id();
        let registered = RegisteredSanitizer::new(id.clone(), sanitizer);

        match session_id {
            Some(session_id) => {
                let session = self.session_for(session_id)?;
                session
                    .update_policy(|policy| policy.sanitizers.push(registered))
                    .await;
                info!("Added {identifier} as sanitizer {id} to session {session_id}");
            }
            None => {
                let mut base = self.base_policy.write().await;
                *base = Arc::new(base.with_sanitizer(registered));
                info!("Added {identifier} as sanitizer {id}");
            }
        }
        Ok(id)
    }

    /// Remove sanitizers by id, returning the ids that were present
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::NotFound` for an unknown session
    pub async fn remove_sanitizers(&self, ids: &[String], session_id: Option<&str>) -> Result<Vec<String>> {
        let removed = match session_id {
            Some(session_id) => {
                self.session_for(session_id)?
                    .update_policy(|policy| policy.remove_sanitizers(ids))
                    .await
            }
            None => {
                let mut base = self.base_policy.write().await;
                let (next, removed) = base.without_sanitizers(ids);
                *base = Arc::new(next);
                removed
            }
        };

        if removed.len() < ids.len() {
            warn!(
                "Only {} of {} sanitizers were registered and removed",
                removed.len(),
                ids.len()
            );
        }
        Ok(removed)
    }

    /// Register a transform globally or for one session
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` for an unknown identifier or invalid
    /// parameters, `ProxyError::NotFound` for an unknown session
    pub async fn add_transform(&self, identifier: &str, body: &[u8], session_id: Option<&str>) -> Result<()> {
        let transform = self.registry.build_transform(identifier, body)?;

        match session_id {
            Some(session_id) => {
                self.session_for(session_id)?
                    .update_policy(|policy| policy.transforms.push(Arc::new(transform)))
                    .await;
            }
            None => {
                let mut base = self.base_policy.write().await;
                *base = Arc::new(base.with_transform(transform));
            }
        }
        info!("Added transform {identifier}");
        Ok(())
    }

    /// Replace the matcher globally or for one session
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` for an unknown identifier or invalid
    /// parameters, `ProxyError::NotFound` for an unknown session
    pub async fn set_matcher(&self, identifier: &str, body: &[u8], session_id: Option<&str>) -> Result<()> {
        let matcher = self.registry.build_matcher(identifier, body)?;

        match session_id {
            Some(session_id) => {
                self.session_for(session_id)?
                    .update_policy(|policy| policy.matcher = Some(Arc::new(matcher)))
                    .await;
            }
            None => {
                let mut base = self.base_policy.write().await;
                *base = Arc::new(base.with_matcher(matcher));
            }
        }
        info!("Matcher set to {identifier}");
        Ok(())
    }

    /// Drop a session's policy additions, or restore the default base policy
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` for a global reset while sessions are
    /// active, `ProxyError::NotFound` for an unknown session
    pub async fn reset(&self, session_id: Option<&str>) -> Result<()> {
        if let Some(session_id) = session_id {
            self.session_for(session_id)?
                .update_policy(|policy| *policy = SessionPolicy::default())
                .await;
            info!("Session {session_id} policy reset");
            return Ok(());
        }

        let active = self.active_sessions();
        if active > 0 {
            return Err(ProxyError::BadRequest(format!(
                "Unable to reset the default policy while {active} session(s) are active."
            )));
        }

        *self.base_policy.write().await = Arc::new(Policy::default_policy()?);
        self.sanitizer_counter.store(0, Ordering::Relaxed);
        info!("Default policy restored");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipMode {
    None,
    RequestBody,
    RequestResponse,
}

impl SkipMode {
    fn parse(value: Option<&str>) -> Result<Self> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::None),
            Some(v) if v.eq_ignore_ascii_case("request-body") => Ok(Self::RequestBody),
            Some(v) if v.eq_ignore_ascii_case("request-response") => Ok(Self::RequestResponse),
            Some(v) => Err(ProxyError::BadRequest(format!(
                "{v} is not a supported value for header {RECORDING_SKIP}. Use \"request-body\" or \"request-response\"."
            ))),
        }
    }
}

fn target_uri(request: &IncomingRequest) -> Result<String> {
    let base = request.header(UPSTREAM_BASE_URI).ok_or_else(|| {
        ProxyError::BadRequest(format!(
            "Target URI header {UPSTREAM_BASE_URI} is missing from the request."
        ))
    })?;
    Ok(upstream_uri(base, &request.target))
}

/// Remove hop-by-hop and proxy control headers
fn strip_proxy_headers(headers: &Headers) -> Headers {
    let mut stripped = headers.clone();
    stripped.retain(|name, _| {
        !HOP_HEADERS.iter().any(|hop| hop.eq_ignore_ascii_case(name))
            && !name.to_ascii_lowercase().starts_with(CONTROL_HEADER_PREFIX)
    });
    stripped
}

fn body_or_none(body: Vec<u8>) -> Option<Vec<u8>> {
    (!body.is_empty()).then_some(body)
}

/// Compact a JSON body so whitespace never affects matching
fn normalize_json(message: &mut RequestOrResponse) {
    if !message.has_json_content() {
        return;
    }
    let Some(body) = message.body.as_deref() else {
        return;
    };
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Ok(compact) = serde_json::to_vec(&value) {
            message.body = Some(compact);
        }
    }
}

/// Rewrite multipart filename separators to one form
fn normalize_multipart(message: &mut RequestOrResponse) {
    let Some(boundary) = message.content_type().and_then(multipart_boundary) else {
        return;
    };
    let Some(body) = message.body.as_deref() else {
        return;
    };
    if let Some(normalized) = normalize_filename_separators(body, &boundary) {
        message.body = Some(normalized);
    }
}
