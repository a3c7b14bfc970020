//! A recording held by one of the session registries

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::model::RecordSession;

use super::policy::SessionPolicy;

/// A [`RecordSession`] plus where it lives and what applies to it.
///
/// The entry pool sits behind its own mutex so lookup-and-remove is one
/// critical section per session. Sessions never share a lock.
#[derive(Debug)]
pub struct ModifiableRecordSession {
    session: Mutex<RecordSession>,
    path: Option<PathBuf>,
    hash: Option<String>,
    source_id: Option<String>,
    policy: RwLock<SessionPolicy>,
    request_count: AtomicUsize,
}

impl ModifiableRecordSession {
    /// Wrap a session that persists to `path`, or stays in memory without one
    #[must_use]
    pub fn new(session: RecordSession, path: Option<PathBuf>) -> Self {
        Self {
            session: Mutex::new(session),
            path,
            hash: None,
            source_id: None,
            policy: RwLock::new(SessionPolicy::default()),
            request_count: AtomicUsize::new(0),
        }
    }

    /// Remember the hash of the file behind the session
    #[must_use]
    pub fn with_hash(mut self, hash: String) -> Self {
        self.hash = Some(hash);
        self
    }

    /// Remember the in-memory recording a playback was started from
    #[must_use]
    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    /// Lock the entry pool
    pub async fn lock(&self) -> MutexGuard<'_, RecordSession> {
        self.session.lock().await
    }

    /// On-disk location, `None` for in-memory sessions
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// SHA-256 of the file the session was loaded from, or of the file a
    /// recording will replace
    #[must_use]
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    /// In-memory recording id this playback replays
    #[must_use]
    pub fn source_id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    /// Snapshot of the session's policy additions
    pub async fn policy(&self) -> SessionPolicy {
        self.policy.read().await.clone()
    }

    /// Change the session's policy additions
    pub async fn update_policy<R>(&self, update: impl FnOnce(&mut SessionPolicy) -> R) -> R {
        let mut policy = self.policy.write().await;
        update(&mut policy)
    }

    /// Count one proxied request, returning the new total
    pub fn record_request(&self) -> usize {
        self.request_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Proxied requests handled so far
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }

}
