//! Base and per-session sanitizer, transform and matcher sets
//!
//! The base policy is an immutable snapshot replaced wholesale on change.
//! Sessions carry only their additions; the effective policy for a request
//! is the base followed by the session's additions.

use std::sync::Arc;

use crate::matcher::RecordMatcher;
use crate::sanitizer::{JsonPath, Sanitizer, SanitizerKind};
use crate::transform::{Transform, TransformKind};
use crate::Result;

/// A sanitizer together with the id it was registered under
#[derive(Debug, Clone)]
pub struct RegisteredSanitizer {
    /// Id returned to the caller, used for removal
    pub id: String,
    /// The sanitizer
    pub sanitizer: Arc<Sanitizer>,
}

impl RegisteredSanitizer {
    /// Pair an id and a sanitizer
    #[must_use]
    pub fn new(id: impl Into<String>, sanitizer: Sanitizer) -> Self {
        Self {
            id: id.into(),
            sanitizer: Arc::new(sanitizer),
        }
    }
}

/// The process-wide policy
#[derive(Debug, Clone)]
pub struct Policy {
    /// Sanitizers in registration order
    pub sanitizers: Vec<RegisteredSanitizer>,
    /// Transforms in registration order
    pub transforms: Vec<Arc<Transform>>,
    /// Active matcher
    pub matcher: Arc<RecordMatcher>,
}

fn default_id(index: usize) -> String {
    format!("AZSDK{index:04}")
}

fn body_key(path: &str) -> Result<Sanitizer> {
    Ok(Sanitizer::new(
        SanitizerKind::BodyKey {
            json_path: JsonPath::parse(path)?,
            value: crate::model::SANITIZE_VALUE.to_string(),
            regex: None,
            group: None,
        },
        None,
    ))
}

impl Policy {
    /// Policy installed at startup and restored by a global reset
    ///
    /// # Errors
    ///
    /// Returns error if a built-in JSON path fails to parse
    pub fn default_policy() -> Result<Self> {
        let sanitizers = [
            Sanitizer::authorization(),
            body_key("$..access_token")?,
            body_key("$..refresh_token")?,
        ]
        .into_iter()
        .enumerate()
        .map(|(i, sanitizer)| RegisteredSanitizer::new(default_id(i), sanitizer))
        .collect();

        let transforms = [
            TransformKind::StorageRequestId,
            TransformKind::ClientId,
            TransformKind::RetryAfterZero,
        ]
        .into_iter()
        .map(|kind| Arc::new(Transform::new(kind, None)))
        .collect();

        Ok(Self {
            sanitizers,
            transforms,
            matcher: Arc::new(RecordMatcher::default()),
        })
    }

    /// Copy with one more sanitizer
    #[must_use]
    pub fn with_sanitizer(&self, sanitizer: RegisteredSanitizer) -> Self {
        let mut next = self.clone();
        next.sanitizers.push(sanitizer);
        next
    }

    /// Copy with one more transform
    #[must_use]
    pub fn with_transform(&self, transform: Transform) -> Self {
        let mut next = self.clone();
        next.transforms.push(Arc::new(transform));
        next
    }

    /// Copy with a different matcher
    #[must_use]
    pub fn with_matcher(&self, matcher: RecordMatcher) -> Self {
        let mut next = self.clone();
        next.matcher = Arc::new(matcher);
        next
    }

    /// Copy without the given sanitizer ids, plus the ids actually removed
    #[must_use]
    pub fn without_sanitizers(&self, ids: &[String]) -> (Self, Vec<String>) {
        let mut next = self.clone();
        let removed = remove_ids(&mut next.sanitizers, ids);
        (next, removed)
    }
}

/// Additions scoped to one session
#[derive(Debug, Clone, Default)]
pub struct SessionPolicy {
    /// Extra sanitizers
    pub sanitizers: Vec<RegisteredSanitizer>,
    /// Extra transforms
    pub transforms: Vec<Arc<Transform>>,
    /// Matcher overriding the base one
    pub matcher: Option<Arc<RecordMatcher>>,
}

impl SessionPolicy {
    /// Remove sanitizers by id, returning the ids removed
    pub fn remove_sanitizers(&mut self, ids: &[String]) -> Vec<String> {
        remove_ids(&mut self.sanitizers, ids)
    }
}

fn remove_ids(sanitizers: &mut Vec<RegisteredSanitizer>, ids: &[String]) -> Vec<String> {
    let mut removed = Vec::new();
    sanitizers.retain(|registered| {
        if ids.contains(&registered.id) {
            removed.push(registered.id.clone());
            false
        } else {
            true
        }
    });
    removed
}

/// What applies to one request: base followed by session additions
#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    /// Sanitizers in application order
    pub sanitizers: Vec<Arc<Sanitizer>>,
    /// Transforms in application order
    pub transforms: Vec<Arc<Transform>>,
    /// Matcher in force
    pub matcher: Arc<RecordMatcher>,
}

impl EffectivePolicy {
    /// Concatenate a base policy and a session's additions
    #[must_use]
    pub fn resolve(base: &Policy, session: &SessionPolicy) -> Self {
        let sanitizers = base
            .sanitizers
            .iter()
            .chain(&session.sanitizers)
            .map(|registered| Arc::clone(&registered.sanitizer))
            .collect();
        let transforms = base
            .transforms
            .iter()
            .chain(&session.transforms)
            .cloned()
            .collect();
        let matcher = session
            .matcher
            .clone()
            .unwrap_or_else(|| Arc::clone(&base.matcher));

        Self {
            sanitizers,
            transforms,
            matcher,
        }
    }
}
