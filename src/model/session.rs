//! Ordered collections of recorded exchanges

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::matcher::RecordMatcher;
use crate::sanitizer::{self, Sanitizer};
use crate::Result;

use super::RecordEntry;

/// An ordered sequence of exchanges plus the variables captured with them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSession {
    /// Exchanges in recorded order
    pub entries: Vec<RecordEntry>,
    /// Recorded randomness (generated names, GUIDs) replayed to the test
    pub variables: BTreeMap<String, String>,
}

impl RecordSession {
    /// Create an empty session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the stored entry answering `request`.
    ///
    /// The request is run through `sanitizers` first so it compares against
    /// the scrubbed recording. With `remove` the matched entry leaves the pool,
    /// so an identical follow-up request advances to the next occurrence.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Mismatch` with the matcher diagnostic if nothing matches
    pub fn lookup(
        &mut self,
        request: &RecordEntry,
        matcher: &RecordMatcher,
        sanitizers: &[Arc<Sanitizer>],
        remove: bool,
    ) -> Result<RecordEntry> {
        let mut request = request.clone();
        sanitizer::apply_to_entry(sanitizers, &mut request);

        let index = matcher.find_match(&request, &self.entries)?;
        debug!(
            "Matched {} {} to entry {} of {}",
            request.request_method,
            request.request_uri,
            index,
            self.entries.len()
        );

        if remove {
            Ok(self.entries.remove(index))
        } else {
            Ok(self.entries[index].clone())
        }
    }

    /// Run the full sanitizer pipeline over every entry and the session itself.
    ///
    /// Entry level sanitizers run again here so that ones registered after
    /// an entry was appended still reach it.
    pub fn sanitize(&mut self, sanitizers: &[Arc<Sanitizer>]) {
        for entry in &mut self.entries {
            sanitizer::apply_to_entry(sanitizers, entry);
        }
        sanitizer::apply_to_session(sanitizers, self);
    }
}
