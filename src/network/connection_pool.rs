//! Admission control for client connections

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::MAX_CONNECTIONS;

/// Caps how many test clients the proxy serves at once
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    permits: Arc<Semaphore>,
    open: Arc<AtomicUsize>,
    limit: usize,
}

impl ConnectionPool {
    /// Create a pool admitting at most `limit` connections, clamped to
    /// `1..=MAX_CONNECTIONS`
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let limit = limit.clamp(1, MAX_CONNECTIONS);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            open: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// Admit one connection, or `None` when the pool is full
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        self.open.fetch_add(1, Ordering::Relaxed);
        Some(ConnectionGuard {
            _permit: permit,
            open: Arc::clone(&self.open),
        })
    }

    /// Connections currently admitted
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }

    /// Configured limit after clamping
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.limit
    }
}

/// Held for the lifetime of one connection
#[derive(Debug)]
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
    open: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::Relaxed);
    }
}
