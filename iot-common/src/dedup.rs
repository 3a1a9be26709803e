//! # Deduplication
//!
//! Tracks the timestamps that have been persisted and rejects repeats.
use std::collections::HashSet;
use std::future::Future;

use tokio::sync::Mutex;

/// Result of asking the guard to admit a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The write ran, succeeded, and the timestamp is now marked as seen.
    Admitted,
    /// The timestamp was already seen, the write did not run.
    Duplicate,
}

/// A set of seen timestamps that only grows for the lifetime of the process.
///
/// `admit` is the critical section: check, write and mark all happen while
/// holding the lock, so concurrent consumers cannot both persist the same
/// timestamp, and a failed write never marks the timestamp.
#[derive(Debug, Default)]
pub struct DuplicateGuard {
    seen: Mutex<HashSet<String>>,
}

impl DuplicateGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from timestamps that are already persisted.
    pub fn with_seen(seen: HashSet<String>) -> Self {
        Self {
            seen: Mutex::new(seen),
        }
    }

    pub async fn is_duplicate(&self, timestamp: &str) -> bool {
        self.seen.lock().await.contains(timestamp)
    }

    pub async fn record(&self, timestamp: &str) {
        self.seen.lock().await.insert(timestamp.to_owned());
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.lock().await.is_empty()
    }

    /// Run `write` only if `timestamp` is unseen, and mark it only if the write succeeds.
    pub async fn admit<F, Fut, E>(&self, timestamp: &str, write: F) -> Result<Admission, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut seen = self.seen.lock().await;

        if seen.contains(timestamp) {
            return Ok(Admission::Duplicate);
        }

        write().await?;
        seen.insert(timestamp.to_owned());

        Ok(Admission::Admitted)
    }
}
