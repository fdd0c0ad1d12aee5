//! Short-lived exclusive locks keyed by concept.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// In-process lock table for concept keys.
///
/// Held only for the check-and-write of a single extraction. Contention is
/// retried a bounded number of times and then reported as
/// [`Error::ConcurrencyConflict`].
#[derive(Debug, Clone)]
pub struct ConceptLocks {
    held: Arc<Mutex<HashSet<String>>>,
    retries: u32,
    backoff: Duration,
}

impl Default for ConceptLocks {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(10))
    }
}

impl ConceptLocks {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
            retries,
            backoff,
        }
    }

    /// Acquire the lock for `concept`, retrying with linear backoff.
    pub fn acquire(&self, concept: &str) -> Result<ConceptGuard> {
        for attempt in 0..=self.retries {
            if self.try_acquire(concept)? {
                return Ok(ConceptGuard {
                    held: Arc::clone(&self.held),
                    concept: concept.to_string(),
                });
            }
            if attempt < self.retries {
                debug!(concept, attempt, "concept lock busy, backing off");
                std::thread::sleep(self.backoff * (attempt + 1));
            }
        }
        Err(Error::conflict(format!("concept:{}", concept)))
    }

    fn try_acquire(&self, concept: &str) -> Result<bool> {
        let mut held = self
            .held
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock concept table: {}", e)))?;
        Ok(held.insert(concept.to_string()))
    }

    pub fn is_held(&self, concept: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(concept))
            .unwrap_or(false)
    }
}

/// Releases its concept on drop.
#[derive(Debug)]
pub struct ConceptGuard {
    held: Arc<Mutex<HashSet<String>>>,
    concept: String,
}

impl ConceptGuard {
    pub fn concept(&self) -> &str {
        &self.concept
    }
}

impl Drop for ConceptGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.concept);
        }
    }
}
