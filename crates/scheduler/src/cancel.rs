//! Cooperative cancellation for frame requests
//!
//! Each request gets a token when it is submitted. Withdrawing a queued
//! request or cancelling a whole volume flips the token; executors check it
//! before and after decoding and drop the result once it is set.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::priority::RequestId;

/// Shared cancellation flag.
///
/// All clones observe the same state.
///
/// ```
/// use voxstream_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let decoder_side = token.clone();
///
/// token.cancel();
/// assert!(decoder_side.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Request id to token map for every request that has not completed yet.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<RequestId, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and store a fresh token for `id`.
    pub fn register(&self, id: RequestId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(id, token.clone());
        token
    }

    /// Returns `true` if the request was registered.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.tokens.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every listed request, returning how many were registered.
    pub fn cancel_many(&self, ids: &[RequestId]) -> usize {
        let tokens = self.tokens.lock();
        ids.iter()
            .filter_map(|id| tokens.get(id))
            .map(CancellationToken::cancel)
            .count()
    }

    pub fn cancel_all(&self) -> usize {
        let tokens = self.tokens.lock();
        tokens.values().for_each(CancellationToken::cancel);
        tokens.len()
    }

    pub fn unregister(&self, id: RequestId) -> bool {
        self.tokens.lock().remove(&id).is_some()
    }

    pub fn unregister_many(&self, ids: &[RequestId]) {
        let mut tokens = self.tokens.lock();
        for id in ids {
            tokens.remove(id);
        }
    }

    pub fn get(&self, id: RequestId) -> Option<CancellationToken> {
        self.tokens.lock().get(&id).cloned()
    }

    pub fn is_cancelled(&self, id: RequestId) -> bool {
        self.tokens
            .lock()
            .get(&id)
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    /// Drop all tokens without cancelling them.
    pub fn clear(&self) {
        self.tokens.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shared_between_clones() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_registry_cancel() {
        let registry = CancellationRegistry::new();
        let token = registry.register(7);

        assert!(!registry.is_cancelled(7));
        assert!(registry.cancel(7));
        assert!(token.is_cancelled());
        assert!(registry.is_cancelled(7));
        assert!(!registry.cancel(8));
    }

    #[test]
    fn test_registry_cancel_many_counts_known_ids() {
        let registry = CancellationRegistry::new();
        let first = registry.register(1);
        let second = registry.register(2);
        let third = registry.register(3);

        assert_eq!(registry.cancel_many(&[1, 3, 99]), 2);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(third.is_cancelled());
    }

    #[test]
    fn test_registry_unregister_and_clear() {
        let registry = CancellationRegistry::new();
        let token = registry.register(1);
        registry.register(2);
        registry.register(3);

        assert!(registry.unregister(1));
        assert!(!registry.unregister(1));
        assert!(registry.get(1).is_none());

        registry.unregister_many(&[2]);
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_all() {
        let registry = CancellationRegistry::new();
        let tokens: Vec<_> = (0..4).map(|id| registry.register(id)).collect();

        assert_eq!(registry.cancel_all(), 4);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }
}
