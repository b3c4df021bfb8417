//! Cancellation tokens keyed by caller-chosen strings.
//!
//! Creating a token under a key that already has one cancels the old token
//! first. Cancelling removes the entry; a request that finishes removes its own
//! entry unless a newer token has replaced it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct Registry {
    tokens: HashMap<String, (u64, CancellationToken)>,
    generation: u64,
}

/// Token handed to one cancellable request.
#[derive(Debug, Clone)]
pub struct CancelTicket {
    key: String,
    generation: u64,
    token: CancellationToken,
}

impl CancelTicket {
    /// Key the ticket was created under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The underlying token.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Registry of cancellation tokens. Cheap to clone.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for CancelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelRegistry")
            .field("pending", &self.keys())
            .finish()
    }
}

impl CancelRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fresh token under `key`, cancelling the one it replaces.
    pub fn create(&self, key: impl Into<String>) -> CancelTicket {
        let key = key.into();
        let token = CancellationToken::new();
        let mut registry = self.registry();
        registry.generation += 1;
        let generation = registry.generation;
        if let Some((_, previous)) = registry
            .tokens
            .insert(key.clone(), (generation, token.clone()))
        {
            debug!(key = %key, "replacing pending cancellation token");
            previous.cancel();
        }
        CancelTicket {
            key,
            generation,
            token,
        }
    }

    /// Cancel and remove the token under `key`. Returns `false` if there was none.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.registry().tokens.remove(key);
        match removed {
            Some((_, token)) => {
                debug!(key, "request cancelled");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered token. Returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.registry().tokens.drain().collect();
        for (_, (_, token)) in &drained {
            token.cancel();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "cancelled all pending requests");
        }
        drained.len()
    }

    /// Drop the entry of a finished request, unless a newer token took its key.
    pub fn finish(&self, ticket: &CancelTicket) {
        let mut registry = self.registry();
        if registry
            .tokens
            .get(&ticket.key)
            .is_some_and(|(generation, _)| *generation == ticket.generation)
        {
            registry.tokens.remove(&ticket.key);
        }
    }

    /// Keys with a pending token, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.registry().tokens.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of pending tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry().tokens.len()
    }

    /// Returns `true` if no token is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
