//! Ordered interceptor chains with register/eject semantics.
//!
//! A chain hands out an opaque [`InterceptorId`] per registration. The id stays
//! valid until ejected; ejecting twice is a no-op that returns `false`.
//!
//! Dispatch order is part of the chain contract rather than an accident of the
//! engine: [`Phase::Request`] and [`Phase::Dispatch`] chains run in registration
//! order, [`Phase::Response`] chains run in reverse registration order so the
//! most recently added interceptor sees the rawest result first.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Opaque, chain-assigned registration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InterceptorId(u64);

impl fmt::Display for InterceptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which part of the request lifecycle a chain serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Wraps the whole pipeline from the outside (deduplication).
    Dispatch,
    /// Runs before the transport, in registration order.
    Request,
    /// Runs after the transport, in reverse registration order.
    Response,
}

impl Phase {
    /// Returns `true` when handlers run last-registered-first.
    #[must_use]
    pub const fn is_lifo(self) -> bool {
        matches!(self, Self::Response)
    }
}

/// An ordered, id-addressed list of handlers.
pub struct InterceptorChain<H: ?Sized> {
    phase: Phase,
    next_id: AtomicU64,
    entries: Mutex<Vec<(InterceptorId, Arc<H>)>>,
}

impl<H: ?Sized> InterceptorChain<H> {
    /// Creates an empty chain for `phase`.
    #[must_use]
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(InterceptorId, Arc<H>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The phase this chain serves.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Appends a handler and returns its id.
    pub fn use_interceptor(&self, handler: Arc<H>) -> InterceptorId {
        let id = InterceptorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push((id, handler));
        id
    }

    /// Removes the handler registered under `id`.
    ///
    /// Returns `false` if the id is unknown or was already ejected.
    pub fn eject(&self, id: InterceptorId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Returns `true` if `id` is currently registered.
    #[must_use]
    pub fn contains(&self, id: InterceptorId) -> bool {
        self.entries().iter().any(|(entry_id, _)| *entry_id == id)
    }

    /// Registered ids, in registration order.
    #[must_use]
    pub fn ids(&self) -> Vec<InterceptorId> {
        self.entries().iter().map(|(id, _)| *id).collect()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Removes every handler.
    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Snapshot of the handlers in dispatch order for this chain's phase.
    #[must_use]
    pub fn handlers(&self) -> Vec<Arc<H>> {
        let entries = self.entries();
        let handlers = entries.iter().map(|(_, handler)| Arc::clone(handler));
        if self.phase.is_lifo() {
            handlers.rev().collect()
        } else {
            handlers.collect()
        }
    }
}

impl<H: ?Sized> fmt::Debug for InterceptorChain<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("phase", &self.phase)
            .field("ids", &self.ids())
            .finish()
    }
}
