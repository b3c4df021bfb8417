//! Concurrency-bounded FIFO request queue.
//!
//! At most `max_concurrent` thunks run at a time; the rest wait in submission
//! order. Each running thunk holds a slot guard, and releasing the slot (on
//! success, failure or panic) immediately starts the next queued item.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{Error, Result};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Configured bound.
    pub max_concurrent: usize,
    /// Thunks currently running.
    pub running: usize,
    /// Thunks waiting for a slot.
    pub pending: usize,
    /// Highest `running` value observed.
    pub peak_running: usize,
    /// Thunks that finished.
    pub completed: u64,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    running: usize,
    peak_running: usize,
    completed: u64,
}

struct QueueInner {
    max_concurrent: usize,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start queued jobs while slots are free.
    fn drain(self: &Arc<Self>) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        loop {
            let job = {
                let mut state = self.state();
                if state.running >= self.max_concurrent {
                    return;
                }
                let Some(job) = state.pending.pop_front() else {
                    return;
                };
                state.running += 1;
                state.peak_running = state.peak_running.max(state.running);
                trace!(running = state.running, pending = state.pending.len(), "queue slot taken");
                job
            };

            let slot = Slot(Arc::clone(self));
            runtime.spawn(async move {
                let _slot = slot;
                job().await;
            });
        }
    }
}

/// Releases a running slot and drains the queue on drop.
struct Slot(Arc<QueueInner>);

impl Drop for Slot {
    fn drop(&mut self) {
        {
            let mut state = self.0.state();
            state.running = state.running.saturating_sub(1);
            state.completed += 1;
        }
        self.0.drain();
    }
}

/// FIFO queue bounding how many requests run at once. Cheap to clone.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

impl RequestQueue {
    /// Queue running at most `max_concurrent` thunks at a time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `max_concurrent` is zero, since such a
    /// queue would never run anything.
    pub fn new(max_concurrent: usize) -> Result<Self> {
        if max_concurrent == 0 {
            return Err(Error::validation("queue max_concurrent must be at least 1"));
        }
        Ok(Self {
            inner: Arc::new(QueueInner {
                max_concurrent,
                state: Mutex::default(),
            }),
        })
    }

    /// Enqueue `thunk`; the returned future settles with its result.
    ///
    /// The thunk starts as soon as a slot is free, whether or not the returned
    /// future is polled. If the queue is cleared first, the future resolves to
    /// [`Error::Cancelled`].
    ///
    /// Dropping the returned future abandons the item: a waiting thunk is
    /// skipped and a running one is dropped at its next await point.
    pub fn add<F, Fut, T>(&self, thunk: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (mut tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                if tx.is_closed() {
                    trace!("skipping abandoned request");
                    return;
                }
                let result = tokio::select! {
                    biased;
                    () = tx.closed() => None,
                    result = thunk() => Some(result),
                };
                match result {
                    // The caller may stop waiting between the two.
                    Some(result) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("queued request abandoned while running"),
                }
            })
        });

        {
            let mut state = self.inner.state();
            state.pending.push_back(job);
            trace!(pending = state.pending.len(), "request queued");
        }
        self.inner.drain();

        async move {
            rx.await
                .unwrap_or_else(|_| Err(Error::cancelled("queued request was dropped")))
        }
    }

    /// Configured bound.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Thunks currently running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.state().running
    }

    /// Thunks waiting for a slot.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Drop every waiting thunk; their callers get [`Error::Cancelled`].
    /// Running thunks are left alone. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut self.inner.state().pending);
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "cleared queued requests");
        }
        dropped.len()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state();
        QueueStats {
            max_concurrent: self.inner.max_concurrent,
            running: state.running,
            pending: state.pending.len(),
            peak_running: state.peak_running,
            completed: state.completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert2::{check, let_assert};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_bound_and_keeps_order() {
        let queue = RequestQueue::new(2).expect("queue");
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Mutex::new(Vec::new()));

        let futures: Vec<_> = (0..5_u64)
            .map(|n| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                let started = Arc::clone(&started);
                queue.add(move || async move {
                    started.lock().unwrap_or_else(PoisonError::into_inner).push(n);
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    // Later items finish faster, order must still hold.
                    tokio::time::sleep(Duration::from_millis(100 - n * 10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(n * 10)
                })
            })
            .collect();

        check!(queue.pending() == 3);
        let results = futures_util::future::join_all(futures).await;

        let results: Vec<u64> = results.into_iter().map(|r| r.expect("thunk result")).collect();
        check!(results == [0, 10, 20, 30, 40]);
        check!(peak.load(Ordering::SeqCst) == 2);
        check!(*started.lock().unwrap_or_else(PoisonError::into_inner) == [0, 1, 2, 3, 4]);

        let stats = queue.stats();
        check!(stats.peak_running == 2);
        check!(stats.completed == 5);
        check!(stats.running == 0);
    }

    #[tokio::test]
    async fn failures_release_their_slot() {
        let queue = RequestQueue::new(1).expect("queue");

        let first = queue.add(|| async { Err::<u32, _>(Error::connection("reset")) });
        let second = queue.add(|| async { Ok(7_u32) });

        let_assert!(Err(err) = first.await);
        check!(err.is_connection());
        let_assert!(Ok(7) = second.await);
        check!(queue.running() == 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_waiting_items() {
        let queue = RequestQueue::new(1).expect("queue");

        let slow = queue.add(|| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok("slow")
        });
        let waiting = queue.add(|| async { Ok("never") });

        check!(queue.clear() == 1);
        let_assert!(Err(err) = waiting.await);
        check!(err.is_cancelled());
        let_assert!(Ok("slow") = slow.await);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_items_do_not_run() {
        let queue = RequestQueue::new(1).expect("queue");
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let thunk = || {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            move || async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        };

        let running = queue.add(thunk());
        let waiting = queue.add(thunk());
        tokio::task::yield_now().await;
        check!(started.load(Ordering::SeqCst) == 1);

        drop(waiting);
        drop(running);
        tokio::time::sleep(Duration::from_secs(10)).await;

        check!(started.load(Ordering::SeqCst) == 1);
        check!(finished.load(Ordering::SeqCst) == 0);
        check!(queue.running() == 0);
        check!(queue.pending() == 0);

        let_assert!(Ok("next") = queue.add(|| async { Ok("next") }).await);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        check!(matches!(RequestQueue::new(0), Err(Error::Validation(_))));
    }
}
