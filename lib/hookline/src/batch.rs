//! Coalesce independent requests into batched calls.
//!
//! [`BatchCoalescer::add`] buffers a request and returns a future for its own
//! result. The buffer is flushed when it reaches `batch_size`, or `delay`
//! after the first buffered item, whichever comes first. A flush hands up to
//! `batch_size` requests to the [`BatchExecutor`] and distributes the results
//! back in submission order. Items left over after a flush get another flush.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{self, BoxFuture, Either};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{Error, HttpClient, Request, Response, Result};

/// Executes one batch: one result per request, in the same order.
///
/// A call-level `Err` fails every item of the batch with that error.
pub type BatchExecutor =
    Arc<dyn Fn(Vec<Request>) -> BoxFuture<'static, Result<Vec<Result<Response>>>> + Send + Sync>;

/// Wrap an async function as a [`BatchExecutor`].
pub fn batch_executor<F, Fut>(f: F) -> BatchExecutor
where
    F: Fn(Vec<Request>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Result<Response>>>> + Send + 'static,
{
    Arc::new(move |requests| Box::pin(f(requests)))
}

/// Executor sending every request of the batch through `client` concurrently.
pub fn fan_out<C>(client: C) -> BatchExecutor
where
    C: HttpClient + Clone + 'static,
{
    batch_executor(move |requests: Vec<Request>| {
        let client = client.clone();
        async move {
            let calls = requests.into_iter().map(|request| client.execute(request));
            Ok(future::join_all(calls).await)
        }
    })
}

/// Options for [`BatchCoalescer`].
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    batch_size: usize,
    delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            delay: Duration::from_millis(50),
        }
    }
}

impl BatchOptions {
    /// Maximum requests per batch; a full buffer flushes immediately.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// How long to wait for more requests before flushing.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Batch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    /// Batches executed.
    pub flushes: u64,
    /// Requests sent in those batches.
    pub items: u64,
    /// Requests waiting in the buffer.
    pub pending: usize,
}

struct BatchItem {
    request: Request,
    reply: oneshot::Sender<Result<Response>>,
}

#[derive(Default)]
struct BatchState {
    buffer: Vec<BatchItem>,
    timer: Option<JoinHandle<()>>,
    processing: bool,
    closed: bool,
    flushes: u64,
    items: u64,
}

struct BatchInner {
    options: BatchOptions,
    executor: BatchExecutor,
    state: Mutex<BatchState>,
}

impl BatchInner {
    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule a flush unless one is already pending.
    fn schedule(self: &Arc<Self>, state: &mut BatchState) {
        if state.timer.is_some() || state.buffer.is_empty() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime, batch flush not scheduled");
            return;
        };

        let delay = if state.buffer.len() >= self.options.batch_size {
            Duration::ZERO
        } else {
            self.options.delay
        };
        let inner = Arc::clone(self);
        state.timer = Some(runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            inner.flush().await;
        }));
    }

    async fn flush(self: Arc<Self>) {
        let items: Vec<BatchItem> = {
            let mut state = self.state();
            state.timer = None;
            state.processing = true;
            let count = state.buffer.len().min(self.options.batch_size);
            state.buffer.drain(..count).collect()
        };
        let _done = FlushDone(Arc::clone(&self));

        if items.is_empty() {
            return;
        }
        let count = items.len();
        let (requests, replies): (Vec<_>, Vec<_>) = items
            .into_iter()
            .map(|item| (item.request, item.reply))
            .unzip();
        debug!(count, "flushing batch");

        match (self.executor)(requests).await {
            Ok(results) => {
                let mut results = results.into_iter();
                for reply in replies {
                    let result = results
                        .next()
                        .unwrap_or_else(|| Err(Error::protocol("batch result is missing an item")));
                    // The caller may have stopped waiting.
                    let _ = reply.send(result);
                }
            }
            Err(err) => {
                warn!(error = %err, count = replies.len(), "batch call failed");
                for reply in replies {
                    let _ = reply.send(Err(err.clone()));
                }
            }
        }

        let mut state = self.state();
        state.flushes += 1;
        state.items += count as u64;
    }
}

/// Ends a flush, even one whose executor panicked: clears `processing` and
/// schedules the leftovers.
struct FlushDone(Arc<BatchInner>);

impl Drop for FlushDone {
    fn drop(&mut self) {
        let mut state = self.0.state();
        state.processing = false;
        self.0.schedule(&mut state);
    }
}

/// Buffers requests and flushes them as batches. Cheap to clone.
#[derive(Clone)]
pub struct BatchCoalescer {
    inner: Arc<BatchInner>,
}

impl fmt::Debug for BatchCoalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoalescer")
            .field("options", &self.inner.options)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BatchCoalescer {
    /// Coalescer flushing through `executor`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `batch_size` is zero.
    pub fn new(options: BatchOptions, executor: BatchExecutor) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(Error::validation("batch_size must be at least 1"));
        }
        Ok(Self {
            inner: Arc::new(BatchInner {
                options,
                executor,
                state: Mutex::default(),
            }),
        })
    }

    /// Buffer `request`; the returned future settles with its own result.
    ///
    /// Must be called within a tokio runtime.
    pub fn add(&self, request: Request) -> impl Future<Output = Result<Response>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.inner.state();
            if state.closed {
                return Either::Left(future::ready(Err(Error::cancelled(
                    "batch coalescer is shut down",
                ))));
            }
            state.buffer.push(BatchItem { request, reply });

            if !state.processing {
                if state.buffer.len() >= self.inner.options.batch_size {
                    if let Some(timer) = state.timer.take() {
                        timer.abort();
                    }
                }
                self.inner.schedule(&mut state);
            }
        }

        Either::Right(async move {
            rx.await
                .unwrap_or_else(|_| Err(Error::cancelled("batched request was dropped")))
        })
    }

    /// Requests waiting in the buffer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state().buffer.len()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BatchStats {
        let state = self.inner.state();
        BatchStats {
            flushes: state.flushes,
            items: state.items,
            pending: state.buffer.len(),
        }
    }

    /// Stop accepting requests, cancel the pending flush and fail buffered
    /// requests with [`Error::Cancelled`]. Returns how many were dropped.
    pub fn shutdown(&self) -> usize {
        let dropped = {
            let mut state = self.inner.state();
            state.closed = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut state.buffer)
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropped buffered batch requests");
        }
        dropped.len()
    }
}
