//! Write batching and coalescing.
//!
//! Writes are queued per path. A later write to a queued path replaces the
//! queued value (a coalesced write) and both callers are answered by the one
//! physical write. The queue is flushed explicitly, by a timer, or when it
//! reaches `max_batch_size` distinct paths.
//!
//! A write the sink rejects goes back on the queue unless a newer write to
//! the same path arrived meanwhile, so it is retried by the next flush.
//! Waiters of the failed attempt are answered with the failure.

use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for the write batcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Whether writes are queued. When false, every write is immediate.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Distinct queued paths that trigger a flush.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Interval of the background flush, if any.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_batch_size() -> usize {
    32
}

#[allow(clippy::unnecessary_wraps)]
fn default_flush_interval_ms() -> Option<u64> {
    Some(100)
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl BatchConfig {
    /// Creates a configuration with batching turned off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the batch size that triggers a flush.
    #[must_use]
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Sets the background flush interval; `None` disables the timer.
    #[must_use]
    pub fn with_flush_interval_ms(mut self, interval: Option<u64>) -> Self {
        self.flush_interval_ms = interval;
        self
    }
}

/// Destination for flushed writes.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Persists `data` at `path`.
    async fn persist(&self, path: &Path, data: &[u8]) -> Result<(), StoreError>;
}

/// Snapshot of batcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Writes accepted into the queue.
    pub queued: u64,
    /// Queued writes replaced by a later write to the same path.
    pub coalesced: u64,
    /// Writes that reached the sink, immediate ones included.
    pub physical_writes: u64,
    /// Non-empty flushes.
    pub flushes: u64,
    /// Queued writes failed by `write_immediate` or a discard.
    pub superseded: u64,
    /// Failed writes put back on the queue for the next flush.
    pub requeued: u64,
    /// Sink failures.
    pub failures: u64,
    /// Paths currently queued.
    pub pending: usize,
    /// `coalesced / queued`, or 0 with nothing queued.
    pub coalescing_rate: f64,
}

#[derive(Debug, Default)]
struct BatchCounters {
    queued: AtomicU64,
    coalesced: AtomicU64,
    physical_writes: AtomicU64,
    flushes: AtomicU64,
    superseded: AtomicU64,
    requeued: AtomicU64,
    failures: AtomicU64,
}

type Waiter = oneshot::Sender<Result<(), StoreError>>;

struct PendingWrite {
    data: Arc<[u8]>,
    waiters: Vec<Waiter>,
}

/// Resolves once a queued write has been flushed.
#[derive(Debug)]
#[must_use = "a ticket does nothing unless waited on"]
pub struct WriteTicket {
    path: PathBuf,
    rx: oneshot::Receiver<Result<(), StoreError>>,
}

impl WriteTicket {
    /// The path the write targets.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the physical write that covers this one.
    pub async fn wait(self) -> Result<(), StoreError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(StoreError::WriteAbandoned { path: self.path }),
        }
    }
}

struct BatcherInner {
    sink: Arc<dyn BatchSink>,
    max_batch_size: usize,
    pending: Mutex<BTreeMap<PathBuf, PendingWrite>>,
    in_flight: Mutex<HashMap<PathBuf, Arc<[u8]>>>,
    flush_gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    counters: BatchCounters,
}

impl BatcherInner {
    async fn flush(&self) -> Result<usize, StoreError> {
        let _gate = self.flush_gate.lock().await;
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(0);
        }

        self.in_flight.lock().extend(
            batch
                .iter()
                .map(|(path, write)| (path.clone(), write.data.clone())),
        );
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(paths = batch.len(), "Flushing write batch");

        let mut written = 0;
        let mut first_error = None;
        for (path, write) in batch {
            let outcome = self.sink.persist(&path, &write.data).await;
            let still_current = self.in_flight.lock().remove(&path).is_some();

            let failure = match outcome {
                Ok(()) => {
                    written += 1;
                    self.counters.physical_writes.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(path = %path.display(), error = %e, "Batched write failed");
                    Some(e.to_string())
                }
            };

            for waiter in write.waiters {
                let reply = match &failure {
                    None => Ok(()),
                    Some(reason) => Err(StoreError::FlushFailed {
                        path: path.clone(),
                        reason: reason.clone(),
                    }),
                };
                let _ = waiter.send(reply);
            }
            if let Some(reason) = failure {
                if still_current {
                    self.requeue(&path, write.data);
                }
                first_error.get_or_insert(StoreError::FlushFailed { path, reason });
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    fn requeue(&self, path: &Path, data: Arc<[u8]>) {
        match self.pending.lock().entry(path.to_path_buf()) {
            Entry::Occupied(_) => {
                debug!(path = %path.display(), "Failed write already replaced by a newer one");
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingWrite {
                    data,
                    waiters: Vec::new(),
                });
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn fail_waiters(&self, path: &Path, write: PendingWrite) {
        self.counters
            .superseded
            .fetch_add(write.waiters.len() as u64, Ordering::Relaxed);
        for waiter in write.waiters {
            let _ = waiter.send(Err(StoreError::Superseded {
                path: path.to_path_buf(),
            }));
        }
    }
}

/// Queues writes and flushes them through a [`BatchSink`].
pub struct WriteBatcher {
    inner: Arc<BatcherInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WriteBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatcher")
            .field("pending", &self.inner.pending.lock().len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl WriteBatcher {
    /// Creates a batcher. The flush timer only runs inside a tokio runtime.
    #[must_use]
    pub fn new(sink: Arc<dyn BatchSink>, config: &BatchConfig) -> Self {
        let inner = Arc::new(BatcherInner {
            sink,
            max_batch_size: config.max_batch_size.max(1),
            pending: Mutex::new(BTreeMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            flush_gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            counters: BatchCounters::default(),
        });
        let timer = config
            .flush_interval_ms
            .filter(|ms| *ms > 0)
            .and_then(|ms| spawn_flush_timer(Arc::downgrade(&inner), Duration::from_millis(ms)));

        Self {
            inner,
            timer: Mutex::new(timer),
        }
    }

    /// Queues a write; the returned ticket resolves once it is on disk.
    pub async fn write(
        &self,
        path: impl Into<PathBuf>,
        data: impl Into<Arc<[u8]>>,
    ) -> Result<WriteTicket, StoreError> {
        if self.is_closed() {
            return Err(StoreError::BatcherClosed);
        }

        let path = path.into();
        let data = data.into();
        let (tx, rx) = oneshot::channel();

        let full = {
            let mut pending = self.inner.pending.lock();
            match pending.entry(path.clone()) {
                Entry::Occupied(mut queued) => {
                    let queued = queued.get_mut();
                    queued.data = data;
                    queued.waiters.push(tx);
                    self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                }
                Entry::Vacant(slot) => {
                    slot.insert(PendingWrite {
                        data,
                        waiters: vec![tx],
                    });
                }
            }
            self.inner.counters.queued.fetch_add(1, Ordering::Relaxed);
            pending.len() >= self.inner.max_batch_size
        };

        if full {
            if let Err(e) = self.inner.flush().await {
                debug!(error = %e, "Size-triggered flush reported a failure");
            }
        }

        Ok(WriteTicket { path, rx })
    }

    /// Writes through to the sink now, failing any queued write to `path`.
    pub async fn write_immediate(&self, path: &Path, data: &[u8]) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::BatcherClosed);
        }

        let _gate = self.inner.flush_gate.lock().await;
        let queued = self.inner.pending.lock().remove(path);
        if let Some(queued) = queued {
            debug!(path = %path.display(), "Immediate write supersedes queued write");
            self.inner.fail_waiters(path, queued);
        }

        let outcome = self.inner.sink.persist(path, data).await;
        match &outcome {
            Ok(()) => self.inner.counters.physical_writes.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.inner.counters.failures.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }

    /// Drops a queued write to `path`, failing its waiters. Returns true if one was queued.
    ///
    /// A write to `path` that is being flushed right now still completes, but
    /// is not put back on the queue if it fails.
    pub fn discard(&self, path: &Path) -> bool {
        let in_flight = self.inner.in_flight.lock().remove(path).is_some();
        let queued = self.inner.pending.lock().remove(path);
        match queued {
            Some(queued) => {
                self.inner.fail_waiters(path, queued);
                true
            }
            None => in_flight,
        }
    }

    /// Flushes every queued write. Returns the number of physical writes.
    ///
    /// All queued paths are attempted; the first failure is returned after
    /// every waiter has been answered. Failed writes stay queued, so a later
    /// flush retries them.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        self.inner.flush().await
    }

    /// Flushes and permanently closes the batcher.
    ///
    /// New writes are rejected from here on even if the final flush fails;
    /// the writes it could not persist stay queued for [`flush`](Self::flush).
    pub async fn close(&self) -> Result<(), StoreError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        self.inner.flush().await.map(|_| ())
    }

    /// Returns true once `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Returns the newest not-yet-persisted value for `path`.
    #[must_use]
    pub fn pending_value(&self, path: &Path) -> Option<Arc<[u8]>> {
        if let Some(queued) = self.inner.pending.lock().get(path) {
            return Some(queued.data.clone());
        }
        self.inner.in_flight.lock().get(path).cloned()
    }

    /// Returns the paths with queued writes.
    #[must_use]
    pub fn pending_paths(&self) -> Vec<PathBuf> {
        self.inner.pending.lock().keys().cloned().collect()
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> BatchStats {
        let counters = &self.inner.counters;
        let queued = counters.queued.load(Ordering::Relaxed);
        let coalesced = counters.coalesced.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let coalescing_rate = if queued == 0 {
            0.0
        } else {
            coalesced as f64 / queued as f64
        };
        BatchStats {
            queued,
            coalesced,
            physical_writes: counters.physical_writes.load(Ordering::Relaxed),
            flushes: counters.flushes.load(Ordering::Relaxed),
            superseded: counters.superseded.load(Ordering::Relaxed),
            requeued: counters.requeued.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            pending: self.inner.pending.lock().len(),
            coalescing_rate,
        }
    }
}

impl Drop for WriteBatcher {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
        let abandoned = self.inner.pending.lock().len();
        if abandoned > 0 {
            warn!(paths = abandoned, "Write batcher dropped with queued writes");
        }
    }
}

fn spawn_flush_timer(inner: Weak<BatcherInner>, interval: Duration) -> Option<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = inner.flush().await {
                debug!(error = %e, "Timed flush reported a failure");
            }
        }
    }))
}
