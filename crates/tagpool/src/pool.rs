//! Pool - public admission, ingestion, resizing, iteration, and shutdown.
//!
//! Flow:
//! 1. `put` admits against the ledger (suspending while saturated)
//! 2. the executor runs the job, a watcher forwards its completion
//! 3. the pump routes the outcome and releases the slot
//! 4. results reach a callback or the iteration queue
//!
//! The pool is a cheap handle; clones share one ledger, executor, and pump.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::Stream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{PoolError, TaskError};
use crate::executor::{Executor, SpawnBlockingExecutor};
use crate::ledger::{Admission, ResizeReport, SlotLedger};
use crate::pump::{self, Delivery};
use crate::tag::Tag;
use crate::task::{DataCallback, ErrorCallback, TaskHandle, TaskOptions, TaskRecord};

pub(crate) struct PoolShared<T: Send + 'static> {
    pub(crate) ledger: SlotLedger,
    pub(crate) executor: Arc<dyn Executor<T>>,
    pub(crate) on_data: Option<DataCallback<T>>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) pending: AtomicUsize,
    pub(crate) ingest_active: AtomicUsize,
    pub(crate) stop: CancellationToken,
    pub(crate) drain_iteration: bool,
    pub(crate) pump_tx: mpsc::UnboundedSender<Delivery<T>>,
    pub(crate) results_tx: mpsc::UnboundedSender<Result<T, TaskError>>,
    pub(crate) results_rx: Mutex<mpsc::UnboundedReceiver<Result<T, TaskError>>>,
    /// Signalled on every routed completion, finished ingest, and stop.
    pub(crate) progress: Notify,
}

/// Tagged, elastic worker pool.
///
/// Slots are partitioned by [`Tag`]; the generic tag is the overflow pool
/// any saturated tag may borrow from. Reservations can be resized while
/// work is in flight via [`adjust`](Pool::adjust).
pub struct Pool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Send + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Configures and builds a [`Pool`].
pub struct PoolBuilder<T: Send + 'static> {
    tags: Vec<(Tag, usize)>,
    generic: Option<usize>,
    limit: Option<usize>,
    on_data: Option<DataCallback<T>>,
    on_error: Option<ErrorCallback>,
    drain_iteration: bool,
}

impl<T: Send + 'static> Default for PoolBuilder<T> {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            generic: None,
            limit: None,
            on_data: None,
            on_error: None,
            drain_iteration: false,
        }
    }
}

impl<T: Send + 'static> PoolBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `reserved` slots for a tag.
    pub fn tag(mut self, tag: impl Into<Tag>, reserved: usize) -> Self {
        self.tags.push((tag.into(), reserved));
        self
    }

    /// Size of the generic overflow pool. Defaults to 0 when neither this
    /// nor [`limit`](Self::limit) is set.
    pub fn generic(mut self, reserved: usize) -> Self {
        self.generic = Some(reserved);
        self
    }

    /// Total slot count. Whatever `total` leaves over after the named
    /// reservations becomes the generic pool. An explicit
    /// [`generic`](Self::generic) wins over this.
    pub fn limit(mut self, total: usize) -> Self {
        self.limit = Some(total);
        self
    }

    /// Route every successful value without a per-task callback to this
    /// function instead of the result queue. Disables iteration.
    pub fn on_data(mut self, callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(callback));
        self
    }

    /// Route every task failure without a per-task error callback to this
    /// function instead of the result queue.
    pub fn on_error(mut self, callback: impl Fn(TaskError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// End iteration once nothing is pending and no ingest stream is active,
    /// instead of blocking until [`stop`](Pool::stop).
    pub fn drain_iteration(mut self) -> Self {
        self.drain_iteration = true;
        self
    }

    /// Build the pool around an executor. Must be called within a Tokio
    /// runtime; the pool spawns its result pump here.
    pub fn build(self, executor: Arc<dyn Executor<T>>) -> Pool<T> {
        let mut named = Vec::new();
        let mut generic_from_tags = None;
        for (tag, reserved) in self.tags {
            if tag.is_generic() {
                generic_from_tags = Some(reserved);
            } else {
                named.push((tag, reserved));
            }
        }
        let named_total: usize = named.iter().map(|(_, reserved)| reserved).sum();
        let generic = self
            .generic
            .or(generic_from_tags)
            .or_else(|| self.limit.map(|total| total.saturating_sub(named_total)))
            .unwrap_or(0);
        named.push((Tag::Generic, generic));

        let (pump_tx, pump_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PoolShared {
            ledger: SlotLedger::new(named),
            executor,
            on_data: self.on_data,
            on_error: self.on_error,
            pending: AtomicUsize::new(0),
            ingest_active: AtomicUsize::new(0),
            stop: CancellationToken::new(),
            drain_iteration: self.drain_iteration,
            pump_tx,
            results_tx,
            results_rx: Mutex::new(results_rx),
            progress: Notify::new(),
        });
        tokio::spawn(pump::pump_loop(Arc::downgrade(&shared), pump_rx));
        Pool { shared }
    }

    /// Build with the bundled [`SpawnBlockingExecutor`].
    pub fn build_default(self) -> Pool<T> {
        self.build(Arc::new(SpawnBlockingExecutor::new()))
    }
}

/// Handle to a background ingest stream.
pub struct IngestHandle {
    join: tokio::task::JoinHandle<usize>,
}

impl IngestHandle {
    /// Resolves once the submitter has walked the whole input (or the pool
    /// stopped), with the number of tasks actually submitted.
    pub async fn wait(self) -> usize {
        self.join.await.unwrap_or(0)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl<T: Send + 'static> Pool<T> {
    pub fn builder() -> PoolBuilder<T> {
        PoolBuilder::new()
    }

    /// Admit and run one job under a tag.
    ///
    /// Suspends while the tag's reservation and the generic pool are both
    /// saturated, resuming when a release or resize frees capacity. A tag
    /// never declared is created with a zero reservation and can only
    /// borrow; with an empty generic pool such a `put` waits until
    /// [`adjust`](Self::adjust) grants capacity.
    pub async fn put<F>(&self, tag: impl Into<Tag>, job: F) -> Result<TaskHandle, PoolError>
    where
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        self.put_with(tag, job, TaskOptions::new()).await
    }

    /// [`put`](Self::put) with per-task routing overrides.
    pub async fn put_with<F>(
        &self,
        tag: impl Into<Tag>,
        job: F,
        options: TaskOptions<T>,
    ) -> Result<TaskHandle, PoolError>
    where
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        let tag = tag.into();
        let admission = self.admit(&tag).await?;
        let (record, handle) = TaskRecord::new(tag.clone(), admission.borrowed, options);
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            task = %record.id,
            tag = %tag,
            borrowed = admission.borrowed,
            "task admitted"
        );

        let completion = self.shared.executor.run(Box::new(job));
        let pump_tx = self.shared.pump_tx.clone();
        tokio::spawn(async move {
            let outcome = match completion.await {
                Ok(outcome) => outcome,
                Err(_) => Err(TaskError::Lost),
            };
            let _ = pump_tx.send(Delivery { record, outcome });
        });
        Ok(handle)
    }

    async fn admit(&self, tag: &Tag) -> Result<Admission, PoolError> {
        loop {
            if self.shared.stop.is_cancelled() {
                return Err(PoolError::Stopped);
            }
            let notified = self.shared.ledger.capacity_changed();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(admission) = self.shared.ledger.try_admit(tag) {
                return Ok(admission);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.stop.cancelled() => return Err(PoolError::Stopped),
            }
        }
    }

    /// Submit one job per item of `items` from a background task.
    ///
    /// The input is walked lazily: because each `put` suspends until a slot
    /// exists, the next item is not pulled from the iterator until there is
    /// capacity for it, so arbitrarily large (or infinite) inputs never pile
    /// up task records. The iterator runs on the pool's runtime and must not
    /// block.
    ///
    /// Several ingest streams may run concurrently; [`join`](Self::join)
    /// waits for all of them.
    pub fn ingest<I, F>(&self, items: I, tag: impl Into<Tag>, f: F) -> IngestHandle
    where
        I: IntoIterator + Send + 'static,
        I::IntoIter: Send + 'static,
        I::Item: Send + 'static,
        F: Fn(I::Item) -> Result<T, TaskError> + Send + Sync + 'static,
    {
        let tag = tag.into();
        let pool = self.clone();
        let f = Arc::new(f);
        self.shared.ingest_active.fetch_add(1, Ordering::AcqRel);
        let join = tokio::spawn(async move {
            let mut submitted = 0usize;
            for item in items {
                if pool.shared.stop.is_cancelled() {
                    break;
                }
                let f = Arc::clone(&f);
                match pool.put(tag.clone(), move || f(item)).await {
                    Ok(_) => submitted += 1,
                    Err(PoolError::Stopped) => break,
                    Err(err) => {
                        tracing::error!(tag = %tag, error = %err, "ingest submission failed");
                        break;
                    }
                }
            }
            pool.shared.ingest_active.fetch_sub(1, Ordering::AcqRel);
            pool.shared.progress.notify_waiters();
            tracing::debug!(tag = %tag, submitted, "ingest stream finished");
            submitted
        });
        IngestHandle { join }
    }

    /// Change a tag's reservation while work is in flight.
    ///
    /// With `use_generic_slots` the delta is moved between the tag and the
    /// generic pool, conserving total capacity; this fails with
    /// [`PoolError::InsufficientGeneric`] when the generic pool cannot cover
    /// the move, mutating nothing. Shrinking never cancels running work: the
    /// surplus finishes under its old accounting while new admissions wait
    /// for the new bound. `use_generic_slots` is meaningless for the generic
    /// tag itself and is ignored there.
    pub fn adjust(
        &self,
        tag: impl Into<Tag>,
        new_size: usize,
        use_generic_slots: bool,
    ) -> Result<ResizeReport, PoolError> {
        self.shared
            .ledger
            .resize(&tag.into(), new_size, use_generic_slots)
    }

    /// Next completed outcome from the result queue, failure or success.
    ///
    /// Suspends while the queue is empty and results may still arrive.
    /// Returns `None` once the queue is empty, nothing is pending, and the
    /// pool is stopped (or idle, in drain-iteration mode). Fails when a pool
    /// data callback consumes results instead.
    pub async fn next_outcome(&self) -> Result<Option<Result<T, TaskError>>, PoolError> {
        if self.shared.on_data.is_some() {
            return Err(PoolError::CallbackModeActive);
        }
        let mut rx = self.shared.results_rx.lock().await;
        loop {
            let notified = self.shared.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Observe pending/ingest before draining the queue: the pump
            // enqueues before it decrements, so idleness seen here proves
            // every routed result is already visible to try_recv.
            let pending = self.shared.pending.load(Ordering::Acquire);
            let ingesting = self.shared.ingest_active.load(Ordering::Acquire);
            let stopped = self.shared.stop.is_cancelled();

            match rx.try_recv() {
                Ok(outcome) => return Ok(Some(outcome)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    let idle = pending == 0
                        && (stopped || (self.shared.drain_iteration && ingesting == 0));
                    if idle {
                        return Ok(None);
                    }
                    notified.as_mut().await;
                }
            }
        }
    }

    /// Next successful value from the result queue.
    ///
    /// Failures encountered on the queue are logged and skipped; use
    /// [`next_outcome`](Self::next_outcome) or an error callback to observe
    /// them.
    pub async fn next_result(&self) -> Result<Option<T>, PoolError> {
        loop {
            match self.next_outcome().await? {
                Some(Ok(value)) => return Ok(Some(value)),
                Some(Err(err)) => {
                    tracing::error!(error = %err, "unhandled task failure");
                }
                None => return Ok(None),
            }
        }
    }

    /// The successful results as a stream, in completion order.
    pub fn results(&self) -> impl Stream<Item = T> + Send + use<T> {
        let pool = self.clone();
        futures::stream::unfold(pool, |pool| async move {
            match pool.next_result().await {
                Ok(Some(value)) => Some((value, pool)),
                Ok(None) => None,
                Err(err) => {
                    tracing::warn!(error = %err, "results stream closed");
                    None
                }
            }
        })
    }

    /// Wait until every ingest stream has finished submitting and nothing is
    /// pending. Submissions racing `join` are the caller's coordination
    /// problem.
    pub async fn join(&self) {
        loop {
            let notified = self.shared.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.ingest_active.load(Ordering::Acquire) == 0
                && self.shared.pending.load(Ordering::Acquire) == 0
            {
                return;
            }
            notified.await;
        }
    }

    /// Stop the pool. Idempotent.
    ///
    /// Admission is refused immediately in both modes and blocked `put`s
    /// fail with [`PoolError::Stopped`]. In-flight work is never
    /// interrupted; with `drain` the executor is torn down only after
    /// pending reaches zero.
    pub async fn stop(&self, drain: bool) {
        if !self.shared.stop.is_cancelled() {
            tracing::info!(drain, "pool stopping");
        }
        self.shared.stop.cancel();
        self.shared.progress.notify_waiters();
        if drain {
            loop {
                let notified = self.shared.progress.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.shared.pending.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        }
        self.shared.executor.shutdown(drain).await;
    }

    /// Count of tasks admitted but not yet routed.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Snapshot of every tag's reservation.
    pub fn tags(&self) -> BTreeMap<Tag, usize> {
        self.shared
            .ledger
            .snapshot()
            .into_iter()
            .map(|(tag, counts)| (tag, counts.reserved))
            .collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }
}
