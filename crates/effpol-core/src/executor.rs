use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchResult, ResourceName};
use crate::error::WorkerError;
use crate::limiter::RateLimiter;
use crate::lookup::PolicyLookup;
use crate::metrics::BatchMetrics;

/// Fans a batch of resource names out to concurrent lookups and fans the
/// results back in, in input order.
///
/// Each name gets its own task. Every task passes through the shared
/// [`RateLimiter`] before calling the lookup, and writes its serialized policy
/// into the slot matching its input position. The first failure is recorded
/// as the batch error and cancels every sibling; the batch then reports only
/// that error, whatever else completed.
pub struct FanOutExecutor {
    limiter: Arc<RateLimiter>,
    metrics: Arc<BatchMetrics>,
}

impl FanOutExecutor {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            metrics: Arc::new(BatchMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<BatchMetrics> {
        &self.metrics
    }

    /// Resolve every name and join all workers before returning.
    ///
    /// The batch runs under a child of `parent`, so cancelling the request
    /// scope also stops the batch. Dropping the returned future cancels the
    /// batch and aborts every worker still running, releasing their hold on
    /// `lookup`.
    pub async fn execute<L>(
        &self,
        lookup: Arc<L>,
        names: Vec<ResourceName>,
        parent: &CancellationToken,
    ) -> BatchResult
    where
        L: PolicyLookup + ?Sized + 'static,
    {
        let state = Arc::new(BatchState::new(names.len(), parent.child_token()));
        let _cancel_on_drop = state.cancel.clone().drop_guard();

        tracing::debug!(items = names.len(), "Dispatching batch");

        let mut workers = JoinSet::new();
        let mut rows = HashMap::with_capacity(names.len());
        for (row, name) in names.into_iter().enumerate() {
            let worker = Worker {
                row,
                name,
                lookup: Arc::clone(&lookup),
                limiter: Arc::clone(&self.limiter),
                metrics: Arc::clone(&self.metrics),
                state: Arc::clone(&state),
            };
            let handle = workers.spawn(worker.run());
            rows.insert(handle.id(), row);
        }

        // Every worker is awaited, cancelled or not.
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                let row = rows.get(&e.id()).copied().unwrap_or_default();
                state.fail(WorkerError::Panicked {
                    row,
                    reason: e.to_string(),
                });
            }
        }

        state.finish()
    }
}

/// Storage shared by the workers of one batch.
struct BatchState {
    slots: Mutex<Vec<Option<String>>>,
    first_error: OnceLock<WorkerError>,
    cancel: CancellationToken,
}

impl BatchState {
    fn new(len: usize, cancel: CancellationToken) -> Self {
        Self {
            slots: Mutex::new(vec![None; len]),
            first_error: OnceLock::new(),
            cancel,
        }
    }

    fn has_failed(&self) -> bool {
        self.first_error.get().is_some()
    }

    /// Record `error` as the batch error unless another worker got there
    /// first. Only the winner cancels the batch.
    fn fail(&self, error: WorkerError) {
        let row = error.row();
        match self.first_error.set(error) {
            Ok(()) => {
                if let Some(winner) = self.first_error.get() {
                    tracing::warn!(row, error = %winner, "Lookup failed, cancelling batch");
                }
                self.cancel.cancel();
            }
            Err(discarded) => {
                tracing::debug!(row, error = %discarded, "Batch already failed, discarding error");
            }
        }
    }

    fn fill(&self, row: usize, payload: String) {
        if self.has_failed() {
            return;
        }
        if let Some(slot) = self.lock_slots().get_mut(row) {
            *slot = Some(payload);
        }
    }

    fn finish(&self) -> BatchResult {
        if let Some(error) = self.first_error.get() {
            return BatchResult::failed(error.to_string());
        }

        let slots = std::mem::take(&mut *self.lock_slots());
        match slots.into_iter().collect::<Option<Vec<String>>>() {
            Some(replies) => BatchResult::Replies(replies),
            None => BatchResult::failed("batch cancelled before completion"),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Option<String>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Worker<L: ?Sized> {
    row: usize,
    name: ResourceName,
    lookup: Arc<L>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<BatchMetrics>,
    state: Arc<BatchState>,
}

impl<L> Worker<L>
where
    L: PolicyLookup + ?Sized,
{
    async fn run(self) {
        let state = &self.state;
        let row = self.row;

        if state.cancel.is_cancelled() {
            return;
        }

        if let Err(source) = self.limiter.acquire(&state.cancel).await {
            self.metrics.record_limiter_cancelled();
            state.fail(WorkerError::RateLimiter { row, source });
            return;
        }

        // The batch may have failed while this worker was queued.
        if state.cancel.is_cancelled() {
            return;
        }

        self.metrics.record_lookup_started();
        let spec = match self.lookup.get(&state.cancel, &self.name).await {
            Ok(spec) => spec,
            Err(source) => {
                self.metrics.record_lookup_failed();
                state.fail(WorkerError::Lookup { row, source });
                return;
            }
        };

        match serde_json::to_string(&spec) {
            Ok(payload) => {
                tracing::debug!(row, name = %self.name, policy = %payload, "Resolved effective policy");
                state.fill(row, payload);
            }
            Err(source) => state.fail(WorkerError::Encode { row, source }),
        }
    }
}
