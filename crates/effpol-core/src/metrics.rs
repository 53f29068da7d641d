use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trait for metrics backends. Implementations can forward to Prometheus,
/// StatsD, or simply log metrics.
pub trait MetricsBackend: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
}

/// Process-wide batch counters. Safe to share across concurrent batches.
pub struct BatchMetrics {
    pub batches_started: AtomicU64,
    pub batches_succeeded: AtomicU64,
    pub batches_failed: AtomicU64,
    pub batches_rejected: AtomicU64,
    pub lookups_started: AtomicU64,
    pub lookups_failed: AtomicU64,
    pub limiter_cancellations: AtomicU64,
    backend: Option<Arc<dyn MetricsBackend>>,
}

impl std::fmt::Debug for BatchMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Default for BatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchMetrics {
    pub fn new() -> Self {
        Self {
            batches_started: AtomicU64::new(0),
            batches_succeeded: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            batches_rejected: AtomicU64::new(0),
            lookups_started: AtomicU64::new(0),
            lookups_failed: AtomicU64::new(0),
            limiter_cancellations: AtomicU64::new(0),
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    fn bump(&self, counter: &AtomicU64, name: &str) {
        let val = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter(name, val);
        }
    }

    pub fn record_batch_started(&self) {
        self.bump(&self.batches_started, "effpol.batches_started");
    }

    pub fn record_batch_succeeded(&self) {
        self.bump(&self.batches_succeeded, "effpol.batches_succeeded");
    }

    pub fn record_batch_failed(&self) {
        self.bump(&self.batches_failed, "effpol.batches_failed");
    }

    /// A batch refused before dispatch (invalid call item).
    pub fn record_batch_rejected(&self) {
        self.bump(&self.batches_rejected, "effpol.batches_rejected");
    }

    pub fn record_lookup_started(&self) {
        self.bump(&self.lookups_started, "effpol.lookups_started");
    }

    pub fn record_lookup_failed(&self) {
        self.bump(&self.lookups_failed, "effpol.lookups_failed");
    }

    pub fn record_limiter_cancelled(&self) {
        self.bump(&self.limiter_cancellations, "effpol.limiter_cancellations");
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_started: self.batches_started.load(Ordering::Relaxed),
            batches_succeeded: self.batches_succeeded.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            lookups_started: self.lookups_started.load(Ordering::Relaxed),
            lookups_failed: self.lookups_failed.load(Ordering::Relaxed),
            limiter_cancellations: self.limiter_cancellations.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of batch metrics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub batches_started: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    pub batches_rejected: u64,
    pub lookups_started: u64,
    pub lookups_failed: u64,
    pub limiter_cancellations: u64,
}

/// Logging-based metrics backend. Emits metrics as structured log events.
pub struct LoggingMetricsBackend;

impl MetricsBackend for LoggingMetricsBackend {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::debug!(metric = name, value = value, kind = "counter", "metric");
    }
}
