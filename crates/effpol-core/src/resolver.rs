use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::batch::{BatchRequest, BatchResult};
use crate::executor::FanOutExecutor;
use crate::lookup::LookupProvider;
use crate::metrics::BatchMetrics;
use crate::validate::validate_all;

/// Runs one decoded request end to end: validate every call item, open a
/// lookup handle for the batch, fan out, and hand back the batch result.
pub struct BatchResolver {
    provider: Arc<dyn LookupProvider>,
    executor: FanOutExecutor,
}

impl BatchResolver {
    pub fn new(provider: Arc<dyn LookupProvider>, executor: FanOutExecutor) -> Self {
        Self { provider, executor }
    }

    pub fn executor(&self) -> &FanOutExecutor {
        &self.executor
    }

    pub fn metrics(&self) -> &Arc<BatchMetrics> {
        self.executor.metrics()
    }

    pub async fn resolve(&self, request: &BatchRequest, parent: &CancellationToken) -> BatchResult {
        let metrics = self.metrics();
        metrics.record_batch_started();

        tracing::info!(
            request_id = %request.request_id,
            caller = %request.caller,
            session_user = %request.session_user,
            user_defined_context = ?request.user_defined_context,
            calls = request.calls.len(),
            "Resolving batch"
        );

        let names = match validate_all(&request.calls) {
            Ok(names) => names,
            Err(e) => {
                metrics.record_batch_rejected();
                tracing::warn!(
                    request_id = %request.request_id,
                    row = e.row(),
                    error = %e,
                    "Rejecting batch with invalid call item"
                );
                return BatchResult::failed(e.to_string());
            }
        };

        if names.is_empty() {
            metrics.record_batch_succeeded();
            return BatchResult::Replies(Vec::new());
        }

        // The handle lives exactly as long as the batch: it moves into the
        // executor and is dropped once the last worker has been joined.
        let lookup = match self.provider.connect().await {
            Ok(lookup) => lookup,
            Err(e) => {
                metrics.record_batch_failed();
                tracing::error!(request_id = %request.request_id, error = %e, "Could not open policy client");
                return BatchResult::failed(format!("Error creating policy client, [{e}]"));
            }
        };

        let result = self.executor.execute(lookup, names, parent).await;

        match &result {
            BatchResult::Replies(replies) => {
                metrics.record_batch_succeeded();
                tracing::info!(request_id = %request.request_id, replies = replies.len(), "Batch resolved");
            }
            BatchResult::Failed(message) => {
                metrics.record_batch_failed();
                tracing::warn!(request_id = %request.request_id, error = %message, "Batch failed");
            }
        }

        result
    }
}
