use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::batch::ResourceName;
use crate::error::LookupError;
use crate::policy::PolicySpec;

/// Resolves the effective policy for a single resource.
///
/// Implementations must watch `cancel` and return [`LookupError::Cancelled`]
/// promptly once it fires instead of finishing an in-flight call.
pub trait PolicyLookup: Send + Sync {
    type Spec: Serialize + Send;

    fn get<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        name: &'a ResourceName,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Spec, LookupError>> + Send + 'a>>;
}

/// A lookup handle scoped to one batch.
pub type SharedLookup = Arc<dyn PolicyLookup<Spec = PolicySpec>>;

/// Hands out a fresh lookup handle per batch.
///
/// The handle is dropped when the batch finishes, on success and failure
/// alike, which releases whatever the provider acquired for it.
pub trait LookupProvider: Send + Sync {
    fn connect<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<SharedLookup, LookupError>> + Send + 'a>>;
}

/// Deterministic in-memory lookup.
///
/// Names without an explicit entry resolve to the fallback (an empty spec
/// unless configured otherwise).
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    entries: HashMap<ResourceName, Result<PolicySpec, LookupError>>,
    fallback: Option<Result<PolicySpec, LookupError>>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, name: impl Into<ResourceName>, spec: PolicySpec) -> Self {
        self.entries.insert(name.into(), Ok(spec));
        self
    }

    pub fn with_error(mut self, name: impl Into<ResourceName>, error: LookupError) -> Self {
        self.entries.insert(name.into(), Err(error));
        self
    }

    /// Resolve unknown names to `result` instead of an empty spec.
    pub fn with_fallback(mut self, result: Result<PolicySpec, LookupError>) -> Self {
        self.fallback = Some(result);
        self
    }
}

impl PolicyLookup for StaticLookup {
    type Spec = PolicySpec;

    fn get<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        name: &'a ResourceName,
    ) -> Pin<Box<dyn Future<Output = Result<PolicySpec, LookupError>> + Send + 'a>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(LookupError::Cancelled);
            }
            match self.entries.get(name).or(self.fallback.as_ref()) {
                Some(result) => result.clone(),
                None => Ok(PolicySpec::default()),
            }
        })
    }
}

/// Provider that shares one [`StaticLookup`] across batches.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    lookup: Arc<StaticLookup>,
}

impl StaticProvider {
    pub fn new(lookup: StaticLookup) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }
}

impl LookupProvider for StaticProvider {
    fn connect<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<SharedLookup, LookupError>> + Send + 'a>> {
        Box::pin(async move {
            let lookup: SharedLookup = self.lookup.clone();
            Ok(lookup)
        })
    }
}
