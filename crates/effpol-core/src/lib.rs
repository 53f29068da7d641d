//! Rate-limited, order-preserving fan-out of effective policy lookups.
//!
//! A [`BatchResolver`] takes a decoded [`BatchRequest`], validates every call
//! item, and hands the resource names to a [`FanOutExecutor`]. The executor
//! runs one task per name behind a shared [`RateLimiter`] and returns either
//! every serialized policy in input order or the first error, never a mix.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use effpol_core::{BatchRequest, BatchResolver, FanOutExecutor, RateLimiter, StaticProvider};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = Arc::new(RateLimiter::new(50.0, 4)?);
//! let resolver = BatchResolver::new(
//!     Arc::new(StaticProvider::default()),
//!     FanOutExecutor::new(limiter),
//! );
//! let request: BatchRequest =
//!     serde_json::from_str(r#"{"calls": [["projects/p/policies/compute.requireOsLogin"]]}"#)?;
//! let _response = effpol_core::aggregate(resolver.resolve(&request, &CancellationToken::new()).await);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod error;
pub mod executor;
pub mod limiter;
pub mod lookup;
pub mod metrics;
pub mod policy;
pub mod resolver;
pub mod response;
pub mod validate;

pub use batch::{BatchRequest, BatchResult, CallItem, ResourceName};
pub use error::{LimiterError, LookupError, ValidationError, WorkerError};
pub use executor::FanOutExecutor;
pub use limiter::RateLimiter;
pub use lookup::{LookupProvider, PolicyLookup, SharedLookup, StaticLookup, StaticProvider};
pub use metrics::{BatchMetrics, LoggingMetricsBackend, MetricsBackend, MetricsSnapshot};
pub use policy::PolicySpec;
pub use resolver::BatchResolver;
pub use response::{WireResponse, aggregate};
