use thiserror::Error;

/// A call item that cannot be dispatched. Invalidates the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid number of input fields provided. expected 1, got {got}")]
    Arity { row: usize, got: usize },

    #[error("Invalid resource type. expected string")]
    NotAString { row: usize },
}

impl ValidationError {
    /// Zero-based position of the offending call item.
    pub fn row(&self) -> usize {
        match self {
            ValidationError::Arity { row, .. } | ValidationError::NotAString { row } => *row,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimiterError {
    #[error("wait cancelled")]
    Cancelled,

    #[error("invalid rate limiter configuration: {0}")]
    InvalidConfig(String),
}

/// Failure reported by a policy lookup collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("lookup cancelled")]
    Cancelled,

    #[error("failed to connect to policy service: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("policy service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed policy response: {0}")]
    Decode(String),

    #[error("invalid resource name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
}

/// The error a single worker records as the batch outcome.
///
/// Rendered messages name the zero-based row so callers can tell which call
/// item broke the batch.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Error in rate limiter for row {row}, [{source}]")]
    RateLimiter { row: usize, source: LimiterError },

    #[error("Error getting effective policy for row {row}, [{source}]")]
    Lookup { row: usize, source: LookupError },

    #[error("Error encoding policy spec to json for row {row}, [{source}]")]
    Encode {
        row: usize,
        source: serde_json::Error,
    },

    #[error("Worker for row {row} terminated abnormally: {reason}")]
    Panicked { row: usize, reason: String },
}

impl WorkerError {
    pub fn row(&self) -> usize {
        match self {
            WorkerError::RateLimiter { row, .. }
            | WorkerError::Lookup { row, .. }
            | WorkerError::Encode { row, .. }
            | WorkerError::Panicked { row, .. } => *row,
        }
    }
}
