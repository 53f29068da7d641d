use serde::{Deserialize, Serialize};

use crate::batch::BatchResult;

/// Body returned to the remote-function caller. Exactly one field is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl WireResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            replies: None,
            error_message: Some(message.into()),
        }
    }

    /// Response for a body that could not be decoded; no batch was started.
    pub fn decode_error(error: impl std::fmt::Display) -> Self {
        Self::error(format!("External Function error: can't read POST body {error}"))
    }
}

pub fn aggregate(result: BatchResult) -> WireResponse {
    match result {
        BatchResult::Replies(replies) => WireResponse {
            replies: Some(replies),
            error_message: None,
        },
        BatchResult::Failed(message) => WireResponse::error(message),
    }
}
