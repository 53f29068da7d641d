use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One incoming remote-function call carrying a batch of lookups.
///
/// Every field tolerates being absent on the wire; a missing `calls` is an
/// empty batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchRequest {
    pub request_id: String,
    pub caller: String,
    pub session_user: String,
    pub user_defined_context: HashMap<String, String>,
    pub calls: Vec<CallItem>,
}

/// The positional arguments of one call. Only single-string items are valid.
pub type CallItem = Vec<serde_json::Value>;

/// Name of a policy-bearing resource, e.g.
/// `projects/my-project/policies/compute.requireOsLogin`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Outcome of a whole batch.
///
/// Either every call item has a serialized policy, positionally aligned with
/// the input, or the batch failed with a single message. There is no
/// partially filled variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchResult {
    Replies(Vec<String>),
    Failed(String),
}

impl BatchResult {
    /// Build a failure, substituting a generic message for an empty one so a
    /// failed batch never carries a blank error.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.is_empty() {
            BatchResult::Failed("batch failed".into())
        } else {
            BatchResult::Failed(message)
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, BatchResult::Failed(_))
    }
}
