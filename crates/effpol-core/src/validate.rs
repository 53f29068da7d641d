use crate::batch::{CallItem, ResourceName};
use crate::error::ValidationError;

/// Check the shape of a single call item.
pub fn validate(row: usize, item: &CallItem) -> Result<ResourceName, ValidationError> {
    if item.len() != 1 {
        return Err(ValidationError::Arity {
            row,
            got: item.len(),
        });
    }
    match &item[0] {
        serde_json::Value::String(name) => Ok(ResourceName::new(name.as_str())),
        _ => Err(ValidationError::NotAString { row }),
    }
}

/// Validate every call item before anything is dispatched.
///
/// Stops at the first invalid item; its error becomes the batch outcome.
pub fn validate_all(calls: &[CallItem]) -> Result<Vec<ResourceName>, ValidationError> {
    calls
        .iter()
        .enumerate()
        .map(|(row, item)| validate(row, item))
        .collect()
}
