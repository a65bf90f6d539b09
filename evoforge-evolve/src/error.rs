//! Evolution error constructors

pub use evoforge_error::{Error, ErrorCategory, ErrorKind, ErrorStatus, Result};

/// Create a MutationRetriesExhausted error
pub fn mutation_retries_exhausted(agent_id: impl Into<String>, detail: impl Into<String>) -> Error {
    Error::new(ErrorKind::MutationRetriesExhausted, detail).with_context("agent_id", agent_id)
}

/// Create a ResourceBudgetExhausted error
pub fn resource_budget_exhausted(agent_id: impl Into<String>, rounds: usize) -> Error {
    Error::new(
        ErrorKind::ResourceBudgetExhausted,
        format!("round budget of {} spent", rounds),
    )
    .with_context("agent_id", agent_id)
    .with_context("rounds", rounds.to_string())
}

/// Create an InvalidMutation error
pub fn invalid_mutation(reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidMutation, reason)
}

/// Create a VersionConflict error
pub fn version_conflict(agent_id: impl Into<String>, latest: u64, attempted: u64) -> Error {
    Error::new(
        ErrorKind::VersionConflict,
        format!("version {} would not supersede version {}", attempted, latest),
    )
    .with_context("agent_id", agent_id)
    .with_context("latest", latest.to_string())
    .with_context("attempted", attempted.to_string())
}

/// Create a StorageFailed error
pub fn storage_error(message: impl Into<String>) -> Error {
    Error::storage_failed(message)
}

/// Create a SerializationFailed error
pub fn serialization_error(message: impl Into<String>) -> Error {
    Error::serialization_failed(message)
}

/// Create an IoFailed error
pub fn io_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::IoFailed, message)
}
