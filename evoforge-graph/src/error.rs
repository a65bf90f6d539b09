//! Graph engine error constructors
//!
//! Re-exports evoforge-error and provides constructors that attach the
//! context keys every failure record needs (node, field, target, ...).

pub use evoforge_error::{Error, ErrorCategory, ErrorKind, ErrorStatus, Result};

use std::time::Duration;

// =============================================================================
// Compile errors
// =============================================================================

/// Create a StartNodeMissing error
pub fn start_node_missing(start: impl Into<String>) -> Error {
    let start = start.into();
    Error::new(
        ErrorKind::StartNodeMissing,
        format!("start node '{}' is not defined in 'nodes'", start),
    )
    .with_context("node", start)
}

/// Create a DanglingReference error
pub fn dangling_reference(from: impl Into<String>, target: impl Into<String>) -> Error {
    let from = from.into();
    let target = target.into();
    Error::new(
        ErrorKind::DanglingReference,
        format!("'{}' points to undefined node '{}'", from, target),
    )
    .with_context("node", from)
    .with_context("target", target)
}

/// Create a SignatureMismatch error naming the unsatisfied input field
pub fn signature_mismatch(
    from: impl Into<String>,
    to: impl Into<String>,
    field: impl Into<String>,
) -> Error {
    let from = from.into();
    let to = to.into();
    let field = field.into();
    Error::new(
        ErrorKind::SignatureMismatch,
        format!(
            "no output of '{}' feeds '{}': input field '{}' is not produced",
            from, to, field
        ),
    )
    .with_context("node", from)
    .with_context("target", to)
    .with_context("field", field)
}

/// Create an InvalidSignature error
pub fn invalid_signature(signature: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidSignature, reason).with_context("signature", signature)
}

/// Create a BranchVariableUndeclared error
pub fn branch_variable_undeclared(node: impl Into<String>, var: impl Into<String>) -> Error {
    let node = node.into();
    let var = var.into();
    Error::new(
        ErrorKind::BranchVariableUndeclared,
        format!("branch variable '{}' is not an output of '{}'", var, node),
    )
    .with_context("node", node)
    .with_context("field", var)
}

/// Create a MissingBranchDefault error
pub fn missing_branch_default(node: impl Into<String>) -> Error {
    let node = node.into();
    Error::new(
        ErrorKind::MissingBranchDefault,
        format!("branch edge of '{}' has no default target", node),
    )
    .with_context("node", node)
}

/// Create a ToolsMissing error
pub fn tools_missing(node: impl Into<String>) -> Error {
    let node = node.into();
    Error::new(
        ErrorKind::ToolsMissing,
        format!("tool-using node '{}' declares no tools", node),
    )
    .with_context("node", node)
}

/// Create an UnknownField error
pub fn unknown_field(location: impl Into<String>, key: impl Into<String>) -> Error {
    let location = location.into();
    let key = key.into();
    Error::new(
        ErrorKind::UnknownField,
        format!("unknown key '{}' in {}", key, location),
    )
    .with_context("location", location)
    .with_context("field", key)
}

// =============================================================================
// Execution errors
// =============================================================================

/// Create a MissingInput error
pub fn missing_input(node: impl Into<String>, field: impl Into<String>) -> Error {
    let node = node.into();
    let field = field.into();
    Error::new(
        ErrorKind::MissingInput,
        format!("node '{}' requires input '{}' which is not in context", node, field),
    )
    .with_context("node", node)
    .with_context("field", field)
}

/// Create a BranchVariableMissing error
pub fn branch_variable_missing(node: impl Into<String>, var: impl Into<String>) -> Error {
    let node = node.into();
    let var = var.into();
    Error::new(
        ErrorKind::BranchVariableMissing,
        format!("branch variable '{}' missing after '{}' ran", var, node),
    )
    .with_context("node", node)
    .with_context("field", var)
}

/// Create a ModelInvocationFailed error for a missing output field
pub fn missing_output(node: impl Into<String>, field: impl Into<String>) -> Error {
    let field = field.into();
    Error::model_invocation_failed(node, format!("declared output '{}' not returned", field))
        .with_context("field", field)
}

/// Create an InvocationTimeout error
pub fn invocation_timeout(node: impl Into<String>, timeout: Duration) -> Error {
    let node = node.into();
    Error::new(
        ErrorKind::InvocationTimeout,
        format!("node '{}' did not answer within {:?}", node, timeout),
    )
    .with_context("node", node)
    .with_context("timeout_ms", timeout.as_millis().to_string())
}

/// Create a LoopBudgetExceeded error
pub fn loop_budget_exceeded(node: impl Into<String>, budget: usize) -> Error {
    Error::new(
        ErrorKind::LoopBudgetExceeded,
        format!("step budget of {} exhausted", budget),
    )
    .with_context("node", node)
    .with_context("budget", budget.to_string())
}

// =============================================================================
// IO / serialization
// =============================================================================

/// Create a ParseFailed error
pub fn parse_error(message: impl Into<String>) -> Error {
    Error::parse_failed(message)
}

/// Create a SerializationFailed error
pub fn serialization_error(message: impl Into<String>) -> Error {
    Error::serialization_failed(message)
}

/// Create an IoFailed error
pub fn io_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::IoFailed, message)
}
