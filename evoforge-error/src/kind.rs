//! Error kinds for evoforge operations

use std::fmt;

/// The layer an error kind belongs to.
///
/// Compile errors are fatal to one compile attempt, execution errors are
/// fatal to one run, evolution errors end the controller loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Compile,
    Execution,
    Evolution,
    General,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Compile => "compile",
            ErrorCategory::Execution => "execution",
            ErrorCategory::Evolution => "evolution",
            ErrorCategory::General => "general",
        };
        write!(f, "{}", s)
    }
}

/// The kind of error that occurred.
///
/// Users match on ErrorKind to decide how to handle a specific case;
/// `category()` groups kinds by the layer that raised them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // =========================================================================
    // General errors
    // =========================================================================
    /// An unexpected error occurred - catch-all for unhandled cases
    Unexpected,

    /// Invalid configuration or parameters
    ConfigInvalid,

    /// Operation was cancelled by an external stop signal
    Cancelled,

    // =========================================================================
    // Descriptor / compile errors
    // =========================================================================
    /// `start_node` does not name a declared node
    StartNodeMissing,

    /// A flow key or edge target names neither a node nor `end`
    DanglingReference,

    /// A sequence/branch target cannot be fed by the source node's outputs
    SignatureMismatch,

    /// A signature string does not follow `ident(, ident)* -> ident(, ident)*`
    InvalidSignature,

    /// A branch `source_var` is not among the branching node's outputs
    BranchVariableUndeclared,

    /// A branch edge has no `default` target
    MissingBranchDefault,

    /// A ToolUsing node declares no tools
    ToolsMissing,

    /// Unknown key in a descriptor parsed in strict mode
    UnknownField,

    // =========================================================================
    // Execution errors
    // =========================================================================
    /// A node's declared input is absent from the execution context
    MissingInput,

    /// The branch variable is absent after the branching node ran
    BranchVariableMissing,

    /// The model/tool collaborator failed or returned malformed outputs
    ModelInvocationFailed,

    /// A node invocation exceeded its timeout
    InvocationTimeout,

    /// The per-run step budget was exhausted
    LoopBudgetExceeded,

    // =========================================================================
    // Evolution errors
    // =========================================================================
    /// Structural mutation could not produce a runnable descriptor
    MutationRetriesExhausted,

    /// The controller's round budget is spent
    ResourceBudgetExhausted,

    /// A collaborator returned a descriptor that breaks lineage rules
    InvalidMutation,

    /// An append would move a lineage backwards
    VersionConflict,

    // =========================================================================
    // Storage / IO errors
    // =========================================================================
    /// Storage operation failed
    StorageFailed,

    /// Serialization/deserialization failed
    SerializationFailed,

    /// File not found
    FileNotFound,

    /// IO operation failed
    IoFailed,

    // =========================================================================
    // Provider errors
    // =========================================================================
    /// Network error talking to the completion provider
    NetworkFailed,

    /// Rate limit exceeded
    RateLimited,

    /// Provider not available or rejected the request
    ProviderUnavailable,

    // =========================================================================
    // Parse errors
    // =========================================================================
    /// Failed to parse input
    ParseFailed,
}

impl ErrorKind {
    /// Returns the error kind as a static string
    pub fn as_str(&self) -> &'static str {
        match self {
            // General
            ErrorKind::Unexpected => "Unexpected",
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::Cancelled => "Cancelled",

            // Compile
            ErrorKind::StartNodeMissing => "StartNodeMissing",
            ErrorKind::DanglingReference => "DanglingReference",
            ErrorKind::SignatureMismatch => "SignatureMismatch",
            ErrorKind::InvalidSignature => "InvalidSignature",
            ErrorKind::BranchVariableUndeclared => "BranchVariableUndeclared",
            ErrorKind::MissingBranchDefault => "MissingBranchDefault",
            ErrorKind::ToolsMissing => "ToolsMissing",
            ErrorKind::UnknownField => "UnknownField",

            // Execution
            ErrorKind::MissingInput => "MissingInput",
            ErrorKind::BranchVariableMissing => "BranchVariableMissing",
            ErrorKind::ModelInvocationFailed => "ModelInvocationFailed",
            ErrorKind::InvocationTimeout => "InvocationTimeout",
            ErrorKind::LoopBudgetExceeded => "LoopBudgetExceeded",

            // Evolution
            ErrorKind::MutationRetriesExhausted => "MutationRetriesExhausted",
            ErrorKind::ResourceBudgetExhausted => "ResourceBudgetExhausted",
            ErrorKind::InvalidMutation => "InvalidMutation",
            ErrorKind::VersionConflict => "VersionConflict",

            // Storage / IO
            ErrorKind::StorageFailed => "StorageFailed",
            ErrorKind::SerializationFailed => "SerializationFailed",
            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::IoFailed => "IoFailed",

            // Provider
            ErrorKind::NetworkFailed => "NetworkFailed",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::ProviderUnavailable => "ProviderUnavailable",

            // Parse
            ErrorKind::ParseFailed => "ParseFailed",
        }
    }

    /// The layer this kind belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::StartNodeMissing
            | ErrorKind::DanglingReference
            | ErrorKind::SignatureMismatch
            | ErrorKind::InvalidSignature
            | ErrorKind::BranchVariableUndeclared
            | ErrorKind::MissingBranchDefault
            | ErrorKind::ToolsMissing
            | ErrorKind::UnknownField => ErrorCategory::Compile,

            ErrorKind::MissingInput
            | ErrorKind::BranchVariableMissing
            | ErrorKind::ModelInvocationFailed
            | ErrorKind::InvocationTimeout
            | ErrorKind::LoopBudgetExceeded => ErrorCategory::Execution,

            ErrorKind::MutationRetriesExhausted
            | ErrorKind::ResourceBudgetExhausted
            | ErrorKind::InvalidMutation
            | ErrorKind::VersionConflict => ErrorCategory::Evolution,

            _ => ErrorCategory::General,
        }
    }

    /// Check if this error kind is retryable by default
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ModelInvocationFailed
                | ErrorKind::InvocationTimeout
                | ErrorKind::NetworkFailed
                | ErrorKind::RateLimited
                | ErrorKind::ProviderUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::SignatureMismatch.to_string(), "SignatureMismatch");
        assert_eq!(ErrorKind::LoopBudgetExceeded.to_string(), "LoopBudgetExceeded");
    }

    #[test]
    fn test_category() {
        assert_eq!(ErrorKind::DanglingReference.category(), ErrorCategory::Compile);
        assert_eq!(ErrorKind::MissingBranchDefault.category(), ErrorCategory::Compile);
        assert_eq!(ErrorKind::BranchVariableMissing.category(), ErrorCategory::Execution);
        assert_eq!(
            ErrorKind::MutationRetriesExhausted.category(),
            ErrorCategory::Evolution
        );
        assert_eq!(ErrorKind::IoFailed.category(), ErrorCategory::General);
    }

    #[test]
    fn test_is_retryable() {
        assert!(ErrorKind::InvocationTimeout.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(!ErrorKind::MissingInput.is_retryable());
        assert!(!ErrorKind::LoopBudgetExceeded.is_retryable());
    }
}
