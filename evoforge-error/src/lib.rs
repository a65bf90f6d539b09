//! # evoforge-error
//!
//! Unified error handling for evoforge, shared by the graph engine and the
//! evolution controller.
//!
//! ## Design
//!
//! - **ErrorKind**: what went wrong (e.g. SignatureMismatch, LoopBudgetExceeded)
//! - **ErrorCategory**: which layer it belongs to (compile, execution, evolution)
//! - **ErrorStatus**: how to handle it (Permanent, Temporary, Persistent)
//! - **Context**: key/value pairs naming the node, field, example or round
//! - **Source**: the wrapped underlying error, never leaked as a raw type
//!
//! ## Usage
//!
//! ```rust
//! use evoforge_error::{Error, ErrorCategory, ErrorKind};
//!
//! fn check() -> Result<(), Error> {
//!     Err(Error::new(ErrorKind::MissingInput, "node 'critic' needs field 'content'")
//!         .with_operation("executor::run")
//!         .with_context("node", "critic")
//!         .with_context("field", "content"))
//! }
//!
//! let err = check().unwrap_err();
//! assert_eq!(err.kind().category(), ErrorCategory::Execution);
//! ```
//!
//! ## Principles
//!
//! - All functions return `Result<T, evoforge_error::Error>`
//! - External errors are wrapped with `set_source(err)`
//! - An error is handled once; callers further up only append context

mod error;
mod kind;
mod status;

pub use error::Error;
pub use kind::{ErrorCategory, ErrorKind};
pub use status::ErrorStatus;

/// Result type alias using the evoforge Error
pub type Result<T> = std::result::Result<T, Error>;
