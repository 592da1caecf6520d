//! Engine-level error taxonomy.
//!
//! Errors are values with a kind and a context. Each kind maps onto the
//! stable discriminant exposed through [`EngineError::code`], which doubles
//! as the process exit code when the engine is embedded under a shell.

use thiserror::Error;
use tracing::error;

use varve_store::StorageError;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("syntax error at {line}:{column}: {message}")]
    Syntax { message: String, line: u32, column: u32 },

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("no viable plan: {0}")]
    Planner(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("plan canceled")]
    Canceled,

    #[error("concurrent write moved HEAD")]
    ConcurrentWrite,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Kind discriminant. `0` is reserved for success.
    pub fn code(&self) -> u8 {
        match self {
            EngineError::Syntax { .. } => 10,
            EngineError::Catalog(_) => 11,
            EngineError::Constraint(_) => 12,
            EngineError::Io(_) => 13,
            EngineError::Integrity(_) => 14,
            EngineError::Timeout => 15,
            EngineError::Canceled => 16,
            EngineError::Planner(_) | EngineError::Execution(_) => 17,
            EngineError::ConcurrentWrite | EngineError::Internal(_) => 17,
        }
    }

    pub fn syntax(message: impl Into<String>, line: u32, column: u32) -> Self {
        EngineError::Syntax { message: message.into(), line, column }
    }

    /// An internal fault tied to one of the engine invariants (I1-I5). The
    /// full detail goes to the log; the surfaced message stays sanitized.
    pub fn internal_invariant(invariant: &'static str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        error!(event = "engine.invariant_violated", invariant = %invariant, detail = %detail);
        EngineError::Internal(format!("invariant {invariant} violated"))
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(_) | StorageError::Io(_) => EngineError::Io(e.to_string()),
            StorageError::CorruptStripe { .. }
            | StorageError::CorruptBlob { .. }
            | StorageError::InvalidDigest(_) => EngineError::Integrity(e.to_string()),
            StorageError::SchemaConflict(_)
            | StorageError::UnknownTable(_)
            | StorageError::UnknownColumn { .. }
            | StorageError::UnknownIndex { .. } => EngineError::Catalog(e.to_string()),
            StorageError::UniqueViolation { .. } | StorageError::TypeMismatch { .. } => {
                EngineError::Constraint(e.to_string())
            }
            StorageError::InvalidKey(_)
            | StorageError::Encode(_)
            | StorageError::Serialization(_) => EngineError::Internal(e.to_string()),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
