//! Error types for the Columba service core
//!
//! Engine failures, lifecycle violations and relay store failures each get their
//! own enum; `ColumbaError` unifies them for the rest of the workspace.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures reported by (or about) the mesh engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Engine bring-up failed: {reason}")]
    StartFailed { reason: String },
    #[error("Engine call '{operation}' failed: {reason}")]
    CallFailed { operation: String, reason: String },
    #[error("Engine operation '{operation}' timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },
    #[error("Engine is not available for calls")]
    Unavailable,
    #[error("Engine teardown failed: {reason}")]
    TeardownFailed { reason: String },
}

/// Violations of the process lifecycle protocol
#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Stale generation {captured} (current {current})")]
    StaleGeneration { captured: u64, current: u64 },
    #[error("Background service is unavailable")]
    ServiceUnavailable,
    #[error("Background service disconnected")]
    ServiceDisconnected,
    #[error("Operation cancelled")]
    Cancelled,
}

/// Failures of the persistence collaborator
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Store write '{operation}' failed: {reason}")]
    WriteFailed { operation: String, reason: String },
    #[error("Store read '{operation}' failed: {reason}")]
    ReadFailed { operation: String, reason: String },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for the Columba service
#[derive(Debug, thiserror::Error)]
pub enum ColumbaError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// An exclusive resource could not be acquired
    #[error("Resource '{resource}' unavailable: {reason}")]
    Resource { resource: String, reason: String },

    /// Malformed identifier or payload
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl ColumbaError {
    /// Create an engine start failure
    pub fn start_failed<T: Into<String>>(reason: T) -> Self {
        ColumbaError::Engine(EngineError::StartFailed {
            reason: reason.into(),
        })
    }

    /// Create an engine call failure
    pub fn call_failed<O: Into<String>, R: Into<String>>(operation: O, reason: R) -> Self {
        ColumbaError::Engine(EngineError::CallFailed {
            operation: operation.into(),
            reason: reason.into(),
        })
    }

    /// Create an engine timeout error
    pub fn engine_timeout<O: Into<String>>(operation: O, duration_ms: u64) -> Self {
        ColumbaError::Engine(EngineError::Timeout {
            operation: operation.into(),
            duration_ms,
        })
    }

    /// The engine handle is absent or its shutdown has begun
    pub fn engine_unavailable() -> Self {
        ColumbaError::Engine(EngineError::Unavailable)
    }

    /// Create a store write failure
    pub fn store_write<O: Into<String>, R: Into<String>>(operation: O, reason: R) -> Self {
        ColumbaError::Store(StoreError::WriteFailed {
            operation: operation.into(),
            reason: reason.into(),
        })
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        ColumbaError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a resource acquisition error
    pub fn resource<R: Into<String>, T: Into<String>>(resource: R, reason: T) -> Self {
        ColumbaError::Resource {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input<T: Into<String>>(reason: T) -> Self {
        ColumbaError::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Whether the error is a stale-generation signal that callers drop silently
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            ColumbaError::Lifecycle(LifecycleError::StaleGeneration { .. })
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, ColumbaError>;
pub type ColumbaResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_context() {
        let err = ColumbaError::call_failed("set_outbound_relay", "rejected");
        assert_eq!(
            err.to_string(),
            "Engine error: Engine call 'set_outbound_relay' failed: rejected"
        );
    }

    #[test]
    fn test_stale_detection() {
        let stale: ColumbaError = LifecycleError::StaleGeneration {
            captured: 1,
            current: 2,
        }
        .into();
        assert!(stale.is_stale());
        assert!(!ColumbaError::engine_unavailable().is_stale());
    }
}
