// stress-core/src/error.rs
// Error taxonomy for the stability engine

use std::result;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::Domain;

/// Main error type for the stability engine
#[derive(Error, Debug)]
pub enum StressError {
    /// Invalid flags, unwritable paths, conflicting scope. Fatal before the session starts.
    #[error("Configuration error: {field} - {message}")]
    Configuration { field: String, message: String },

    /// A probe or optional dependency is missing
    #[error("Capability unavailable: {capability} ({reason})")]
    CapabilityUnavailable { capability: String, reason: String },

    /// In-band verification mismatch inside a workload
    #[error("Integrity error in {domain}: {detail}")]
    Integrity { domain: Domain, detail: String },

    /// Storage or process I/O failure
    #[error("I/O error: {operation} failed - {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Bounded wait elapsed
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context} - {source}")]
    Serialization {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type alias for convenience
pub type Result<T> = result::Result<T, StressError>;

/// What the orchestrator does with an error
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryStrategy {
    /// Abort the session before it starts
    Abort,
    /// Drop the affected domain or metric, keep the session
    Disable,
    /// Count it against the domain and keep going
    RecordAndContinue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    Fatal,     // Session cannot run
    Degraded,  // Session runs without something
    Finding,   // Evidence of instability
    Transient, // Shutdown timing
}

/// Trait for error recovery
pub trait ErrorRecovery {
    fn recovery_strategy(&self) -> RecoveryStrategy;
    fn is_recoverable(&self) -> bool;
    fn error_category(&self) -> ErrorCategory;
}

impl ErrorRecovery for StressError {
    fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            StressError::Configuration { .. } => RecoveryStrategy::Abort,
            StressError::CapabilityUnavailable { .. } => RecoveryStrategy::Disable,
            StressError::Serialization { .. } => RecoveryStrategy::Abort,
            StressError::Integrity { .. }
            | StressError::Io { .. }
            | StressError::Timeout { .. } => RecoveryStrategy::RecordAndContinue,
        }
    }

    fn is_recoverable(&self) -> bool {
        !matches!(self.recovery_strategy(), RecoveryStrategy::Abort)
    }

    fn error_category(&self) -> ErrorCategory {
        match self {
            StressError::Configuration { .. } | StressError::Serialization { .. } => {
                ErrorCategory::Fatal
            }
            StressError::CapabilityUnavailable { .. } => ErrorCategory::Degraded,
            StressError::Integrity { .. } | StressError::Io { .. } => ErrorCategory::Finding,
            StressError::Timeout { .. } => ErrorCategory::Transient,
        }
    }
}

/// Helper macros for error creation
#[macro_export]
macro_rules! stress_error {
    (config, $field:expr, $msg:expr) => {
        $crate::error::StressError::Configuration {
            field: $field.to_string(),
            message: $msg.to_string(),
        }
    };
    (unavailable, $cap:expr, $reason:expr) => {
        $crate::error::StressError::CapabilityUnavailable {
            capability: $cap.to_string(),
            reason: $reason.to_string(),
        }
    };
    (io, $op:expr, $source:expr) => {
        $crate::error::StressError::Io {
            operation: $op.to_string(),
            source: $source,
        }
    };
}

impl StressError {
    pub fn timeout(operation: &str, limit: std::time::Duration) -> Self {
        StressError::Timeout {
            operation: operation.to_string(),
            timeout_ms: limit.as_millis() as u64,
        }
    }

    /// Log at the level the error category calls for
    pub fn log(&self, context: &str) {
        match self.error_category() {
            ErrorCategory::Fatal => error!("❌ {}: {}", context, self),
            ErrorCategory::Finding | ErrorCategory::Transient => warn!("⚠️ {}: {}", context, self),
            ErrorCategory::Degraded => info!("{}: {}", context, self),
        }
    }

    /// Escalate a domain initialization failure to a fatal configuration error
    pub fn into_configuration(self, field: &str) -> StressError {
        match self {
            StressError::Configuration { .. } => self,
            other => StressError::Configuration {
                field: field.to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for StressError {
    fn from(err: std::io::Error) -> Self {
        StressError::Io {
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for StressError {
    fn from(err: serde_json::Error) -> Self {
        StressError::Serialization {
            context: "JSON processing".to_string(),
            source: Box::new(err),
        }
    }
}
