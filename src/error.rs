//! Error types for the vigil HA coordinator.
//!
//! This module provides a unified error type [`VigilError`] for all
//! coordinator operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Orchestration**: failures surfaced by the VM orchestrator while
//!   stopping, starting, migrating or destroying an instance
//! - **Capacity**: placement failed because no host can take the VM
//! - **Liveness**: investigator-level signals, including "unknown VM"
//! - **Lookup**: missing VMs or hosts
//! - **Configuration**: invalid settings
//!
//! # Example
//!
//! ```rust
//! use vigil::error::{Result, VigilError};
//!
//! fn check_host(host_id: u64) -> Result<()> {
//!     if host_id == 0 {
//!         return Err(VigilError::HostNotFound(host_id));
//!     }
//!     Ok(())
//! }
//!
//! fn handle_error(err: &VigilError) {
//!     if err.is_retryable() {
//!         println!("Retrying operation...");
//!     } else {
//!         println!("Fatal error: {}", err);
//!     }
//! }
//! ```

use thiserror::Error;

/// Main error type for vigil operations.
#[derive(Error, Debug)]
pub enum VigilError {
    // Orchestration errors
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Operation timed out: {0}")]
    OperationTimedOut(String),

    #[error("Concurrent operation in progress: {0}")]
    ConcurrentOperation(String),

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    // Capacity errors
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("Insufficient server capacity: {0}")]
    InsufficientServerCapacity(String),

    // Liveness errors
    #[error("Investigator does not recognize VM {0}")]
    UnknownVm(u64),

    // Lookup errors
    #[error("VM not found: {0}")]
    VmNotFound(u64),

    #[error("Host not found: {0}")]
    HostNotFound(u64),

    // Configuration errors
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Store errors
    #[error("Work store error: {0}")]
    Store(String),

    #[error("Work item not found: {0}")]
    WorkNotFound(u64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VigilError {
    /// Check if error is retryable.
    ///
    /// Retryable errors feed the reschedule path of the recovery state
    /// machine; everything else is terminal for the current attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VigilError::ResourceUnavailable(_)
                | VigilError::OperationTimedOut(_)
                | VigilError::ConcurrentOperation(_)
                | VigilError::AgentUnavailable(_)
                | VigilError::InsufficientCapacity(_)
                | VigilError::InsufficientServerCapacity(_)
        )
    }

    /// Check if this is a capacity exhaustion error.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            VigilError::InsufficientCapacity(_) | VigilError::InsufficientServerCapacity(_)
        )
    }
}

impl From<serde_json::Error> for VigilError {
    fn from(e: serde_json::Error) -> Self {
        VigilError::Serialization(e.to_string())
    }
}

/// Result type alias for vigil operations.
pub type Result<T> = std::result::Result<T, VigilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(VigilError::OperationTimedOut("stop".into()).is_retryable());
        assert!(VigilError::InsufficientServerCapacity("no host".into()).is_retryable());
        assert!(!VigilError::VmNotFound(7).is_retryable());
        assert!(!VigilError::UnknownVm(7).is_retryable());
    }

    #[test]
    fn test_capacity_classification() {
        assert!(VigilError::InsufficientCapacity("pod".into()).is_capacity());
        assert!(!VigilError::ResourceUnavailable("agent".into()).is_capacity());
    }
}
