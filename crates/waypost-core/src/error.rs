//! Error types for waypost service discovery.

use thiserror::Error;

/// Result type alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors surfaced by discovery operations.
///
/// An unknown service name is not an error: lookups resolve it to an
/// empty endpoint list.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("discovery backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("discovery backend timed out after {timeout_ms}ms loading '{service}'")]
    BackendTimeout { service: String, timeout_ms: u64 },

    #[error("discovery backend error: {0}")]
    Backend(String),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DiscoveryError {
    /// Transport-level failures, as opposed to caller mistakes.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            DiscoveryError::BackendUnavailable(_)
                | DiscoveryError::BackendTimeout { .. }
                | DiscoveryError::Backend(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_names_service() {
        let err = DiscoveryError::BackendTimeout {
            service: "orders".to_string(),
            timeout_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "discovery backend timed out after 250ms loading 'orders'"
        );
        assert!(err.is_backend());
    }

    #[test]
    fn registration_errors_are_not_backend_errors() {
        let err = DiscoveryError::InvalidRegistration("no port".to_string());
        assert!(!err.is_backend());
    }
}
