//! Result and error types for flowguard.

use thiserror::Error;

/// Result type for flowguard operations
pub type FlowResult<T> = Result<T, FlowError>;

/// Errors that can occur while driving a page or loading engine inputs.
///
/// These are raw errors. The engine never lets them escape a workflow run:
/// [`crate::retry::classify`] turns each one into a
/// [`FailureRecord`](crate::retry::FailureRecord).
#[derive(Debug, Error)]
pub enum FlowError {
    /// A resolved handle no longer refers to a live node
    #[error("Stale element: handle {handle} is detached from the page")]
    StaleElement {
        /// Opaque handle id
        handle: String,
    },

    /// The element exists but refused the interaction (disabled, read-only)
    #[error("Element {handle} is not interactable: {message}")]
    NotInteractable {
        /// Opaque handle id
        handle: String,
        /// Error message
        message: String,
    },

    /// Generic driver failure (connection lost, protocol error)
    #[error("Driver error: {message}")]
    Driver {
        /// Error message
        message: String,
    },

    /// Navigation error
    #[error("Navigation to {url} failed: {message}")]
    Navigation {
        /// URL that failed
        url: String,
        /// Error message
        message: String,
    },

    /// Operation timed out inside the driver
    #[error("Operation timed out after {ms}ms")]
    Timeout {
        /// Timeout in milliseconds
        ms: u64,
    },

    /// Action construction rejected
    #[error("Invalid action: {0}")]
    InvalidAction(#[from] crate::action::ActionError),

    /// Verification claim construction rejected
    #[error("Invalid claim: {0}")]
    InvalidClaim(#[from] crate::verify::ClaimError),

    /// Workflow definition could not be built
    #[error("Workflow definition error: {0}")]
    Definition(#[from] crate::definition::DefinitionError),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

impl FlowError {
    /// Create a driver error
    #[must_use]
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a stale element error
    #[must_use]
    pub fn stale(handle: impl Into<String>) -> Self {
        Self::StaleElement {
            handle: handle.into(),
        }
    }
}
