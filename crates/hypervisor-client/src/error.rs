//! Hypervisor client errors

use thiserror::Error;

/// Errors that can occur when talking to the hypervisor API
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Hypervisor API returned an error
    #[error("Hypervisor API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Domain not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Connection closed or event subscription lost
    #[error("Disconnected: {0}")]
    Disconnected(String),
}

impl HypervisorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
