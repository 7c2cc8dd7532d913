//! Controller-specific error types.
//!
//! Kubernetes API failures are classified on the way in: the reconciler only
//! cares whether a write hit a missing object, a stale version, or something
//! worth retrying.

use hypervisor_client::HypervisorError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the node controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Hypervisor API error
    #[error("Hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    /// Target object does not exist (any more)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write lost an optimistic concurrency race
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource violates an invariant the controller relies on
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Placeholder workload could not be created
    #[error("Failed to start VM: {0}")]
    StartFailed(String),

    /// Placeholder workload of the same name is still around
    #[error("Placeholder already exists: {0}")]
    AlreadyExists(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Startup sequencing failed or was interrupted
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),
}

impl ControllerError {
    /// Classifies a Kubernetes API error by its HTTP status.
    pub fn from_kube(err: KubeError, what: &str) -> Self {
        match &err {
            KubeError::Api(resp) if resp.code == 404 => Self::NotFound(what.to_string()),
            KubeError::Api(resp) if resp.code == 409 => {
                Self::Conflict(format!("{what}: {}", resp.message))
            }
            _ => Self::Kube(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
            || matches!(self, Self::Hypervisor(e) if e.is_not_found())
    }
}
