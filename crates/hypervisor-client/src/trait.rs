//! HypervisorClient trait for mocking
//!
//! The concrete `HypervisorClient` implements this trait; tests use
//! `MockHypervisorClient` (feature `test-util`).

use crate::error::HypervisorError;
use crate::models::{DomainEvent, DomainInfo};
use tokio::sync::mpsc;

/// Operations the node controller needs from the hypervisor.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait HypervisorClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Check that the hypervisor API is reachable
    async fn ping(&self) -> Result<(), HypervisorError>;

    /// List every domain defined on this node
    async fn list_domains(&self) -> Result<Vec<DomainInfo>, HypervisorError>;

    /// Look up a single domain; `HypervisorError::NotFound` if it does not exist
    async fn get_domain(&self, name: &str) -> Result<DomainInfo, HypervisorError>;

    /// Subscribe to lifecycle events.
    ///
    /// Events produced after this call returns are delivered in order on the
    /// returned channel. The channel closes when the subscription is lost; the
    /// caller is expected to resubscribe and relist.
    async fn subscribe_lifecycle(&self) -> Result<mpsc::Receiver<DomainEvent>, HypervisorError>;

    /// Stop every subscription and release the connection
    async fn close(&self);
}
