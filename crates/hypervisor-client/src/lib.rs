//! Hypervisor API Client
//!
//! Client for the node-local hypervisor API used by the node controller.
//!
//! # Example
//!
//! ```no_run
//! use hypervisor_client::{HypervisorClient, HypervisorClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HypervisorClient::new("http://127.0.0.1:16510".to_string())?;
//! client.ping().await?;
//!
//! // Subscribe before listing so no transition is missed in between
//! let mut events = client.subscribe_lifecycle().await?;
//! let domains = client.list_domains().await?;
//! println!("{} domains", domains.len());
//!
//! while let Some(event) = events.recv().await {
//!     println!("{} {}", event.name, event.code);
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod hypervisor_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::HypervisorClient;
pub use error::HypervisorError;
pub use hypervisor_trait::HypervisorClientTrait;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::MockHypervisorClient;
