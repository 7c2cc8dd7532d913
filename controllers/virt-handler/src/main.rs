//! virt-handler
//!
//! Node-local controller for VirtualMachines:
//! - mirrors the hypervisor's domains into a local cache
//! - starts a placeholder workload for every VM scheduled to this node
//! - cleans up domains whose VM is gone, including ones left behind while the
//!   process was down
//!
//! Configuration is read from the environment; see [`config::Config`].

mod bootstrap;
mod cluster;
mod config;
mod controller;
mod domain_bridge;
mod domain_controller;
mod domain_manager;
mod error;
mod reconciler;
mod recorder;
mod vm_controller;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting virt-handler");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Node: {}", config.node_name);
    info!("  Namespace: {}", config.namespace);
    info!("  Hypervisor URL: {}", config.hypervisor_url);
    info!("  Launcher image: {}", config.launcher_image);
    info!("  Workers: {}", config.workers);
    info!(
        "  Retry backoff: {:?}..{:?}, max {} retries",
        config.retry_base_delay, config.retry_max_delay, config.max_retries
    );

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
