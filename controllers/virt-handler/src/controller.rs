//! Main controller implementation.
//!
//! Builds the Kubernetes and hypervisor clients, runs the bootstrap sequence
//! and then supervises the running tasks until shutdown.

use crate::bootstrap::{Bootstrap, BootstrapSettings, Running};
use crate::cluster::KubeVirtualMachineClient;
use crate::config::Config;
use crate::domain_manager::PodDomainManager;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::recorder::{EventRecorder, KubeEventRecorder};
use crds::{node_selector, VirtualMachine};
use hypervisor_client::{HypervisorClient, HypervisorClientTrait};
use kube::{Api, Client};
use kube_runtime::{watcher, WatchStreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Node controller for VirtualMachines and their domains.
pub struct Controller {
    running: Running,
    hypervisor: Arc<HypervisorClient>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Controller {
    /// Connects to both APIs and brings the controllers up.
    ///
    /// Blocks until the domain cache has synced. An interrupt received in the
    /// meantime aborts startup.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!(node = %config.node_name, "Initializing virt-handler");

        let kube_client = Client::try_default().await?;

        let hypervisor = Arc::new(HypervisorClient::new(config.hypervisor_url.clone())?);
        info!("Checking hypervisor connectivity...");
        hypervisor.ping().await.map_err(|e| {
            error!("Hypervisor at {} is not reachable: {}", config.hypervisor_url, e);
            ControllerError::Hypervisor(e)
        })?;
        info!("Hypervisor reachable");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        spawn_signal_handler(Arc::clone(&shutdown));

        let recorder: Arc<dyn EventRecorder> = Arc::new(KubeEventRecorder::new(
            kube_client.clone(),
            config.node_name.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(PodDomainManager::new(
                kube_client.clone(),
                config.launcher_image.clone(),
            )),
            Arc::new(KubeVirtualMachineClient::new(kube_client.clone())),
            Arc::clone(&recorder),
            config.emulator_path.clone(),
        ));

        let vm_api: Api<VirtualMachine> = Api::namespaced(kube_client, &config.namespace);
        let vm_events = watcher(
            vm_api,
            watcher::Config::default().labels(&node_selector(&config.node_name)),
        )
        .default_backoff();

        let settings = BootstrapSettings {
            namespace: config.namespace.clone(),
            workers: config.workers,
            max_retries: config.max_retries,
            backoff: config.backoff(),
        };
        let hypervisor_api: Arc<dyn HypervisorClientTrait> = hypervisor.clone();
        let running = Bootstrap::new(hypervisor_api, reconciler, recorder, settings)
            .run(vm_events, shutdown_rx)
            .await;

        let running = match running {
            Ok(running) => running,
            Err(e) => {
                hypervisor.close().await;
                return Err(e);
            }
        };

        Ok(Self {
            running,
            hypervisor,
            shutdown,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("virt-handler running");

        let mut shutdown_rx = self.shutdown.subscribe();
        let result = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => Ok(()),
            exited = self.running.wait_for_cache_exit() => {
                let reason = match exited {
                    Some(Err(e)) => format!("cache task panicked: {e}"),
                    _ => "cache task exited unexpectedly".to_string(),
                };
                error!("{}", reason);
                Err(ControllerError::Watch(reason))
            }
        };

        info!("Shutting down virt-handler");
        self.shutdown.send_replace(true);
        self.running.shutdown().await;
        self.hypervisor.close().await;
        info!("virt-handler stopped");
        result
    }
}

/// Flips `shutdown` on the first interrupt.
fn spawn_signal_handler(shutdown: Arc<watch::Sender<bool>>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for interrupts: {}", e);
            return;
        }
        info!("Interrupt received");
        shutdown.send_replace(true);
    });
}
