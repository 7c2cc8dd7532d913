//! Startup sequencing.
//!
//! Phases run strictly in order and never go back:
//!
//! `Init -> WarmDomainCache -> SyncedBarrier -> SeedVmStore -> RunControllers -> SteadyState`
//!
//! Domains that already exist on the node are seeded into the VM store as
//! identity-only VMs before the VM cache starts. The VM cache's first list
//! then reports every seeded VM that is gone from the cluster as a deletion,
//! which runs the delete path exactly once for domains left behind while the
//! process was down. VM workers hold off until that first list is applied.

use crate::domain_bridge::domain_events;
use crate::domain_controller::DomainController;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::recorder::EventRecorder;
use crate::vm_controller::{spawn_workers, VmController, VmEventHandler};
use crds::{Domain, VirtualMachine};
use futures::Stream;
use hypervisor_client::HypervisorClientTrait;
use kube::ResourceExt;
use kube_runtime::watcher;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info};
use watch_cache::{ExponentialBackoff, ObjectKey, Store, WatchCache, WorkQueue};

/// Startup phase; ordered the way the phases run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapPhase {
    Init,
    WarmDomainCache,
    SyncedBarrier,
    SeedVmStore,
    RunControllers,
    SteadyState,
}

#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    /// Namespace of VMs and domain mirrors
    pub namespace: String,
    /// Number of VM workers
    pub workers: usize,
    /// Requeues of one key before it is dropped
    pub max_retries: u32,
    /// Used for work queue retries and domain relists
    pub backoff: ExponentialBackoff,
}

/// Startup sequencer; consumed by [`Bootstrap::run`].
pub struct Bootstrap {
    hypervisor: Arc<dyn HypervisorClientTrait>,
    reconciler: Arc<Reconciler>,
    recorder: Arc<dyn EventRecorder>,
    settings: BootstrapSettings,
    phase: watch::Sender<BootstrapPhase>,
}

/// Everything started by a completed bootstrap.
pub struct Running {
    caches: JoinSet<()>,
    pub workers: Vec<JoinHandle<()>>,
    /// VM keys waiting for a worker
    pub queue: WorkQueue<ObjectKey>,
    /// Backing store of the VM cache
    pub vm_store: Store<VirtualMachine>,
}

impl fmt::Debug for Running {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Running")
            .field("caches", &self.caches.len())
            .field("workers", &self.workers.len())
            .field("queue", &self.queue)
            .field("vm_store", &self.vm_store)
            .finish_non_exhaustive()
    }
}

impl Running {
    /// Resolves when either cache task ends. Both run until shutdown, so this
    /// only returns early if one of them died.
    pub async fn wait_for_cache_exit(&mut self) -> Option<Result<(), JoinError>> {
        self.caches.join_next().await
    }

    /// Stops the workers and waits for every task.
    ///
    /// The shutdown signal given to [`Bootstrap::run`] must already have
    /// fired, otherwise the cache tasks keep running.
    pub async fn shutdown(mut self) {
        self.queue.shut_down();
        for worker in self.workers {
            if let Err(e) = worker.await {
                debug!(error = %e, "VM worker ended abnormally");
            }
        }
        while let Some(result) = self.caches.join_next().await {
            if let Err(e) = result {
                debug!(error = %e, "Cache task ended abnormally");
            }
        }
    }
}

impl Bootstrap {
    pub fn new(
        hypervisor: Arc<dyn HypervisorClientTrait>,
        reconciler: Arc<Reconciler>,
        recorder: Arc<dyn EventRecorder>,
        settings: BootstrapSettings,
    ) -> Self {
        let (phase, _) = watch::channel(BootstrapPhase::Init);
        Self {
            hypervisor,
            reconciler,
            recorder,
            settings,
            phase,
        }
    }

    /// Observes phase transitions.
    pub fn phases(&self) -> watch::Receiver<BootstrapPhase> {
        self.phase.subscribe()
    }

    fn advance(&self, next: BootstrapPhase) -> Result<(), ControllerError> {
        let current = *self.phase.borrow();
        if next <= current {
            return Err(ControllerError::Bootstrap(format!(
                "cannot move from {current:?} back to {next:?}"
            )));
        }
        self.phase.send_replace(next);
        info!(phase = ?next, "Bootstrap phase");
        Ok(())
    }

    /// Brings the controllers up.
    ///
    /// `vm_events` is the list/watch stream of the VMs assigned to this node.
    /// Fails if `shutdown` fires before the domain cache synced.
    pub async fn run<S, E>(
        self,
        vm_events: S,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Running, ControllerError>
    where
        S: Stream<Item = Result<watcher::Event<VirtualMachine>, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.advance(BootstrapPhase::WarmDomainCache)?;
        let warm_cache: WatchCache<Domain> = WatchCache::new("domains-warmup");
        let (warm_stop, warm_stop_rx) = watch::channel(false);
        let warm_task = {
            let cache = warm_cache.clone();
            let events = domain_events(
                Arc::clone(&self.hypervisor),
                self.settings.namespace.clone(),
                self.settings.backoff,
            );
            tokio::spawn(async move { cache.run(events, warm_stop_rx).await })
        };

        self.advance(BootstrapPhase::SyncedBarrier)?;
        let synced = warm_cache.wait_for_sync(&mut shutdown.clone()).await;
        warm_stop.send_replace(true);
        if let Err(e) = warm_task.await {
            debug!(error = %e, "Domain warm-up task ended abnormally");
        }
        if !synced {
            return Err(ControllerError::Bootstrap(
                "stopped before the domain cache synced".to_string(),
            ));
        }

        self.advance(BootstrapPhase::SeedVmStore)?;
        let vm_store: Store<VirtualMachine> = Store::default();
        for domain in warm_cache.store().list() {
            let namespace = domain
                .namespace()
                .unwrap_or_else(|| self.settings.namespace.clone());
            vm_store.insert(VirtualMachine::reference(&namespace, &domain.name_any()));
        }
        info!(domains = vm_store.len(), "Seeded VM store with existing domains");

        self.advance(BootstrapPhase::RunControllers)?;
        let queue = WorkQueue::new(self.settings.backoff);

        let domain_controller = DomainController::new(
            Arc::clone(&self.hypervisor),
            self.settings.namespace.clone(),
            self.settings.backoff,
            queue.clone(),
        );
        let mut caches = JoinSet::new();
        caches.spawn(domain_controller.run(shutdown.clone()));

        let vm_cache = WatchCache::with_store("virtualmachines", vm_store.clone());
        vm_cache.subscribe(Arc::new(VmEventHandler::new(queue.clone())));
        {
            let vm_cache = vm_cache.clone();
            let shutdown = shutdown.clone();
            caches.spawn(async move { vm_cache.run(vm_events, shutdown).await });
        }

        let vm_controller = VmController::new(
            vm_store.clone(),
            queue.clone(),
            Arc::clone(&self.reconciler),
            Arc::clone(&self.recorder),
            self.settings.namespace.clone(),
            self.settings.max_retries,
        );
        let workers = spawn_workers(&vm_controller, self.settings.workers, &vm_cache, &shutdown);

        self.advance(BootstrapPhase::SteadyState)?;
        Ok(Running {
            caches,
            workers,
            queue,
            vm_store,
        })
    }
}
