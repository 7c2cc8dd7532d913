//! VM work processing.
//!
//! Changes seen by the VM cache (and relayed domain changes) are reduced to
//! `namespace/name` keys on a [`WorkQueue`]. Workers pull keys, look the VM
//! up in the cache and run the reconciler against an owned copy; a key whose
//! VM is no longer cached goes through the delete path.

use crate::error::ControllerError;
use crate::reconciler::{Action, Reconciler};
use crate::recorder::{EventRecorder, EventType, REASON_RETRIES_EXHAUSTED};
use crds::VirtualMachine;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use watch_cache::{EventHandler, ObjectKey, Store, WatchCache, WorkQueue};

/// Enqueues the key of every changed VM.
pub struct VmEventHandler {
    queue: WorkQueue<ObjectKey>,
}

impl VmEventHandler {
    /// Creates a handler feeding `queue`.
    pub fn new(queue: WorkQueue<ObjectKey>) -> Self {
        Self { queue }
    }
}

impl EventHandler<VirtualMachine> for VmEventHandler {
    fn on_add(&self, vm: &Arc<VirtualMachine>, _is_in_initial_list: bool) {
        self.queue.add(ObjectKey::from_resource(vm.as_ref()));
    }

    fn on_update(&self, _old: &Arc<VirtualMachine>, new: &Arc<VirtualMachine>) {
        self.queue.add(ObjectKey::from_resource(new.as_ref()));
    }

    fn on_delete(&self, vm: &Arc<VirtualMachine>) {
        self.queue.add(ObjectKey::from_resource(vm.as_ref()));
    }
}

/// Pool of workers draining the VM queue.
#[derive(Clone)]
pub struct VmController {
    store: Store<VirtualMachine>,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<Reconciler>,
    recorder: Arc<dyn EventRecorder>,
    namespace: String,
    max_retries: u32,
}

impl VmController {
    /// Creates a worker pool over the VM cache's `store`.
    ///
    /// `namespace` is used for keys without one; a key is dropped after
    /// `max_retries` consecutive requeues.
    pub fn new(
        store: Store<VirtualMachine>,
        queue: WorkQueue<ObjectKey>,
        reconciler: Arc<Reconciler>,
        recorder: Arc<dyn EventRecorder>,
        namespace: String,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            queue,
            reconciler,
            recorder,
            namespace,
            max_retries,
        }
    }

    /// Runs one worker until the queue shuts down.
    pub async fn run_worker(self, id: usize) {
        debug!(worker = id, "VM worker started");
        while self.process_next_item().await {}
        debug!(worker = id, "VM worker stopped");
    }

    /// Handles one key. Returns false once the queue is shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let vm = self.store.get(&key);
        let outcome = AssertUnwindSafe(self.execute(&key, vm.as_deref()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(Action::Done)) => self.queue.forget(&key),
            Ok(Ok(Action::Requeue(cause))) => self.requeue(&key, vm.as_deref(), &cause),
            Ok(Err(e)) => {
                error!(vm = %key, error = %e, "Reconcile failed permanently, dropping key");
                self.queue.forget(&key);
            }
            Err(_) => {
                error!(vm = %key, "Reconcile panicked, dropping key");
                self.queue.forget(&key);
            }
        }

        self.queue.done(&key);
        true
    }

    async fn execute(
        &self,
        key: &ObjectKey,
        vm: Option<&VirtualMachine>,
    ) -> Result<Action, ControllerError> {
        match vm {
            Some(vm) => self.reconciler.reconcile(vm).await,
            None => {
                let namespace = key.namespace.as_deref().unwrap_or(&self.namespace);
                debug!(vm = %key, "VM no longer cached, cleaning up");
                self.reconciler
                    .on_delete(&VirtualMachine::reference(namespace, &key.name))
                    .await
            }
        }
    }

    fn requeue(&self, key: &ObjectKey, vm: Option<&VirtualMachine>, cause: &ControllerError) {
        let retries = self.queue.num_requeues(key);
        if retries >= self.max_retries {
            error!(vm = %key, retries, error = %cause, "Giving up on VM after repeated failures");
            if let Some(vm) = vm {
                self.recorder.record(
                    vm,
                    EventType::Warning,
                    REASON_RETRIES_EXHAUSTED,
                    &format!("Dropped after {retries} retries: {cause}"),
                );
            }
            self.queue.forget(key);
            return;
        }
        warn!(vm = %key, retries, error = %cause, "Reconcile failed, requeueing");
        self.queue.add_rate_limited(key.clone());
    }
}

/// Spawns `workers` workers; they exit once `controller`'s queue shuts down.
///
/// Workers take their first key only after `vm_cache` applied its first list,
/// so a key relayed earlier is not mistaken for a deleted VM. Keys added in
/// the meantime stay queued. Workers that see `shutdown` before the sync exit
/// without processing anything.
pub fn spawn_workers(
    controller: &VmController,
    workers: usize,
    vm_cache: &WatchCache<VirtualMachine>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    info!(workers, "Starting VM workers");
    (0..workers)
        .map(|id| {
            let controller = controller.clone();
            let vm_cache = vm_cache.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                if !vm_cache.wait_for_sync(&mut shutdown).await {
                    debug!(worker = id, "Stopped before the VM cache synced");
                    return;
                }
                controller.run_worker(id).await;
            })
        })
        .collect()
}
