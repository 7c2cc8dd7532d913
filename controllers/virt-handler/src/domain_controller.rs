//! Domain controller: relays domain changes to the VM work queue.

use crate::domain_bridge::domain_events;
use crds::Domain;
use hypervisor_client::HypervisorClientTrait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use watch_cache::{EventHandler, ExponentialBackoff, ObjectKey, WatchCache, WorkQueue};

/// Domain cache of this node with a [`DomainRelay`] subscribed to it.
pub struct DomainController {
    cache: WatchCache<Domain>,
    hypervisor: Arc<dyn HypervisorClientTrait>,
    namespace: String,
    backoff: ExponentialBackoff,
}

impl DomainController {
    /// Creates the domain cache and subscribes a relay feeding `queue`.
    pub fn new(
        hypervisor: Arc<dyn HypervisorClientTrait>,
        namespace: String,
        backoff: ExponentialBackoff,
        queue: WorkQueue<ObjectKey>,
    ) -> Self {
        let cache = WatchCache::new("domains");
        cache.subscribe(Arc::new(DomainRelay::new(queue)));
        Self {
            cache,
            hypervisor,
            namespace,
            backoff,
        }
    }

    /// Domain cache fed by [`DomainController::run`].
    pub fn cache(&self) -> &WatchCache<Domain> {
        &self.cache
    }

    /// Feeds the cache from the hypervisor until `shutdown` fires.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!("Starting domain controller");
        let events = domain_events(self.hypervisor, self.namespace, self.backoff);
        self.cache.run(events, shutdown).await;
    }
}

/// Enqueues the VM key of every changed domain.
///
/// Adds that arrive with the cache's initial list are skipped: those domains
/// were seeded into the VM store during bootstrap and the VM cache's first
/// list already settles them.
pub struct DomainRelay {
    queue: WorkQueue<ObjectKey>,
}

impl DomainRelay {
    /// Creates a relay feeding `queue`.
    pub fn new(queue: WorkQueue<ObjectKey>) -> Self {
        Self { queue }
    }

    fn relay(&self, domain: &Domain, what: &str) {
        let key = ObjectKey::from_resource(domain);
        debug!(vm = %key, change = what, "Relaying domain change");
        self.queue.add(key);
    }
}

impl EventHandler<Domain> for DomainRelay {
    fn on_add(&self, domain: &Arc<Domain>, is_in_initial_list: bool) {
        if is_in_initial_list {
            return;
        }
        self.relay(domain, "add");
    }

    fn on_update(&self, _old: &Arc<Domain>, new: &Arc<Domain>) {
        self.relay(new, "update");
    }

    fn on_delete(&self, domain: &Arc<Domain>) {
        self.relay(domain, "delete");
    }
}
