//! Mock HypervisorClient for unit testing
//!
//! Keeps domains in memory and lets tests push lifecycle events to every
//! open subscription, drop subscriptions, and inject list failures.

use crate::error::HypervisorError;
use crate::hypervisor_trait::HypervisorClientTrait;
use crate::models::{DomainEvent, DomainInfo, LifecycleEventCode};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

const MOCK_CHANNEL_CAPACITY: usize = 1024;

/// In-memory hypervisor
#[derive(Clone, Debug, Default)]
pub struct MockHypervisorClient {
    domains: Arc<Mutex<BTreeMap<String, DomainInfo>>>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<DomainEvent>>>>,
    list_failures: Arc<AtomicU32>,
    list_calls: Arc<AtomicUsize>,
    subscribe_calls: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockHypervisorClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a domain (for test setup); emits no event
    pub fn add_domain(&self, domain: DomainInfo) {
        lock(&self.domains).insert(domain.name.clone(), domain);
    }

    /// Remove a domain (for test setup); emits no event
    pub fn remove_domain(&self, name: &str) -> Option<DomainInfo> {
        lock(&self.domains).remove(name)
    }

    /// Deliver a lifecycle event to every live subscription
    pub fn emit(&self, name: &str, code: LifecycleEventCode) {
        let uuid = lock(&self.domains)
            .get(name)
            .map(|d| d.uuid.clone())
            .unwrap_or_default();
        let event = DomainEvent::new(name, uuid, code);
        lock(&self.subscribers).retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    /// Drop every subscription, closing the event channels
    pub fn disconnect(&self) {
        lock(&self.subscribers).clear();
    }

    /// Make the next `n` calls to `list_domains` fail
    pub fn fail_next_lists(&self, n: u32) {
        self.list_failures.store(n, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl HypervisorClientTrait for MockHypervisorClient {
    fn base_url(&self) -> &str {
        "mock://hypervisor"
    }

    async fn ping(&self) -> Result<(), HypervisorError> {
        if self.is_closed() {
            return Err(HypervisorError::Disconnected("mock closed".to_string()));
        }
        Ok(())
    }

    async fn list_domains(&self) -> Result<Vec<DomainInfo>, HypervisorError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .list_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(HypervisorError::Api("injected list failure".to_string()));
        }
        Ok(lock(&self.domains).values().cloned().collect())
    }

    async fn get_domain(&self, name: &str) -> Result<DomainInfo, HypervisorError> {
        lock(&self.domains)
            .get(name)
            .cloned()
            .ok_or_else(|| HypervisorError::NotFound(format!("domain {name}")))
    }

    async fn subscribe_lifecycle(&self) -> Result<mpsc::Receiver<DomainEvent>, HypervisorError> {
        if self.is_closed() {
            return Err(HypervisorError::Disconnected("mock closed".to_string()));
        }
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(MOCK_CHANNEL_CAPACITY);
        lock(&self.subscribers).push(tx);
        Ok(rx)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.disconnect();
    }
}
