//! Domain event bridge.
//!
//! Turns hypervisor lifecycle events into the list/watch vocabulary consumed
//! by [`watch_cache::WatchCache`], so that a domain cache is fed exactly like
//! a cache of cluster resources:
//!
//! 1. subscribe to lifecycle events, then list every domain and emit
//!    `Init`, `InitApply(domain)`..., `InitDone`
//! 2. map each lifecycle event to `Apply` (fresh details looked up from the
//!    hypervisor) or `Delete`
//! 3. when the subscription is lost or a lookup fails, go back to 1
//!
//! Subscribing before listing means a transition racing the list shows up as
//! an extra event afterwards instead of getting lost.

use crate::error::ControllerError;
use crds::{Devices, Domain, DomainSpec, DomainState, Memory};
use futures::Stream;
use hypervisor_client::{
    DomainEvent, DomainInfo, DomainRunState, HypervisorClientTrait, LifecycleEventCode,
};
use kube_runtime::watcher;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use watch_cache::ExponentialBackoff;

enum State {
    Relist { failures: u32 },
    Draining {
        pending: VecDeque<watcher::Event<Domain>>,
        events: mpsc::Receiver<DomainEvent>,
    },
    Watching { events: mpsc::Receiver<DomainEvent> },
}

struct Bridge {
    hypervisor: Arc<dyn HypervisorClientTrait>,
    namespace: String,
    backoff: ExponentialBackoff,
}

/// Stream of domain changes on this node, as seen by the hypervisor.
///
/// Domains are placed in `namespace`, the namespace of the VMs they belong to.
/// Errors are informational; the stream recovers by itself and never ends.
pub fn domain_events(
    hypervisor: Arc<dyn HypervisorClientTrait>,
    namespace: String,
    backoff: ExponentialBackoff,
) -> impl Stream<Item = Result<watcher::Event<Domain>, ControllerError>> + Send {
    let bridge = Bridge {
        hypervisor,
        namespace,
        backoff,
    };
    futures::stream::unfold(
        (bridge, State::Relist { failures: 0 }),
        |(bridge, mut state)| async move {
            loop {
                state = match state {
                    State::Relist { failures } => match bridge.relist(failures).await {
                        Ok(next) => next,
                        Err(e) => {
                            let retry = State::Relist {
                                failures: failures.saturating_add(1),
                            };
                            return Some((Err(e), (bridge, retry)));
                        }
                    },
                    State::Draining {
                        mut pending,
                        events,
                    } => match pending.pop_front() {
                        Some(event) => {
                            return Some((Ok(event), (bridge, State::Draining { pending, events })));
                        }
                        None => State::Watching { events },
                    },
                    State::Watching { mut events } => {
                        let Some(event) = events.recv().await else {
                            warn!("Domain event subscription closed, relisting");
                            let err = ControllerError::Watch(
                                "hypervisor event channel closed".to_string(),
                            );
                            return Some((Err(err), (bridge, State::Relist { failures: 1 })));
                        };
                        match bridge.translate(event).await {
                            Ok(Some(change)) => {
                                return Some((Ok(change), (bridge, State::Watching { events })));
                            }
                            Ok(None) => State::Watching { events },
                            Err(e) => {
                                warn!(error = %e, "Domain lookup failed, relisting");
                                return Some((Err(e), (bridge, State::Relist { failures: 1 })));
                            }
                        }
                    }
                };
            }
        },
    )
}

impl Bridge {
    async fn relist(&self, failures: u32) -> Result<State, ControllerError> {
        if failures > 0 {
            let delay = self.backoff.delay_for(failures - 1);
            debug!(failures, ?delay, "Backing off before relisting domains");
            tokio::time::sleep(delay).await;
        }

        let events = self.hypervisor.subscribe_lifecycle().await?;
        let domains = self.hypervisor.list_domains().await?;
        info!(domains = domains.len(), "Listed hypervisor domains");

        let mut pending = VecDeque::with_capacity(domains.len() + 2);
        pending.push_back(watcher::Event::Init);
        pending.extend(
            domains
                .into_iter()
                .map(|info| watcher::Event::InitApply(to_domain(&self.namespace, info))),
        );
        pending.push_back(watcher::Event::InitDone);
        Ok(State::Draining { pending, events })
    }

    async fn translate(
        &self,
        event: DomainEvent,
    ) -> Result<Option<watcher::Event<Domain>>, ControllerError> {
        debug!(domain = %event.name, code = %event.code, "Domain lifecycle event");
        if event.name.is_empty() {
            return Ok(None);
        }
        if event.code == LifecycleEventCode::Undefined {
            return Ok(Some(watcher::Event::Delete(self.tombstone(&event))));
        }

        match self.hypervisor.get_domain(&event.name).await {
            Ok(info) => Ok(Some(watcher::Event::Apply(to_domain(&self.namespace, info)))),
            Err(e) if e.is_not_found() => Ok(Some(watcher::Event::Delete(self.tombstone(&event)))),
            Err(e) => Err(e.into()),
        }
    }

    /// Identity-only domain for deletions.
    fn tombstone(&self, event: &DomainEvent) -> Domain {
        let mut spec = DomainSpec::minimal(&event.name);
        spec.uuid = event.uuid.clone();
        Domain::with_state(&self.namespace, spec, DomainState::NoState)
    }
}

fn to_state(state: DomainRunState) -> DomainState {
    match state {
        DomainRunState::NoState => DomainState::NoState,
        DomainRunState::Running => DomainState::Running,
        DomainRunState::Blocked => DomainState::Blocked,
        DomainRunState::Paused => DomainState::Paused,
        DomainRunState::Shutdown => DomainState::Shutdown,
        DomainRunState::Shutoff => DomainState::Shutoff,
        DomainRunState::Crashed => DomainState::Crashed,
        DomainRunState::PMSuspended => DomainState::PMSuspended,
    }
}

/// Domain mirror of a hypervisor domain.
pub fn to_domain(namespace: &str, info: DomainInfo) -> Domain {
    let spec = DomainSpec {
        memory: info.memory_kib.map(|value| Memory {
            value,
            unit: "KiB".to_string(),
        }),
        vcpus: info.vcpus,
        devices: Devices {
            emulator: info.emulator,
            ..Devices::default()
        },
        uuid: info.uuid,
        ..DomainSpec::minimal(&info.name)
    };
    Domain::with_state(namespace, spec, to_state(info.state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use hypervisor_client::MockHypervisorClient;
    use kube::ResourceExt;
    use std::time::Duration;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(100))
    }

    fn running(name: &str, uuid: &str) -> DomainInfo {
        DomainInfo::new(name, uuid, DomainRunState::Running)
    }

    async fn next<S>(stream: &mut S) -> Result<watcher::Event<Domain>, ControllerError>
    where
        S: Stream<Item = Result<watcher::Event<Domain>, ControllerError>> + Unpin,
    {
        stream.next().await.expect("domain stream never ends")
    }

    async fn expect_initial_list<S>(stream: &mut S) -> Vec<Domain>
    where
        S: Stream<Item = Result<watcher::Event<Domain>, ControllerError>> + Unpin,
    {
        assert!(matches!(next(stream).await, Ok(watcher::Event::Init)));
        let mut listed = Vec::new();
        loop {
            match next(stream).await {
                Ok(watcher::Event::InitApply(domain)) => listed.push(domain),
                Ok(watcher::Event::InitDone) => return listed,
                other => panic!("unexpected event during initial list: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_initial_list() {
        let mock = MockHypervisorClient::new();
        mock.add_domain(running("testvm", "1234"));
        mock.add_domain(DomainInfo::new("othervm", "5678", DomainRunState::Shutoff));

        let mut stream = Box::pin(domain_events(Arc::new(mock.clone()), "default".to_string(), backoff()));
        let listed = expect_initial_list(&mut stream).await;

        assert_eq!(listed.len(), 2);
        let testvm = listed.iter().find(|d| d.name_any() == "testvm").unwrap();
        assert_eq!(testvm.namespace().as_deref(), Some("default"));
        assert_eq!(testvm.spec.uuid, "1234");
        assert_eq!(testvm.state(), DomainState::Running);
        assert_eq!(mock.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_events_map_to_apply_and_delete() {
        let mock = MockHypervisorClient::new();
        let mut stream = Box::pin(domain_events(Arc::new(mock.clone()), "default".to_string(), backoff()));
        assert!(expect_initial_list(&mut stream).await.is_empty());

        mock.add_domain(running("testvm", "1234"));
        mock.emit("testvm", LifecycleEventCode::Started);
        match next(&mut stream).await {
            Ok(watcher::Event::Apply(domain)) => {
                assert_eq!(domain.name_any(), "testvm");
                assert_eq!(domain.state(), DomainState::Running);
            }
            other => panic!("expected apply, got {other:?}"),
        }

        mock.emit("testvm", LifecycleEventCode::Undefined);
        match next(&mut stream).await {
            Ok(watcher::Event::Delete(domain)) => {
                assert_eq!(domain.name_any(), "testvm");
                assert_eq!(domain.spec.uuid, "1234");
            }
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_event_for_vanished_domain_is_a_delete() {
        let mock = MockHypervisorClient::new();
        mock.add_domain(running("testvm", "1234"));
        let mut stream = Box::pin(domain_events(Arc::new(mock.clone()), "default".to_string(), backoff()));
        expect_initial_list(&mut stream).await;

        mock.emit("testvm", LifecycleEventCode::Stopped);
        mock.remove_domain("testvm");
        // lookup happens when the event is translated, after the removal
        assert!(matches!(next(&mut stream).await, Ok(watcher::Event::Delete(_))));
    }

    #[tokio::test]
    async fn test_replayed_event_is_idempotent() {
        let mock = MockHypervisorClient::new();
        mock.add_domain(running("testvm", "1234"));
        let mut stream = Box::pin(domain_events(Arc::new(mock.clone()), "default".to_string(), backoff()));
        expect_initial_list(&mut stream).await;

        mock.emit("testvm", LifecycleEventCode::Resumed);
        mock.emit("testvm", LifecycleEventCode::Resumed);
        let first = next(&mut stream).await;
        let second = next(&mut stream).await;
        match (first, second) {
            (Ok(watcher::Event::Apply(a)), Ok(watcher::Event::Apply(b))) => assert_eq!(a, b),
            other => panic!("expected two applies, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_subscription_triggers_relist() {
        let mock = MockHypervisorClient::new();
        mock.add_domain(running("testvm", "1234"));
        let mut stream = Box::pin(domain_events(Arc::new(mock.clone()), "default".to_string(), backoff()));
        expect_initial_list(&mut stream).await;

        mock.disconnect();
        mock.remove_domain("testvm");
        assert!(matches!(next(&mut stream).await, Err(ControllerError::Watch(_))));

        let relisted = expect_initial_list(&mut stream).await;
        assert!(relisted.is_empty());
        assert_eq!(mock.subscribe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_failures_are_retried() {
        let mock = MockHypervisorClient::new();
        mock.add_domain(running("testvm", "1234"));
        mock.fail_next_lists(2);
        let mut stream = Box::pin(domain_events(Arc::new(mock.clone()), "default".to_string(), backoff()));

        assert!(next(&mut stream).await.is_err());
        assert!(next(&mut stream).await.is_err());
        assert_eq!(expect_initial_list(&mut stream).await.len(), 1);
        assert_eq!(mock.list_calls(), 3);
    }

    #[test]
    fn test_to_domain_carries_details() {
        let mut info = running("testvm", "1234");
        info.emulator = Some("/usr/bin/qemu-kvm".to_string());
        info.memory_kib = Some(65536);
        info.vcpus = Some(2);

        let domain = to_domain("vms", info);
        assert_eq!(domain.namespace().as_deref(), Some("vms"));
        assert_eq!(domain.spec.name, "testvm");
        assert_eq!(domain.spec.devices.emulator.as_deref(), Some("/usr/bin/qemu-kvm"));
        assert_eq!(domain.spec.memory.as_ref().map(|m| m.value), Some(65536));
        assert_eq!(domain.spec.vcpus, Some(2));
    }
}
