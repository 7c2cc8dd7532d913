//! Kubernetes event recording.
//!
//! Events are informational: recording never blocks a reconcile and failures
//! are only logged.

use crds::VirtualMachine;
use k8s_openapi::api::core::v1::{Event, EventSource};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client, Resource, ResourceExt};
use std::fmt;
use tracing::{debug, warn};

/// Reporting component stamped on every event
pub const COMPONENT: &str = "virt-handler";

/// Placeholder created and VM handed over to scheduling
pub const REASON_SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
/// Placeholders of a deleted VM removed
pub const REASON_SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
/// Placeholder of an earlier, incomplete start of the same VM removed
pub const REASON_LEFTOVER_PLACEHOLDER: &str = "LeftoverPlaceholder";
/// Placeholder of a deleted VM with the same name removed
pub const REASON_ORPHANED_PLACEHOLDER: &str = "OrphanedPlaceholder";
/// VM dropped from the work queue after too many failed attempts
pub const REASON_RETRIES_EXHAUSTED: &str = "RetriesExhausted";

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Expected progress
    Normal,
    /// Something an operator may need to look at
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        })
    }
}

/// Fire-and-forget sink for events about a VM.
pub trait EventRecorder: Send + Sync {
    /// Records an event about `vm`. Returns immediately; failures are logged.
    fn record(&self, vm: &VirtualMachine, event_type: EventType, reason: &str, message: &str);
}

/// Writes `core/v1` Events through the cluster API.
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    host: String,
}

impl KubeEventRecorder {
    /// Creates a recorder reporting from node `host`.
    pub fn new(client: Client, host: String) -> Self {
        Self { client, host }
    }

    fn build_event(&self, vm: &VirtualMachine, event_type: EventType, reason: &str, message: &str) -> Event {
        let name = vm.name_any();
        Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{name}.")),
                namespace: vm.namespace(),
                ..Default::default()
            },
            involved_object: vm.object_ref(&()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some(event_type.to_string()),
            count: Some(1),
            source: Some(EventSource {
                component: Some(COMPONENT.to_string()),
                host: Some(self.host.clone()),
            }),
            reporting_component: Some(COMPONENT.to_string()),
            reporting_instance: Some(self.host.clone()),
            ..Default::default()
        }
    }
}

impl EventRecorder for KubeEventRecorder {
    fn record(&self, vm: &VirtualMachine, event_type: EventType, reason: &str, message: &str) {
        let event = self.build_event(vm, event_type, reason, message);
        let namespace = vm.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        let vm_name = vm.name_any();
        let reason = reason.to_string();

        tokio::spawn(async move {
            match api.create(&PostParams::default(), &event).await {
                Ok(_) => debug!(vm = %vm_name, reason = %reason, "Recorded event"),
                Err(e) => warn!(vm = %vm_name, reason = %reason, error = %e, "Failed to record event"),
            }
        });
    }
}
