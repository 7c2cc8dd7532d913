//! Test utilities for unit testing reconcilers
//!
//! In-memory stand-ins for the collaborators of the reconciler and helpers
//! for creating test data.

use crate::cluster::VirtualMachineClient;
use crate::domain_manager::{build_placeholder, DomainManager};
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::recorder::{EventRecorder, EventType};
use async_trait::async_trait;
use crds::{
    VirtualMachine, VirtualMachineSpec, VirtualMachineStatus, VmPhase, DOMAIN_LABEL, VM_UID_LABEL,
};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use kube::ResourceExt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const TEST_EMULATOR: &str = "/usr/local/bin/qemu-x86_64";

/// Helper to create a test VirtualMachine
pub fn create_test_vm(namespace: &str, name: &str, uid: Option<&str>) -> VirtualMachine {
    let mut vm = VirtualMachine::new(name, VirtualMachineSpec::default());
    vm.metadata.namespace = Some(namespace.to_string());
    vm.metadata.uid = uid.map(str::to_string);
    vm.metadata.resource_version = Some("1".to_string());
    vm
}

/// Helper to create a test VirtualMachine in `phase`
pub fn create_test_vm_in_phase(name: &str, uid: &str, phase: VmPhase) -> VirtualMachine {
    let mut vm = create_test_vm("default", name, Some(uid));
    vm.status = Some(VirtualMachineStatus {
        phase,
        node_name: None,
    });
    vm
}

/// Helper to create a running placeholder pod for VM `name` created for `uid`
pub fn create_test_placeholder(name: &str, uid: &str) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(crate::domain_manager::placeholder_name(name));
    pod.metadata.namespace = Some("default".to_string());
    pod.metadata.labels = Some(BTreeMap::from([
        (DOMAIN_LABEL.to_string(), name.to_string()),
        (VM_UID_LABEL.to_string(), uid.to_string()),
    ]));
    pod
}

/// Helper to create a placeholder that already ran to completion
pub fn create_test_terminated_placeholder(name: &str, uid: &str) -> Pod {
    let mut pod = create_test_placeholder(name, uid);
    pod.status = Some(PodStatus {
        phase: Some("Failed".to_string()),
        ..Default::default()
    });
    pod
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory domain manager backed by a list of pods.
///
/// Creating a placeholder that already exists fails, like the API server does,
/// and terminated placeholders are not reported as running.
#[derive(Default)]
pub struct MockDomainManager {
    pods: Mutex<Vec<Pod>>,
    started: Mutex<Vec<VirtualMachine>>,
    deleted: Mutex<Vec<String>>,
    start_failures: AtomicU32,
    delete_failures: AtomicU32,
    list_failures: AtomicU32,
}

impl MockDomainManager {
    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.pods.lock().unwrap().clone()
    }

    /// VMs passed to successful `start_vm` calls
    pub fn started(&self) -> Vec<VirtualMachine> {
        self.started.lock().unwrap().clone()
    }

    /// Names of VMs passed to successful `delete_vm` calls
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn fail_next_starts(&self, n: u32) {
        self.start_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_deletes(&self, n: u32) {
        self.delete_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_lists(&self, n: u32) {
        self.list_failures.store(n, Ordering::SeqCst);
    }

    fn domain_pods(&self, name: &str) -> Vec<Pod> {
        self.pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.labels().get(DOMAIN_LABEL).map(String::as_str) == Some(name))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DomainManager for MockDomainManager {
    async fn start_vm(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        if take_failure(&self.start_failures) {
            return Err(ControllerError::StartFailed("injected start failure".to_string()));
        }
        let pod = build_placeholder(vm, "virt-launcher:test")?;
        let mut pods = self.pods.lock().unwrap();
        if pods.iter().any(|p| p.name_any() == pod.name_any()) {
            return Err(ControllerError::AlreadyExists(pod.name_any()));
        }
        pods.push(pod);
        self.started.lock().unwrap().push(vm.clone());
        Ok(())
    }

    async fn delete_vm(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        if take_failure(&self.delete_failures) {
            return Err(ControllerError::Watch("injected delete failure".to_string()));
        }
        let name = vm.name_any();
        self.pods
            .lock()
            .unwrap()
            .retain(|p| p.labels().get(DOMAIN_LABEL) != Some(&name));
        self.deleted.lock().unwrap().push(name);
        Ok(())
    }

    async fn get_running_placeholders(&self, vm: &VirtualMachine) -> Result<Vec<Pod>, ControllerError> {
        if take_failure(&self.list_failures) {
            return Err(ControllerError::Watch("injected list failure".to_string()));
        }
        Ok(self
            .domain_pods(&vm.name_any())
            .into_iter()
            .filter(|p| !is_terminated(p))
            .collect())
    }
}

/// Records status writes; queued errors are returned first.
#[derive(Default)]
pub struct MockVirtualMachineClient {
    updates: Mutex<Vec<VirtualMachine>>,
    errors: Mutex<VecDeque<ControllerError>>,
}

impl MockVirtualMachineClient {
    pub fn push_error(&self, err: ControllerError) {
        self.errors.lock().unwrap().push_back(err);
    }

    pub fn updates(&self) -> Vec<VirtualMachine> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl VirtualMachineClient for MockVirtualMachineClient {
    async fn update_status(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        if let Some(err) = self.errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.updates.lock().unwrap().push(vm.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub vm: String,
    pub event_type: EventType,
    pub reason: String,
}

#[derive(Default)]
pub struct MockEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MockEventRecorder {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

impl EventRecorder for MockEventRecorder {
    fn record(&self, vm: &VirtualMachine, event_type: EventType, reason: &str, _message: &str) {
        self.events.lock().unwrap().push(RecordedEvent {
            vm: vm.name_any(),
            event_type,
            reason: reason.to_string(),
        });
    }
}

/// Reconciler wired to fresh mocks.
pub struct TestHarness {
    pub domains: Arc<MockDomainManager>,
    pub cluster: Arc<MockVirtualMachineClient>,
    pub recorder: Arc<MockEventRecorder>,
    pub reconciler: Arc<Reconciler>,
}

impl TestHarness {
    pub fn new() -> Self {
        let domains = Arc::new(MockDomainManager::default());
        let cluster = Arc::new(MockVirtualMachineClient::default());
        let recorder = Arc::new(MockEventRecorder::default());
        let reconciler = Arc::new(Reconciler::new(
            domains.clone(),
            cluster.clone(),
            recorder.clone(),
            TEST_EMULATOR.to_string(),
        ));
        Self {
            domains,
            cluster,
            recorder,
            reconciler,
        }
    }
}
