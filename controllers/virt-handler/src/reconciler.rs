//! VM reconciliation logic.
//!
//! Turns a freshly declared VirtualMachine into a placeholder pod and hands
//! it over to the scheduler by stamping the `Scheduling` phase. Everything
//! after that phase belongs to other controllers.
//!
//! Reconcile results are typed:
//! - `Ok(Action::Done)`: converged, or nothing to do
//! - `Ok(Action::Requeue(cause))`: transient failure, retry with backoff
//! - `Err(e)`: permanent failure, retrying would not help

use crate::cluster::VirtualMachineClient;
use crate::domain_manager::{placeholder_owner_uid, DomainManager};
use crate::error::ControllerError;
use crate::recorder::{
    EventRecorder, EventType, REASON_LEFTOVER_PLACEHOLDER, REASON_ORPHANED_PLACEHOLDER,
    REASON_SUCCESSFUL_CREATE, REASON_SUCCESSFUL_DELETE,
};
use crds::{DomainSpec, VirtualMachine, VirtualMachineStatus, VmPhase};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a successful reconcile pass.
#[derive(Debug)]
pub enum Action {
    /// Converged, or nothing to do; the key's retry counter is reset
    Done,
    /// Transient failure; retry the key after a backoff delay
    Requeue(ControllerError),
}

/// VM reconciler.
///
/// Collaborators are passed in as trait objects so tests can swap them for
/// in-memory versions.
pub struct Reconciler {
    domain_manager: Arc<dyn DomainManager>,
    cluster: Arc<dyn VirtualMachineClient>,
    recorder: Arc<dyn EventRecorder>,
    emulator_path: String,
}

impl Reconciler {
    /// Creates a reconciler; `emulator_path` is stamped into domains that do
    /// not name an emulator.
    pub fn new(
        domain_manager: Arc<dyn DomainManager>,
        cluster: Arc<dyn VirtualMachineClient>,
        recorder: Arc<dyn EventRecorder>,
        emulator_path: String,
    ) -> Self {
        Self {
            domain_manager,
            cluster,
            recorder,
            emulator_path,
        }
    }

    /// Reconciles an added or updated VM.
    pub async fn reconcile(&self, vm: &VirtualMachine) -> Result<Action, ControllerError> {
        if !vm.phase().is_unset() {
            debug!(vm = %vm.name_any(), phase = ?vm.phase(), "VM already handled");
            return Ok(Action::Done);
        }

        let name = vm.metadata.name.as_deref().filter(|n| !n.is_empty()).ok_or_else(|| {
            ControllerError::InvalidResource("VirtualMachine without a name".to_string())
        })?;
        let uid = vm.uid().filter(|u| !u.is_empty()).ok_or_else(|| {
            ControllerError::InvalidResource(format!("VirtualMachine {name} has no UID"))
        })?;
        let key = format!("{}/{name}", vm.namespace().unwrap_or_default());

        let mut vm = vm.clone();
        self.apply_defaults(&mut vm);

        if let Err(start_err) = self.domain_manager.start_vm(&vm).await {
            return Ok(self.handle_start_failure(&vm, uid, start_err).await);
        }

        vm.status = Some(VirtualMachineStatus {
            phase: VmPhase::Scheduling,
            ..vm.status.clone().unwrap_or_default()
        });
        match self.cluster.update_status(&vm).await {
            Ok(()) => {}
            Err(ControllerError::NotFound(_)) => {
                debug!(vm = %key, "VM vanished before its phase could be stamped");
                return Ok(Action::Done);
            }
            Err(ControllerError::Conflict(_)) => {
                debug!(vm = %key, "VM changed before its phase could be stamped");
                return Ok(Action::Done);
            }
            Err(e) => return Ok(Action::Requeue(e)),
        }

        info!(vm = %key, "Handed VM over to scheduling");
        self.recorder.record(
            &vm,
            EventType::Normal,
            REASON_SUCCESSFUL_CREATE,
            &format!("Created placeholder for VM {name}"),
        );
        Ok(Action::Done)
    }

    /// Cleans up a VM that is gone from the cluster.
    pub async fn on_delete(&self, vm: &VirtualMachine) -> Result<Action, ControllerError> {
        if let Err(e) = self.domain_manager.delete_vm(vm).await {
            return Ok(Action::Requeue(e));
        }
        info!(vm = %vm.name_any(), "Removed workloads of deleted VM");
        self.recorder.record(
            vm,
            EventType::Normal,
            REASON_SUCCESSFUL_DELETE,
            &format!("Deleted placeholders of VM {}", vm.name_any()),
        );
        Ok(Action::Done)
    }

    /// Fills in the parts of the domain spec the node controller owns.
    fn apply_defaults(&self, vm: &mut VirtualMachine) {
        let name = vm.name_any();
        let uid = vm.uid().unwrap_or_default().to_string();
        let domain = vm
            .spec
            .domain
            .get_or_insert_with(|| DomainSpec::minimal(&name));
        domain.uuid = uid;
        domain.name = name;
        if domain.devices.emulator.as_deref().is_none_or(str::is_empty) {
            domain.devices.emulator = Some(self.emulator_path.clone());
        }
    }

    /// A failed start usually means an earlier placeholder is still around;
    /// remove it so the next pass can start cleanly.
    async fn handle_start_failure(
        &self,
        vm: &VirtualMachine,
        uid: &str,
        start_err: ControllerError,
    ) -> Action {
        let name = vm.name_any();
        let pods = match self.domain_manager.get_running_placeholders(vm).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(vm = %name, error = %e, "Failed to list placeholders after start failure");
                return Action::Requeue(e);
            }
        };

        let Some(pod) = pods.first() else {
            if let ControllerError::AlreadyExists(pod_name) = &start_err {
                // a terminated placeholder still holds the name
                warn!(vm = %name, pod = %pod_name, "Removing terminated placeholder");
                self.recorder.record(
                    vm,
                    EventType::Warning,
                    REASON_LEFTOVER_PLACEHOLDER,
                    &format!("Removing terminated placeholder {pod_name}"),
                );
                if let Err(e) = self.domain_manager.delete_vm(vm).await {
                    return Action::Requeue(e);
                }
            }
            return Action::Requeue(start_err);
        };

        let pod_name = pod.name_any();
        // Both cases are cleaned up the same way; the owner UID only decides
        // how the cleanup is reported.
        if placeholder_owner_uid(pod) == Some(uid) {
            warn!(vm = %name, pod = %pod_name, "Removing leftover placeholder of an incomplete start");
            self.recorder.record(
                vm,
                EventType::Warning,
                REASON_LEFTOVER_PLACEHOLDER,
                &format!("Removing leftover placeholder {pod_name}"),
            );
        } else {
            warn!(vm = %name, pod = %pod_name, owner = ?placeholder_owner_uid(pod), "Removing placeholder of a deleted VM with the same name");
            self.recorder.record(
                vm,
                EventType::Warning,
                REASON_ORPHANED_PLACEHOLDER,
                &format!("Removing orphaned placeholder {pod_name}"),
            );
        }

        match self.domain_manager.delete_vm(vm).await {
            Ok(()) => Action::Requeue(start_err),
            Err(e) => Action::Requeue(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        create_test_placeholder, create_test_terminated_placeholder, create_test_vm,
        create_test_vm_in_phase, TestHarness,
        TEST_EMULATOR,
    };

    #[tokio::test]
    async fn test_new_vm_gets_placeholder_and_scheduling_phase() {
        let h = TestHarness::new();
        let vm = create_test_vm("default", "testvm", Some("1234"));

        let action = h.reconciler.reconcile(&vm).await.unwrap();
        assert!(matches!(action, Action::Done));

        let started = h.domains.started();
        assert_eq!(started.len(), 1);
        let domain = started[0].spec.domain.as_ref().unwrap();
        assert_eq!(domain.name, "testvm");
        assert_eq!(domain.uuid, "1234");
        assert_eq!(domain.devices.emulator.as_deref(), Some(TEST_EMULATOR));

        let updates = h.cluster.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].phase(), VmPhase::Scheduling);
        assert_eq!(updates[0].resource_version().as_deref(), Some("1"));
        assert_eq!(h.recorder.reasons(), vec![REASON_SUCCESSFUL_CREATE]);
    }

    #[tokio::test]
    async fn test_defaulting_keeps_explicit_emulator() {
        let h = TestHarness::new();
        let mut vm = create_test_vm("default", "testvm", Some("1234"));
        let mut spec = DomainSpec::minimal("something-else");
        spec.devices.emulator = Some("/usr/bin/qemu-kvm".to_string());
        vm.spec.domain = Some(spec);

        h.reconciler.reconcile(&vm).await.unwrap();

        let started = h.domains.started();
        let domain = started[0].spec.domain.as_ref().unwrap();
        assert_eq!(domain.name, "testvm");
        assert_eq!(domain.devices.emulator.as_deref(), Some("/usr/bin/qemu-kvm"));
        // the cached object itself is never modified
        assert_eq!(vm.spec.domain.as_ref().unwrap().name, "something-else");
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent_once_scheduling() {
        let h = TestHarness::new();
        let vm = create_test_vm_in_phase("testvm", "1234", VmPhase::Scheduling);

        for _ in 0..2 {
            let action = h.reconciler.reconcile(&vm).await.unwrap();
            assert!(matches!(action, Action::Done));
        }
        assert!(h.domains.pods().is_empty());
        assert!(h.cluster.updates().is_empty());
    }

    #[tokio::test]
    async fn test_later_phases_are_left_alone() {
        let h = TestHarness::new();
        for phase in [VmPhase::Pending, VmPhase::Running, VmPhase::Failed] {
            let vm = create_test_vm_in_phase("testvm", "1234", phase);
            assert!(matches!(h.reconciler.reconcile(&vm).await, Ok(Action::Done)));
        }
        assert!(h.domains.started().is_empty());
    }

    #[tokio::test]
    async fn test_leftover_placeholder_is_removed_then_converges() {
        let h = TestHarness::new();
        h.domains.add_pod(create_test_placeholder("testvm", "1234"));
        let vm = create_test_vm("default", "testvm", Some("1234"));

        let action = h.reconciler.reconcile(&vm).await.unwrap();
        assert!(matches!(action, Action::Requeue(ControllerError::AlreadyExists(_))));
        assert_eq!(h.domains.deleted(), vec!["testvm"]);
        assert!(h.domains.pods().is_empty());
        assert!(h.cluster.updates().is_empty());
        assert_eq!(h.recorder.reasons(), vec![REASON_LEFTOVER_PLACEHOLDER]);

        let action = h.reconciler.reconcile(&vm).await.unwrap();
        assert!(matches!(action, Action::Done));
        assert_eq!(h.cluster.updates()[0].phase(), VmPhase::Scheduling);
    }

    #[tokio::test]
    async fn test_orphaned_placeholder_is_removed_and_requeued() {
        let h = TestHarness::new();
        h.domains.add_pod(create_test_placeholder("testvm", "old-uid"));
        let vm = create_test_vm("default", "testvm", Some("1234"));

        let action = h.reconciler.reconcile(&vm).await.unwrap();
        assert!(matches!(action, Action::Requeue(_)));
        assert_eq!(h.domains.deleted(), vec!["testvm"]);
        assert_eq!(h.recorder.reasons(), vec![REASON_ORPHANED_PLACEHOLDER]);
    }

    #[tokio::test]
    async fn test_terminated_placeholder_is_removed_then_converges() {
        let h = TestHarness::new();
        h.domains.add_pod(create_test_terminated_placeholder("testvm", "1234"));
        let vm = create_test_vm("default", "testvm", Some("1234"));

        let action = h.reconciler.reconcile(&vm).await.unwrap();
        assert!(matches!(action, Action::Requeue(ControllerError::AlreadyExists(_))));
        assert_eq!(h.domains.deleted(), vec!["testvm"]);
        assert!(h.domains.pods().is_empty());
        assert_eq!(h.recorder.reasons(), vec![REASON_LEFTOVER_PLACEHOLDER]);

        let action = h.reconciler.reconcile(&vm).await.unwrap();
        assert!(matches!(action, Action::Done));
        assert_eq!(h.domains.started().len(), 1);
        assert_eq!(h.cluster.updates()[0].phase(), VmPhase::Scheduling);
    }

    #[tokio::test]
    async fn test_start_failure_without_placeholders_requeues_cause() {
        let h = TestHarness::new();
        h.domains.fail_next_starts(1);
        let vm = create_test_vm("default", "testvm", Some("1234"));

        match h.reconciler.reconcile(&vm).await.unwrap() {
            Action::Requeue(ControllerError::StartFailed(msg)) => {
                assert_eq!(msg, "injected start failure");
            }
            other => panic!("expected requeue of the start error, got {other:?}"),
        }
        assert!(h.domains.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_placeholder_lookup_failure_requeues() {
        let h = TestHarness::new();
        h.domains.fail_next_starts(1);
        h.domains.fail_next_lists(1);
        let vm = create_test_vm("default", "testvm", Some("1234"));

        assert!(matches!(
            h.reconciler.reconcile(&vm).await,
            Ok(Action::Requeue(ControllerError::Watch(_)))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_failure_requeues() {
        let h = TestHarness::new();
        h.domains.add_pod(create_test_placeholder("testvm", "1234"));
        h.domains.fail_next_deletes(1);
        let vm = create_test_vm("default", "testvm", Some("1234"));

        assert!(matches!(
            h.reconciler.reconcile(&vm).await,
            Ok(Action::Requeue(ControllerError::Watch(_)))
        ));
        assert_eq!(h.domains.pods().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_and_not_found_on_phase_stamp_are_benign() {
        let h = TestHarness::new();
        h.cluster.push_error(ControllerError::Conflict("default/a".to_string()));
        h.cluster.push_error(ControllerError::NotFound("default/b".to_string()));

        let a = create_test_vm("default", "a", Some("uid-a"));
        let b = create_test_vm("default", "b", Some("uid-b"));
        assert!(matches!(h.reconciler.reconcile(&a).await, Ok(Action::Done)));
        assert!(matches!(h.reconciler.reconcile(&b).await, Ok(Action::Done)));
        assert!(h.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_other_phase_stamp_errors_requeue() {
        let h = TestHarness::new();
        h.cluster.push_error(ControllerError::Watch("connection reset".to_string()));
        let vm = create_test_vm("default", "testvm", Some("1234"));

        assert!(matches!(h.reconciler.reconcile(&vm).await, Ok(Action::Requeue(_))));
    }

    #[tokio::test]
    async fn test_missing_identity_is_permanent() {
        let h = TestHarness::new();
        let vm = create_test_vm("default", "testvm", None);

        assert!(matches!(
            h.reconciler.reconcile(&vm).await,
            Err(ControllerError::InvalidResource(_))
        ));
        assert!(h.domains.started().is_empty());
    }

    #[tokio::test]
    async fn test_on_delete_removes_workloads() {
        let h = TestHarness::new();
        h.domains.add_pod(create_test_placeholder("testvm", "1234"));

        let action = h
            .reconciler
            .on_delete(&VirtualMachine::reference("default", "testvm"))
            .await
            .unwrap();
        assert!(matches!(action, Action::Done));
        assert!(h.domains.pods().is_empty());
        assert_eq!(h.recorder.reasons(), vec![REASON_SUCCESSFUL_DELETE]);
    }

    #[tokio::test]
    async fn test_on_delete_failure_requeues() {
        let h = TestHarness::new();
        h.domains.fail_next_deletes(1);

        let action = h
            .reconciler
            .on_delete(&VirtualMachine::reference("default", "testvm"))
            .await
            .unwrap();
        assert!(matches!(action, Action::Requeue(_)));
        assert!(h.recorder.events().is_empty());
    }
}
