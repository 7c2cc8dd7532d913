//! VirtualMachine CRD
//!
//! Declares a VM. The node controller turns a freshly created VirtualMachine
//! into a placeholder pod and hands it over to the scheduler by stamping the
//! `Scheduling` phase; every later phase belongs to other controllers.

use crate::domain::DomainSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1alpha1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    shortname = "vm",
    namespaced,
    status = "VirtualMachineStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Desired domain; defaulted by the node controller when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainSpec>,
}

/// VM lifecycle phase.
///
/// The empty phase means "never handled". Only the empty -> `Scheduling`
/// transition is written by the node controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum VmPhase {
    #[default]
    #[serde(rename = "")]
    Unset,
    Scheduling,
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl VmPhase {
    /// Whether no controller has claimed the VM yet.
    pub fn is_unset(self) -> bool {
        self == VmPhase::Unset
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Current phase
    #[serde(default)]
    pub phase: VmPhase,

    /// Node the VM runs on, set by the scheduler side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl VirtualMachine {
    /// Minimal VM carrying only an identity.
    ///
    /// Used for domains found on the node at startup and for keys whose VM is
    /// no longer in the cache, so the delete path can run against them.
    pub fn reference(namespace: &str, name: &str) -> Self {
        let mut vm = VirtualMachine::new(name, VirtualMachineSpec::default());
        vm.metadata.namespace = Some(namespace.to_string());
        vm
    }

    /// Current phase, `Unset` when no status was written yet.
    pub fn phase(&self) -> VmPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Unique ID assigned by the cluster API.
    pub fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }
}
