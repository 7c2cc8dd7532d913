//! Domain resource
//!
//! Mirrors a hypervisor domain on the local node. Domains are never written to
//! the cluster by the node controller; the type only gives the domain cache a
//! Kubernetes-shaped identity (`namespace/name`) to key on.
//!
//! `DomainSpec` doubles as the desired domain description embedded in a
//! `VirtualMachine`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Memory assigned to a minimal domain, in KiB.
pub const MINIMAL_MEMORY_KIB: u64 = 8192;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1alpha1",
    kind = "Domain",
    namespaced,
    status = "DomainStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// Domain name, equal to the owning VirtualMachine's name
    #[serde(default)]
    pub name: String,

    /// Domain UUID, equal to the owning VirtualMachine's UID
    #[serde(default)]
    pub uuid: String,

    /// Hypervisor driver type (e.g. "qemu", "kvm")
    #[serde(rename = "type", default = "default_domain_type")]
    pub domain_type: String,

    /// Guest memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,

    /// Number of virtual CPUs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u32>,

    /// Attached devices
    #[serde(default)]
    pub devices: Devices,
}

fn default_domain_type() -> String {
    "qemu".to_string()
}

impl DomainSpec {
    /// Smallest domain spec that the hypervisor accepts for `name`.
    pub fn minimal(name: &str) -> Self {
        Self {
            name: name.to_string(),
            uuid: String::new(),
            domain_type: default_domain_type(),
            memory: Some(Memory {
                value: MINIMAL_MEMORY_KIB,
                unit: "KiB".to_string(),
            }),
            vcpus: None,
            devices: Devices::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// Amount of memory
    pub value: u64,

    /// Unit of `value` (e.g. "KiB", "MiB")
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    /// Path of the emulator binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulator: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Guest device name (e.g. "vda")
    pub target: String,

    /// Backing image or volume
    pub source: String,

    /// Disk device kind ("disk", "cdrom")
    #[serde(default = "default_disk_device")]
    pub device: String,
}

fn default_disk_device() -> String {
    "disk".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    /// Interface type ("network", "bridge")
    #[serde(rename = "type")]
    pub interface_type: String,

    /// Network or bridge name
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Lifecycle state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum DomainState {
    #[default]
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PMSuspended,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DomainStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub state: DomainState,
}

impl Domain {
    /// Builds a domain mirror in `namespace`.
    pub fn with_state(namespace: &str, spec: DomainSpec, state: DomainState) -> Self {
        let name = spec.name.clone();
        let mut domain = Domain::new(&name, spec);
        domain.metadata.namespace = Some(namespace.to_string());
        domain.status = Some(DomainStatus { state });
        domain
    }

    /// Current state, `NoState` if no status was observed yet.
    pub fn state(&self) -> DomainState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_spec() {
        let spec = DomainSpec::minimal("web-1");
        assert_eq!(spec.name, "web-1");
        assert_eq!(spec.domain_type, "qemu");
        assert_eq!(spec.memory.map(|m| m.value), Some(MINIMAL_MEMORY_KIB));
        assert!(spec.devices.emulator.is_none());
    }

    #[test]
    fn test_domain_with_state() {
        let domain = Domain::with_state("default", DomainSpec::minimal("web-1"), DomainState::Running);
        assert_eq!(domain.metadata.name.as_deref(), Some("web-1"));
        assert_eq!(domain.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(domain.state(), DomainState::Running);
    }

    #[test]
    fn test_spec_type_field_is_renamed() {
        let json = serde_json::to_value(DomainSpec::minimal("web-1")).unwrap();
        assert_eq!(json["type"], "qemu");
        assert_eq!(json["memory"]["unit"], "KiB");
    }
}
