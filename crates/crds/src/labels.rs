//! Well-known labels
//!
//! Labels written on VirtualMachines and placeholder pods. The VM UID label is
//! what lets the reconciler tell a leftover placeholder of the same VM apart
//! from an orphan left behind by a deleted VM with the same name.

/// Node a VirtualMachine is assigned to; the node controller filters on it.
pub const NODE_NAME_LABEL: &str = "kubevirt.io/nodeName";

/// UID of the VirtualMachine that owns a placeholder pod.
pub const VM_UID_LABEL: &str = "kubevirt.io/vmUID";

/// Name of the domain (and VirtualMachine) a placeholder pod carries.
pub const DOMAIN_LABEL: &str = "kubevirt.io/domain";

/// Application label on every placeholder pod.
pub const APP_LABEL: &str = "kubevirt.io/app";

/// Value of [`APP_LABEL`] on placeholder pods.
pub const LAUNCHER_APP: &str = "virt-launcher";

/// Label selector matching the placeholder pods of a domain.
pub fn domain_selector(domain: &str) -> String {
    format!("{APP_LABEL}={LAUNCHER_APP},{DOMAIN_LABEL}={domain}")
}

/// Label selector matching the VirtualMachines assigned to a node.
pub fn node_selector(node: &str) -> String {
    format!("{NODE_NAME_LABEL}={node}")
}
