//! Virtnode resource definitions
//!
//! Kubernetes custom resources shared by the node controller:
//! - `VirtualMachine`: the declared VM, owned by the cluster API
//! - `Domain`: the node-local mirror of a hypervisor domain

pub mod domain;
pub mod labels;
pub mod virtual_machine;

pub use domain::*;
pub use labels::*;
pub use virtual_machine::*;
