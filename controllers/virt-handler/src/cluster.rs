//! Cluster-side writes to VirtualMachines.

use crate::error::ControllerError;
use crds::VirtualMachine;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

/// Status writer for VirtualMachines.
#[async_trait::async_trait]
pub trait VirtualMachineClient: Send + Sync {
    /// Writes `vm.status`, guarded by `vm.metadata.resourceVersion`.
    ///
    /// Errors are classified: `NotFound` when the VM is gone, `Conflict` when
    /// the VM changed since `vm` was read.
    async fn update_status(&self, vm: &VirtualMachine) -> Result<(), ControllerError>;
}

/// [`VirtualMachineClient`] writing through the status subresource.
pub struct KubeVirtualMachineClient {
    client: Client,
}

impl KubeVirtualMachineClient {
    /// Creates a status writer using `client`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Merge patch for the status subresource.
///
/// Carrying `resourceVersion` makes the API server reject the patch with 409
/// if the object moved on.
fn status_patch(vm: &VirtualMachine) -> serde_json::Value {
    let mut patch = json!({ "status": vm.status });
    if let Some(version) = vm.resource_version() {
        patch["metadata"] = json!({ "resourceVersion": version });
    }
    patch
}

#[async_trait::async_trait]
impl VirtualMachineClient for KubeVirtualMachineClient {
    async fn update_status(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        let name = vm.name_any();
        let namespace = vm.namespace().ok_or_else(|| {
            ControllerError::InvalidResource(format!("VirtualMachine {name} has no namespace"))
        })?;
        let key = format!("{namespace}/{name}");
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), &namespace);

        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&status_patch(vm)))
            .await
            .map_err(|e| ControllerError::from_kube(e, &key))?;
        debug!(vm = %key, "Updated VM status");
        Ok(())
    }
}
