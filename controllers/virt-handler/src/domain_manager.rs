//! Domain manager: starts and stops the workloads backing a VM.
//!
//! A VM is started by creating its placeholder (launcher) pod; the launcher
//! then defines the domain on whatever node the scheduler picks.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{
    domain_selector, VirtualMachine, APP_LABEL, DOMAIN_LABEL, LAUNCHER_APP, VM_UID_LABEL,
};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Field selector excluding pods that already terminated.
const RUNNING_PODS_SELECTOR: &str = "status.phase!=Succeeded,status.phase!=Failed";

/// Starts and removes the workloads that back VMs.
#[async_trait]
pub trait DomainManager: Send + Sync {
    /// Creates the placeholder workload of `vm`.
    async fn start_vm(&self, vm: &VirtualMachine) -> Result<(), ControllerError>;

    /// Removes every placeholder workload of `vm`'s domain.
    async fn delete_vm(&self, vm: &VirtualMachine) -> Result<(), ControllerError>;

    /// Placeholders of `vm`'s domain that have not terminated.
    async fn get_running_placeholders(&self, vm: &VirtualMachine) -> Result<Vec<Pod>, ControllerError>;
}

/// Name of the placeholder pod of VM `name`.
pub fn placeholder_name(name: &str) -> String {
    format!("virt-launcher-{name}")
}

/// UID of the VM a placeholder was created for.
pub fn placeholder_owner_uid(pod: &Pod) -> Option<&str> {
    pod.labels().get(VM_UID_LABEL).map(String::as_str)
}

/// [`DomainManager`] backed by placeholder pods in the VM's namespace.
pub struct PodDomainManager {
    client: Client,
    launcher_image: String,
}

impl PodDomainManager {
    /// Creates a manager starting placeholders from `launcher_image`.
    pub fn new(client: Client, launcher_image: String) -> Self {
        Self {
            client,
            launcher_image,
        }
    }

    fn pods(&self, vm: &VirtualMachine) -> Result<Api<Pod>, ControllerError> {
        let namespace = vm.namespace().ok_or_else(|| {
            ControllerError::InvalidResource(format!("VirtualMachine {} has no namespace", vm.name_any()))
        })?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

/// Placeholder pod of `vm`; `vm` must carry a UID.
pub fn build_placeholder(vm: &VirtualMachine, launcher_image: &str) -> Result<Pod, ControllerError> {
    let name = vm.name_any();
    let uid = vm.uid().ok_or_else(|| {
        ControllerError::InvalidResource(format!("VirtualMachine {name} has no UID"))
    })?;
    let domain = vm
        .spec
        .domain
        .as_ref()
        .map_or(name.as_str(), |d| d.name.as_str());

    let labels = BTreeMap::from([
        (APP_LABEL.to_string(), LAUNCHER_APP.to_string()),
        (DOMAIN_LABEL.to_string(), domain.to_string()),
        (VM_UID_LABEL.to_string(), uid.to_string()),
    ]);

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(placeholder_name(&name)),
            namespace: vm.namespace(),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "compute".to_string(),
                image: Some(launcher_image.to_string()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                command: Some(vec![
                    "/virt-launcher".to_string(),
                    "--name".to_string(),
                    domain.to_string(),
                ]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[async_trait]
impl DomainManager for PodDomainManager {
    async fn start_vm(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        let pod = build_placeholder(vm, &self.launcher_image)?;
        let pod_name = pod.name_any();
        match self.pods(vm)?.create(&PostParams::default(), &pod).await {
            Ok(_) => {
                info!(vm = %vm.name_any(), pod = %pod_name, "Created placeholder pod");
                Ok(())
            }
            Err(e) => match ControllerError::from_kube(e, &pod_name) {
                ControllerError::Conflict(_) => Err(ControllerError::AlreadyExists(pod_name)),
                e => Err(ControllerError::StartFailed(format!("creating pod {pod_name}: {e}"))),
            },
        }
    }

    async fn delete_vm(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        let selector = domain_selector(&vm.name_any());
        self.pods(vm)?
            .delete_collection(&DeleteParams::default(), &ListParams::default().labels(&selector))
            .await
            .map_err(|e| ControllerError::from_kube(e, &selector))?;
        debug!(vm = %vm.name_any(), "Deleted placeholder pods");
        Ok(())
    }

    async fn get_running_placeholders(&self, vm: &VirtualMachine) -> Result<Vec<Pod>, ControllerError> {
        let selector = domain_selector(&vm.name_any());
        let params = ListParams::default()
            .labels(&selector)
            .fields(RUNNING_PODS_SELECTOR);
        let pods = self
            .pods(vm)?
            .list(&params)
            .await
            .map_err(|e| ControllerError::from_kube(e, &selector))?;
        Ok(pods.items)
    }
}
