//! Prints the VirtualMachine CustomResourceDefinition as YAML.

use crds::VirtualMachine;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("---\n{}", serde_yaml::to_string(&VirtualMachine::crd())?);
    Ok(())
}
