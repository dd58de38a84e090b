use kube::CustomResourceExt;

use vmi_mutator::resources::virtualmachineinstancepresets::VirtualMachineInstancePreset;
use vmi_mutator::resources::virtualmachineinstances::VirtualMachineInstance;

fn main() -> anyhow::Result<()> {
    let crds = [
        VirtualMachineInstance::crd(),
        VirtualMachineInstancePreset::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
