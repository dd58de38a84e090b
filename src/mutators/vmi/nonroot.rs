use tracing::debug;

use crate::config::NON_ROOT_FEATURE_GATE;
use crate::resources::virtualmachineinstances::{
    VirtualMachineInstance, VirtualMachineInstanceStatus,
};
use crate::{Error, Result};

/// UID of the unprivileged user the virtual machine process runs as
pub const NON_ROOT_UID: u64 = 107;

/// Reject devices that need a privileged virtual machine process, otherwise record that the VMI
/// runs unprivileged.
pub fn set_non_root(vmi: &mut VirtualMachineInstance) -> Result<()> {
    let devices = &vmi.spec.domain.devices;
    let incompatible = [
        ("VirtioFS", devices.filesystems.iter().any(|f| f.virtiofs.is_some())),
        ("SRIOV", devices.interfaces.iter().any(|i| i.sriov.is_some())),
        ("HostDevices", !devices.host_devices.is_empty()),
    ];
    if let Some((device, _)) = incompatible.into_iter().find(|(_, used)| *used) {
        return Err(Error::NonRootIncompatible {
            device,
            gate: NON_ROOT_FEATURE_GATE,
        });
    }

    debug!(uid = NON_ROOT_UID, "Running VMI as nonroot");
    vmi.status
        .get_or_insert_with(VirtualMachineInstanceStatus::default)
        .runtime_user = Some(NON_ROOT_UID);
    Ok(())
}
