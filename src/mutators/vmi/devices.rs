use std::collections::BTreeSet;

use tracing::debug;

use super::arch::set_disk_bus;
use crate::config::{ClusterConfig, NetworkInterfaceKind};
use crate::mutators::{Arch, Diagnostic};
use crate::pci::PciAddress;
use crate::resources::virtualmachineinstances::{
    ContainerDiskSource, Disk, DiskTarget, Input, InputBus, InputType, Interface,
    InterfaceBinding, Network, PodNetwork, VirtualMachineInstanceSpec,
};

/// Name of the network and interface synthesized for VMIs without any networking
pub static DEFAULT_NETWORK_NAME: &str = "default";

pub static PULL_ALWAYS: &str = "Always";
pub static PULL_IF_NOT_PRESENT: &str = "IfNotPresent";

pub fn set_device_defaults(
    spec: &mut VirtualMachineInstanceSpec,
    config: &ClusterConfig,
    arch: Arch,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for volume in &mut spec.volumes {
        if let Some(container_disk) = &mut volume.container_disk {
            set_default_pull_policy(container_disk);
        }
    }
    add_missing_disks(spec);
    for disk in &mut spec.domain.devices.disks {
        if !disk.has_target() {
            disk.disk = Some(DiskTarget::default());
            set_disk_bus(arch, disk);
        }
    }
    for input in &mut spec.domain.devices.inputs {
        set_input_defaults(input);
    }
    set_default_network(spec, config, diagnostics);
    canonicalize_pci_addresses(&mut spec.domain.devices.interfaces, diagnostics);
}

/// `latest` and untagged images are re-pulled on every start, anything pinned to a tag or digest
/// only when missing.
fn set_default_pull_policy(container_disk: &mut ContainerDiskSource) {
    if container_disk
        .image_pull_policy
        .as_deref()
        .is_some_and(|p| !p.is_empty())
    {
        return;
    }

    let policy = if container_disk.image.contains('@') {
        PULL_IF_NOT_PRESENT
    } else {
        // a ':' before the last '/' belongs to the registry host
        let name = container_disk
            .image
            .rsplit_once('/')
            .map_or(container_disk.image.as_str(), |(_, name)| name);
        match name.split_once(':') {
            None | Some((_, "latest")) => PULL_ALWAYS,
            Some(_) => PULL_IF_NOT_PRESENT,
        }
    };
    debug!(image = %container_disk.image, policy, "Setting image pull policy");
    container_disk.image_pull_policy = Some(policy.to_string());
}

/// Append a disk for each volume that no disk or filesystem refers to, in volume order.
fn add_missing_disks(spec: &mut VirtualMachineInstanceSpec) {
    let devices = &mut spec.domain.devices;
    let mut used: BTreeSet<&str> = devices
        .disks
        .iter()
        .map(|d| d.name.as_str())
        .chain(devices.filesystems.iter().map(|f| f.name.as_str()))
        .collect();

    let mut missing = vec![];
    for volume in &spec.volumes {
        if used.insert(volume.name.as_str()) {
            missing.push(Disk::named(&volume.name));
        }
    }

    if !missing.is_empty() {
        debug!(disks = missing.len(), "Adding disks for volumes without one");
        devices.disks.extend(missing);
    }
}

fn set_input_defaults(input: &mut Input) {
    input.bus.get_or_insert(InputBus::Usb);
    input.type_.get_or_insert(InputType::Tablet);
}

/// A VMI that declares neither networks nor interfaces gets a pod network with one interface
/// bound the way the cluster configuration says.
fn set_default_network(
    spec: &mut VirtualMachineInstanceSpec,
    config: &ClusterConfig,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let devices = &mut spec.domain.devices;
    if devices.autoattach_pod_interface == Some(false)
        || !devices.interfaces.is_empty()
        || !spec.networks.is_empty()
    {
        return;
    }

    let mut kind = config.network_interface();
    if kind == NetworkInterfaceKind::Slirp && !config.permit_slirp_interface() {
        kind = NetworkInterfaceKind::Bridge;
        diagnostics.push(Diagnostic::SlirpNotPermitted { used: kind });
    }

    let mut interface = Interface {
        name: DEFAULT_NETWORK_NAME.to_string(),
        ..Default::default()
    };
    let binding = Some(InterfaceBinding::default());
    match kind {
        NetworkInterfaceKind::Bridge => interface.bridge = binding,
        NetworkInterfaceKind::Masquerade => interface.masquerade = binding,
        NetworkInterfaceKind::Slirp => interface.slirp = binding,
    }

    debug!(binding = %kind, "Adding default pod network");
    devices.interfaces.push(interface);
    spec.networks.push(Network {
        name: DEFAULT_NETWORK_NAME.to_string(),
        pod: Some(PodNetwork::default()),
        ..Default::default()
    });
}

fn canonicalize_pci_addresses(interfaces: &mut [Interface], diagnostics: &mut Vec<Diagnostic>) {
    for interface in interfaces {
        let Some(address) = &interface.pci_address else {
            continue;
        };
        match address.parse::<PciAddress>() {
            Ok(parsed) => interface.pci_address = Some(parsed.to_string()),
            Err(source) => diagnostics.push(Diagnostic::InvalidPciAddress {
                interface: interface.name.clone(),
                source,
            }),
        }
    }
}
