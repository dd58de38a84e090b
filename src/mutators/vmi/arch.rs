use tracing::debug;

use crate::config::ClusterConfig;
use crate::mutators::Arch;
use crate::resources::virtualmachineinstances::{
    Bootloader, Cpu, Disk, DiskBus, DiskTarget, DomainSpec, Efi, Firmware, Machine,
};

/// CPU model used when neither the VMI nor the cluster configuration picks one
pub static DEFAULT_CPU_MODEL: &str = "host-model";

/// The only CPU mode supported on arm64
pub static CPU_MODE_HOST_PASSTHROUGH: &str = "host-passthrough";

impl Arch {
    pub fn default_machine_type(&self) -> &'static str {
        match self {
            Arch::Amd64 => "q35",
            Arch::Arm64 => "virt",
            Arch::Ppc64le => "pseries",
        }
    }
}

pub fn set_arch_defaults(domain: &mut DomainSpec, config: &ClusterConfig, arch: Arch) {
    set_default_cpu_model(domain, config, arch);
    set_default_machine_type(domain, config, arch);

    if arch == Arch::Arm64 {
        set_default_bootloader(domain);
        for disk in &mut domain.devices.disks {
            set_disk_bus(arch, disk);
        }
    }
}

fn set_default_cpu_model(domain: &mut DomainSpec, config: &ClusterConfig, arch: Arch) {
    let cpu = domain.cpu.get_or_insert_with(Cpu::default);
    if cpu.model.as_deref().is_some_and(|m| !m.is_empty()) {
        return;
    }

    let model = match arch {
        Arch::Arm64 => CPU_MODE_HOST_PASSTHROUGH,
        Arch::Amd64 | Arch::Ppc64le => config.cpu_model.as_deref().unwrap_or(DEFAULT_CPU_MODEL),
    };
    debug!(%arch, model, "Setting default CPU model");
    cpu.model = Some(model.to_string());
}

fn set_default_machine_type(domain: &mut DomainSpec, config: &ClusterConfig, arch: Arch) {
    let machine = domain.machine.get_or_insert_with(Machine::default);
    if !machine.type_.is_empty() {
        return;
    }

    let machine_type = config
        .machine_type
        .as_deref()
        .unwrap_or_else(|| arch.default_machine_type());
    debug!(%arch, machine_type, "Setting default machine type");
    machine.type_ = machine_type.to_string();
}

/// arm64 guests only boot through UEFI, without secure boot.
fn set_default_bootloader(domain: &mut DomainSpec) {
    let firmware = domain.firmware.get_or_insert_with(Firmware::default);
    if firmware.bootloader.is_some() {
        return;
    }

    debug!("Setting UEFI bootloader");
    firmware.bootloader = Some(Bootloader {
        efi: Some(Efi {
            secure_boot: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    });
}

/// Apply the architecture's disk bus rule to a single disk. On arm64 every bus becomes virtio,
/// except an explicit scsi bus on a plain disk target; a disk without any target gets a plain
/// virtio disk target.
pub fn set_disk_bus(arch: Arch, disk: &mut Disk) {
    if arch != Arch::Arm64 {
        return;
    }

    if !disk.has_target() {
        disk.disk = Some(DiskTarget::default());
    }
    if let Some(target) = &mut disk.disk {
        if target.bus != Some(DiskBus::Scsi) {
            target.bus = Some(DiskBus::Virtio);
        }
    }
    if let Some(target) = &mut disk.cdrom {
        target.bus = Some(DiskBus::Virtio);
    }
    if let Some(target) = &mut disk.lun {
        target.bus = Some(DiskBus::Virtio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::virtualmachineinstances::{Bios, CdRomTarget, LunTarget};

    fn config_with_model(model: &str) -> ClusterConfig {
        ClusterConfig {
            cpu_model: Some(model.into()),
            ..Default::default()
        }
    }

    fn cpu_model(domain: &DomainSpec) -> Option<&str> {
        domain.cpu.as_ref().and_then(|c| c.model.as_deref())
    }

    #[test]
    fn amd64_defaults() {
        let mut domain = DomainSpec::default();
        set_arch_defaults(&mut domain, &ClusterConfig::default(), Arch::Amd64);

        assert_eq!(cpu_model(&domain), Some(DEFAULT_CPU_MODEL));
        assert_eq!(domain.machine.map(|m| m.type_).as_deref(), Some("q35"));
        assert_eq!(domain.firmware, None);
    }

    #[test]
    fn config_cpu_model_and_machine_type() {
        let mut config = config_with_model("Haswell");
        config.machine_type = Some("pc-q35-3.0".into());
        let mut domain = DomainSpec::default();

        set_arch_defaults(&mut domain, &config, Arch::Ppc64le);

        assert_eq!(cpu_model(&domain), Some("Haswell"));
        assert_eq!(domain.machine.map(|m| m.type_).as_deref(), Some("pc-q35-3.0"));
    }

    #[test]
    fn explicit_values_are_kept() {
        let mut domain = DomainSpec {
            cpu: Some(Cpu {
                model: Some("EPYC".into()),
                ..Default::default()
            }),
            machine: Some(Machine {
                type_: "pc-i440fx".into(),
                ..Default::default()
            }),
            ..Default::default()
        };

        set_arch_defaults(&mut domain, &config_with_model("Haswell"), Arch::Amd64);

        assert_eq!(cpu_model(&domain), Some("EPYC"));
        assert_eq!(domain.machine.map(|m| m.type_).as_deref(), Some("pc-i440fx"));
    }

    #[test]
    fn arm64_ignores_configured_cpu_model() {
        let mut domain = DomainSpec::default();
        set_arch_defaults(&mut domain, &config_with_model("Haswell"), Arch::Arm64);

        assert_eq!(cpu_model(&domain), Some(CPU_MODE_HOST_PASSTHROUGH));
        assert_eq!(domain.machine.map(|m| m.type_).as_deref(), Some("virt"));
        assert_eq!(
            domain.firmware.and_then(|f| f.bootloader),
            Some(Bootloader {
                efi: Some(Efi {
                    secure_boot: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            })
        );
    }

    #[test]
    fn arm64_keeps_explicit_bootloader() {
        let bios = Bootloader {
            bios: Some(Bios::default()),
            ..Default::default()
        };
        let mut domain = DomainSpec {
            firmware: Some(Firmware {
                bootloader: Some(bios.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        set_arch_defaults(&mut domain, &ClusterConfig::default(), Arch::Arm64);

        assert_eq!(domain.firmware.and_then(|f| f.bootloader), Some(bios));
    }

    #[test]
    fn arm64_disk_buses() {
        let mut domain = DomainSpec::default();
        domain.devices.disks = vec![
            Disk {
                disk: Some(DiskTarget {
                    bus: Some(DiskBus::Scsi),
                    ..Default::default()
                }),
                ..Disk::named("scsi")
            },
            Disk {
                disk: Some(DiskTarget {
                    bus: Some(DiskBus::Sata),
                    ..Default::default()
                }),
                ..Disk::named("sata")
            },
            Disk {
                cdrom: Some(CdRomTarget {
                    bus: Some(DiskBus::Scsi),
                    ..Default::default()
                }),
                ..Disk::named("cdrom")
            },
            Disk {
                lun: Some(LunTarget {
                    bus: Some(DiskBus::Sata),
                    ..Default::default()
                }),
                ..Disk::named("lun")
            },
            Disk::named("bare"),
        ];

        set_arch_defaults(&mut domain, &ClusterConfig::default(), Arch::Arm64);

        let disks = &domain.devices.disks;
        assert_eq!(disks[0].disk.as_ref().unwrap().bus, Some(DiskBus::Scsi));
        assert_eq!(disks[1].disk.as_ref().unwrap().bus, Some(DiskBus::Virtio));
        assert_eq!(disks[2].cdrom.as_ref().unwrap().bus, Some(DiskBus::Virtio));
        assert_eq!(disks[3].lun.as_ref().unwrap().bus, Some(DiskBus::Virtio));
        assert_eq!(disks[4].disk.as_ref().unwrap().bus, Some(DiskBus::Virtio));
    }

    #[test]
    fn amd64_leaves_disks_alone() {
        let mut disk = Disk {
            disk: Some(DiskTarget {
                bus: Some(DiskBus::Sata),
                ..Default::default()
            }),
            ..Disk::named("sata")
        };
        set_disk_bus(Arch::Amd64, &mut disk);
        assert_eq!(disk.disk.unwrap().bus, Some(DiskBus::Sata));
    }
}
