use kube::ResourceExt;
use tracing::{field, info, instrument, warn, Span};

use super::{arch, devices, hyperv, limits, nonroot, presets, resources, workload};
use crate::mutators::{Context, Diagnostic, Operation};
use crate::resources::virtualmachineinstances::{
    VirtualMachineInstance, VIRTUAL_MACHINE_INSTANCE_FINALIZER,
};
use crate::{Error, Result};

/// The only identity allowed to change the status of an existing VMI
pub static PRIVILEGED_USER: &str = "system:serviceaccount:kubevirt:kubevirt-controller";

/// Outcome of an admitted mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub vmi: VirtualMachineInstance,
    /// Findings that did not block admission
    pub diagnostics: Vec<Diagnostic>,
}

#[instrument(skip_all, fields(operation = %operation, vmi, user))]
pub fn mutate(
    operation: Operation,
    old: Option<&VirtualMachineInstance>,
    new: VirtualMachineInstance,
    user: &str,
    ctx: &Context,
) -> Result<Mutation> {
    Span::current().record("vmi", field::display(new.name_any()));
    Span::current().record("user", user);

    match operation {
        Operation::Create => mutate_create(new, ctx),
        Operation::Update => {
            let old = old.ok_or_else(|| Error::MissingOldObject(new.name_any()))?;
            Ok(mutate_update(old, new, user))
        }
    }
}

/// Apply every defaulting stage to a new VMI. The only way this fails is a device that the
/// nonroot feature gate does not allow.
pub fn mutate_create(mut vmi: VirtualMachineInstance, ctx: &Context) -> Result<Mutation> {
    let mut diagnostics = vec![];

    limits::apply_namespace_limits(
        &mut vmi.spec.domain.resources,
        ctx.limit_ranges,
        &mut diagnostics,
    );
    diagnostics.extend(presets::apply_presets(&mut vmi, ctx.presets));
    resources::set_default_resources(&mut vmi.spec.domain, ctx.config, &mut diagnostics);
    arch::set_arch_defaults(&mut vmi.spec.domain, ctx.config, ctx.arch);
    devices::set_device_defaults(&mut vmi.spec, ctx.config, ctx.arch, &mut diagnostics);

    // conflicts never block admission
    if let Err(conflicts) = hyperv::set_hyperv_dependencies(&mut vmi.spec.domain) {
        diagnostics.extend(conflicts.0.into_iter().map(|c| {
            Diagnostic::FeatureDependencyConflict {
                feature: c.feature,
                requires: c.requires,
            }
        }));
    }

    workload::set_workload_node_selectors(&mut vmi.spec);
    add_finalizer(&mut vmi);

    if ctx.config.non_root_enabled() {
        if let Err(err) = nonroot::set_non_root(&mut vmi) {
            warn!(reason = err.reason(), "Rejecting VMI: {err}");
            return Err(err);
        }
    }

    for diagnostic in &diagnostics {
        warn!("{diagnostic}");
    }
    info!(
        arch = %ctx.arch,
        presets = ctx.presets.len(),
        diagnostics = diagnostics.len(),
        "Mutated VMI"
    );

    Ok(Mutation { vmi, diagnostics })
}

/// Only the privileged controller may change the status of an existing VMI; for anybody else the
/// previous status is put back.
pub fn mutate_update(
    old: &VirtualMachineInstance,
    mut new: VirtualMachineInstance,
    user: &str,
) -> Mutation {
    if user != PRIVILEGED_USER && new.status != old.status {
        info!("Reverting status change by unprivileged user");
        new.status = old.status.clone();
    }

    Mutation {
        vmi: new,
        diagnostics: vec![],
    }
}

fn add_finalizer(vmi: &mut VirtualMachineInstance) {
    let finalizers = vmi.finalizers_mut();
    if !finalizers.iter().any(|f| f == VIRTUAL_MACHINE_INSTANCE_FINALIZER) {
        finalizers.push(VIRTUAL_MACHINE_INSTANCE_FINALIZER.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, NetworkInterfaceKind};
    use crate::mutators::Arch;
    use crate::resources::virtualmachineinstancepresets::VirtualMachineInstancePreset;
    use crate::resources::virtualmachineinstances::{
        VirtualMachineInstancePhase, VirtualMachineInstanceStatus,
    };
    use assert_json_diff::assert_json_include;
    use k8s_openapi::api::core::v1::LimitRange;
    use serde_json::{json, Value};

    fn vmi(spec: Value) -> VirtualMachineInstance {
        serde_json::from_value(json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachineInstance",
            "metadata": {
                "name": "testvmi",
                "namespace": "default",
                "labels": {"test": "test"}
            },
            "spec": spec
        }))
        .unwrap()
    }

    fn cpu_preset() -> VirtualMachineInstancePreset {
        serde_json::from_value(json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachineInstancePreset",
            "metadata": {"name": "test-preset", "namespace": "default"},
            "spec": {
                "selector": {"matchLabels": {"test": "test"}},
                "domain": {"cpu": {"cores": 4}, "devices": {}}
            }
        }))
        .unwrap()
    }

    fn memory_limit_range() -> LimitRange {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "LimitRange",
            "metadata": {"name": "abc", "namespace": "default"},
            "spec": {"limits": [{"type": "Container", "default": {"memory": "128M"}}]}
        }))
        .unwrap()
    }

    struct Fixture {
        config: ClusterConfig,
        presets: Vec<VirtualMachineInstancePreset>,
        limit_ranges: Vec<LimitRange>,
        arch: Arch,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                config: ClusterConfig::default(),
                presets: vec![cpu_preset()],
                limit_ranges: vec![memory_limit_range()],
                arch: Arch::Amd64,
            }
        }

        fn ctx(&self) -> Context<'_> {
            Context {
                config: &self.config,
                arch: self.arch,
                presets: &self.presets,
                limit_ranges: &self.limit_ranges,
            }
        }

        fn create(&self, vmi: VirtualMachineInstance) -> Mutation {
            mutate(Operation::Create, None, vmi, "user", &self.ctx()).unwrap()
        }
    }

    fn to_json(vmi: &VirtualMachineInstance) -> Value {
        serde_json::to_value(vmi).unwrap()
    }

    #[test]
    fn applies_defaults_on_create() {
        let fixture = Fixture::new();

        let mutation = fixture.create(vmi(json!({"domain": {"devices": {}}})));

        assert!(mutation.diagnostics.is_empty());
        assert_json_include!(
            actual: to_json(&mutation.vmi),
            expected: json!({
                "metadata": {
                    "finalizers": ["foregroundDeleteVirtualMachine"],
                    "annotations": {"virtualmachinepreset.kubevirt.io/test-preset": "kubevirt.io/v1"}
                },
                "spec": {
                    "domain": {
                        "cpu": {"cores": 4, "model": "host-model"},
                        "machine": {"type": "q35"},
                        "resources": {
                            "requests": {"memory": "128M"},
                            "limits": {"memory": "128M"}
                        },
                        "devices": {
                            "interfaces": [{"name": "default", "bridge": {}}]
                        }
                    },
                    "networks": [{"name": "default", "pod": {}}]
                }
            })
        );
        assert_eq!(mutation.vmi.status, None);
    }

    fn vmi_with_untyped_fields() -> VirtualMachineInstance {
        vmi(json!({
            "hostname": "myhost",
            "terminationGracePeriodSeconds": 0,
            "domain": {
                "clock": {"utc": {}},
                "devices": {
                    "disks": [{"name": "rootdisk", "disk": {"bus": "ide"}, "cache": "none"}],
                    "interfaces": [{"name": "default", "masquerade": {}, "ports": [{"port": 80}]}]
                }
            },
            "networks": [{"name": "default", "pod": {}}],
            "volumes": [
                {"name": "rootdisk", "containerDisk": {"image": "test:v1"}},
                {"name": "dv", "dataVolume": {"name": "my-dv"}}
            ]
        }))
    }

    #[test]
    fn create_keeps_untyped_fields() {
        let fixture = Fixture::new();

        let mutation = fixture.create(vmi_with_untyped_fields());

        let actual = to_json(&mutation.vmi);
        assert_eq!(actual["spec"]["hostname"], json!("myhost"));
        assert_json_include!(
            actual: actual,
            expected: json!({
                "spec": {
                    "terminationGracePeriodSeconds": 0,
                    "domain": {
                        "clock": {"utc": {}},
                        "devices": {
                            "disks": [
                                {"name": "rootdisk", "disk": {"bus": "ide"}, "cache": "none"},
                                {"name": "dv", "disk": {}}
                            ],
                            "interfaces": [
                                {"name": "default", "masquerade": {}, "ports": [{"port": 80}]}
                            ]
                        }
                    },
                    "networks": [{"name": "default", "pod": {}}],
                    "volumes": [
                        {
                            "name": "rootdisk",
                            "containerDisk": {"image": "test:v1", "imagePullPolicy": "IfNotPresent"}
                        },
                        {"name": "dv", "dataVolume": {"name": "my-dv"}}
                    ]
                }
            })
        );
    }

    #[test]
    fn update_keeps_untyped_fields() {
        let fixture = Fixture::new();
        let new = vmi_with_untyped_fields();

        let mutation = mutate(
            Operation::Update,
            Some(&new),
            new.clone(),
            "user",
            &fixture.ctx(),
        )
        .unwrap();

        assert_eq!(to_json(&mutation.vmi), to_json(&new));
        assert_eq!(to_json(&new)["spec"]["hostname"], json!("myhost"));
    }

    #[test]
    fn converts_cpu_request_to_sockets() {
        let mut fixture = Fixture::new();
        fixture.presets.clear();

        let mutation = fixture.create(vmi(json!({
            "domain": {"resources": {"requests": {"cpu": "2200m"}}, "devices": {}}
        })));

        assert_json_include!(
            actual: to_json(&mutation.vmi),
            expected: json!({
                "spec": {"domain": {"cpu": {"sockets": 3, "cores": 1, "threads": 1}}}
            })
        );
    }

    #[test]
    fn memory_overcommit_without_namespace_limits() {
        let mut fixture = Fixture::new();
        fixture.limit_ranges.clear();
        fixture.config.memory_overcommit = Some(150);

        let mutation = fixture.create(vmi(json!({
            "domain": {"memory": {"guest": "3072M"}, "devices": {}}
        })));

        assert_json_include!(
            actual: to_json(&mutation.vmi),
            expected: json!({
                "spec": {"domain": {"resources": {"requests": {"memory": "2048M"}}}}
            })
        );
    }

    #[test]
    fn user_values_win() {
        let mut fixture = Fixture::new();
        fixture.config.cpu_model = Some("Haswell".into());
        fixture.config.machine_type = Some("pc-q35-3.0".into());

        let mutation = fixture.create(vmi(json!({
            "domain": {
                "cpu": {"cores": 2, "model": "EPYC"},
                "machine": {"type": "pc-i440fx"},
                "resources": {"requests": {"memory": "512M"}},
                "memory": {"guest": "4096M"},
                "devices": {}
            },
            "volumes": [{
                "name": "rootdisk",
                "containerDisk": {"image": "test:latest", "imagePullPolicy": "Never"}
            }]
        })));

        assert_json_include!(
            actual: to_json(&mutation.vmi),
            expected: json!({
                "spec": {
                    "domain": {
                        "cpu": {"cores": 2, "model": "EPYC"},
                        "machine": {"type": "pc-i440fx"},
                        "resources": {"requests": {"memory": "512M"}}
                    },
                    "volumes": [{"containerDisk": {"imagePullPolicy": "Never"}}]
                }
            })
        );
    }

    #[test]
    fn hyperv_conflicts_do_not_block_admission() {
        let fixture = Fixture::new();

        let mutation = fixture.create(vmi(json!({
            "domain": {
                "features": {
                    "hyperv": {
                        "vpindex": {"enabled": false},
                        "synictimer": {"enabled": true},
                        "evmcs": {}
                    }
                },
                "devices": {}
            }
        })));

        assert_eq!(
            mutation.diagnostics,
            vec![Diagnostic::FeatureDependencyConflict {
                feature: "synic",
                requires: "vpindex",
            }]
        );
        assert_json_include!(
            actual: to_json(&mutation.vmi),
            expected: json!({
                "spec": {
                    "domain": {
                        "cpu": {"features": [{"name": "vmx", "policy": "require"}]},
                        "features": {
                            "hyperv": {
                                "vpindex": {"enabled": false},
                                "synic": {"enabled": true},
                                "vapic": {"enabled": true}
                            }
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn arm64_defaults() {
        let mut fixture = Fixture::new();
        fixture.arch = Arch::Arm64;
        fixture.config.cpu_model = Some("Haswell".into());

        let mutation = fixture.create(vmi(json!({
            "domain": {
                "devices": {
                    "disks": [
                        {"name": "scsi", "disk": {"bus": "scsi"}},
                        {"name": "cdrom", "cdrom": {"bus": "sata"}}
                    ]
                }
            },
            "volumes": [{"name": "scsi"}, {"name": "cdrom"}, {"name": "extra"}]
        })));

        assert_json_include!(
            actual: to_json(&mutation.vmi),
            expected: json!({
                "spec": {
                    "domain": {
                        "cpu": {"model": "host-passthrough"},
                        "machine": {"type": "virt"},
                        "firmware": {"bootloader": {"efi": {"secureBoot": false}}},
                        "devices": {
                            "disks": [
                                {"name": "scsi", "disk": {"bus": "scsi"}},
                                {"name": "cdrom", "cdrom": {"bus": "virtio"}},
                                {"name": "extra", "disk": {"bus": "virtio"}}
                            ]
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn create_is_idempotent() {
        let mut fixture = Fixture::new();
        fixture.arch = Arch::Arm64;
        fixture.config.network_interface = Some(NetworkInterfaceKind::Masquerade);
        fixture.config.cpu_request = Some(k8s_openapi::apimachinery::pkg::api::resource::Quantity(
            "500m".into(),
        ));

        let first = fixture.create(vmi(json!({
            "domain": {
                "cpu": {"realtime": {}},
                "memory": {"guest": "1Gi"},
                "features": {"hyperv": {"synictimer": {}, "evmcs": {"enabled": true}}},
                "devices": {"inputs": [{"name": "tablet"}]}
            },
            "volumes": [
                {"name": "rootdisk", "containerDisk": {"image": "fedora"}},
                {"name": "data", "emptyDisk": {"capacity": "1Gi"}}
            ]
        })));
        let second = fixture.create(first.vmi.clone());

        assert_eq!(first.vmi, second.vmi);
        assert!(second.diagnostics.is_empty());
    }

    #[test]
    fn preset_exclusion() {
        let fixture = Fixture::new();
        let mut excluded = vmi(json!({"domain": {"devices": {}}}));
        excluded.annotations_mut().insert(
            presets::PRESET_EXCLUDE_ANNOTATION.to_string(),
            "true".to_string(),
        );

        let mutation = fixture.create(excluded);

        assert_eq!(
            mutation.vmi.spec.domain.cpu.and_then(|c| c.cores),
            None
        );
    }

    #[test]
    fn finalizer_is_added_once() {
        let fixture = Fixture::new();
        let mut existing = vmi(json!({"domain": {"devices": {}}}));
        existing
            .finalizers_mut()
            .push(VIRTUAL_MACHINE_INSTANCE_FINALIZER.to_string());

        let mutation = fixture.create(existing);

        assert_eq!(
            mutation.vmi.finalizers(),
            &[VIRTUAL_MACHINE_INSTANCE_FINALIZER.to_string()]
        );
    }

    #[test]
    fn nonroot_rejects_virtiofs() {
        let mut fixture = Fixture::new();
        fixture.config.feature_gates = vec!["NonRoot".into()];
        let with_virtiofs = vmi(json!({
            "domain": {"devices": {"filesystems": [{"name": "shared", "virtiofs": {}}]}},
            "volumes": [{"name": "shared"}]
        }));

        let err = mutate(
            Operation::Create,
            None,
            with_virtiofs,
            "user",
            &fixture.ctx(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            Error::NonRootIncompatible {
                device: "VirtioFS",
                ..
            }
        ));
    }

    #[test]
    fn nonroot_sets_runtime_user() {
        let mut fixture = Fixture::new();
        fixture.config.feature_gates = vec!["NonRoot".into()];

        let mutation = fixture.create(vmi(json!({"domain": {"devices": {}}})));

        assert_eq!(
            mutation.vmi.status.and_then(|s| s.runtime_user),
            Some(107)
        );
    }

    fn with_status(phase: VirtualMachineInstancePhase) -> VirtualMachineInstance {
        let mut vmi = vmi(json!({"domain": {"devices": {}}}));
        vmi.status = Some(VirtualMachineInstanceStatus {
            phase: Some(phase),
            ..Default::default()
        });
        vmi
    }

    #[test]
    fn update_status_from_privileged_user_is_kept() {
        let fixture = Fixture::new();
        let old = with_status(VirtualMachineInstancePhase::Scheduling);
        let new = with_status(VirtualMachineInstancePhase::Running);

        let mutation = mutate(
            Operation::Update,
            Some(&old),
            new.clone(),
            PRIVILEGED_USER,
            &fixture.ctx(),
        )
        .unwrap();

        assert_eq!(mutation.vmi, new);
    }

    #[test]
    fn update_status_from_other_user_is_reverted() {
        let fixture = Fixture::new();
        let old = with_status(VirtualMachineInstancePhase::Scheduling);
        let new = with_status(VirtualMachineInstancePhase::Running);

        let mutation = mutate(
            Operation::Update,
            Some(&old),
            new,
            "system:serviceaccount:default:someone",
            &fixture.ctx(),
        )
        .unwrap();

        assert_eq!(mutation.vmi.status, old.status);
        // no defaulting on update
        assert!(mutation.vmi.spec.networks.is_empty());
        assert!(mutation.vmi.finalizers().is_empty());
    }

    #[test]
    fn update_without_old_object_fails() {
        let fixture = Fixture::new();

        let result = mutate(
            Operation::Update,
            None,
            with_status(VirtualMachineInstancePhase::Running),
            PRIVILEGED_USER,
            &fixture.ctx(),
        );

        assert!(matches!(result, Err(Error::MissingOldObject(name)) if name == "testvmi"));
    }
}
