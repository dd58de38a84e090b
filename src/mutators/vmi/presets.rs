use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::mutators::Diagnostic;
use crate::resources::virtualmachineinstancepresets::{
    selector_matches, VirtualMachineInstancePreset,
};
use crate::resources::virtualmachineinstances::{DomainSpec, VirtualMachineInstance};

/// Annotation with which a VMI opts out of preset application
pub static PRESET_EXCLUDE_ANNOTATION: &str =
    "virtualmachineinstancepresets.admission.kubevirt.io/exclude";

/// Prefix of the annotation recording each preset applied to a VMI
pub static PRESET_ANNOTATION_PREFIX: &str = "virtualmachinepreset.kubevirt.io/";

static PRESET_API_VERSION: &str = "kubevirt.io/v1";

/// Returns the presets that apply to the VMI: same namespace and a matching selector, ordered by
/// name so that application order does not depend on the order they were listed in.
pub fn matching_presets(
    vmi: &VirtualMachineInstance,
    presets: &[VirtualMachineInstancePreset],
) -> Vec<VirtualMachineInstancePreset> {
    let labels = vmi.labels();
    let mut matching: Vec<_> = presets
        .iter()
        .filter(|p| match (p.namespace(), vmi.namespace()) {
            (Some(preset_ns), Some(vmi_ns)) => preset_ns == vmi_ns,
            _ => true,
        })
        .filter(|p| selector_matches(&p.spec.selector, labels))
        .cloned()
        .collect();
    matching.sort_by_key(|p| p.name_any());
    matching
}

pub fn is_excluded(vmi: &VirtualMachineInstance) -> bool {
    vmi.annotations()
        .get(PRESET_EXCLUDE_ANNOTATION)
        .is_some_and(|v| v == "true")
}

/// Tracks which preset set which field so that collisions between presets can be told apart
/// from values the caller set.
#[derive(Default)]
struct Claims<'a> {
    diagnostics: Vec<Diagnostic>,
    owners: BTreeMap<String, &'a str>,
}

impl<'a> Claims<'a> {
    fn merge<T: Clone + PartialEq>(
        &mut self,
        field: &str,
        target: &mut Option<T>,
        value: Option<&T>,
        preset: &'a str,
    ) {
        let Some(value) = value else {
            return;
        };
        match target.as_ref() {
            None => {
                debug!(preset, field, "Applying preset value");
                *target = Some(value.clone());
                self.owners.insert(field.to_string(), preset);
            }
            Some(existing) if existing != value => match self.owners.get(field) {
                Some(applied) => self.diagnostics.push(Diagnostic::PresetConflict {
                    field: field.to_string(),
                    applied: applied.to_string(),
                    conflicting: preset.to_string(),
                }),
                None => debug!(preset, field, "VMI overrides preset value"),
            },
            Some(_) => {}
        }
    }

    fn merge_entry<V: Clone + PartialEq>(
        &mut self,
        field: &str,
        target: &mut BTreeMap<String, V>,
        key: &str,
        value: &V,
        preset: &'a str,
    ) {
        let mut current = target.get(key).cloned();
        self.merge(field, &mut current, Some(value), preset);
        if let Some(current) = current {
            target.insert(key.to_string(), current);
        }
    }

    fn merge_quantities(
        &mut self,
        field: &str,
        target: &mut Option<BTreeMap<String, Quantity>>,
        values: Option<&BTreeMap<String, Quantity>>,
        preset: &'a str,
    ) {
        for (resource, quantity) in values.into_iter().flatten() {
            self.merge_entry(
                &format!("{field}.{resource}"),
                target.get_or_insert_with(BTreeMap::new),
                resource,
                quantity,
                preset,
            );
        }
    }

    fn merge_domain(&mut self, domain: &mut DomainSpec, preset: &'a str, from: &DomainSpec) {
        let resources = &mut domain.resources;
        self.merge_quantities(
            "resources.requests",
            &mut resources.requests,
            from.resources.requests.as_ref(),
            preset,
        );
        self.merge_quantities(
            "resources.limits",
            &mut resources.limits,
            from.resources.limits.as_ref(),
            preset,
        );
        self.merge("cpu", &mut domain.cpu, from.cpu.as_ref(), preset);
        self.merge("memory", &mut domain.memory, from.memory.as_ref(), preset);
        self.merge("machine", &mut domain.machine, from.machine.as_ref(), preset);
        self.merge("firmware", &mut domain.firmware, from.firmware.as_ref(), preset);
        self.merge("features", &mut domain.features, from.features.as_ref(), preset);
        for (key, value) in &from.other {
            self.merge_entry(key, &mut domain.other, key, value, preset);
        }
    }

    /// Presets that set at least one field
    fn applied(&self) -> BTreeSet<&'a str> {
        self.owners.values().copied().collect()
    }
}

/// Merge the domain of each preset into the VMI, in order. Fields set by the caller are never
/// touched and the first preset to set a field wins; later presets disagreeing on it are
/// reported.
pub fn apply_presets(
    vmi: &mut VirtualMachineInstance,
    presets: &[VirtualMachineInstancePreset],
) -> Vec<Diagnostic> {
    if is_excluded(vmi) {
        info!(vmi = %vmi.name_any(), "VMI excluded from preset application");
        return vec![];
    }

    let names: Vec<String> = presets.iter().map(|p| p.name_any()).collect();
    let mut claims = Claims::default();
    for (preset, name) in presets.iter().zip(&names) {
        if let Some(from) = &preset.spec.domain {
            claims.merge_domain(&mut vmi.spec.domain, name, from);
        }
    }

    let applied = claims.applied();
    let annotations = vmi.annotations_mut();
    for name in names.iter().filter(|name| applied.contains(name.as_str())) {
        annotations.insert(
            format!("{PRESET_ANNOTATION_PREFIX}{name}"),
            PRESET_API_VERSION.to_string(),
        );
    }

    claims.diagnostics
}
