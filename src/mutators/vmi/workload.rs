use std::collections::BTreeMap;

use tracing::debug;

use crate::resources::virtualmachineinstances::{
    VirtualMachineInstanceSpec, REALTIME_LABEL, SEV_LABEL,
};

/// Pin realtime and SEV guests onto nodes labelled as able to host them. Existing selector
/// entries are kept as they are.
pub fn set_workload_node_selectors(spec: &mut VirtualMachineInstanceSpec) {
    let realtime = spec
        .domain
        .cpu
        .as_ref()
        .is_some_and(|cpu| cpu.realtime.is_some());
    let sev = spec
        .domain
        .launch_security
        .as_ref()
        .is_some_and(|ls| ls.sev.is_some());

    for (hinted, label) in [(realtime, REALTIME_LABEL), (sev, SEV_LABEL)] {
        if hinted {
            let selector = spec.node_selector.get_or_insert_with(BTreeMap::new);
            if !selector.contains_key(label) {
                debug!(label, "Adding node selector");
                selector.insert(label.to_string(), String::new());
            }
        }
    }
}
