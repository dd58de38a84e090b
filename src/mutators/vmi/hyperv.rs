use std::collections::VecDeque;

use tracing::debug;

use crate::resources::virtualmachineinstances::{
    Cpu, CpuFeature, DomainSpec, FeatureHyperv, FeatureState, SyNICTimer,
};

/// CPU feature the guest needs for enlightened VMCS
pub static VMX_FEATURE: &str = "vmx";

pub static REQUIRE_POLICY: &str = "require";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HypervFeature {
    VpIndex,
    SyNic,
    SyNicTimer,
    Vapic,
    Evmcs,
}

use HypervFeature::*;

const FEATURES: [HypervFeature; 5] = [VpIndex, SyNic, SyNicTimer, Vapic, Evmcs];

/// (feature, prerequisite) pairs: enabling the first requires the second.
const DEPENDENCIES: [(HypervFeature, HypervFeature); 3] =
    [(SyNicTimer, SyNic), (SyNic, VpIndex), (Evmcs, Vapic)];

enum Flag {
    Unset,
    Enabled,
    Disabled,
}

fn state_flag(state: &Option<FeatureState>) -> Flag {
    flag(state.as_ref().map(|s| s.enabled))
}

/// `present` carries the `enabled` value of a feature that is present at all; a present feature
/// without an explicit value counts as enabled.
fn flag(present: Option<Option<bool>>) -> Flag {
    match present {
        None => Flag::Unset,
        Some(Some(false)) => Flag::Disabled,
        Some(_) => Flag::Enabled,
    }
}

impl HypervFeature {
    fn name(self) -> &'static str {
        match self {
            VpIndex => "vpindex",
            SyNic => "synic",
            SyNicTimer => "synictimer",
            Vapic => "vapic",
            Evmcs => "evmcs",
        }
    }

    fn flag(self, hyperv: &FeatureHyperv) -> Flag {
        match self {
            VpIndex => state_flag(&hyperv.vpindex),
            SyNic => state_flag(&hyperv.synic),
            Vapic => state_flag(&hyperv.vapic),
            Evmcs => state_flag(&hyperv.evmcs),
            SyNicTimer => flag(hyperv.synictimer.as_ref().map(|t| t.enabled)),
        }
    }

    fn enable(self, hyperv: &mut FeatureHyperv) {
        let state = Some(FeatureState::enabled());
        match self {
            VpIndex => hyperv.vpindex = state,
            SyNic => hyperv.synic = state,
            Vapic => hyperv.vapic = state,
            Evmcs => hyperv.evmcs = state,
            SyNicTimer => {
                hyperv
                    .synictimer
                    .get_or_insert_with(SyNICTimer::default)
                    .enabled = Some(true)
            }
        }
    }
}

/// An enabled feature whose prerequisite was explicitly disabled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{feature} requires {requires}")]
pub struct FeatureConflict {
    pub feature: &'static str,
    pub requires: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("conflicting hyperv features: {}", join(.0))]
pub struct FeatureConflicts(pub Vec<FeatureConflict>);

fn join(conflicts: &[FeatureConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Enable every prerequisite of the enabled hyperv features, transitively, and require the vmx
/// CPU feature when EVMCS is enabled.
///
/// Explicitly disabled prerequisites are left disabled and the walk does not continue through
/// them. All conflicts are collected and returned after the rest of the closure was applied.
pub fn set_hyperv_dependencies(domain: &mut DomainSpec) -> Result<(), FeatureConflicts> {
    let Some(hyperv) = domain.features.as_mut().and_then(|f| f.hyperv.as_mut()) else {
        return Ok(());
    };

    let mut queue: VecDeque<HypervFeature> = FEATURES
        .into_iter()
        .filter(|f| matches!(f.flag(hyperv), Flag::Enabled))
        .collect();

    let mut conflicts = vec![];
    while let Some(feature) = queue.pop_front() {
        for (_, requires) in DEPENDENCIES.iter().filter(|(from, _)| *from == feature) {
            match requires.flag(hyperv) {
                Flag::Enabled => {}
                Flag::Unset => {
                    debug!(
                        feature = feature.name(),
                        requires = requires.name(),
                        "Enabling hyperv prerequisite"
                    );
                    requires.enable(hyperv);
                    queue.push_back(*requires);
                }
                Flag::Disabled => conflicts.push(FeatureConflict {
                    feature: feature.name(),
                    requires: requires.name(),
                }),
            }
        }
    }

    if matches!(Evmcs.flag(hyperv), Flag::Enabled) {
        require_vmx(domain.cpu.get_or_insert_with(Cpu::default));
    }

    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(FeatureConflicts(conflicts))
    }
}

/// Make sure the vmx feature is required, keeping the position of an existing entry.
fn require_vmx(cpu: &mut Cpu) {
    match cpu.features.iter_mut().find(|f| f.name == VMX_FEATURE) {
        Some(feature) if feature.policy == REQUIRE_POLICY => {}
        Some(feature) => feature.policy = REQUIRE_POLICY.to_string(),
        None => cpu.features.push(CpuFeature {
            name: VMX_FEATURE.to_string(),
            policy: REQUIRE_POLICY.to_string(),
            ..Default::default()
        }),
    }
}
