use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::virtualmachineinstances::DomainSpec;

/// VirtualMachineInstancePreset defines a VMI spec.domain to be applied to all VMIs that match the
/// provided label selector. Values the VMI already carries are never overwritten.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "VirtualMachineInstancePreset",
    group = "kubevirt.io",
    version = "v1",
    namespaced,
    shortname = "vmipreset",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstancePresetSpec {
    /// Selector is a label query over a set of VMIs.
    pub selector: LabelSelector,

    /// Domain is the same object type as contained in VirtualMachineInstanceSpec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainSpec>,
}

/// Returns true if the selector matches the given label set.
///
/// An empty selector matches everything. Unknown operators never match, so a malformed preset is
/// not silently applied to every VMI.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let match_labels = selector.match_labels.iter().flatten();
    for (key, value) in match_labels {
        if labels.get(key) != Some(value) {
            return false;
        }
    }

    let match_expressions = selector.match_expressions.iter().flatten();
    for expression in match_expressions {
        let label = labels.get(&expression.key);
        let values = expression.values.as_deref().unwrap_or_default();
        let matches = match expression.operator.as_str() {
            "In" => label.is_some_and(|v| values.contains(v)),
            "NotIn" => label.is_none_or(|v| !values.contains(v)),
            "Exists" => label.is_some(),
            "DoesNotExist" => label.is_none(),
            _ => false,
        };
        if !matches {
            return false;
        }
    }

    true
}
