use std::fmt::Display;
use std::path::Path;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Feature gate enabling unprivileged virtual machine processes
pub static NON_ROOT_FEATURE_GATE: &str = "NonRoot";

pub const DEFAULT_MEMORY_OVERCOMMIT: u32 = 100;

/// Binding method used for the interface synthesized when a VMI declares no networking at all
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkInterfaceKind {
    #[default]
    Bridge,
    Masquerade,
    Slirp,
}

impl Display for NetworkInterfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bridge => write!(f, "bridge"),
            Self::Masquerade => write!(f, "masquerade"),
            Self::Slirp => write!(f, "slirp"),
        }
    }
}

/// Read-only snapshot of the cluster-wide virtualization configuration.
///
/// Every field is optional; unset fields fall back to the documented defaults.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// CPU model applied to VMIs that do not choose one. Ignored on arm64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,

    /// Machine type applied to VMIs that do not choose one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,

    /// CPU request applied to VMIs that request no CPU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<Quantity>,

    /// Percentage of the guest memory that is actually reserved. Defaults to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_overcommit: Option<u32>,

    /// Binding of the default interface. Defaults to bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interface: Option<NetworkInterfaceKind>,

    /// Whether slirp may be used as the default interface binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permit_slirp_interface: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feature_gates: Vec<String>,
}

impl ClusterConfig {
    /// Load a configuration snapshot from a YAML (or JSON) file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn memory_overcommit(&self) -> u32 {
        match self.memory_overcommit {
            Some(percent) if percent > 0 => percent,
            _ => DEFAULT_MEMORY_OVERCOMMIT,
        }
    }

    pub fn network_interface(&self) -> NetworkInterfaceKind {
        self.network_interface.unwrap_or_default()
    }

    pub fn permit_slirp_interface(&self) -> bool {
        self.permit_slirp_interface.unwrap_or(false)
    }

    pub fn feature_gate_enabled(&self, gate: &str) -> bool {
        self.feature_gates.iter().any(|g| g == gate)
    }

    pub fn non_root_enabled(&self) -> bool {
        self.feature_gate_enabled(NON_ROOT_FEATURE_GATE)
    }
}
