use std::fmt::Display;
use std::str::FromStr;

use k8s_openapi::api::core::v1::LimitRange;

use crate::config::{ClusterConfig, NetworkInterfaceKind};
use crate::pci::PciAddressError;
use crate::quantity_parser::ParseError;
use crate::resources::virtualmachineinstancepresets::VirtualMachineInstancePreset;

pub mod vmi;

/// The kind of admission request being mutated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Create => write!(f, "CREATE"),
            Operation::Update => write!(f, "UPDATE"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported operation {0:?}, expected CREATE or UPDATE")]
pub struct InvalidOperation(String);

impl FromStr for Operation {
    type Err = InvalidOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATE" => Ok(Operation::Create),
            "UPDATE" => Ok(Operation::Update),
            _ => Err(InvalidOperation(s.to_string())),
        }
    }
}

/// Target architecture of the cluster's virtualization nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Arch {
    #[default]
    Amd64,
    Arm64,
    Ppc64le,
}

impl Arch {
    /// Map a Rust target architecture name (`std::env::consts::ARCH`) onto a supported one.
    /// `powerpc64` is taken as little-endian.
    pub fn from_target(target: &str) -> Option<Self> {
        match target {
            "x86_64" => Some(Arch::Amd64),
            "aarch64" => Some(Arch::Arm64),
            "powerpc64" => Some(Arch::Ppc64le),
            _ => None,
        }
    }

    /// Architecture of the running host, if it is a supported one
    pub fn host() -> Option<Self> {
        Self::from_host(std::env::consts::ARCH, cfg!(target_endian = "little"))
    }

    fn from_host(target: &str, little_endian: bool) -> Option<Self> {
        match Self::from_target(target)? {
            Arch::Ppc64le if !little_endian => None,
            arch => Some(arch),
        }
    }
}

impl Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arch::Amd64 => write!(f, "amd64"),
            Arch::Arm64 => write!(f, "arm64"),
            Arch::Ppc64le => write!(f, "ppc64le"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported architecture {0:?}, expected one of amd64, arm64, ppc64le")]
pub struct InvalidArch(String);

impl FromStr for Arch {
    type Err = InvalidArch;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" => Ok(Arch::Amd64),
            "arm64" => Ok(Arch::Arm64),
            "ppc64le" => Ok(Arch::Ppc64le),
            other => Arch::from_target(other).ok_or_else(|| InvalidArch(other.to_string())),
        }
    }
}

/// Read-only inputs shared by every stage of a single admission.
///
/// The presets are expected to be already filtered down to the ones whose selector matches the
/// object, in match priority order; the limit ranges to the ones of the object's namespace.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub config: &'a ClusterConfig,
    pub arch: Arch,
    pub presets: &'a [VirtualMachineInstancePreset],
    pub limit_ranges: &'a [LimitRange],
}

/// A non-fatal finding reported alongside a mutation. Diagnostics never block admission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Diagnostic {
    #[error("hyperv feature {feature} requires {requires}, which is explicitly disabled")]
    FeatureDependencyConflict {
        feature: &'static str,
        requires: &'static str,
    },

    #[error("preset {conflicting} sets {field} differently than preset {applied}, keeping the value of {applied}")]
    PresetConflict {
        field: String,
        applied: String,
        conflicting: String,
    },

    #[error("slirp is not permitted as default network interface, using {used}")]
    SlirpNotPermitted { used: NetworkInterfaceKind },

    #[error("invalid quantity {value:?} in {field}: {source}")]
    InvalidQuantity {
        field: String,
        value: String,
        source: ParseError,
    },

    #[error("invalid pci address on interface {interface}: {source}")]
    InvalidPciAddress {
        interface: String,
        source: PciAddressError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_from_str() {
        assert_eq!(Operation::from_str("CREATE").unwrap(), Operation::Create);
        assert_eq!(Operation::from_str("update").unwrap(), Operation::Update);
        assert!(Operation::from_str("DELETE").is_err());
    }

    #[test]
    fn test_arch_from_str() {
        assert_eq!(Arch::from_str("arm64").unwrap(), Arch::Arm64);
        assert_eq!(Arch::from_str("aarch64").unwrap(), Arch::Arm64);
        assert_eq!(Arch::from_str("x86_64").unwrap(), Arch::Amd64);
        assert_eq!(Arch::from_str("ppc64le").unwrap(), Arch::Ppc64le);
        assert!(Arch::from_str("riscv64").is_err());
    }

    #[test]
    fn test_arch_from_host() {
        assert_eq!(Arch::from_host("x86_64", true), Some(Arch::Amd64));
        assert_eq!(Arch::from_host("powerpc64", true), Some(Arch::Ppc64le));
        assert_eq!(Arch::from_host("powerpc64", false), None);
        assert_eq!(Arch::from_host("s390x", false), None);
    }

    #[test]
    fn test_diagnostic_messages() {
        let diagnostic = Diagnostic::FeatureDependencyConflict {
            feature: "synic",
            requires: "vpindex",
        };
        assert_eq!(
            diagnostic.to_string(),
            "hyperv feature synic requires vpindex, which is explicitly disabled"
        );
    }
}
