use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{device} is not supported by nonroot virtual machines while the {gate} feature gate is enabled")]
    NonRootIncompatible {
        device: &'static str,
        gate: &'static str,
    },

    #[error("Update of VirtualMachineInstance {0} is missing the previous object")]
    MissingOldObject(String),

    #[error("No object found in manifest {0}")]
    EmptyManifest(String),

    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Short, stable label of the error kind for logs
    pub fn reason(&self) -> &'static str {
        match self {
            Error::NonRootIncompatible { .. } => "NonRootIncompatible",
            Error::MissingOldObject(_) => "MissingOldObject",
            Error::EmptyManifest(_) => "EmptyManifest",
            Error::SerializationError(_) => "SerializationError",
            Error::YamlError(_) => "YamlError",
            Error::Io(_) => "IoError",
        }
    }
}

/// Cluster-wide virtualization configuration
pub mod config;

/// Reading objects from manifest files
pub mod manifests;

/// Admission mutation pipelines
pub mod mutators;

pub mod pci;

pub mod quantity_parser;

/// Log integrations
pub mod telemetry;

/// Custom resources
pub mod resources;
