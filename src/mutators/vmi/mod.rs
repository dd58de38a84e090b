//! Admission mutation of VirtualMachineInstances.
//!
//! Each stage is a plain function over the object being admitted, sequenced by [`mutate_create`].

pub mod arch;
pub mod devices;
pub mod hyperv;
pub mod limits;
mod mutator;
pub mod nonroot;
pub mod presets;
pub mod resources;
pub mod workload;

pub use mutator::{mutate, mutate_create, mutate_update, Mutation, PRIVILEGED_USER};
