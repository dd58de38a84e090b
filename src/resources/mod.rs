pub mod virtualmachineinstancepresets;
pub mod virtualmachineinstances;
