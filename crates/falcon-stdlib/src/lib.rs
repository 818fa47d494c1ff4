//! Concrete native builtins for the Falcon language, installed into a
//! [`falcon_vm::Vm`]'s global table.

pub mod builtins;

pub use builtins::install;
