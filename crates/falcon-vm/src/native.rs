//! Native (host-provided) function bridge.
//!
//! A native is a plain Rust function, not a heap object with executable
//! code: the `Obj::Native` heap value only carries the name and arity used
//! for error messages and arity checks. The callable itself lives in a
//! name-keyed registry on the `Vm`.

use std::collections::HashMap;

use falcon_core::value::Value;

use crate::error::RuntimeError;
use crate::vm::Vm;

pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError>;

#[derive(Default)]
pub struct NativeRegistry {
    funcs: HashMap<String, NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, f: NativeFn) {
        self.funcs.insert(name.to_string(), f);
    }

    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.funcs.get(name).copied()
    }
}
