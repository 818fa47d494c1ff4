//! Heap object kinds and the handle that addresses them.
//!
//! Every object Falcon allocates — strings, functions, closures, instances,
//! lists, maps — is one variant of the single [`Obj`] tagged enum, addressed
//! from the rest of the VM by an [`ObjRef`] handle rather than a pointer. The
//! handle carries a generation counter so a stale reference to a freed and
//! reused slot is detected rather than silently aliasing unrelated data.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// A handle into [`crate::heap::Heap`]'s arena.
///
/// Two `ObjRef`s are equal only if they name the same slot *and* the same
/// generation, so a handle captured before a `collect()` that freed and
/// recycled its slot will not silently collide with the new occupant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

impl ObjRef {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Builds a handle for unit tests that exercise [`Table`] or [`Obj`]
    /// logic without going through a real [`crate::heap::Heap`].
    #[doc(hidden)]
    pub fn for_test(index: u32) -> Self {
        Self { index, generation: 0 }
    }
}

/// State of an upvalue: open while it still aliases a live stack slot,
/// closed once the frame that owned the slot returns.
#[derive(Clone, Debug)]
pub enum UpvalueState {
    /// Index into the VM's value stack.
    Open(usize),
    /// The value has been lifted off the stack and is owned here.
    Closed(Value),
}

#[derive(Clone, Debug)]
pub struct UpvalueObj {
    pub state: UpvalueState,
}

#[derive(Clone, Debug)]
pub struct FunctionObj {
    /// `None` for the implicit top-level script function.
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub upvalue_count: u8,
    /// For each upvalue the `Closure` instruction that creates a closure
    /// over this function must capture: `(index, is_local)`, where
    /// `is_local` says whether `index` is a slot in the *enclosing* frame
    /// (`true`) or that frame's own upvalue array (`false`). Populated by
    /// the compiler; read by the VM when it executes `Op::Closure`.
    pub upvalues: Vec<(u8, bool)>,
    pub chunk: Chunk,
}

/// A native (host-provided) function's metadata. The callable itself lives
/// in `falcon-vm`'s native registry, keyed by `name`; this object is what
/// `Value::Obj` points at when a global is bound to a builtin.
#[derive(Clone, Debug)]
pub struct NativeObj {
    pub name: ObjRef,
    pub arity: Option<u8>,
}

#[derive(Clone, Debug)]
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Clone, Debug)]
pub struct ClassObj {
    pub name: ObjRef,
    pub methods: Table,
}

#[derive(Clone, Debug)]
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: Table,
}

#[derive(Clone, Debug)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

/// A heap-allocated Falcon object. The mark bit used by the collector lives
/// alongside this in `Heap`'s slot wrapper, not in the payload itself, so
/// tracing the object graph never has to match on more than this one tag.
#[derive(Clone, Debug)]
pub enum Obj {
    Str(Box<str>),
    Function(FunctionObj),
    Native(NativeObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    List(Vec<Value>),
    Map(Table),
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::Str(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native",
            Obj::Closure(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "function",
            Obj::List(_) => "list",
            Obj::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Obj::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Every reachable `ObjRef` this object holds directly (one hop). The
    /// collector's trace phase follows these to discover the rest of the
    /// graph; it does not need to recurse itself.
    pub fn trace_refs(&self, mut visit: impl FnMut(ObjRef)) {
        match self {
            Obj::Str(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    visit(name);
                }
                for c in &f.chunk.consts {
                    if let Some(r) = c.obj_ref() {
                        visit(r);
                    }
                }
            }
            Obj::Native(n) => visit(n.name),
            Obj::Closure(c) => {
                visit(c.function);
                for uv in &c.upvalues {
                    visit(*uv);
                }
            }
            Obj::Upvalue(uv) => {
                if let UpvalueState::Closed(v) = &uv.state {
                    if let Some(r) = v.obj_ref() {
                        visit(r);
                    }
                }
            }
            Obj::Class(c) => {
                visit(c.name);
                for (k, v) in c.methods.iter() {
                    visit(k);
                    if let Some(r) = v.obj_ref() {
                        visit(r);
                    }
                }
            }
            Obj::Instance(i) => {
                visit(i.class);
                for (k, v) in i.fields.iter() {
                    visit(k);
                    if let Some(r) = v.obj_ref() {
                        visit(r);
                    }
                }
            }
            Obj::BoundMethod(b) => {
                if let Some(r) = b.receiver.obj_ref() {
                    visit(r);
                }
                visit(b.method);
            }
            Obj::List(items) => {
                for v in items {
                    if let Some(r) = v.obj_ref() {
                        visit(r);
                    }
                }
            }
            Obj::Map(t) => {
                for (k, v) in t.iter() {
                    visit(k);
                    if let Some(r) = v.obj_ref() {
                        visit(r);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_are_distinct_by_generation() {
        let a = ObjRef::new(3, 0);
        let b = ObjRef::new(3, 1);
        assert_ne!(a, b);
        assert_eq!(a, ObjRef::new(3, 0));
    }

    #[test]
    fn list_trace_visits_object_elements_only() {
        let s = ObjRef::for_test(7);
        let list = Obj::List(vec![Value::Number(1.0), Value::Obj(s), Value::Null]);
        let mut seen = Vec::new();
        list.trace_refs(|r| seen.push(r));
        assert_eq!(seen, vec![s]);
    }
}
