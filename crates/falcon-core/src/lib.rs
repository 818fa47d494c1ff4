//! Shared data model for the Falcon language: the `Value` tagged union, heap
//! object kinds, the object arena and its garbage collector, the
//! open-addressed hash table, and the bytecode chunk format.
//!
//! Both `falcon-compiler` and `falcon-vm` depend on this crate so that
//! compile-time allocation (string/function constants) and run-time
//! allocation share one [`heap::Heap`].

pub mod chunk;
pub mod error;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub mod prelude {
    pub use crate::chunk::{Chunk, LineTable, Op};
    pub use crate::error::ChunkError;
    pub use crate::heap::{GcOptions, Heap, RootSet};
    pub use crate::object::{
        BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, NativeObj, Obj, ObjRef, UpvalueObj, UpvalueState,
    };
    pub use crate::table::Table;
    pub use crate::value::Value;
}
