//! Front end: turns Falcon source text directly into a bytecode
//! [`falcon_core::object::FunctionObj`] representing the top-level script,
//! with no intermediate AST — the parser emits instructions as it
//! recognizes grammar rules (a single-pass Pratt compiler, clox-style).

pub mod error;
pub mod lexer;
pub mod parser;

use falcon_core::heap::Heap;
use falcon_core::object::FunctionObj;

pub use error::{CompileError, Diagnostics, ParseError};

/// Compiles `source` into the implicit top-level script function, allocating
/// any string/function constants it needs into `heap`. `heap` is threaded in
/// by mutable reference (rather than owned) so the same arena that held
/// constants at compile time is the one the VM later runs against.
pub fn compile(source: &str, heap: &mut Heap) -> Result<FunctionObj, Vec<ParseError>> {
    let _span = tracing::debug_span!("compile", bytes = source.len()).entered();
    let parser = parser::Parser::new(source, heap);
    parser.compile_script()
}

#[cfg(test)]
mod tests {
    use super::*;
    use falcon_core::chunk::Op;

    fn compiled_ops(src: &str) -> Vec<Op> {
        let mut heap = Heap::new();
        let f = compile(src, &mut heap).expect("should compile");
        f.chunk.ops
    }

    #[test]
    fn number_literal_compiles_to_a_constant_and_pop() {
        let ops = compiled_ops("1;");
        assert!(matches!(ops[0], Op::Constant(0)));
        assert!(matches!(ops[1], Op::Pop));
        assert!(matches!(ops.last(), Some(Op::Return)));
    }

    #[test]
    fn let_binding_and_global_read() {
        let ops = compiled_ops("let x = 1; x;");
        assert!(ops.iter().any(|op| matches!(op, Op::DefineGlobal(_))));
        assert!(ops.iter().any(|op| matches!(op, Op::GetGlobal(_))));
    }

    #[test]
    fn local_in_block_uses_local_slots_not_globals() {
        let ops = compiled_ops("{ let x = 1; x; }");
        assert!(ops.iter().any(|op| matches!(op, Op::GetLocal(_))));
        assert!(!ops.iter().any(|op| matches!(op, Op::DefineGlobal(_))));
    }

    #[test]
    fn if_else_emits_two_patched_jumps() {
        let ops = compiled_ops("if (true) { 1; } else { 2; }");
        let jumps: Vec<_> = ops.iter().filter(|op| op.is_jump()).collect();
        assert_eq!(jumps.len(), 2);
    }

    #[test]
    fn while_loop_emits_a_backward_loop_instruction() {
        let ops = compiled_ops("while (true) { 1; }");
        assert!(ops.iter().any(|op| matches!(op, Op::Loop(_))));
    }

    #[test]
    fn function_declaration_emits_a_closure() {
        let ops = compiled_ops("fn add(a, b) { return a + b; }");
        assert!(ops.iter().any(|op| matches!(op, Op::Closure(_))));
    }

    #[test]
    fn closure_over_outer_local_emits_an_upvalue_read() {
        let mut heap = Heap::new();
        let f = compile("fn make() { let x = 1; fn inner() { return x; } return inner; }", &mut heap).unwrap();
        // The outer function's constant pool holds `inner`'s compiled Function.
        let inner = f.chunk.consts.iter().find_map(|v| v.obj_ref());
        let inner_fn = inner.map(|r| heap.get(r));
        let inner_ops = match inner_fn {
            Some(falcon_core::object::Obj::Function(ff)) => ff.chunk.ops.clone(),
            _ => panic!("expected the nested function constant"),
        };
        assert!(inner_ops.iter().any(|op| matches!(op, Op::GetUpvalue(_))));
    }

    #[test]
    fn missing_semicolon_is_reported_as_a_parse_error() {
        let mut heap = Heap::new();
        let err = compile("let x = 1", &mut heap).unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn class_declaration_emits_class_and_method_ops() {
        let ops = compiled_ops("class Point { init(x) { this.x = x; } }");
        assert!(ops.iter().any(|op| matches!(op, Op::Class(_))));
        assert!(ops.iter().any(|op| matches!(op, Op::Method(_))));
    }
}
