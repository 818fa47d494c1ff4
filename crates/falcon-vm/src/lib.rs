//! Stack-based interpreter for compiled Falcon bytecode.

pub mod error;
pub mod native;
pub mod vm;

pub use error::{FalconError, InterpretResult, RuntimeError};
pub use native::{NativeFn, NativeRegistry};
pub use vm::{Vm, VmOptions};

#[cfg(test)]
mod tests {
    use super::*;
    use falcon_core::value::Value;

    #[test]
    fn arithmetic_and_print_smoke_test() {
        let mut vm = Vm::new();
        vm.define_native("print", None, |vm, args| {
            for a in args {
                let _ = vm; // natives may use `vm` to allocate/intern
                let _ = a;
            }
            Ok(Value::Null)
        });
        vm.interpret("let x = 1 + 2 * 3; print(x);").expect("should run");
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("1 / 0;").unwrap_err();
        assert!(matches!(err, FalconError::Runtime { error: RuntimeError::DivisionByZero, .. }));
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("nope;").unwrap_err();
        assert!(matches!(err, FalconError::Runtime { error: RuntimeError::UndefinedVariable(_), .. }));
    }

    #[test]
    fn closures_capture_outer_locals_by_reference() {
        let mut vm = Vm::new();
        let src = r#"
            let counter = null;
            fn makeCounter() {
                let n = 0;
                fn inc() {
                    n = n + 1;
                    return n;
                }
                return inc;
            }
            counter = makeCounter();
            counter();
            counter();
        "#;
        vm.interpret(src).expect("should run");
    }

    #[test]
    fn closures_in_a_for_loop_capture_each_iterations_value() {
        let mut vm = Vm::new();
        vm.define_native("check", Some(2), |_vm, args| {
            if args[0] == args[1] {
                Ok(Value::Null)
            } else {
                Err(RuntimeError::Native(format!("expected {:?} but got {:?}", args[1], args[0])))
            }
        });
        let src = r#"
            let closures = [null, null, null];
            for (let i = 1; i <= 3; i = i + 1) {
                fn grab() { return i; }
                closures[i - 1] = grab;
            }
            check(closures[0](), 1);
            check(closures[1](), 2);
            check(closures[2](), 3);
        "#;
        vm.interpret(src).expect("each closure should keep its own iteration's loop variable");
    }

    #[test]
    fn classes_support_init_and_field_access() {
        let mut vm = Vm::new();
        let src = r#"
            class Point {
                init(x, y) {
                    this.x = x;
                    this.y = y;
                }
                sum() {
                    return this.x + this.y;
                }
            }
            let p = Point(1, 2);
            p.sum();
        "#;
        vm.interpret(src).expect("should run");
    }

    #[test]
    fn list_and_map_literals_support_indexing() {
        let mut vm = Vm::new();
        vm.interpret(r#"let xs = [1, 2, 3]; xs[1]; let m = {"a": 1}; m["a"];"#).expect("should run");
    }

    #[test]
    fn gc_stress_mode_does_not_corrupt_reachable_state() {
        let mut vm = Vm::with_options(VmOptions::default().with_gc(falcon_core::heap::GcOptions { initial_threshold: 0, growth_factor: 1, stress: true }));
        vm.interpret(r#"let xs = []; let i = 0; while (i < 50) { xs = [xs, i]; i = i + 1; } xs;"#).expect("should run under gc stress");
    }

    /// A small arithmetic expression tree, rendered to Falcon source. Every
    /// generated expression is balanced by construction, so running it
    /// exercises the stack-discipline and GC-stress invariants without ever
    /// being expected to fail on its own terms.
    fn arith_expr() -> impl proptest::strategy::Strategy<Value = String> {
        use proptest::prelude::*;
        let leaf = (0i32..50).prop_map(|n| n.to_string());
        leaf.prop_recursive(4, 64, 4, |inner| {
            prop_oneof![
                (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("({a} + {b})")),
                (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("({a} - {b})")),
                (inner.clone(), inner).prop_map(|(a, b)| format!("({a} * {b})")),
            ]
        })
    }

    proptest::proptest! {
        /// Stack discipline: any balanced arithmetic expression, however
        /// deeply nested, compiles and runs to completion without a stack
        /// over/underflow — the compiler's emitted stack deltas always sum
        /// to "exactly one value left" for an expression statement.
        #[test]
        fn stack_discipline_holds_for_nested_arithmetic(expr in arith_expr()) {
            let mut vm = Vm::new();
            let src = format!("let r = {expr};");
            proptest::prop_assert!(vm.interpret(&src).is_ok());
        }

        /// GC-stress invariance: collecting before every allocation must not
        /// change the observable result of a program versus collecting only
        /// past the byte threshold.
        #[test]
        fn gc_stress_mode_matches_normal_mode(expr in arith_expr()) {
            let src = format!("let r = {expr}; str(r);");

            let mut normal = Vm::new();
            falcon_stdlib_install_for_test(&mut normal);
            let normal_result = normal.interpret(&src);

            let mut stressed = Vm::with_options(
                VmOptions::default().with_gc(falcon_core::heap::GcOptions { initial_threshold: 0, growth_factor: 1, stress: true }),
            );
            falcon_stdlib_install_for_test(&mut stressed);
            let stressed_result = stressed.interpret(&src);

            proptest::prop_assert_eq!(normal_result.is_ok(), stressed_result.is_ok());
        }
    }

    /// Registers just enough of the stdlib surface (`str`) for the
    /// GC-stress-invariance property without depending on `falcon-stdlib`,
    /// which itself depends on this crate.
    fn falcon_stdlib_install_for_test(vm: &mut Vm) {
        vm.define_native("str", Some(1), |vm, args| {
            Ok(Value::Obj(vm.heap_mut().intern(&args[0].to_string())))
        });
    }
}
