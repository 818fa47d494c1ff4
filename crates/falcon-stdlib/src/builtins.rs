//! Concrete native functions bound into a [`Vm`]'s global table.
//!
//! Each native is a plain `fn` item registered by name and arity with the
//! VM's native registry.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use falcon_core::object::Obj;
use falcon_core::value::Value;
use falcon_vm::{RuntimeError, Vm};

pub fn install(vm: &mut Vm) {
    vm.define_native("clock", Some(0), clock);
    vm.define_native("time", Some(0), time);
    vm.define_native("exit", Some(1), exit);
    vm.define_native("type", Some(1), type_of);
    vm.define_native("bool", Some(1), to_bool);
    vm.define_native("num", Some(1), to_num);
    vm.define_native("str", Some(1), to_str);
    vm.define_native("len", Some(1), len);
    vm.define_native("input", Some(0), input);
    vm.define_native("print", None, print);
    vm.define_native("abs", Some(1), abs);
    vm.define_native("sqrt", Some(1), sqrt);
    vm.define_native("pow", Some(2), pow);
    vm.define_native("hasField", Some(2), has_field);
    vm.define_native("getField", Some(2), get_field);
    vm.define_native("setField", Some(3), set_field);
    vm.define_native("delField", Some(2), del_field);
    vm.define_native("assert", None, assert_fn);
    vm.define_native("push", Some(2), push);
    vm.define_native("pop", Some(1), pop);
}

fn expect_number(v: &Value) -> Result<f64, RuntimeError> {
    match v {
        Value::Number(n) => Ok(*n),
        other => Err(RuntimeError::TypeMismatch { expected: "number", actual: other.type_name_inline().unwrap_or("object") }),
    }
}

fn expect_string(vm: &Vm, v: &Value) -> Result<String, RuntimeError> {
    match v.obj_ref().and_then(|r| vm.heap().get(r).as_str().map(str::to_string)) {
        Some(s) => Ok(s),
        None => Err(RuntimeError::TypeMismatch { expected: "string", actual: "object" }),
    }
}

fn clock(_vm: &mut Vm, _args: &[Value]) -> Result<Value, RuntimeError> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|e| RuntimeError::Native(e.to_string()))?.as_secs_f64();
    Ok(Value::Number(secs))
}

fn time(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    clock(vm, args)
}

fn exit(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let code = expect_number(&args[0])? as i32;
    std::io::stdout().flush().ok();
    std::process::exit(code);
}

fn type_of(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let name = match args[0].type_name_inline() {
        Some(n) => n,
        None => args[0].obj_ref().map(|r| vm.heap().get(r).kind_name()).unwrap_or("error"),
    };
    Ok(Value::Obj(vm.heap_mut().intern(name)))
}

fn to_bool(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(!vm.heap().is_falsey(&args[0])))
}

fn to_num(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Number(n) => Ok(Value::Number(*n)),
        Value::Bool(b) => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
        other => Err(RuntimeError::TypeMismatch { expected: "number-like", actual: other.type_name_inline().unwrap_or("object") }),
    }
}

fn to_str(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let rendered = display_value(vm, &args[0]);
    Ok(Value::Obj(vm.heap_mut().intern(&rendered)))
}

fn len(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let r = args[0].obj_ref().ok_or(RuntimeError::TypeMismatch { expected: "string, list or map", actual: "primitive" })?;
    let n = match vm.heap().get(r) {
        Obj::Str(s) => s.chars().count(),
        Obj::List(items) => items.len(),
        Obj::Map(t) => t.len(),
        _ => return Err(RuntimeError::TypeMismatch { expected: "string, list or map", actual: vm.heap().get(r).kind_name() }),
    };
    Ok(Value::Number(n as f64))
}

fn input(vm: &mut Vm, _args: &[Value]) -> Result<Value, RuntimeError> {
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).map_err(|e| RuntimeError::Native(e.to_string()))?;
    let trimmed = line.trim_end_matches(['\n', '\r']);
    Ok(Value::Obj(vm.heap_mut().intern(trimmed)))
}

fn print(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let rendered: Vec<String> = args.iter().map(|a| display_value(vm, a)).collect();
    println!("{}", rendered.join(" "));
    Ok(Value::Null)
}

fn abs(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(expect_number(&args[0])?.abs()))
}

fn sqrt(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(expect_number(&args[0])?.sqrt()))
}

fn pow(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(expect_number(&args[0])?.powf(expect_number(&args[1])?)))
}

fn has_field(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let field = expect_string(vm, &args[1])?;
    let name_ref = vm.heap_mut().intern(&field);
    let r = args[0].obj_ref().ok_or(RuntimeError::TypeMismatch { expected: "instance", actual: "primitive" })?;
    match vm.heap().get(r) {
        Obj::Instance(inst) => Ok(Value::Bool(inst.fields.get(name_ref).is_some())),
        _ => Err(RuntimeError::TypeMismatch { expected: "instance", actual: vm.heap().get(r).kind_name() }),
    }
}

fn get_field(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let field = expect_string(vm, &args[1])?;
    let name_ref = vm.heap_mut().intern(&field);
    let r = args[0].obj_ref().ok_or(RuntimeError::TypeMismatch { expected: "instance", actual: "primitive" })?;
    match vm.heap().get(r) {
        Obj::Instance(inst) => Ok(inst.fields.get(name_ref).unwrap_or(Value::Null)),
        _ => Err(RuntimeError::TypeMismatch { expected: "instance", actual: vm.heap().get(r).kind_name() }),
    }
}

fn set_field(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let field = expect_string(vm, &args[1])?;
    let name_ref = vm.heap_mut().intern(&field);
    let r = args[0].obj_ref().ok_or(RuntimeError::TypeMismatch { expected: "instance", actual: "primitive" })?;
    match vm.heap_mut().get_mut(r) {
        Obj::Instance(inst) => {
            inst.fields.set(name_ref, args[2]);
            Ok(args[2])
        }
        _ => Err(RuntimeError::TypeMismatch { expected: "instance", actual: "primitive" }),
    }
}

fn del_field(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let field = expect_string(vm, &args[1])?;
    let name_ref = vm.heap_mut().intern(&field);
    let r = args[0].obj_ref().ok_or(RuntimeError::TypeMismatch { expected: "instance", actual: "primitive" })?;
    match vm.heap_mut().get_mut(r) {
        Obj::Instance(inst) => Ok(Value::Bool(inst.fields.delete(name_ref))),
        _ => Err(RuntimeError::TypeMismatch { expected: "instance", actual: "primitive" }),
    }
}

fn assert_fn(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let cond = args.first().ok_or(RuntimeError::ArityMismatch { expected: 1, actual: 0 })?;
    if vm.heap().is_falsey(cond) {
        let msg = args.get(1).map(|m| display_value(vm, m)).unwrap_or_else(|| "assertion failed".to_string());
        return Err(RuntimeError::Native(msg));
    }
    Ok(Value::Null)
}

fn push(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let r = args[0].obj_ref().ok_or(RuntimeError::TypeMismatch { expected: "list", actual: "primitive" })?;
    match vm.heap_mut().get_mut(r) {
        Obj::List(items) => {
            items.push(args[1]);
            Ok(args[0])
        }
        _ => Err(RuntimeError::TypeMismatch { expected: "list", actual: "primitive" }),
    }
}

fn pop(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let r = args[0].obj_ref().ok_or(RuntimeError::TypeMismatch { expected: "list", actual: "primitive" })?;
    match vm.heap_mut().get_mut(r) {
        Obj::List(items) => Ok(items.pop().unwrap_or(Value::Null)),
        _ => Err(RuntimeError::TypeMismatch { expected: "list", actual: "primitive" }),
    }
}

/// Renders a value the way `print`/`str` show it, recursing into list/map
/// contents (unlike `Value`'s own `Display`, which can't see the heap).
fn display_value(vm: &Vm, v: &Value) -> String {
    match v {
        Value::Obj(r) | Value::Err(r) => match vm.heap().get(*r) {
            Obj::Str(s) => s.to_string(),
            Obj::List(items) => {
                let rendered: Vec<String> = items.iter().map(|i| display_value(vm, i)).collect();
                format!("[{}]", rendered.join(", "))
            }
            Obj::Map(t) => {
                let rendered: Vec<String> = t
                    .iter()
                    .map(|(k, val)| format!("{}: {}", display_value(vm, &Value::Obj(k)), display_value(vm, &val)))
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Obj::Function(f) => format!("<fn {}>", f.name.and_then(|n| vm.heap().get(n).as_str().map(str::to_string)).unwrap_or_else(|| "anonymous".to_string())),
            Obj::Closure(_) => "<fn>".to_string(),
            Obj::Native(n) => format!("<native fn {}>", vm.heap().get(n.name).as_str().unwrap_or("?")),
            Obj::Class(c) => format!("<class {}>", vm.heap().get(c.name).as_str().unwrap_or("?")),
            Obj::Instance(i) => {
                let class_name = match vm.heap().get(i.class) {
                    Obj::Class(c) => vm.heap().get(c.name).as_str().unwrap_or("?").to_string(),
                    _ => "?".to_string(),
                };
                format!("<{class_name} instance>")
            }
            Obj::BoundMethod(_) => "<fn>".to_string(),
            Obj::Upvalue(_) => "<upvalue>".to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_register_without_panicking() {
        let mut vm = Vm::new();
        install(&mut vm);
        assert!(vm.global("print").is_some());
        assert!(vm.global("len").is_some());
    }

    #[test]
    fn numeric_and_string_conversions() {
        let mut vm = Vm::new();
        install(&mut vm);
        vm.interpret(r#"assert(str(3) == "3", "str(3)"); assert(num(true) == 1, "num(true)");"#).expect("should run");
    }

    #[test]
    fn len_and_push_pop_on_lists() {
        let mut vm = Vm::new();
        install(&mut vm);
        vm.interpret(r#"let xs = [1, 2]; push(xs, 3); assert(len(xs) == 3, "len after push"); pop(xs); assert(len(xs) == 2, "len after pop");"#)
            .expect("should run");
    }

    #[test]
    fn reflection_helpers_read_and_write_instance_fields() {
        let mut vm = Vm::new();
        install(&mut vm);
        let src = r#"
            class Box {}
            let b = Box();
            setField(b, "value", 42);
            assert(hasField(b, "value"), "hasField");
            assert(getField(b, "value") == 42, "getField");
            delField(b, "value");
            assert(!hasField(b, "value"), "delField");
        "#;
        vm.interpret(src).expect("should run");
    }

    #[test]
    fn assert_failure_surfaces_as_a_native_runtime_error() {
        let mut vm = Vm::new();
        install(&mut vm);
        let err = vm.interpret(r#"assert(false, "boom");"#).unwrap_err();
        match err {
            falcon_vm::FalconError::Runtime { error: RuntimeError::Native(msg), .. } => assert_eq!(msg, "boom"),
            other => panic!("expected a Native runtime error, got {other:?}"),
        }
    }

    #[test]
    fn assert_with_no_arguments_is_an_arity_error_not_a_panic() {
        let mut vm = Vm::new();
        install(&mut vm);
        let err = vm.interpret("assert();").unwrap_err();
        match err {
            falcon_vm::FalconError::Runtime { error: RuntimeError::ArityMismatch { expected: 1, actual: 0 }, .. } => {}
            other => panic!("expected an ArityMismatch runtime error, got {other:?}"),
        }
    }
}
