//! The bytecode interpreter: an operand stack, a call-frame stack, the
//! global/native tables, and the dispatch loop that implements every
//! opcode's semantics.

use falcon_core::chunk::Op;
use falcon_core::heap::{GcOptions, Heap, RootSet};
use falcon_core::object::{
    BoundMethodObj, ClosureObj, InstanceObj, Obj, ObjRef, UpvalueObj, UpvalueState,
};
use falcon_core::table::Table;
use falcon_core::value::Value;
use falcon_compiler::ParseError;

use crate::error::{FalconError, InterpretResult, RuntimeError, FRAMES_MAX, STACK_MAX};
use crate::native::NativeRegistry;

#[derive(Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    /// Stack index of this frame's slot 0 (the callee itself, or `this`).
    base: usize,
}

/// Builder-style tuning for a `Vm`.
#[derive(Clone, Debug, Default)]
pub struct VmOptions {
    pub gc: GcOptions,
    pub trace: bool,
}

impl VmOptions {
    pub fn with_gc(mut self, gc: GcOptions) -> Self {
        self.gc = gc;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    heap: Heap,
    /// Open upvalues, sorted by descending stack index so closing the ones
    /// at or above a given slot is a simple prefix walk.
    open_upvalues: Vec<ObjRef>,
    natives: NativeRegistry,
    trace: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            globals: Table::new(),
            heap: Heap::with_options(options.gc),
            open_upvalues: Vec::new(),
            natives: NativeRegistry::new(),
            trace: options.trace,
        }
    }

    pub fn set_trace(&mut self, on: bool) {
        self.trace = on;
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack.push(v);
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop on an empty stack is a compiler bug")
    }

    fn peek(&self, distance_from_top: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance_from_top]
    }

    pub fn define_native(&mut self, name: &str, arity: Option<u8>, f: crate::native::NativeFn) {
        let name_ref = self.heap.intern(name);
        let native_ref = self.heap.allocate(Obj::Native(falcon_core::object::NativeObj { name: name_ref, arity }));
        self.globals.set(name_ref, Value::Obj(native_ref));
        self.natives.register(name, f);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.iter().find(|(k, _)| self.heap.get(*k).as_str() == Some(name)).map(|(_, v)| v)
    }

    /// Compiles and runs `source` as a fresh top-level script.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = falcon_compiler::compile(source, &mut self.heap).map_err(FalconError::Compile)?;
        let function_ref = self.heap.allocate(Obj::Function(function));
        let closure_ref = self.heap.allocate(Obj::Closure(ClosureObj { function: function_ref, upvalues: Vec::new() }));
        self.push(Value::Obj(closure_ref)).expect("empty stack has room for one value");
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, base: 0 });
        self.run().map_err(|error| {
            let trace = self.format_trace();
            self.stack.clear();
            self.frames.clear();
            FalconError::Runtime { error, trace }
        })
    }

    /// Compiles `source` but does not run it; used by the CLI's `-d` flag.
    pub fn disassemble_source(&mut self, source: &str) -> Result<String, Vec<ParseError>> {
        let function = falcon_compiler::compile(source, &mut self.heap)?;
        let mut out = function.chunk.disassemble("<script>");
        self.disassemble_nested(&function.chunk, &mut out);
        Ok(out)
    }

    fn disassemble_nested(&self, chunk: &falcon_core::chunk::Chunk, out: &mut String) {
        for c in &chunk.consts {
            if let Some(r) = c.obj_ref() {
                if let Obj::Function(f) = self.heap.get(r) {
                    let name = f.name.and_then(|n| self.heap.get(n).as_str().map(str::to_string));
                    out.push('\n');
                    out.push_str(&f.chunk.disassemble(name.as_deref().unwrap_or("<fn>")));
                    self.disassemble_nested(&f.chunk, out);
                }
            }
        }
    }

    fn current_function(&self) -> &falcon_core::object::FunctionObj {
        let frame = self.frames.last().expect("run() never called with an empty frame stack");
        let Obj::Closure(closure) = self.heap.get(frame.closure) else { unreachable!("frame always holds a Closure") };
        let Obj::Function(function) = self.heap.get(closure.function) else { unreachable!("closure always holds a Function") };
        function
    }

    fn frame_base(&self) -> usize {
        self.frames.last().unwrap().base
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            self.maybe_collect();

            let ip = self.frames.last().unwrap().ip;
            let op = match self.current_function().chunk.ops.get(ip).copied() {
                Some(op) => op,
                None => return Err(RuntimeError::UnknownOpcode(ip)),
            };
            self.frames.last_mut().unwrap().ip += 1;
            if self.trace {
                tracing::trace!(ip, ?op, "dispatch");
            }

            match op {
                Op::Constant(idx) => {
                    let v = self.current_function().chunk.consts[idx as usize];
                    self.push(v)?;
                }
                Op::Null => self.push(Value::Null)?,
                Op::True => self.push(Value::Bool(true))?,
                Op::False => self.push(Value::Bool(false))?,

                Op::Add => self.binary_add()?,
                Op::Subtract => self.binary_numeric(|a, b| a - b)?,
                Op::Multiply => self.binary_numeric(|a, b| a * b)?,
                Op::Divide => self.binary_divide()?,
                Op::Modulo => self.binary_modulo()?,
                Op::Negate => {
                    let v = self.pop();
                    match v {
                        Value::Number(n) => self.push(Value::Number(-n))?,
                        other => return Err(self.type_error("number", &other)),
                    }
                }

                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                Op::Greater => self.binary_compare(|a, b| a > b)?,
                Op::Less => self.binary_compare(|a, b| a < b)?,
                Op::Not => {
                    let v = self.pop();
                    let falsey = self.heap.is_falsey(&v);
                    self.push(Value::Bool(falsey))?;
                }

                Op::Pop => {
                    self.pop();
                }
                Op::Dup => {
                    let v = self.peek(0);
                    self.push(v)?;
                }

                Op::GetLocal(slot) => {
                    let v = self.stack[self.frame_base() + slot as usize];
                    self.push(v)?;
                }
                Op::SetLocal(slot) => {
                    let v = self.peek(0);
                    let idx = self.frame_base() + slot as usize;
                    self.stack[idx] = v;
                }
                Op::GetGlobal(idx) => {
                    let name_ref = self.const_obj_ref(idx);
                    match self.globals.get(name_ref) {
                        Some(v) => self.push(v)?,
                        None => return Err(RuntimeError::UndefinedVariable(self.string_at(name_ref))),
                    }
                }
                Op::SetGlobal(idx) => {
                    let name_ref = self.const_obj_ref(idx);
                    let v = self.peek(0);
                    if self.globals.get(name_ref).is_none() {
                        return Err(RuntimeError::UndefinedVariable(self.string_at(name_ref)));
                    }
                    self.globals.set(name_ref, v);
                }
                Op::DefineGlobal(idx) => {
                    let name_ref = self.const_obj_ref(idx);
                    let v = self.pop();
                    self.globals.set(name_ref, v);
                }

                Op::GetUpvalue(idx) => {
                    let uv_ref = self.current_upvalue(idx);
                    let v = match self.heap.get(uv_ref) {
                        Obj::Upvalue(u) => match u.state {
                            UpvalueState::Open(stack_idx) => self.stack[stack_idx],
                            UpvalueState::Closed(v) => v,
                        },
                        _ => unreachable!(),
                    };
                    self.push(v)?;
                }
                Op::SetUpvalue(idx) => {
                    let uv_ref = self.current_upvalue(idx);
                    let v = self.peek(0);
                    let stack_idx = match self.heap.get(uv_ref) {
                        Obj::Upvalue(u) => match u.state {
                            UpvalueState::Open(i) => Some(i),
                            UpvalueState::Closed(_) => None,
                        },
                        _ => unreachable!(),
                    };
                    match stack_idx {
                        Some(i) => self.stack[i] = v,
                        None => {
                            if let Obj::Upvalue(u) = self.heap.get_mut(uv_ref) {
                                u.state = UpvalueState::Closed(v);
                            }
                        }
                    }
                }
                Op::CloseUpvalue => {
                    let v = self.pop();
                    let idx = self.stack.len();
                    self.close_upvalues_from(idx, Some(v));
                }

                Op::Jump(offset) => self.jump(offset),
                Op::JumpIfFalse(offset) => {
                    if self.heap.is_falsey(&self.peek(0)) {
                        self.jump(offset);
                    }
                }
                Op::JumpIfTrue(offset) => {
                    if !self.heap.is_falsey(&self.peek(0)) {
                        self.jump(offset);
                    }
                }
                Op::Loop(offset) => self.jump(-offset),

                Op::Call(argc) => {
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                Op::Closure(idx) => self.make_closure(idx)?,
                Op::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues_from(frame.base, None);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        self.stack.clear();
                        return Ok(());
                    }
                    self.push(result)?;
                }

                Op::BuildList(n) => {
                    let start = self.stack.len() - n as usize;
                    let items = self.stack.split_off(start);
                    let r = self.heap.allocate(Obj::List(items));
                    self.push(Value::Obj(r))?;
                }
                Op::BuildMap(n) => {
                    let mut table = Table::new();
                    let start = self.stack.len() - (n as usize) * 2;
                    let pairs = self.stack.split_off(start);
                    for pair in pairs.chunks_exact(2) {
                        let key = pair[0].obj_ref().filter(|r| matches!(self.heap.get(*r), Obj::Str(_)));
                        let key = key.ok_or_else(|| self.type_error("string", &pair[0]))?;
                        table.set(key, pair[1]);
                    }
                    let r = self.heap.allocate(Obj::Map(table));
                    self.push(Value::Obj(r))?;
                }
                Op::GetIndex => self.get_index()?,
                Op::SetIndex => self.set_index()?,

                Op::Class(idx) => {
                    let v = self.current_function().chunk.consts[idx as usize];
                    self.push(v)?;
                }
                Op::Inherit => {
                    let superclass = self.peek(1);
                    let sub = self.peek(0);
                    let super_ref = superclass.obj_ref().filter(|r| matches!(self.heap.get(*r), Obj::Class(_)));
                    let super_ref = super_ref.ok_or(RuntimeError::InvalidSuperclass)?;
                    let methods = match self.heap.get(super_ref) {
                        Obj::Class(c) => c.methods.iter().collect::<Vec<_>>(),
                        _ => unreachable!(),
                    };
                    if let Some(sub_ref) = sub.obj_ref() {
                        if let Obj::Class(c) = self.heap.get_mut(sub_ref) {
                            for (k, v) in methods {
                                c.methods.set(k, v);
                            }
                        }
                    }
                    self.pop(); // the subclass; superclass stays for the `super` local
                }
                Op::Method(idx) => {
                    let name_ref = self.const_obj_ref(idx);
                    let method = self.pop();
                    let class = self.peek(0);
                    if let Some(class_ref) = class.obj_ref() {
                        if let Obj::Class(c) = self.heap.get_mut(class_ref) {
                            c.methods.set(name_ref, method);
                        }
                    }
                }
                Op::GetProperty(idx) => self.get_property(idx)?,
                Op::SetProperty(idx) => self.set_property(idx)?,
                Op::Invoke(idx, argc) => self.invoke(idx, argc)?,
                Op::GetSuper(idx) => self.get_super(idx)?,
                Op::SuperInvoke(idx, argc) => self.super_invoke(idx, argc)?,
            }
        }
    }

    fn jump(&mut self, offset: i32) {
        let frame = self.frames.last_mut().unwrap();
        frame.ip = (frame.ip as i64 + offset as i64) as usize;
    }

    fn const_obj_ref(&self, idx: u16) -> ObjRef {
        self.current_function().chunk.consts[idx as usize].obj_ref().expect("name constants are always interned strings")
    }

    fn string_at(&self, r: ObjRef) -> String {
        self.heap.get(r).as_str().unwrap_or("<?>").to_string()
    }

    fn current_upvalue(&self, idx: u16) -> ObjRef {
        let frame = self.frames.last().unwrap();
        let Obj::Closure(c) = self.heap.get(frame.closure) else { unreachable!() };
        c.upvalues[idx as usize]
    }

    fn type_error(&self, expected: &'static str, actual: &Value) -> RuntimeError {
        RuntimeError::TypeMismatch { expected, actual: self.value_kind(actual) }
    }

    fn value_kind(&self, v: &Value) -> &'static str {
        match v.type_name_inline() {
            Some(n) => n,
            None => v.obj_ref().map(|r| self.heap.get(r).kind_name()).unwrap_or("error"),
        }
    }

    fn binary_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y))?,
            (Value::Obj(ra), Value::Obj(rb))
                if matches!(self.heap.get(ra), Obj::Str(_)) && matches!(self.heap.get(rb), Obj::Str(_)) =>
            {
                let sa = self.heap.get(ra).as_str().unwrap();
                let sb = self.heap.get(rb).as_str().unwrap();
                let combined = format!("{sa}{sb}");
                let r = self.heap.intern(&combined);
                self.push(Value::Obj(r))?;
            }
            (a, _) => return Err(self.type_error("number or string", &a)),
        }
        Ok(())
    }

    fn binary_numeric(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(f(x, y)))?,
            (a, _) => return Err(self.type_error("number", &a)),
        }
        Ok(())
    }

    fn binary_divide(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(_), Value::Number(y)) if y == 0.0 => return Err(RuntimeError::DivisionByZero),
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x / y))?,
            (a, _) => return Err(self.type_error("number", &a)),
        }
        Ok(())
    }

    fn binary_modulo(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(_), Value::Number(y)) if y == 0.0 => return Err(RuntimeError::DivisionByZero),
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x % y))?,
            (a, _) => return Err(self.type_error("number", &a)),
        }
        Ok(())
    }

    fn binary_compare(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Bool(f(x, y)))?,
            (a, _) => return Err(self.type_error("number", &a)),
        }
        Ok(())
    }

    fn close_upvalues_from(&mut self, from_stack_idx: usize, just_popped: Option<Value>) {
        while let Some(&last) = self.open_upvalues.last() {
            let stack_idx = match self.heap.get(last) {
                Obj::Upvalue(u) => match u.state {
                    UpvalueState::Open(i) => i,
                    UpvalueState::Closed(_) => break,
                },
                _ => unreachable!(),
            };
            if stack_idx < from_stack_idx {
                break;
            }
            let value = if stack_idx == from_stack_idx && just_popped.is_some() {
                just_popped.unwrap()
            } else {
                self.stack[stack_idx]
            };
            if let Obj::Upvalue(u) = self.heap.get_mut(last) {
                u.state = UpvalueState::Closed(value);
            }
            self.open_upvalues.pop();
        }
    }

    fn capture_upvalue(&mut self, stack_idx: usize) -> ObjRef {
        if let Some(&existing) = self.open_upvalues.iter().find(|&&r| match self.heap.get(r) {
            Obj::Upvalue(u) => matches!(u.state, UpvalueState::Open(i) if i == stack_idx),
            _ => false,
        }) {
            return existing;
        }
        let r = self.heap.allocate(Obj::Upvalue(UpvalueObj { state: UpvalueState::Open(stack_idx) }));
        let pos = self
            .open_upvalues
            .iter()
            .position(|&o| match self.heap.get(o) {
                Obj::Upvalue(u) => matches!(u.state, UpvalueState::Open(i) if i < stack_idx),
                _ => false,
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, r);
        r
    }

    fn make_closure(&mut self, idx: u16) -> Result<(), RuntimeError> {
        let function_ref = self.current_function().chunk.consts[idx as usize].obj_ref().expect("closure constant is a Function");
        let Obj::Function(f) = self.heap.get(function_ref) else { unreachable!() };
        let descriptors = f.upvalues.clone();
        let base = self.frame_base();
        let mut upvalues = Vec::with_capacity(descriptors.len());
        for (index, is_local) in descriptors {
            if is_local {
                upvalues.push(self.capture_upvalue(base + index as usize));
            } else {
                upvalues.push(self.current_upvalue(index as u16));
            }
        }
        let closure_ref = self.heap.allocate(Obj::Closure(ClosureObj { function: function_ref, upvalues }));
        self.push(Value::Obj(closure_ref))
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let Some(r) = callee.obj_ref() else {
            return Err(RuntimeError::NotCallable);
        };
        match self.heap.get(r).clone() {
            Obj::Closure(c) => self.call_closure(r, &c, argc),
            Obj::Native(n) => self.call_native(&n, argc),
            Obj::Class(_) => self.instantiate(r, argc),
            Obj::BoundMethod(b) => {
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = b.receiver;
                let Obj::Closure(c) = self.heap.get(b.method).clone() else { unreachable!("bound methods always wrap a Closure") };
                self.call_closure(b.method, &c, argc)
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, closure: &ClosureObj, argc: u8) -> Result<(), RuntimeError> {
        let Obj::Function(f) = self.heap.get(closure.function) else { unreachable!() };
        if f.arity != argc {
            return Err(RuntimeError::ArityMismatch { expected: f.arity, actual: argc });
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(RuntimeError::FrameOverflow);
        }
        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, base });
        Ok(())
    }

    fn call_native(&mut self, native: &falcon_core::object::NativeObj, argc: u8) -> Result<(), RuntimeError> {
        if let Some(expected) = native.arity {
            if expected != argc {
                return Err(RuntimeError::ArityMismatch { expected, actual: argc });
            }
        }
        let name = self.string_at(native.name);
        let f = self.natives.get(&name).ok_or(RuntimeError::NotCallable)?;
        let start = self.stack.len() - argc as usize;
        let args: Vec<Value> = self.stack[start..].to_vec();
        let result = f(self, &args)?;
        self.stack.truncate(start - 1);
        self.push(result)
    }

    fn instantiate(&mut self, class_ref: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let instance_ref = self.heap.allocate(Obj::Instance(InstanceObj { class: class_ref, fields: Table::new() }));
        let slot = self.stack.len() - argc as usize - 1;
        self.stack[slot] = Value::Obj(instance_ref);

        let init_name = self.heap.intern("init");
        let init = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(init_name),
            _ => None,
        };
        match init {
            Some(Value::Obj(method_ref)) => {
                let Obj::Closure(c) = self.heap.get(method_ref).clone() else { unreachable!() };
                self.call_closure(method_ref, &c, argc)
            }
            _ if argc == 0 => Ok(()),
            _ => Err(RuntimeError::ArityMismatch { expected: 0, actual: argc }),
        }
    }

    fn get_index(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop();
        let target = self.pop();
        let Some(r) = target.obj_ref() else {
            return Err(self.type_error("list, map or string", &target));
        };
        match self.heap.get(r).clone() {
            Obj::List(items) => {
                let i = self.expect_index(&index, items.len())?;
                self.push(items[i])?;
            }
            Obj::Map(table) => {
                let key = index.obj_ref().filter(|kr| matches!(self.heap.get(*kr), Obj::Str(_)));
                let key = key.ok_or_else(|| self.type_error("string", &index))?;
                self.push(table.get(key).unwrap_or(Value::Null))?;
            }
            Obj::Str(s) => {
                let i = self.expect_index(&index, s.chars().count())?;
                let ch = s.chars().nth(i).unwrap();
                let r = self.heap.intern(&ch.to_string());
                self.push(Value::Obj(r))?;
            }
            _ => return Err(self.type_error("list, map or string", &target)),
        }
        Ok(())
    }

    fn set_index(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop();
        let index = self.pop();
        let target = self.pop();
        let Some(r) = target.obj_ref() else {
            return Err(self.type_error("list or map", &target));
        };
        match self.heap.get_mut(r) {
            Obj::List(items) => {
                let len = items.len();
                let i = self.expect_index(&index, len)?;
                if let Obj::List(items) = self.heap.get_mut(r) {
                    items[i] = value;
                }
            }
            Obj::Map(_) => {
                let key = index.obj_ref().filter(|kr| matches!(self.heap.get(*kr), Obj::Str(_)));
                let key = key.ok_or_else(|| self.type_error("string", &index))?;
                if let Obj::Map(t) = self.heap.get_mut(r) {
                    t.set(key, value);
                }
            }
            _ => return Err(self.type_error("list or map", &target)),
        }
        self.push(value)
    }

    fn expect_index(&self, v: &Value, len: usize) -> Result<usize, RuntimeError> {
        let Value::Number(n) = v else { return Err(self.type_error("number", v)) };
        let i = *n as i64;
        if i < 0 || i as usize >= len {
            return Err(RuntimeError::IndexOutOfBounds { index: i, len });
        }
        Ok(i as usize)
    }

    fn get_property(&mut self, idx: u16) -> Result<(), RuntimeError> {
        let name_ref = self.const_obj_ref(idx);
        let receiver = self.pop();
        let Some(r) = receiver.obj_ref() else {
            return Err(self.type_error("instance", &receiver));
        };
        let Obj::Instance(inst) = self.heap.get(r) else {
            return Err(self.type_error("instance", &receiver));
        };
        if let Some(v) = inst.fields.get(name_ref) {
            return self.push(v);
        }
        let class_ref = inst.class;
        let method = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(name_ref),
            _ => None,
        };
        match method {
            Some(Value::Obj(method_ref)) => {
                let bound = self.heap.allocate(Obj::BoundMethod(BoundMethodObj { receiver, method: method_ref }));
                self.push(Value::Obj(bound))
            }
            _ => Err(RuntimeError::UndefinedProperty(self.string_at(name_ref))),
        }
    }

    fn set_property(&mut self, idx: u16) -> Result<(), RuntimeError> {
        let name_ref = self.const_obj_ref(idx);
        let value = self.pop();
        let receiver = self.pop();
        let Some(r) = receiver.obj_ref() else {
            return Err(self.type_error("instance", &receiver));
        };
        match self.heap.get_mut(r) {
            Obj::Instance(inst) => {
                inst.fields.set(name_ref, value);
                self.push(value)
            }
            _ => Err(self.type_error("instance", &receiver)),
        }
    }

    fn invoke(&mut self, idx: u16, argc: u8) -> Result<(), RuntimeError> {
        let name_ref = self.const_obj_ref(idx);
        let receiver = self.peek(argc as usize);
        let Some(r) = receiver.obj_ref() else {
            return Err(self.type_error("instance", &receiver));
        };
        let Obj::Instance(inst) = self.heap.get(r) else {
            return Err(self.type_error("instance", &receiver));
        };
        if let Some(field) = inst.fields.get(name_ref) {
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }
        let class_ref = inst.class;
        let method = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(name_ref),
            _ => None,
        };
        match method {
            Some(Value::Obj(method_ref)) => {
                let Obj::Closure(c) = self.heap.get(method_ref).clone() else { unreachable!() };
                self.call_closure(method_ref, &c, argc)
            }
            _ => Err(RuntimeError::UndefinedProperty(self.string_at(name_ref))),
        }
    }

    fn get_super(&mut self, idx: u16) -> Result<(), RuntimeError> {
        let name_ref = self.const_obj_ref(idx);
        let superclass = self.pop();
        let receiver = self.pop();
        let super_ref = superclass.obj_ref().ok_or(RuntimeError::InvalidSuperclass)?;
        let method = match self.heap.get(super_ref) {
            Obj::Class(c) => c.methods.get(name_ref),
            _ => None,
        };
        match method {
            Some(Value::Obj(method_ref)) => {
                let bound = self.heap.allocate(Obj::BoundMethod(BoundMethodObj { receiver, method: method_ref }));
                self.push(Value::Obj(bound))
            }
            _ => Err(RuntimeError::UndefinedProperty(self.string_at(name_ref))),
        }
    }

    fn super_invoke(&mut self, idx: u16, argc: u8) -> Result<(), RuntimeError> {
        let name_ref = self.const_obj_ref(idx);
        let superclass = self.pop();
        let super_ref = superclass.obj_ref().ok_or(RuntimeError::InvalidSuperclass)?;
        let method = match self.heap.get(super_ref) {
            Obj::Class(c) => c.methods.get(name_ref),
            _ => None,
        };
        match method {
            Some(Value::Obj(method_ref)) => {
                let Obj::Closure(c) = self.heap.get(method_ref).clone() else { unreachable!() };
                self.call_closure(method_ref, &c, argc)
            }
            _ => Err(RuntimeError::UndefinedProperty(self.string_at(name_ref))),
        }
    }

    fn maybe_collect(&mut self) {
        let frame_closures: Vec<ObjRef> = self.frames.iter().map(|f| f.closure).collect();
        let roots =
            RootSet { stack: &self.stack, frame_closures: &frame_closures, globals: &self.globals, open_upvalues: &self.open_upvalues };
        self.heap.maybe_collect(roots);
    }

    fn format_trace(&self) -> String {
        let mut out = String::new();
        for frame in self.frames.iter().rev() {
            let Obj::Closure(c) = self.heap.get(frame.closure) else { continue };
            let Obj::Function(f) = self.heap.get(c.function) else { continue };
            let name = f.name.and_then(|n| self.heap.get(n).as_str().map(str::to_string)).unwrap_or_else(|| "<script>".to_string());
            let line = f.chunk.line_at(frame.ip.saturating_sub(1)).unwrap_or(0);
            out.push_str(&format!("  at {name} (line {line})\n"));
        }
        out
    }
}
