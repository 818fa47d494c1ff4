//! Single-pass Pratt parser: there is no separate AST, every grammar rule
//! emits bytecode as it recognizes it. Scope/local/upvalue bookkeeping lives
//! on a stack of [`FnState`], one per function currently being compiled
//! (the outermost is the implicit top-level script).

use falcon_core::chunk::Op;
use falcon_core::heap::Heap;
use falcon_core::object::{ClosureObj, FunctionObj, Obj, ObjRef};
use falcon_core::value::Value;

use crate::error::Diagnostics;
use crate::lexer::Token;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
enum Prec {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assignment,
            Prec::Assignment => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Equality,
            Prec::Equality => Prec::Comparison,
            Prec::Comparison => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Unary,
            Prec::Unary => Prec::Call,
            Prec::Call | Prec::Primary => Prec::Primary,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum FnKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct LocalVar<'s> {
    name: &'s str,
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct LoopCtx {
    start: usize,
    scope_depth: i32,
    break_jumps: Vec<usize>,
}

struct FnState<'s> {
    function: FunctionObj,
    kind: FnKind,
    locals: Vec<LocalVar<'s>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
}

impl<'s> FnState<'s> {
    fn new(kind: FnKind, name: Option<ObjRef>) -> Self {
        let mut locals = Vec::new();
        // Slot 0 is reserved: `this` for methods, the callee for free functions.
        locals.push(LocalVar { name: "", depth: 0, is_captured: false });
        Self {
            function: FunctionObj { name, arity: 0, upvalue_count: 0, upvalues: Vec::new(), chunk: falcon_core::chunk::Chunk::new() },
            kind,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
}

pub struct Parser<'s, 'h> {
    tokens: Vec<(Token<'s>, u32)>,
    pos: usize,
    diags: Diagnostics,
    heap: &'h mut Heap,
    fns: Vec<FnState<'s>>,
    classes: Vec<ClassCtx>,
}

type ParseResult = Result<(), ()>;

impl<'s, 'h> Parser<'s, 'h> {
    pub fn new(src: &'s str, heap: &'h mut Heap) -> Self {
        let mut tokens = Vec::new();
        let mut line = 1u32;
        let mut lex = Token::lexer(src);
        while let Some(tok) = lex.next() {
            line += lex.slice().matches('\n').count() as u32;
            if let Ok(t) = tok {
                tokens.push((t, line));
            }
        }
        Self { tokens, pos: 0, diags: Diagnostics::new(), heap, fns: vec![FnState::new(FnKind::Script, None)], classes: Vec::new() }
    }

    /// Drives the parser to the end of input and returns the assembled
    /// top-level script function, or the accumulated diagnostics.
    pub fn compile_script(mut self) -> Result<FunctionObj, Vec<crate::error::ParseError>> {
        while self.current().is_some() {
            self.declaration();
        }
        self.emit(Op::Null);
        self.emit(Op::Return);
        if self.diags.has_errors() {
            return Err(self.diags.into_errors());
        }
        Ok(self.fns.pop().expect("script FnState always present").function)
    }

    fn current(&self) -> Option<&Token<'s>> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn current_line(&self) -> u32 {
        self.tokens.get(self.pos).map(|(_, l)| *l).unwrap_or_else(|| self.tokens.last().map(|(_, l)| *l).unwrap_or(1))
    }

    fn advance(&mut self) -> Option<Token<'s>> {
        let t = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn check(&self, t: &Token<'s>) -> bool {
        self.current() == Some(t)
    }

    fn matches(&mut self, t: &Token<'s>) -> bool {
        if self.check(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: Token<'s>, msg: &str) -> ParseResult {
        if self.matches(&t) {
            Ok(())
        } else {
            self.error(msg);
            Err(())
        }
    }

    fn error(&mut self, msg: &str) {
        self.diags.report(self.current_line(), msg.to_string());
    }

    fn fs(&mut self) -> &mut FnState<'s> {
        self.fns.last_mut().expect("at least the script FnState is always present")
    }

    fn chunk_mut(&mut self) -> &mut falcon_core::chunk::Chunk {
        &mut self.fs().function.chunk
    }

    fn emit(&mut self, op: Op) {
        let line = self.current_line();
        self.chunk_mut().write(op, line);
    }

    fn emit_jump(&mut self, make: fn(i32) -> Op) -> usize {
        self.emit(make(0));
        self.chunk_mut().ops.len() - 1
    }

    fn patch_jump(&mut self, at: usize) {
        let target = self.chunk_mut().ops.len();
        let offset = (target - at - 1) as i32;
        let chunk = self.chunk_mut();
        chunk.ops[at] = match chunk.ops[at] {
            Op::Jump(_) => Op::Jump(offset),
            Op::JumpIfFalse(_) => Op::JumpIfFalse(offset),
            Op::JumpIfTrue(_) => Op::JumpIfTrue(offset),
            other => other,
        };
    }

    fn emit_loop(&mut self, start: usize) {
        let line = self.current_line();
        let here = self.chunk_mut().ops.len();
        let offset = (here - start + 1) as i32;
        self.chunk_mut().write(Op::Loop(offset), line);
    }

    fn make_const(&mut self, v: Value) -> u16 {
        self.chunk_mut().add_const(v)
    }

    fn intern_const(&mut self, s: &str) -> u16 {
        let r = self.heap.intern(s);
        self.make_const(Value::Obj(r))
    }

    // ---- scopes & variables ----

    fn begin_scope(&mut self) {
        self.fs().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fs().scope_depth -= 1;
        let depth = self.fs().scope_depth;
        while let Some(local) = self.fs().locals.last() {
            if local.depth <= depth {
                break;
            }
            let captured = self.fs().locals.last().unwrap().is_captured;
            self.fs().locals.pop();
            self.emit(if captured { Op::CloseUpvalue } else { Op::Pop });
        }
    }

    fn declare_local(&mut self, name: &'s str) {
        let depth = self.fs().scope_depth;
        if self.fs().locals.iter().rev().take_while(|l| l.depth == depth).any(|l| l.name == name) {
            self.error("a variable with this name already exists in this scope");
            return;
        }
        self.fs().locals.push(LocalVar { name, depth, is_captured: false });
    }

    fn resolve_local(&self, fn_idx: usize, name: &str) -> Option<u8> {
        self.fns[fn_idx].locals.iter().enumerate().rev().find(|(_, l)| l.name == name).map(|(i, _)| i as u8)
    }

    fn resolve_upvalue(&mut self, fn_idx: usize, name: &str) -> Option<u8> {
        if fn_idx == 0 {
            return None;
        }
        let enclosing = fn_idx - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name) {
            self.fns[enclosing].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(fn_idx, local_idx, true));
        }
        if let Some(up_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(fn_idx, up_idx, false));
        }
        None
    }

    fn add_upvalue(&mut self, fn_idx: usize, index: u8, is_local: bool) -> u8 {
        let ups = &mut self.fns[fn_idx].upvalues;
        if let Some((i, _)) = ups.iter().enumerate().find(|(_, u)| u.index == index && u.is_local == is_local) {
            return i as u8;
        }
        ups.push(UpvalueDesc { index, is_local });
        self.fns[fn_idx].function.upvalue_count = ups.len() as u8;
        (ups.len() - 1) as u8
    }

    // ---- statements ----

    fn declaration(&mut self) {
        let result = if self.matches(&Token::Fn) {
            self.fn_declaration()
        } else if self.matches(&Token::Class) {
            self.class_declaration()
        } else if self.matches(&Token::Let) {
            self.let_declaration()
        } else {
            self.statement()
        };
        if result.is_err() {
            self.synchronize();
        }
    }

    fn synchronize(&mut self) {
        self.diags.synchronize();
        while let Some(t) = self.current() {
            if matches!(t, Token::Semicolon) {
                self.pos += 1;
                return;
            }
            if matches!(t, Token::Fn | Token::Let | Token::If | Token::While | Token::For | Token::Return | Token::Class) {
                return;
            }
            self.pos += 1;
        }
    }

    fn let_declaration(&mut self) -> ParseResult {
        let name = self.expect_ident("expected a variable name")?;
        let global_slot = self.begin_variable(name);
        if self.matches(&Token::Equal) {
            self.expression()?;
        } else {
            self.emit(Op::Null);
        }
        self.expect(Token::Semicolon, "expected ';' after a let binding")?;
        self.finish_variable(global_slot);
        Ok(())
    }

    /// Declares `name` and, if at global scope, returns the constant-pool
    /// slot for its name so `finish_variable` can emit `DefineGlobal`.
    fn begin_variable(&mut self, name: &'s str) -> Option<u16> {
        if self.fs().scope_depth > 0 {
            self.declare_local(name);
            None
        } else {
            Some(self.intern_const(name))
        }
    }

    fn finish_variable(&mut self, global_slot: Option<u16>) {
        match global_slot {
            Some(slot) => self.emit(Op::DefineGlobal(slot)),
            None => {
                // The value is already sitting in the local's slot; locals
                // need no store instruction. Mark it initialized.
                if let Some(last) = self.fs().locals.last_mut() {
                    let depth = self.fs().scope_depth;
                    last.depth = depth;
                }
            }
        }
    }

    fn expect_ident(&mut self, msg: &str) -> Result<&'s str, ()> {
        match self.advance() {
            Some(Token::Ident(s)) => Ok(s),
            _ => {
                self.error(msg);
                Err(())
            }
        }
    }

    fn fn_declaration(&mut self) -> ParseResult {
        let name = self.expect_ident("expected a function name")?;
        let global_slot = self.begin_variable(name);
        self.function_body(name, FnKind::Function)?;
        self.finish_variable(global_slot);
        Ok(())
    }

    fn function_body(&mut self, name: &'s str, kind: FnKind) -> ParseResult {
        let name_ref = self.heap.intern(name);
        self.fns.push(FnState::new(kind, Some(name_ref)));
        self.begin_scope();
        self.expect(Token::LeftParen, "expected '(' after a function name")?;
        if !self.check(&Token::RightParen) {
            loop {
                let arity = self.fs().function.arity + 1;
                self.fs().function.arity = arity;
                if arity > 255 {
                    self.error("a function cannot have more than 255 parameters");
                }
                let pname = self.expect_ident("expected a parameter name")?;
                self.declare_local(pname);
                self.fs().locals.last_mut().unwrap().depth = self.fs().scope_depth;
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RightParen, "expected ')' after parameters")?;
        self.expect(Token::LeftBrace, "expected '{' before a function body")?;
        self.block()?;
        self.emit(Op::Null);
        self.emit(Op::Return);

        let mut finished = self.fns.pop().expect("pushed above");
        finished.function.upvalue_count = finished.upvalues.len() as u8;
        finished.function.upvalues = finished.upvalues.iter().map(|u| (u.index, u.is_local)).collect();
        let function_ref = self.heap.allocate(Obj::Function(finished.function));
        let const_slot = self.make_const(Value::Obj(function_ref));
        self.emit(Op::Closure(const_slot));
        Ok(())
    }

    fn class_declaration(&mut self) -> ParseResult {
        let name = self.expect_ident("expected a class name")?;
        let name_const = self.intern_const(name);
        let global_slot = self.begin_variable(name);
        let class_ref = {
            let name_ref = self.heap.intern(name);
            self.heap.allocate(Obj::Class(falcon_core::object::ClassObj { name: name_ref, methods: falcon_core::table::Table::new() }))
        };
        let class_const = self.make_const(Value::Obj(class_ref));
        self.emit(Op::Class(class_const));
        self.finish_variable(global_slot);

        let mut has_superclass = false;
        if self.matches(&Token::Colon) {
            let super_name = self.expect_ident("expected a superclass name")?;
            self.named_variable(super_name, false);
            self.begin_scope();
            self.declare_local("super");
            self.fs().locals.last_mut().unwrap().depth = self.fs().scope_depth;
            self.named_variable(name, false);
            self.emit(Op::Inherit);
            has_superclass = true;
        }

        self.classes.push(ClassCtx { has_superclass });
        self.named_variable(name, false);
        self.expect(Token::LeftBrace, "expected '{' before a class body")?;
        while !self.check(&Token::RightBrace) && self.current().is_some() {
            self.method()?;
        }
        self.expect(Token::RightBrace, "expected '}' after a class body")?;
        self.emit(Op::Pop); // the class value pushed by `named_variable` above
        self.classes.pop();
        if has_superclass {
            self.end_scope();
        }
        let _ = name_const;
        Ok(())
    }

    fn method(&mut self) -> ParseResult {
        let name = self.expect_ident("expected a method name")?;
        let kind = if name == "init" { FnKind::Initializer } else { FnKind::Method };
        self.function_body(name, kind)?;
        let name_const = self.intern_const(name);
        self.emit(Op::Method(name_const));
        Ok(())
    }

    fn statement(&mut self) -> ParseResult {
        if self.matches(&Token::If) {
            self.if_statement()
        } else if self.matches(&Token::While) {
            self.while_statement()
        } else if self.matches(&Token::For) {
            self.for_statement()
        } else if self.matches(&Token::LeftBrace) {
            self.begin_scope();
            let r = self.block();
            self.end_scope();
            r
        } else if self.matches(&Token::Return) {
            self.return_statement()
        } else if self.matches(&Token::Break) {
            self.break_statement()
        } else if self.matches(&Token::Continue) {
            self.continue_statement()
        } else {
            self.expression_statement()
        }
    }

    fn block(&mut self) -> ParseResult {
        while !self.check(&Token::RightBrace) && self.current().is_some() {
            self.declaration();
        }
        self.expect(Token::RightBrace, "expected '}' to close a block")
    }

    fn expression_statement(&mut self) -> ParseResult {
        self.expression()?;
        self.expect(Token::Semicolon, "expected ';' after an expression")?;
        self.emit(Op::Pop);
        Ok(())
    }

    fn if_statement(&mut self) -> ParseResult {
        self.expect(Token::LeftParen, "expected '(' after 'if'")?;
        self.expression()?;
        self.expect(Token::RightParen, "expected ')' after an if condition")?;
        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.statement()?;
        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);
        self.emit(Op::Pop);
        if self.matches(&Token::Else) {
            self.statement()?;
        }
        self.patch_jump(else_jump);
        Ok(())
    }

    fn while_statement(&mut self) -> ParseResult {
        let loop_start = self.chunk_mut().ops.len();
        self.fs().loops.push(LoopCtx { start: loop_start, scope_depth: self.fs().scope_depth, break_jumps: Vec::new() });
        self.expect(Token::LeftParen, "expected '(' after 'while'")?;
        self.expression()?;
        self.expect(Token::RightParen, "expected ')' after a while condition")?;
        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.statement()?;
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit(Op::Pop);
        let loop_ctx = self.fs().loops.pop().unwrap();
        for j in loop_ctx.break_jumps {
            self.patch_jump(j);
        }
        Ok(())
    }

    fn for_statement(&mut self) -> ParseResult {
        self.begin_scope();
        self.expect(Token::LeftParen, "expected '(' after 'for'")?;
        let init_locals_start = self.fs().locals.len();
        if self.matches(&Token::Semicolon) {
            // no initializer
        } else if self.matches(&Token::Let) {
            self.let_declaration()?;
        } else {
            self.expression_statement()?;
        }
        // Slots the initializer declared, e.g. `i` in `for (let i = 0; ...)`.
        // Every iteration gets its own copy of these (see below) so a closure
        // created in the body keeps the value from its creation iteration
        // instead of aliasing the one slot the initializer declared.
        let loop_var_slots: Vec<u16> = (init_locals_start..self.fs().locals.len()).map(|i| i as u16).collect();
        let loop_var_names: Vec<&'s str> = self.fs().locals[init_locals_start..].iter().map(|l| l.name).collect();

        let mut loop_start = self.chunk_mut().ops.len();
        let mut exit_jump = None;
        if !self.matches(&Token::Semicolon) {
            self.expression()?;
            self.expect(Token::Semicolon, "expected ';' after a for condition")?;
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit(Op::Pop);
        }

        if !self.matches(&Token::RightParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let incr_start = self.chunk_mut().ops.len();
            self.expression()?;
            self.emit(Op::Pop);
            self.expect(Token::RightParen, "expected ')' after for clauses")?;
            self.emit_loop(loop_start);
            loop_start = incr_start;
            self.patch_jump(body_jump);
        }

        self.fs().loops.push(LoopCtx { start: loop_start, scope_depth: self.fs().scope_depth, break_jumps: Vec::new() });

        // Copy the loop-control locals into a fresh inner scope before the
        // body runs, so locals resolved inside the body bind to this
        // iteration's own slots rather than the initializer's. Without this,
        // `Op::CloseUpvalue` for those slots would only ever fire once, after
        // the loop fully exits, and every closure capturing the loop variable
        // would see its final value rather than the value at its own
        // iteration.
        if !loop_var_slots.is_empty() {
            self.begin_scope();
            for (&outer_slot, name) in loop_var_slots.iter().zip(&loop_var_names) {
                self.emit(Op::GetLocal(outer_slot));
                self.declare_local(name);
                let depth = self.fs().scope_depth;
                self.fs().locals.last_mut().unwrap().depth = depth;
            }
        }

        self.statement()?;

        if !loop_var_slots.is_empty() {
            let shadow_base = (self.fs().locals.len() - loop_var_slots.len()) as u16;
            // Write the (possibly mutated) per-iteration copies back to the
            // outer slots before the increment clause runs, then close this
            // iteration's scope.
            for (i, &outer_slot) in loop_var_slots.iter().enumerate() {
                self.emit(Op::GetLocal(shadow_base + i as u16));
                self.emit(Op::SetLocal(outer_slot));
                self.emit(Op::Pop);
            }
            self.end_scope();
        }

        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit(Op::Pop);
        }
        let loop_ctx = self.fs().loops.pop().unwrap();
        for j in loop_ctx.break_jumps {
            self.patch_jump(j);
        }
        self.end_scope();
        Ok(())
    }

    fn return_statement(&mut self) -> ParseResult {
        if self.fs().kind == FnKind::Script {
            self.error("cannot return from top-level script code");
        }
        if self.matches(&Token::Semicolon) {
            self.emit(Op::Null);
            self.emit(Op::Return);
        } else {
            if self.fs().kind == FnKind::Initializer {
                self.error("cannot return a value from an 'init' method");
            }
            self.expression()?;
            self.expect(Token::Semicolon, "expected ';' after a return value")?;
            self.emit(Op::Return);
        }
        Ok(())
    }

    fn break_statement(&mut self) -> ParseResult {
        self.expect(Token::Semicolon, "expected ';' after 'break'")?;
        if self.fs().loops.is_empty() {
            self.error("'break' used outside of a loop");
            return Err(());
        }
        let jump = self.emit_jump(Op::Jump);
        self.fs().loops.last_mut().unwrap().break_jumps.push(jump);
        Ok(())
    }

    fn continue_statement(&mut self) -> ParseResult {
        self.expect(Token::Semicolon, "expected ';' after 'continue'")?;
        match self.fs().loops.last() {
            Some(l) => {
                let start = l.start;
                self.emit_loop(start);
                Ok(())
            }
            None => {
                self.error("'continue' used outside of a loop");
                Err(())
            }
        }
    }

    // ---- expressions ----

    fn expression(&mut self) -> ParseResult {
        self.parse_precedence(Prec::Assignment)
    }

    fn parse_precedence(&mut self, min_prec: Prec) -> ParseResult {
        let can_assign = min_prec <= Prec::Assignment;
        self.prefix(can_assign)?;
        while let Some(prec) = self.current().and_then(infix_precedence) {
            if prec < min_prec {
                break;
            }
            self.infix(can_assign)?;
        }
        if can_assign && self.matches(&Token::Equal) {
            self.error("invalid assignment target");
            return Err(());
        }
        Ok(())
    }

    fn prefix(&mut self, can_assign: bool) -> ParseResult {
        let line = self.current_line();
        match self.advance() {
            Some(Token::Number(n)) => {
                let slot = self.make_const(Value::Number(n));
                self.emit(Op::Constant(slot));
                Ok(())
            }
            Some(Token::Str(s)) => {
                let r = self.heap.intern(&s);
                let slot = self.make_const(Value::Obj(r));
                self.emit(Op::Constant(slot));
                Ok(())
            }
            Some(Token::True) => {
                self.emit(Op::True);
                Ok(())
            }
            Some(Token::False) => {
                self.emit(Op::False);
                Ok(())
            }
            Some(Token::Null) => {
                self.emit(Op::Null);
                Ok(())
            }
            Some(Token::This) => {
                if self.classes.is_empty() {
                    self.error("'this' used outside of a method");
                    return Err(());
                }
                self.variable("this", false);
                Ok(())
            }
            Some(Token::Super) => self.super_access(),
            Some(Token::Ident(name)) => {
                self.variable(name, can_assign);
                Ok(())
            }
            Some(Token::LeftParen) => {
                self.expression()?;
                self.expect(Token::RightParen, "expected ')' after an expression")
            }
            Some(Token::LeftBracket) => self.list_literal(),
            Some(Token::LeftBrace) => self.map_literal(),
            Some(Token::Minus) => {
                self.parse_precedence(Prec::Unary)?;
                self.emit(Op::Negate);
                Ok(())
            }
            Some(Token::Bang) => {
                self.parse_precedence(Prec::Unary)?;
                self.emit(Op::Not);
                Ok(())
            }
            other => {
                let _ = other;
                let _ = line;
                self.error("expected an expression");
                Err(())
            }
        }
    }

    fn infix(&mut self, can_assign: bool) -> ParseResult {
        match self.advance() {
            Some(Token::Plus) => self.binary(Prec::Term, Op::Add),
            Some(Token::Minus) => self.binary(Prec::Term, Op::Subtract),
            Some(Token::Star) => self.binary(Prec::Factor, Op::Multiply),
            Some(Token::Slash) => self.binary(Prec::Factor, Op::Divide),
            Some(Token::Percent) => self.binary(Prec::Factor, Op::Modulo),
            Some(Token::EqualEqual) => self.binary(Prec::Equality, Op::Equal),
            Some(Token::BangEqual) => {
                self.parse_precedence(Prec::Equality.next())?;
                self.emit(Op::Equal);
                self.emit(Op::Not);
                Ok(())
            }
            Some(Token::Greater) => self.binary(Prec::Comparison, Op::Greater),
            Some(Token::GreaterEqual) => {
                self.parse_precedence(Prec::Comparison.next())?;
                self.emit(Op::Less);
                self.emit(Op::Not);
                Ok(())
            }
            Some(Token::Less) => self.binary(Prec::Comparison, Op::Less),
            Some(Token::LessEqual) => {
                self.parse_precedence(Prec::Comparison.next())?;
                self.emit(Op::Greater);
                self.emit(Op::Not);
                Ok(())
            }
            Some(Token::And) => self.and_expr(),
            Some(Token::Or) => self.or_expr(),
            Some(Token::LeftParen) => self.call_expr(),
            Some(Token::LeftBracket) => self.index_expr(can_assign),
            Some(Token::Dot) => self.dot_expr(can_assign),
            _ => {
                self.error("unexpected infix operator");
                Err(())
            }
        }
    }

    fn binary(&mut self, prec: Prec, op: Op) -> ParseResult {
        self.parse_precedence(prec.next())?;
        self.emit(op);
        Ok(())
    }

    fn and_expr(&mut self) -> ParseResult {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.parse_precedence(Prec::And)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn or_expr(&mut self) -> ParseResult {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit(Op::Pop);
        self.parse_precedence(Prec::Or)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn call_expr(&mut self) -> ParseResult {
        let argc = self.argument_list()?;
        self.emit(Op::Call(argc));
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8, ()> {
        let mut argc = 0u8;
        if !self.check(&Token::RightParen) {
            loop {
                self.expression()?;
                if argc == 255 {
                    self.error("cannot pass more than 255 arguments");
                }
                argc += 1;
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RightParen, "expected ')' after arguments")?;
        Ok(argc)
    }

    fn index_expr(&mut self, can_assign: bool) -> ParseResult {
        self.expression()?;
        self.expect(Token::RightBracket, "expected ']' after an index expression")?;
        if can_assign && self.matches(&Token::Equal) {
            self.expression()?;
            self.emit(Op::SetIndex);
        } else {
            self.emit(Op::GetIndex);
        }
        Ok(())
    }

    fn dot_expr(&mut self, can_assign: bool) -> ParseResult {
        let name = self.expect_ident("expected a property name after '.'")?;
        let name_const = self.intern_const(name);
        if can_assign && self.matches(&Token::Equal) {
            self.expression()?;
            self.emit(Op::SetProperty(name_const));
        } else if self.matches(&Token::LeftParen) {
            let argc = self.argument_list()?;
            self.emit(Op::Invoke(name_const, argc));
        } else {
            self.emit(Op::GetProperty(name_const));
        }
        Ok(())
    }

    fn super_access(&mut self) -> ParseResult {
        if !self.classes.last().is_some_and(|c| c.has_superclass) {
            self.error("'super' used outside of a subclass");
        }
        self.expect(Token::Dot, "expected '.' after 'super'")?;
        let name = self.expect_ident("expected a superclass method name")?;
        let name_const = self.intern_const(name);
        self.variable("this", false);
        if self.matches(&Token::LeftParen) {
            let argc = self.argument_list()?;
            self.variable("super", false);
            self.emit(Op::SuperInvoke(name_const, argc));
        } else {
            self.variable("super", false);
            self.emit(Op::GetSuper(name_const));
        }
        Ok(())
    }

    fn list_literal(&mut self) -> ParseResult {
        let mut count: u16 = 0;
        if !self.check(&Token::RightBracket) {
            loop {
                self.expression()?;
                count += 1;
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RightBracket, "expected ']' after a list literal")?;
        self.emit(Op::BuildList(count));
        Ok(())
    }

    fn map_literal(&mut self) -> ParseResult {
        let mut count: u16 = 0;
        if !self.check(&Token::RightBrace) {
            loop {
                let key = self.expect_ident_or_string("expected a map key")?;
                let slot = self.intern_const(&key);
                self.emit(Op::Constant(slot));
                self.expect(Token::Colon, "expected ':' after a map key")?;
                self.expression()?;
                count += 1;
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RightBrace, "expected '}' after a map literal")?;
        self.emit(Op::BuildMap(count));
        Ok(())
    }

    fn expect_ident_or_string(&mut self, msg: &str) -> Result<String, ()> {
        match self.advance() {
            Some(Token::Ident(s)) => Ok(s.to_string()),
            Some(Token::Str(s)) => Ok(s),
            _ => {
                self.error(msg);
                Err(())
            }
        }
    }

    fn variable(&mut self, name: &str, can_assign: bool) {
        self.named_variable(name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let fn_idx = self.fns.len() - 1;
        if let Some(slot) = self.resolve_local(fn_idx, name) {
            if can_assign && self.matches(&Token::Equal) {
                let _ = self.expression();
                self.emit(Op::SetLocal(slot as u16));
            } else {
                self.emit(Op::GetLocal(slot as u16));
            }
        } else if let Some(slot) = self.resolve_upvalue(fn_idx, name) {
            if can_assign && self.matches(&Token::Equal) {
                let _ = self.expression();
                self.emit(Op::SetUpvalue(slot as u16));
            } else {
                self.emit(Op::GetUpvalue(slot as u16));
            }
        } else {
            let slot = self.intern_const(name);
            if can_assign && self.matches(&Token::Equal) {
                let _ = self.expression();
                self.emit(Op::SetGlobal(slot));
            } else {
                self.emit(Op::GetGlobal(slot));
            }
        }
    }
}

fn infix_precedence(t: &Token<'_>) -> Option<Prec> {
    Some(match t {
        Token::Or => Prec::Or,
        Token::And => Prec::And,
        Token::EqualEqual | Token::BangEqual => Prec::Equality,
        Token::Greater | Token::GreaterEqual | Token::Less | Token::LessEqual => Prec::Comparison,
        Token::Plus | Token::Minus => Prec::Term,
        Token::Star | Token::Slash | Token::Percent => Prec::Factor,
        Token::LeftParen | Token::LeftBracket | Token::Dot => Prec::Call,
        _ => return None,
    })
}
