//! Single-pass recursive-descent compiler.
//!
//! A Pratt expression parser driven by a precedence table, a symbol table
//! for name resolution, and one compiler frame per function being
//! assembled, emitting directly against a plain stack-slot local/upvalue
//! model rather than allocating fixed registers. There is no separate AST
//! stage — parsing and code generation happen in the same walk, so there's
//! never an intermediate tree to hold in memory.

use std::collections::HashMap;

use crate::bytecode::Op;
use crate::error::CompileDiagnostic;
use crate::gc::Heap;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::object::function::{FnDebug, UpvalueSpec};
use crate::object::{GcRef, ObjFn};
use crate::symbol::{ConstantPool, SymbolTable};
use crate::value::{ConstKey, Value};

const MAX_LOCALS: usize = 256;
const MAX_PARAMS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Conditional, // ?:
    Or,         // ||
    And,        // &&
    Is,         // is
    Equality,   // == !=
    Comparison, // < > <= >=
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    Range,      // .. ...
    Shift,      // << >>
    Term,       // + -
    Factor,     // * / %
    Unary,      // - ! ~
    Call,       // . () []
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

struct LoopState {
    start: usize,
    body_depth: i32,
    break_jumps: Vec<usize>,
}

/// Per-function compiler frame, linked to its enclosing frame for upvalue
/// resolution.
struct FnFrame {
    locals: Vec<Local>,
    upvalues: Vec<UpvalueSpec>,
    scope_depth: i32,
    code: crate::symbol::CodeBuffer,
    constants: ConstantPool,
    arity: u8,
    loops: Vec<LoopState>,
    fn_name: String,
    is_method: bool,
}

impl FnFrame {
    fn new(fn_name: impl Into<String>, is_method: bool) -> Self {
        // Slot 0 is always the receiver (`this`) for methods, or the
        // function value itself for plain closures.
        let locals = vec![Local { name: String::new(), depth: 0, is_captured: false }];
        FnFrame {
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            code: crate::symbol::CodeBuffer::new(),
            constants: ConstantPool::new(),
            arity: 0,
            loops: Vec::new(),
            fn_name: fn_name.into(),
            is_method,
        }
    }
}

struct ClassState {
    fields: SymbolTable,
    static_field_locals: HashMap<String, u8>,
    class_frame_index: usize,
    is_foreign: bool,
    name: String,
}

pub struct Compiler<'a> {
    lexer: Lexer<'a>,
    current: Token,
    previous: Token,
    module_name: String,
    frames: Vec<FnFrame>,
    classes: Vec<ClassState>,
    diagnostics: Vec<CompileDiagnostic>,
    heap: &'a mut Heap,
    method_names: &'a mut SymbolTable,
    module: GcRef,
    panic_mode: bool,
}

type PrefixFn<'a> = fn(&mut Compiler<'a>, can_assign: bool);
type InfixFn<'a> = fn(&mut Compiler<'a>, can_assign: bool);

fn rule<'a>(kind: &TokenKind) -> (Option<PrefixFn<'a>>, Option<InfixFn<'a>>, Precedence) {
    use TokenKind::*;
    match kind {
        LeftParen => (Some(Compiler::grouping), Some(Compiler::call_trailer_paren_unused), Precedence::None),
        LeftBracket => (Some(Compiler::list_literal), Some(Compiler::subscript), Precedence::Call),
        LeftBrace => (Some(Compiler::map_literal), None, Precedence::None),
        Dot => (None, Some(Compiler::dot), Precedence::Call),
        DotDot | DotDotDot => (None, Some(Compiler::range), Precedence::Range),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => (None, Some(Compiler::binary), Precedence::Term),
        Star => (None, Some(Compiler::binary), Precedence::Factor),
        Slash => (None, Some(Compiler::binary), Precedence::Factor),
        Percent => (None, Some(Compiler::binary), Precedence::Factor),
        LtLt => (None, Some(Compiler::binary), Precedence::Shift),
        GtGt => (None, Some(Compiler::binary), Precedence::Shift),
        Amp => (None, Some(Compiler::binary), Precedence::BitAnd),
        Pipe => (None, Some(Compiler::binary), Precedence::BitOr),
        Caret => (None, Some(Compiler::binary), Precedence::BitXor),
        Tilde => (Some(Compiler::unary), None, Precedence::None),
        Bang => (Some(Compiler::unary), None, Precedence::None),
        EqEq => (None, Some(Compiler::binary), Precedence::Equality),
        BangEq => (None, Some(Compiler::binary), Precedence::Equality),
        Lt => (None, Some(Compiler::binary), Precedence::Comparison),
        Gt => (None, Some(Compiler::binary), Precedence::Comparison),
        LtEq => (None, Some(Compiler::binary), Precedence::Comparison),
        GtEq => (None, Some(Compiler::binary), Precedence::Comparison),
        Is => (None, Some(Compiler::is_expr), Precedence::Is),
        AmpAmp => (None, Some(Compiler::and_expr), Precedence::And),
        PipePipe => (None, Some(Compiler::or_expr), Precedence::Or),
        Question => (None, Some(Compiler::conditional), Precedence::Conditional),
        Number(_) => (Some(Compiler::number), None, Precedence::None),
        String(_) => (Some(Compiler::string_lit), None, Precedence::None),
        InterpolationStart(_) => (Some(Compiler::interpolated_string), None, Precedence::None),
        DollarString(_) => (Some(Compiler::dollar_string), None, Precedence::None),
        Null => (Some(Compiler::null_lit), None, Precedence::None),
        True => (Some(Compiler::bool_lit), None, Precedence::None),
        False => (Some(Compiler::bool_lit), None, Precedence::None),
        This => (Some(Compiler::this_expr), None, Precedence::None),
        Super => (Some(Compiler::super_expr), None, Precedence::None),
        Field(_) => (Some(Compiler::field_expr), None, Precedence::None),
        StaticField(_) => (Some(Compiler::static_field_expr), None, Precedence::None),
        Ident(_) => (Some(Compiler::variable), None, Precedence::None),
        _ => (None, None, Precedence::None),
    }
}

impl<'a> Compiler<'a> {
    pub fn compile(
        heap: &'a mut Heap,
        method_names: &'a mut SymbolTable,
        module: GcRef,
        source: &'a str,
        module_name: &str,
    ) -> Result<GcRef, Vec<CompileDiagnostic>> {
        let mut lexer = Lexer::new(source);
        let first = lexer.next_token();
        let mut c = Compiler {
            lexer,
            current: first,
            previous: Token { kind: TokenKind::Eof, span: crate::lexer::Span { start: 0, end: 0, line: 1 } },
            module_name: module_name.to_string(),
            frames: vec![FnFrame::new("(script)", false)],
            classes: Vec::new(),
            diagnostics: Vec::new(),
            heap,
            method_names,
            module,
            panic_mode: false,
        };
        c.skip_newlines();
        while !c.check(&TokenKind::Eof) {
            c.declaration();
            c.skip_newlines();
        }
        c.emit(Op::Null);
        c.emit(Op::Return);
        if !c.diagnostics.is_empty() {
            return Err(c.diagnostics);
        }
        let frame = c.frames.pop().expect("top frame");
        Ok(c.finish_fn(frame, 0))
    }

    // -- token stream -----------------------------------------------------

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, self.lexer.next_token());
        if let TokenKind::Error(e) = self.current.kind.clone() {
            self.error_at_current(&format!("{}", e));
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, msg: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(msg);
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn error_at_current(&mut self, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let line = self.current.span.line as i32;
        self.diagnostics.push(CompileDiagnostic::new(&self.module_name, line, msg.to_string()));
    }

    fn error(&mut self, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let line = self.previous.span.line as i32;
        self.diagnostics.push(CompileDiagnostic::new(&self.module_name, line, msg.to_string()));
    }

    // -- emission -----------------------------------------------------------

    fn frame(&mut self) -> &mut FnFrame {
        self.frames.last_mut().expect("at least one frame")
    }

    fn line(&self) -> u32 {
        self.previous.span.line
    }

    fn emit(&mut self, op: Op) -> usize {
        let line = self.line();
        self.frame().code.emit_byte(op as u8, line)
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.line();
        self.frame().code.emit_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.line();
        self.frame().code.emit_u16(value, line);
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit(op);
        self.emit_u16(0xFFFF);
        self.frame().code.len() - 2
    }

    fn patch_jump(&mut self, at: usize) {
        let target = self.frame().code.len();
        let offset = target - at - 2;
        if offset > u16::MAX as usize {
            self.error("jump offset too large");
            return;
        }
        self.frame().code.patch_u16(at, offset as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit(Op::Loop);
        let offset = self.frame().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("loop body too large");
            return;
        }
        self.emit_u16(offset as u16);
    }

    fn add_constant(&mut self, key: ConstKey, value: Value) -> u16 {
        match self.frame().constants.intern(key, value) {
            Some(i) => i,
            None => {
                self.error("too many constants in one function");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value, key: ConstKey) {
        let idx = self.add_constant(key, value);
        self.emit(Op::Constant);
        self.emit_u16(idx);
    }

    fn intern_string(&mut self, s: &[u8]) -> GcRef {
        let data = crate::object::ObjData::String(crate::object::ObjString::new(s.to_vec()));
        let r = self.heap.allocate(data, None);
        self.heap.pop_temp_root();
        r
    }

    // -- scopes / locals ------------------------------------------------

    fn begin_scope(&mut self) {
        self.frame().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = self.frame().scope_depth;
        self.frame().scope_depth -= 1;
        while let Some(local) = self.frame().locals.last() {
            if local.depth < self.frame().scope_depth + 1 {
                break;
            }
            if self.frame().locals.last().unwrap().is_captured {
                self.emit(Op::CloseUpvalue);
            } else {
                self.emit(Op::Pop);
            }
            self.frame().locals.pop();
        }
        let _ = depth;
    }

    fn add_local(&mut self, name: &str) -> usize {
        let depth = self.frame().scope_depth;
        self.frame().locals.push(Local { name: name.to_string(), depth, is_captured: false });
        self.frame().locals.len() - 1
    }

    fn declare_local(&mut self, name: &str) {
        if self.frame().locals.len() >= MAX_LOCALS {
            self.error("too many local variables in one function");
            return;
        }
        let depth = self.frame().scope_depth;
        for local in self.frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error(&format!("variable '{}' already declared in this scope", name));
                return;
            }
        }
        self.add_local(name);
    }

    fn resolve_local(&self, frame_idx: usize, name: &str) -> Option<usize> {
        self.frames[frame_idx].locals.iter().rposition(|l| l.name == name)
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing = frame_idx - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local_slot].is_captured = true;
            return Some(self.add_upvalue(frame_idx, local_slot as u8, true));
        }
        if let Some(up) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_idx, up, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        let ups = &mut self.frames[frame_idx].upvalues;
        for (i, uv) in ups.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return i as u8;
            }
        }
        ups.push(UpvalueSpec { is_local, index });
        (ups.len() - 1) as u8
    }

    // -- variable resolution / load-store -------------------------------

    /// Emits code that loads `name` by the standard local -> upvalue ->
    /// module-variable search order.
    fn load_variable(&mut self, name: &str) {
        let top = self.frames.len() - 1;
        if let Some(slot) = self.resolve_local(top, name) {
            self.emit_load_local(slot);
        } else if let Some(up) = self.resolve_upvalue(top, name) {
            self.emit(Op::LoadUpvalue);
            self.emit_u8(up);
        } else {
            self.load_or_declare_module_var(name);
        }
    }

    fn emit_load_local(&mut self, slot: usize) {
        use Op::*;
        let fixed = [LoadLocal0, LoadLocal1, LoadLocal2, LoadLocal3, LoadLocal4, LoadLocal5, LoadLocal6, LoadLocal7, LoadLocal8];
        if slot < fixed.len() {
            self.emit(fixed[slot]);
        } else {
            self.emit(Op::LoadLocal);
            self.emit_u8(slot as u8);
        }
    }

    fn store_variable(&mut self, name: &str) {
        let top = self.frames.len() - 1;
        if let Some(slot) = self.resolve_local(top, name) {
            self.emit(Op::StoreLocal);
            self.emit_u8(slot as u8);
        } else if let Some(up) = self.resolve_upvalue(top, name) {
            self.emit(Op::StoreUpvalue);
            self.emit_u8(up);
        } else {
            let slot = self.module.as_module_mut().declare_variable(name, Value::Undefined).unwrap_or(0);
            self.emit(Op::StoreModuleVar);
            self.emit_u16(slot as u16);
        }
    }

    /// Forward-reference-friendly module variable lookup: an undeclared
    /// top-level name auto-declares as `Undefined`, so mutual recursion
    /// between top-level classes/functions resolves without a separate
    /// declaration pass.
    fn load_or_declare_module_var(&mut self, name: &str) {
        let module = self.module.as_module_mut();
        let slot = match module.find_variable(name) {
            Some(s) => s,
            None => module.declare_variable(name, Value::Undefined).unwrap_or(0),
        };
        self.emit(Op::LoadModuleVar);
        self.emit_u16(slot as u16);
    }

    // -- parsing ----------------------------------------------------------

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = rule(&self.previous.kind).0;
        let Some(prefix) = prefix else {
            self.error("expected expression");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(&self.current.kind).2 {
            self.advance();
            if let Some(infix) = rule(&self.previous.kind).1 {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(&TokenKind::Eq) {
            self.error("invalid assignment target");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    // -- literals -----------------------------------------------------------

    fn number(&mut self, _can_assign: bool) {
        if let TokenKind::Number(n) = self.previous.kind {
            self.emit_constant(Value::Num(n), ConstKey::Num(n.to_bits()));
        }
    }

    fn null_lit(&mut self, _can_assign: bool) {
        self.emit(Op::Null);
    }

    fn bool_lit(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::True => self.emit(Op::True),
            _ => self.emit(Op::False),
        };
    }

    fn string_lit(&mut self, _can_assign: bool) {
        if let TokenKind::String(bytes) = self.previous.kind.clone() {
            let s = self.intern_string(&bytes);
            self.emit_constant(Value::Obj(s), ConstKey::Str(bytes));
        }
    }

    fn dollar_string(&mut self, _can_assign: bool) {
        // `$"..."` reaches the host-supplied `dollarOperatorFn` hook rather
        // than producing a plain string value directly. The literal itself
        // is the receiver, same as a unary operator method — no separate
        // argument is pushed.
        if let TokenKind::DollarString(bytes) = self.previous.kind.clone() {
            let s = self.intern_string(&bytes);
            self.emit_constant(Value::Obj(s), ConstKey::Str(bytes));
            self.emit_method_call_known("$", 0);
        }
    }

    /// String interpolation desugars to a left-fold of `+` over each
    /// literal chunk and each embedded expression's `.toString` — plain
    /// string concatenation, not a dedicated opcode.
    fn interpolated_string(&mut self, _can_assign: bool) {
        let TokenKind::InterpolationStart(first) = self.previous.kind.clone() else { unreachable!() };
        let s = self.intern_string(&first);
        self.emit_constant(Value::Obj(s), ConstKey::Str(first));
        loop {
            self.expression();
            self.emit_method_call_known("toString()", 0);
            self.emit_method_call_known("+(_)", 1);
            self.advance();
            match self.previous.kind.clone() {
                TokenKind::InterpolationMid(chunk) => {
                    let s = self.intern_string(&chunk);
                    self.emit_constant(Value::Obj(s), ConstKey::Str(chunk));
                    self.emit_method_call_known("+(_)", 1);
                }
                TokenKind::InterpolationEnd(chunk) => {
                    let s = self.intern_string(&chunk);
                    self.emit_constant(Value::Obj(s), ConstKey::Str(chunk));
                    self.emit_method_call_known("+(_)", 1);
                    break;
                }
                _ => {
                    self.error("expected continuation of interpolated string");
                    break;
                }
            }
        }
    }

    fn list_literal(&mut self, _can_assign: bool) {
        self.load_or_declare_module_var("List");
        self.emit_method_call_known("new()", 0);
        self.skip_newlines();
        if !self.check(&TokenKind::RightBracket) {
            loop {
                self.skip_newlines();
                if self.check(&TokenKind::RightBracket) {
                    break;
                }
                self.expression();
                self.emit_method_call_known("addCore_(_)", 1);
                self.skip_newlines();
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.consume(&TokenKind::RightBracket, "expected ']' to close list literal");
    }

    fn map_literal(&mut self, _can_assign: bool) {
        self.load_or_declare_module_var("Map");
        self.emit_method_call_known("new()", 0);
        self.skip_newlines();
        if !self.check(&TokenKind::RightBrace) {
            loop {
                self.skip_newlines();
                if self.check(&TokenKind::RightBrace) {
                    break;
                }
                self.expression();
                self.skip_newlines();
                self.consume(&TokenKind::Colon, "expected ':' between map key and value");
                self.skip_newlines();
                self.expression();
                self.emit_method_call_known("addCore_(_,_)", 2);
                self.skip_newlines();
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.consume(&TokenKind::RightBrace, "expected '}' to close map literal");
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.skip_newlines();
        self.expression();
        self.skip_newlines();
        self.consume(&TokenKind::RightParen, "expected ')' after expression");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind.clone();
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_method_call_known("-", 0),
            TokenKind::Bang => self.emit_method_call_known("!", 0),
            TokenKind::Tilde => self.emit_method_call_known("~", 0),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.kind.clone();
        let (_, _, prec) = rule(&op);
        let next = match prec {
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Shift => Precedence::Term,
            Precedence::BitAnd => Precedence::Shift,
            Precedence::BitXor => Precedence::BitAnd,
            Precedence::BitOr => Precedence::BitXor,
            Precedence::Comparison => Precedence::BitOr,
            Precedence::Equality => Precedence::Comparison,
            other => other,
        };
        self.parse_precedence(next);
        let sig = match op {
            TokenKind::Plus => "+(_)",
            TokenKind::Minus => "-(_)",
            TokenKind::Star => "*(_)",
            TokenKind::Slash => "/(_)",
            TokenKind::Percent => "%(_)",
            TokenKind::LtLt => "<<(_)",
            TokenKind::GtGt => ">>(_)",
            TokenKind::Amp => "&(_)",
            TokenKind::Pipe => "|(_)",
            TokenKind::Caret => "^(_)",
            TokenKind::EqEq => "==(_)",
            TokenKind::BangEq => "!=(_)",
            TokenKind::Lt => "<(_)",
            TokenKind::Gt => ">(_)",
            TokenKind::LtEq => "<=(_)",
            TokenKind::GtEq => ">=(_)",
            _ => return,
        };
        self.emit_method_call_known(sig, 1);
    }

    fn range(&mut self, _can_assign: bool) {
        let inclusive = matches!(self.previous.kind, TokenKind::DotDot);
        self.parse_precedence(Precedence::Shift);
        self.emit_method_call_known(if inclusive { "..(_)" } else { "...(_)" }, 1);
    }

    fn is_expr(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Equality);
        self.emit_method_call_known("is(_)", 1);
    }

    fn and_expr(&mut self, _can_assign: bool) {
        let jump = self.emit_jump(Op::And);
        self.parse_precedence(Precedence::And);
        self.patch_jump(jump);
    }

    fn or_expr(&mut self, _can_assign: bool) {
        let jump = self.emit_jump(Op::Or);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(jump);
    }

    fn conditional(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        self.skip_newlines();
        self.expression();
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.skip_newlines();
        self.consume(&TokenKind::Colon, "expected ':' in conditional expression");
        self.skip_newlines();
        self.parse_precedence(Precedence::Conditional);
        self.patch_jump(end_jump);
    }

    fn this_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("'this' used outside of a method");
        }
        self.load_variable("this");
    }

    fn super_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("'super' used outside of a method");
            return;
        }
        self.load_variable("this");
        self.skip_newlines();
        if self.matches(&TokenKind::Dot) {
            self.consume(&TokenKind::Ident(String::new()), "expected superclass method name");
            let TokenKind::Ident(name) = self.previous.kind.clone() else { return };
            self.finish_super_call(&name);
        } else {
            // Bare `super(...)` re-dispatches the *current* method's
            // signature to the superclass.
            let name = self.classes.last().map(|c| c.name.clone()).unwrap_or_default();
            let _ = name;
            self.error("bare 'super(...)' dispatch must name a method: use 'super.name(...)'");
        }
    }

    fn finish_super_call(&mut self, name: &str) {
        let (argc, sig) = self.argument_list_for_call(name);
        let symbol = self.method_names.intern(&sig) as u16;
        // Push the hidden "super" local (captured as an upvalue by every
        // method of a subclass) on top of the call window; the VM pops it
        // first to find which class's method table to dispatch against.
        self.load_variable(" super");
        let n = argc.min(16) as u8;
        let op = Op::from_byte(Op::SUPER_FIRST + n).unwrap_or(Op::Super0);
        self.emit(op);
        self.emit_u16(symbol);
    }

    fn field_expr(&mut self, can_assign: bool) {
        let TokenKind::Field(name) = self.previous.kind.clone() else { return };
        if self.classes.is_empty() {
            self.error("field access used outside of a class");
            return;
        }
        let slot = {
            let class = self.classes.last_mut().unwrap();
            class.fields.intern(&name) as u8
        };
        if can_assign && self.matches(&TokenKind::Eq) {
            self.expression();
            self.emit(Op::StoreFieldThis);
            self.emit_u8(slot);
        } else {
            self.emit(Op::LoadFieldThis);
            self.emit_u8(slot);
        }
    }

    fn static_field_expr(&mut self, can_assign: bool) {
        let TokenKind::StaticField(name) = self.previous.kind.clone() else { return };
        if self.classes.is_empty() {
            self.error("static field access used outside of a class");
            return;
        }
        let class_frame_index = self.classes.last().unwrap().class_frame_index;
        let slot = match self.classes.last().unwrap().static_field_locals.get(&name).copied() {
            Some(s) => s,
            None => {
                let synthetic = format!(" static {} {}", self.classes.last().unwrap().name, name);
                let slot = {
                    let depth = self.frames[class_frame_index].scope_depth;
                    self.frames[class_frame_index].locals.push(Local { name: synthetic, depth, is_captured: false });
                    (self.frames[class_frame_index].locals.len() - 1) as u8
                };
                // Initialize to null right where the static field is first
                // discovered in the enclosing (class-declaring) frame's own
                // bytecode stream: a static field starts out null the first
                // time the enclosing scope runs.
                let line = self.line();
                self.frames[class_frame_index].code.emit_byte(Op::Null as u8, line);
                self.frames[class_frame_index].code.emit_byte(Op::StoreLocal as u8, line);
                self.frames[class_frame_index].code.emit_byte(slot, line);
                self.frames[class_frame_index].code.emit_byte(Op::Pop as u8, line);
                self.classes.last_mut().unwrap().static_field_locals.insert(name, slot);
                slot
            }
        };
        let top = self.frames.len() - 1;
        // Static fields are always reached via the upvalue chain from the
        // current (possibly deeply nested) method frame up to the
        // class-declaring frame, even when `top == class_frame_index`
        // (direct local read/write in that case).
        if top == class_frame_index {
            if can_assign && self.matches(&TokenKind::Eq) {
                self.expression();
                self.emit(Op::StoreLocal);
                self.emit_u8(slot);
            } else {
                self.emit_load_local(slot as usize);
            }
            return;
        }
        let up = self.resolve_upvalue_to_frame(top, class_frame_index, slot);
        if can_assign && self.matches(&TokenKind::Eq) {
            self.expression();
            self.emit(Op::StoreUpvalue);
            self.emit_u8(up);
        } else {
            self.emit(Op::LoadUpvalue);
            self.emit_u8(up);
        }
    }

    /// Like `resolve_upvalue`, but the target local slot in `target_frame`
    /// is already known (used for static fields, whose backing local isn't
    /// found by name lookup alone since its synthetic name embeds the class).
    fn resolve_upvalue_to_frame(&mut self, frame_idx: usize, target_frame: usize, target_slot: u8) -> u8 {
        if frame_idx == target_frame + 1 {
            self.frames[target_frame].locals[target_slot as usize].is_captured = true;
            return self.add_upvalue(frame_idx, target_slot, true);
        }
        let parent_up = self.resolve_upvalue_to_frame(frame_idx - 1, target_frame, target_slot);
        self.add_upvalue(frame_idx, parent_up, false)
    }

    fn variable(&mut self, can_assign: bool) {
        let TokenKind::Ident(name) = self.previous.kind.clone() else { return };
        if can_assign && self.check(&TokenKind::Eq) {
            self.advance();
            self.expression();
            self.store_variable(&name);
        } else {
            self.load_variable(&name);
        }
    }

    /// Parses `(args)` (bare call target already on stack as receiver for
    /// `.name(...)`, handled by `dot`); here used for free function-style
    /// calls, which route through the ordinary `Fn.call` convention instead
    /// of a bare-call opcode. Unused as a direct infix rule — kept to
    /// satisfy the rule table's shape.
    fn call_trailer_paren_unused(&mut self, _can_assign: bool) {
        self.error("unexpected '('");
    }

    fn subscript(&mut self, can_assign: bool) {
        let mut argc = 0u32;
        self.skip_newlines();
        if !self.check(&TokenKind::RightBracket) {
            loop {
                self.expression();
                argc += 1;
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.consume(&TokenKind::RightBracket, "expected ']'");
        if can_assign && self.matches(&TokenKind::Eq) {
            self.expression();
            argc += 1;
            let sig = format!("[{}]=", vec!["_"; argc as usize].join(","));
            self.emit_method_call_known(&sig, argc);
        } else {
            let sig = format!("[{}]", vec!["_"; argc as usize].join(","));
            self.emit_method_call_known(&sig, argc);
        }
    }

    fn dot(&mut self, can_assign: bool) {
        self.skip_newlines();
        if self.matches(&TokenKind::Class) {
            // `.class` isn't a general method, but the core library
            // implements it as an ordinary zero-arg method, so just fall
            // through to the normal name path using the keyword's text.
            self.emit_method_call_known("class", 0);
            return;
        }
        self.consume(&TokenKind::Ident(String::new()), "expected method name after '.'");
        let TokenKind::Ident(name) = self.previous.kind.clone() else { return };
        if can_assign && self.check(&TokenKind::Eq) {
            self.advance();
            self.expression();
            let sig = format!("{}=(_)", name);
            self.emit_method_call_known(&sig, 1);
            return;
        }
        let (argc, sig) = self.argument_list_for_call(&name);
        self.emit_method_call_known(&sig, argc);
    }

    /// Parses an optional `(args)` / trailing block-argument list for a
    /// call whose method name was already consumed, returning the argument
    /// count and full signature string.
    fn argument_list_for_call(&mut self, name: &str) -> (u32, String) {
        let mut argc = 0u32;
        let mut params = Vec::new();
        if self.matches(&TokenKind::LeftParen) {
            self.skip_newlines();
            if !self.check(&TokenKind::RightParen) {
                loop {
                    self.skip_newlines();
                    self.expression();
                    argc += 1;
                    params.push("_");
                    self.skip_newlines();
                    if !self.matches(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.skip_newlines();
            self.consume(&TokenKind::RightParen, "expected ')' after arguments");
        }
        // A trailing `{ |params| ... }` block literal after a call's
        // argument list is sugar for passing a `Fn` as one more argument
        // (`list.each { |x| ... }`, `Fiber.new { ... }`).
        if self.check(&TokenKind::LeftBrace) {
            self.advance();
            self.function_literal();
            argc += 1;
            params.push("_");
        }
        let sig = if params.is_empty() { format!("{}()", name) } else { format!("{}({})", name, params.join(",")) };
        (argc, sig)
    }

    fn emit_method_call_known(&mut self, signature: &str, argc: u32) {
        let symbol = self.method_names.intern(signature) as u16;
        let n = argc.min(16) as u8;
        let op = Op::from_byte(Op::CALL_FIRST + n).unwrap_or(Op::Call0);
        self.emit(op);
        self.emit_u16(symbol);
    }

    // -- statements -----------------------------------------------------

    fn declaration(&mut self) {
        self.panic_mode = false;
        if self.matches(&TokenKind::Var) {
            self.var_declaration();
        } else if self.matches(&TokenKind::Class) {
            self.class_declaration(false);
        } else if self.check(&TokenKind::Foreign) {
            self.advance();
            if self.matches(&TokenKind::Class) {
                self.class_declaration(true);
            } else {
                self.error("expected 'class' after 'foreign'");
            }
        } else if self.matches(&TokenKind::Import) {
            self.import_statement();
        } else {
            self.statement();
        }
    }

    fn var_declaration(&mut self) {
        self.consume(&TokenKind::Ident(String::new()), "expected variable name");
        let TokenKind::Ident(name) = self.previous.kind.clone() else { return };
        if self.matches(&TokenKind::Eq) {
            self.expression();
        } else {
            self.emit(Op::Null);
        }
        self.define_variable(&name);
        self.consume_statement_end();
    }

    fn define_variable(&mut self, name: &str) {
        if self.frame().scope_depth > 0 {
            self.declare_local(name);
        } else {
            let slot = self.module.as_module_mut().declare_variable(name, Value::Undefined);
            let Some(slot) = slot else {
                self.error("too many module-level variables");
                return;
            };
            self.emit(Op::StoreModuleVar);
            self.emit_u16(slot as u16);
            self.emit(Op::Pop);
        }
    }

    fn consume_statement_end(&mut self) {
        if self.check(&TokenKind::Newline) || self.check(&TokenKind::Semicolon) || self.check(&TokenKind::Eof) {
            self.skip_newlines();
            while self.matches(&TokenKind::Semicolon) {
                self.skip_newlines();
            }
        } else if !self.check(&TokenKind::RightBrace) {
            self.error("expected newline or ';' after statement");
        }
    }

    fn import_statement(&mut self) {
        self.consume(&TokenKind::String(Vec::new()), "expected module path string");
        let TokenKind::String(path) = self.previous.kind.clone() else { return };
        let path_str = self.intern_string(&path);
        self.emit_constant(Value::Obj(path_str), ConstKey::Str(path));
        self.emit(Op::ImportModule);
        self.emit(Op::Pop);
        if self.matches(&TokenKind::For) {
            loop {
                self.consume(&TokenKind::Ident(String::new()), "expected imported variable name");
                let TokenKind::Ident(name) = self.previous.kind.clone() else { return };
                let bytes = name.clone().into_bytes();
                let name_obj = self.intern_string(&bytes);
                self.emit_constant(Value::Obj(name_obj), ConstKey::Str(bytes));
                self.emit(Op::ImportVariable);
                let local_name = if self.matches(&TokenKind::As) {
                    self.consume(&TokenKind::Ident(String::new()), "expected alias name");
                    let TokenKind::Ident(alias) = self.previous.kind.clone() else { name.clone() };
                    alias
                } else {
                    name
                };
                self.define_variable(&local_name);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume_statement_end();
    }

    fn statement(&mut self) {
        if self.matches(&TokenKind::If) {
            self.if_statement();
        } else if self.matches(&TokenKind::While) {
            self.while_statement();
        } else if self.matches(&TokenKind::For) {
            self.for_statement();
        } else if self.matches(&TokenKind::Return) {
            self.return_statement();
        } else if self.matches(&TokenKind::Break) {
            self.break_statement();
        } else if self.matches(&TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(&TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    /// A `{ ... }` block body (already past `{`).
    fn block(&mut self) {
        self.skip_newlines();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
            self.skip_newlines();
        }
        self.consume(&TokenKind::RightBrace, "expected '}' to close block");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.emit(Op::Pop);
        self.consume_statement_end();
    }

    fn if_statement(&mut self) {
        self.consume(&TokenKind::LeftParen, "expected '(' after 'if'");
        self.skip_newlines();
        self.expression();
        self.skip_newlines();
        self.consume(&TokenKind::RightParen, "expected ')' after condition");
        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.skip_newlines();
        self.statement();
        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);
        self.emit(Op::Pop);
        self.skip_newlines();
        if self.matches(&TokenKind::Else) {
            self.skip_newlines();
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.frame().code.len();
        self.frame().loops.push(LoopState { start: loop_start, body_depth: self.frame().scope_depth, break_jumps: Vec::new() });
        self.consume(&TokenKind::LeftParen, "expected '(' after 'while'");
        self.skip_newlines();
        self.expression();
        self.skip_newlines();
        self.consume(&TokenKind::RightParen, "expected ')' after condition");
        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);
        self.skip_newlines();
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit(Op::Pop);
        let loop_state = self.frame().loops.pop().unwrap();
        for j in loop_state.break_jumps {
            self.patch_jump(j);
        }
    }

    /// `for (x in expr) body` desugars to a `while` loop driven by the
    /// iterable's `iterate`/`iteratorValue` methods.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(&TokenKind::LeftParen, "expected '(' after 'for'");
        self.consume(&TokenKind::Ident(String::new()), "expected loop variable name");
        let TokenKind::Ident(var_name) = self.previous.kind.clone() else { return };
        self.consume(&TokenKind::In, "expected 'in' in for-loop");
        self.skip_newlines();
        self.expression();
        self.skip_newlines();
        self.consume(&TokenKind::RightParen, "expected ')' after iterable expression");
        // hidden local: the sequence being iterated
        self.add_local(" seq");
        self.emit(Op::Null);
        self.add_local(" iter"); // iterator state, starts null

        let loop_start = self.frame().code.len();
        self.frame().loops.push(LoopState { start: loop_start, body_depth: self.frame().scope_depth, break_jumps: Vec::new() });

        // seq.iterate(iter) -> iter
        self.emit_load_local(self.frame().locals.len() - 2);
        self.emit_load_local(self.frame().locals.len() - 1);
        self.emit_method_call_known("iterate(_)", 1);
        let iter_slot = self.frame().locals.len() - 1;
        self.emit(Op::StoreLocal);
        self.emit_u8(iter_slot as u8);
        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);

        self.begin_scope();
        self.emit_load_local(self.frame().locals.len() - 2);
        self.emit_load_local(iter_slot);
        self.emit_method_call_known("iteratorValue(_)", 1);
        self.add_local(&var_name);
        self.skip_newlines();
        self.statement();
        self.end_scope();

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit(Op::Pop);
        let loop_state = self.frame().loops.pop().unwrap();
        for j in loop_state.break_jumps {
            self.patch_jump(j);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.check(&TokenKind::Newline) || self.check(&TokenKind::Semicolon) || self.check(&TokenKind::RightBrace) {
            self.emit(Op::Null);
        } else {
            self.expression();
        }
        self.emit(Op::Return);
        self.consume_statement_end();
    }

    fn break_statement(&mut self) {
        if self.frame().loops.is_empty() {
            self.error("'break' used outside of a loop");
            return;
        }
        let body_depth = self.frame().loops.last().unwrap().body_depth;
        self.close_locals_above(body_depth);
        let jump = self.emit_jump(Op::Jump);
        self.frame().loops.last_mut().unwrap().break_jumps.push(jump);
        self.consume_statement_end();
    }

    fn continue_statement(&mut self) {
        if self.frame().loops.is_empty() {
            self.error("'continue' used outside of a loop");
            return;
        }
        let (start, body_depth) = {
            let l = self.frame().loops.last().unwrap();
            (l.start, l.body_depth)
        };
        self.close_locals_above(body_depth);
        self.emit_loop(start);
        self.consume_statement_end();
    }

    /// Pops/closes every local declared deeper than `depth`, without
    /// altering the frame's persistent scope bookkeeping — used by
    /// `break`/`continue` to unwind the stack across scopes they jump out
    /// of.
    fn close_locals_above(&mut self, depth: i32) {
        let count = self.frame().locals.iter().rev().take_while(|l| l.depth > depth).count();
        for i in 0..count {
            let idx = self.frame().locals.len() - 1 - i;
            if self.frame().locals[idx].is_captured {
                self.emit(Op::CloseUpvalue);
            } else {
                self.emit(Op::Pop);
            }
        }
    }

    // -- classes ----------------------------------------------------------

    fn class_declaration(&mut self, is_foreign: bool) {
        self.consume(&TokenKind::Ident(String::new()), "expected class name");
        let TokenKind::Ident(name) = self.previous.kind.clone() else { return };

        let name_bytes = name.clone().into_bytes();
        let name_obj = self.intern_string(&name_bytes);
        self.emit_constant(Value::Obj(name_obj), ConstKey::Str(name_bytes));

        let superclass_name = if self.matches(&TokenKind::Is) {
            self.consume(&TokenKind::Ident(String::new()), "expected superclass name");
            let TokenKind::Ident(super_name) = self.previous.kind.clone() else { return };
            Some(super_name)
        } else {
            None
        };
        let load_superclass = |c: &mut Self| match &superclass_name {
            Some(n) => c.load_variable(n),
            None => c.load_or_declare_module_var("Object"),
        };
        // Load it once to seed the hidden "super" local every method of
        // this class closes over for `super.foo(...)` dispatch, then again
        // as `Class`/`ForeignClass`'s consumable operand.
        load_superclass(self);
        self.add_local(" super");
        load_superclass(self);

        let class_frame_index = self.frames.len() - 1;
        self.classes.push(ClassState {
            fields: SymbolTable::new(),
            static_field_locals: HashMap::new(),
            class_frame_index,
            is_foreign,
            name: name.clone(),
        });

        let field_count_at = if is_foreign {
            self.emit(Op::ForeignClass);
            None
        } else {
            // Field count is patched in once the body has been scanned.
            self.emit(Op::Class);
            let pos = self.frame().code.len();
            self.emit_u8(0);
            Some(pos)
        };

        self.skip_newlines();
        self.consume(&TokenKind::LeftBrace, "expected '{' to open class body");
        self.skip_newlines();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.method_declaration();
            self.skip_newlines();
        }
        self.consume(&TokenKind::RightBrace, "expected '}' to close class body");

        self.emit(Op::EndClass);
        self.define_variable(&name);

        let class = self.classes.pop().unwrap();
        if !is_foreign {
            let num_fields = class.fields.len();
            // Patch the field-count operand now that the body is fully
            // scanned (the operand is a single byte, so 255 fields is the
            // hard ceiling).
            if num_fields > crate::object::ObjClass::MAX_FIELDS as usize {
                self.error("too many fields in one class (max 255)");
            }
            if let Some(pos) = field_count_at {
                self.frame().code.patch_byte(pos, num_fields as u8);
            }
        }
    }

    fn method_declaration(&mut self) {
        let is_static = self.matches(&TokenKind::Static);
        let is_foreign_method = self.matches(&TokenKind::Foreign);
        if self.matches(&TokenKind::Construct) {
            self.finish_method(true, false, is_foreign_method);
            return;
        }
        self.finish_method(false, is_static, is_foreign_method);
    }

    fn finish_method(&mut self, is_construct: bool, is_static: bool, is_foreign: bool) {
        let (name, sig_kind) = self.method_name_and_kind();
        let (params, sig) = self.parse_method_signature(&name, sig_kind);

        if is_foreign {
            self.consume_statement_end();
            let sig_bytes = sig.clone().into_bytes();
            let sig_obj = self.intern_string(&sig_bytes);
            self.emit_constant(Value::Obj(sig_obj), ConstKey::Str(sig_bytes));
            let symbol = self.method_names.intern(&sig) as u16;
            self.emit(if is_static { Op::MethodStatic } else { Op::MethodInstance });
            self.emit_u16(symbol);
            return;
        }

        self.frames.push(FnFrame::new(sig.clone(), true));
        self.frame().arity = params.len() as u8;
        for p in &params {
            self.declare_local(p);
        }
        self.skip_newlines();
        self.consume(&TokenKind::LeftBrace, "expected '{' to open method body");
        // No `begin_scope`/`end_scope` around the whole body: `RETURN`
        // already closes every open upvalue and truncates the entire frame
        // back to `stack_start` (see `vm.rs::return_from_frame`), so
        // per-scope `Pop`/`CLOSE_UPVALUE` bookkeeping here would be not
        // only redundant but wrong — it would run *after* the implicit
        // return value below and pop that instead of a local.
        let has_value = self.function_body(&TokenKind::RightBrace);
        self.consume(&TokenKind::RightBrace, "expected '}' to close method body");

        let arity = self.frame().arity;
        if is_construct {
            // A construct body's own trailing expression (if any) is
            // discarded: the factory wrapper below always reuses `this`
            // as the constructed instance.
            if has_value {
                self.emit(Op::Pop);
            }
            self.emit_load_local(0);
        } else if !has_value {
            self.emit(Op::Null);
        }
        self.emit(Op::Return);

        let frame = self.frames.pop().unwrap();
        let symbol = self.method_names.intern(&sig) as u16;
        if is_construct {
            self.emit_closure(frame);
            let init_symbol = self.method_names.intern(&format!("init {}", sig)) as u16;
            self.emit(Op::MethodInstance);
            self.emit_u16(init_symbol);
            self.emit_constructor_factory(&sig, init_symbol, arity);
            let ctor_symbol = self.method_names.intern(&sig) as u16;
            self.emit(Op::MethodStatic);
            self.emit_u16(ctor_symbol);
        } else {
            self.emit_closure(frame);
            self.emit(if is_static { Op::MethodStatic } else { Op::MethodInstance });
            self.emit_u16(symbol);
        }
    }

    /// Compiles the statements of a function/method/block body up to (but
    /// not including) `terminator`. Mirrors the source language's block
    /// sugar: if the body's last element is a bare expression with no
    /// statement terminator before `terminator`, that expression's value is
    /// left on the stack as an implicit return value (this fn returns
    /// `true`); otherwise nothing is left on the stack and the caller must
    /// push its own default (`null`, or `this` for a constructor).
    fn function_body(&mut self, terminator: &TokenKind) -> bool {
        self.skip_newlines();
        loop {
            if self.check(terminator) || self.check(&TokenKind::Eof) {
                return false;
            }
            if self.starts_block_level_statement() {
                self.declaration();
                self.skip_newlines();
                continue;
            }
            self.expression();
            if self.check(terminator) {
                return true;
            }
            self.emit(Op::Pop);
            self.consume_statement_end();
            self.skip_newlines();
        }
    }

    fn starts_block_level_statement(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::Var
                | TokenKind::Class
                | TokenKind::Foreign
                | TokenKind::Import
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::LeftBrace
        )
    }

    /// Emits `CLOSURE <fn-const> <per-upvalue (isLocal,index)>*` for a
    /// just-finished frame, in that exact order: the upvalue trailer
    /// follows the opcode and its constant operand.
    fn emit_closure(&mut self, frame: FnFrame) {
        let upvalues = frame.upvalues.clone();
        let fn_obj = self.finish_fn(frame, 0);
        let idx = self.add_constant(ConstKey::Str(format!("__fn_{:p}", fn_obj.as_ptr()).into_bytes()), Value::Obj(fn_obj));
        self.emit(Op::Closure);
        self.emit_u16(idx);
        for uv in upvalues {
            self.emit_u8(if uv.is_local { 1 } else { 0 });
            self.emit_u8(uv.index);
        }
    }

    /// A `{ |params| body }` function literal, as used for `Fn.new`/
    /// `Fiber.new` trailing-block call arguments. The leading `{` has
    /// already been consumed by the caller.
    fn function_literal(&mut self) {
        self.frames.push(FnFrame::new("(fn)", false));
        if self.matches(&TokenKind::Pipe) {
            let params = self.parse_block_param_list();
            self.frame().arity = params.len() as u8;
            for p in &params {
                self.declare_local(&p);
            }
            self.consume(&TokenKind::Pipe, "expected '|' to close block parameter list");
        }
        let has_value = self.function_body(&TokenKind::RightBrace);
        self.consume(&TokenKind::RightBrace, "expected '}' to close block");
        if !has_value {
            self.emit(Op::Null);
        }
        self.emit(Op::Return);
        let frame = self.frames.pop().unwrap();
        self.emit_closure(frame);
    }

    fn parse_block_param_list(&mut self) -> Vec<String> {
        let mut params = Vec::new();
        if !self.check(&TokenKind::Pipe) {
            loop {
                self.consume(&TokenKind::Ident(String::new()), "expected block parameter name");
                if let TokenKind::Ident(n) = self.previous.kind.clone() {
                    if params.len() >= MAX_PARAMS {
                        self.error("too many parameters (max 16)");
                    } else {
                        params.push(n);
                    }
                }
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        params
    }

    fn emit_constructor_factory(&mut self, sig: &str, init_symbol: u16, arity: u8) {
        self.frames.push(FnFrame::new(format!("factory {}", sig), true));
        self.frame().arity = arity;
        for i in 0..arity {
            self.declare_local(&format!(" p{}", i));
        }
        if self.classes.last().map(|c| c.is_foreign).unwrap_or(false) {
            self.emit(Op::ForeignConstruct);
        } else {
            self.emit(Op::Construct);
        }
        let op = Op::from_byte(Op::CALL_FIRST + arity.min(16)).unwrap_or(Op::Call0);
        self.emit(op);
        self.emit_u16(init_symbol);
        self.emit(Op::Return);
        let frame = self.frames.pop().unwrap();
        let idx = self.emit_closure_for_frame(frame);
        self.emit(Op::Closure);
        self.emit_u16(idx);
    }

    fn method_name_and_kind(&mut self) -> (String, MethodSigKind) {
        self.advance();
        match self.previous.kind.clone() {
            TokenKind::Ident(name) => (name, MethodSigKind::Named),
            TokenKind::LeftBracket => (String::new(), MethodSigKind::Subscript),
            TokenKind::Plus => ("+".to_string(), MethodSigKind::Operator),
            TokenKind::Minus => ("-".to_string(), MethodSigKind::OperatorMaybeUnary),
            TokenKind::Star => ("*".to_string(), MethodSigKind::Operator),
            TokenKind::Slash => ("/".to_string(), MethodSigKind::Operator),
            TokenKind::Percent => ("%".to_string(), MethodSigKind::Operator),
            TokenKind::LtLt => ("<<".to_string(), MethodSigKind::Operator),
            TokenKind::GtGt => (">>".to_string(), MethodSigKind::Operator),
            TokenKind::Amp => ("&".to_string(), MethodSigKind::Operator),
            TokenKind::Pipe => ("|".to_string(), MethodSigKind::Operator),
            TokenKind::Caret => ("^".to_string(), MethodSigKind::Operator),
            TokenKind::Tilde => ("~".to_string(), MethodSigKind::OperatorUnary),
            TokenKind::Bang => ("!".to_string(), MethodSigKind::OperatorUnary),
            TokenKind::EqEq => ("==".to_string(), MethodSigKind::Operator),
            TokenKind::BangEq => ("!=".to_string(), MethodSigKind::Operator),
            TokenKind::Lt => ("<".to_string(), MethodSigKind::Operator),
            TokenKind::Gt => (">".to_string(), MethodSigKind::Operator),
            TokenKind::LtEq => ("<=".to_string(), MethodSigKind::Operator),
            TokenKind::GtEq => (">=".to_string(), MethodSigKind::Operator),
            TokenKind::DotDot => ("..".to_string(), MethodSigKind::Operator),
            TokenKind::DotDotDot => ("...".to_string(), MethodSigKind::Operator),
            _ => {
                self.error("expected method name");
                (String::new(), MethodSigKind::Named)
            }
        }
    }

    fn parse_method_signature(&mut self, name: &str, kind: MethodSigKind) -> (Vec<String>, String) {
        match kind {
            MethodSigKind::OperatorUnary => (Vec::new(), name.to_string()),
            MethodSigKind::OperatorMaybeUnary => {
                if self.matches(&TokenKind::LeftParen) {
                    let p = self.parse_param_list();
                    (p.clone(), format!("{}({})", name, p.iter().map(|_| "_").collect::<Vec<_>>().join(",")))
                } else {
                    (Vec::new(), name.to_string())
                }
            }
            MethodSigKind::Operator => {
                self.consume(&TokenKind::LeftParen, "expected '(' after operator method name");
                let p = self.parse_param_list();
                (p.clone(), format!("{}({})", name, p.iter().map(|_| "_").collect::<Vec<_>>().join(",")))
            }
            MethodSigKind::Subscript => {
                let p = self.parse_param_list();
                self.consume(&TokenKind::RightBracket, "expected ']' in subscript method name");
                if self.matches(&TokenKind::Eq) {
                    self.consume(&TokenKind::LeftParen, "expected '(' after subscript setter");
                    let value_param = self.parse_param_list();
                    let all = p.len() + value_param.len();
                    (
                        p.into_iter().chain(value_param).collect(),
                        format!("[{}]=", vec!["_"; all].join(",")),
                    )
                } else {
                    (p.clone(), format!("[{}]", vec!["_"; p.len()].join(",")))
                }
            }
            MethodSigKind::Named => {
                if self.matches(&TokenKind::Eq) {
                    self.consume(&TokenKind::LeftParen, "expected '(' after setter name");
                    let p = self.parse_param_list();
                    self.consume(&TokenKind::RightParen, "expected ')' after setter parameter");
                    (p, format!("{}=(_)", name))
                } else if self.matches(&TokenKind::LeftParen) {
                    let p = self.parse_param_list();
                    self.consume(&TokenKind::RightParen, "expected ')' after parameter list");
                    (p.clone(), format!("{}({})", name, p.iter().map(|_| "_").collect::<Vec<_>>().join(",")))
                } else {
                    (Vec::new(), format!("{}()", name))
                }
            }
        }
    }

    fn parse_param_list(&mut self) -> Vec<String> {
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) && !self.check(&TokenKind::RightBracket) {
            loop {
                self.consume(&TokenKind::Ident(String::new()), "expected parameter name");
                if let TokenKind::Ident(n) = self.previous.kind.clone() {
                    if params.len() >= MAX_PARAMS {
                        self.error("too many parameters (max 16)");
                    } else {
                        params.push(n);
                    }
                }
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        params
    }

    /// Like `finish_fn` + interning the function constant, but leaves
    /// emitting `CLOSURE` to the caller — used by `emit_constructor_factory`,
    /// whose factory frame never resolves an upvalue (it only constructs and
    /// immediately calls `init`), so there is no upvalue trailer to emit.
    fn emit_closure_for_frame(&mut self, frame: FnFrame) -> u16 {
        let fn_obj = self.finish_fn(frame, 0);
        self.add_constant(ConstKey::Str(format!("__fn_{:p}", fn_obj.as_ptr()).into_bytes()), Value::Obj(fn_obj))
    }

    fn finish_fn(&mut self, frame: FnFrame, num_upvalues_override: u16) -> GcRef {
        let max_slots = frame.locals.len().max(1) as u16;
        let data = crate::object::ObjData::Fn(ObjFn {
            code: frame.code.bytes,
            constants: frame.constants.values().to_vec(),
            module: self.module,
            max_slots,
            num_upvalues: if num_upvalues_override > 0 { num_upvalues_override } else { frame.upvalues.len() as u16 },
            arity: frame.arity,
            debug: FnDebug { name: frame.fn_name, lines: frame.code.lines },
        });
        let r = self.heap.allocate(data, None);
        self.heap.pop_temp_root();
        r
    }
}

enum MethodSigKind {
    Named,
    Operator,
    OperatorUnary,
    OperatorMaybeUnary,
    Subscript,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;
    use crate::object::ObjModule;

    fn compile_ok(src: &str) -> GcRef {
        let mut heap = Heap::new(1 << 20, 1 << 20, 50);
        let mut method_names = SymbolTable::new();
        let module = heap.allocate(crate::object::ObjData::Module(ObjModule::new("main")), None);
        match Compiler::compile(&mut heap, &mut method_names, module, src, "main") {
            Ok(f) => f,
            Err(diags) => panic!("compile failed: {:?}", diags.iter().map(|d| &d.message).collect::<Vec<_>>()),
        }
    }

    #[test]
    fn compiles_arithmetic() {
        let f = compile_ok("var x = 1 + 2 * 3\n");
        assert!(f.as_fn().code.len() > 0);
    }

    #[test]
    fn compiles_if_while_for() {
        compile_ok("var i = 0\nwhile (i < 10) {\n  i = i + 1\n}\n");
        compile_ok("for (x in [1, 2, 3]) {\n  System.print(x)\n}\n");
    }

    #[test]
    fn compiles_class_with_fields_and_methods() {
        compile_ok(
            "class Point {\n  construct new(x, y) {\n    _x = x\n    _y = y\n  }\n  x { _x }\n  x=(value) { _x = value }\n}\n",
        );
    }

    #[test]
    fn compiles_interpolated_string() {
        compile_ok("var x = 1\nvar s = \"a%(x)b\"\n");
    }

    #[test]
    fn rejects_break_outside_loop() {
        let mut heap = Heap::new(1 << 20, 1 << 20, 50);
        let mut method_names = SymbolTable::new();
        let module = heap.allocate(crate::object::ObjData::Module(ObjModule::new("main")), None);
        let result = Compiler::compile(&mut heap, &mut method_names, module, "break\n", "main");
        assert!(result.is_err());
    }
}
