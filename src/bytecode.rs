//! Bytecode instruction set.
//!
//! One `#[repr(u8)]` enum, a doc comment per variant spelling out operands
//! and stack effect, one byte per opcode with inline 1-/2-byte operands —
//! a stack machine rather than a register machine, so every operation
//! reads its operands straight off the top of the value stack instead of
//! indexing into a register file.

/// One opcode, one byte, with a fixed operand shape. Big-endian for any
/// 2-byte operand.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// u16 const index -> +1: push `constants[i]`
    Constant = 0,
    /// -> +1: push `null`
    Null = 1,
    /// -> +1: push `false`
    False = 2,
    /// -> +1: push `true`
    True = 3,
    /// -> +1: push stack-slot 0..8 (9 opcodes, one per fixed local slot)
    LoadLocal0 = 4,
    LoadLocal1 = 5,
    LoadLocal2 = 6,
    LoadLocal3 = 7,
    LoadLocal4 = 8,
    LoadLocal5 = 9,
    LoadLocal6 = 10,
    LoadLocal7 = 11,
    LoadLocal8 = 12,
    /// u8 slot -> +1: push stack-slot i
    LoadLocal = 13,
    /// u8 slot -> 0: write top into slot i (no pop)
    StoreLocal = 14,
    /// u8 index -> +1: push closure's upvalue i
    LoadUpvalue = 15,
    /// u8 index -> 0: write top into closure's upvalue i
    StoreUpvalue = 16,
    /// u16 slot -> +1: push module variable i
    LoadModuleVar = 17,
    /// u16 slot -> 0: write top into module variable i
    StoreModuleVar = 18,
    /// u8 field -> +1: push `this.field[i]` (receiver at slot 0)
    LoadFieldThis = 19,
    /// u8 field -> 0: write top into `this.field[i]`
    StoreFieldThis = 20,
    /// u8 field -> -1+1: pop instance, push `instance.field[i]`
    LoadField = 21,
    /// u8 field -> -1: pop instance, write (prior) top into `instance.field[i]`
    StoreField = 22,
    /// -> -1: discard top
    Pop = 23,
    /// u16 method symbol -> -(argc): CALL_0..16, argc = op - Call0
    Call0 = 24,
    Call1 = 25,
    Call2 = 26,
    Call3 = 27,
    Call4 = 28,
    Call5 = 29,
    Call6 = 30,
    Call7 = 31,
    Call8 = 32,
    Call9 = 33,
    Call10 = 34,
    Call11 = 35,
    Call12 = 36,
    Call13 = 37,
    Call14 = 38,
    Call15 = 39,
    Call16 = 40,
    /// u16 method symbol -> -(argc)-1: pops a superclass reference off the
    /// top of the stack first (compiler arranges for it to be there, via
    /// the hidden "super" local every subclass method closes over), then
    /// dispatches the argc+1 window (this+args) below it against that
    /// class's method table: SUPER_0..16
    Super0 = 41,
    Super1 = 42,
    Super2 = 43,
    Super3 = 44,
    Super4 = 45,
    Super5 = 46,
    Super6 = 47,
    Super7 = 48,
    Super8 = 49,
    Super9 = 50,
    Super10 = 51,
    Super11 = 52,
    Super12 = 53,
    Super13 = 54,
    Super14 = 55,
    Super15 = 56,
    Super16 = 57,
    /// u16 offset -> 0: ip += offset
    Jump = 58,
    /// u16 offset -> 0: ip -= offset (back-edge)
    Loop = 59,
    /// u16 offset -> -1: pop, if falsy ip += offset
    JumpIfFalse = 60,
    /// u16 offset -> -1/+0: peek; if falsy, jump (value stays); else pop and fall through (`&&`)
    And = 61,
    /// u16 offset -> -1/+0: peek; if truthy, jump (value stays); else pop and fall through (`||`)
    Or = 62,
    /// -> -1: close the upvalue capturing the top local, then pop it
    CloseUpvalue = 63,
    /// -> 0: pop result, unwind the current frame (may end the fiber)
    Return = 64,
    /// u16 fn-const + per-upvalue (u8 isLocal, u8 index) -> +1: wrap a
    /// function constant into a closure, capturing its upvalues
    Closure = 65,
    /// -> 0: replace slot 0 (class) with a freshly allocated instance
    Construct = 66,
    /// -> 0: like CONSTRUCT, but allocates a foreign instance
    ForeignConstruct = 67,
    /// u8 numFields -> -1: build a class from (name, superclass) on the stack
    Class = 68,
    /// -> -1: like CLASS, but builds a foreign class (no field count operand)
    ForeignClass = 69,
    /// -> -2: consume (attributes, class), store attributes on the class
    EndClass = 70,
    /// u16 method symbol -> -2: define an instance method on the class on top
    MethodInstance = 71,
    /// u16 method symbol -> -2: define a static method (on the metaclass)
    MethodStatic = 72,
    /// u16 module-name const -> +1: run module (or push cached) onto the stack
    ImportModule = 73,
    /// u16 var-name const -> +1: pull a variable from the last-imported module
    ImportVariable = 74,
    /// -> +1: mark the current module done, push `null`
    EndModule = 75,
    /// never executed; compiled-unit terminator / sentinel
    End = 76,
}

impl Op {
    pub const CALL_FIRST: u8 = Op::Call0 as u8;
    pub const CALL_LAST: u8 = Op::Call16 as u8;
    pub const SUPER_FIRST: u8 = Op::Super0 as u8;
    pub const SUPER_LAST: u8 = Op::Super16 as u8;
    pub const LOAD_LOCAL_FIRST: u8 = Op::LoadLocal0 as u8;
    pub const LOAD_LOCAL_LAST: u8 = Op::LoadLocal8 as u8;

    pub fn from_byte(b: u8) -> Option<Op> {
        if b <= Op::End as u8 {
            // SAFETY: `Op` is `#[repr(u8)]` and contiguous from 0..=End.
            Some(unsafe { std::mem::transmute::<u8, Op>(b) })
        } else {
            None
        }
    }

    pub fn is_call(self) -> bool {
        let b = self as u8;
        (Op::CALL_FIRST..=Op::CALL_LAST).contains(&b)
    }

    pub fn is_super_call(self) -> bool {
        let b = self as u8;
        (Op::SUPER_FIRST..=Op::SUPER_LAST).contains(&b)
    }

    /// Argument count for a `CALL_n`/`SUPER_n` opcode: these are grouped in
    /// contiguous runs precisely so the handler can recover the argument
    /// count by subtraction instead of decoding an extra operand byte.
    pub fn call_arg_count(self) -> u8 {
        let b = self as u8;
        if self.is_call() {
            b - Op::CALL_FIRST
        } else if self.is_super_call() {
            b - Op::SUPER_FIRST
        } else {
            0
        }
    }

    /// Number of operand bytes following this opcode (not counting the
    /// opcode byte itself, and not counting `CLOSURE`'s variable-length
    /// upvalue trailer, which callers must special-case).
    pub fn operand_len(self) -> usize {
        use Op::*;
        if self.is_call() || self.is_super_call() {
            return 2;
        }
        match self {
            Constant | LoadModuleVar | StoreModuleVar | Jump | Loop | JumpIfFalse | And | Or | ImportModule
            | ImportVariable | MethodInstance | MethodStatic | Closure => 2,
            LoadLocal | StoreLocal | LoadUpvalue | StoreUpvalue | LoadFieldThis | StoreFieldThis | LoadField
            | StoreField | Class => 1,
            _ => 0,
        }
    }

    /// Static stack effect for opcodes whose effect doesn't depend on a
    /// runtime operand (call/super effects depend on argument count and
    /// are computed by the caller).
    pub fn stack_effect(self) -> i32 {
        use Op::*;
        if self.is_call() {
            return -(self.call_arg_count() as i32);
        }
        if self.is_super_call() {
            return -(self.call_arg_count() as i32) - 1;
        }
        match self {
            Constant | Null | False | True => 1,
            LoadLocal0 | LoadLocal1 | LoadLocal2 | LoadLocal3 | LoadLocal4 | LoadLocal5 | LoadLocal6
            | LoadLocal7 | LoadLocal8 | LoadLocal => 1,
            StoreLocal => 0,
            LoadUpvalue => 1,
            StoreUpvalue => 0,
            LoadModuleVar => 1,
            StoreModuleVar => 0,
            LoadFieldThis => 1,
            StoreFieldThis => 0,
            LoadField => 0, // pop instance, push field value
            StoreField => -1,
            Pop => -1,
            Jump | Loop => 0,
            JumpIfFalse => -1,
            And | Or => 0,
            CloseUpvalue => -1,
            Return => 0,
            Closure => 1,
            Construct | ForeignConstruct => 0,
            Class | ForeignClass => -1,
            EndClass => -2,
            MethodInstance | MethodStatic => -2,
            ImportModule => 1,
            ImportVariable => 1,
            EndModule => 1,
            End => 0,
            Call0 | Call1 | Call2 | Call3 | Call4 | Call5 | Call6 | Call7 | Call8 | Call9 | Call10 | Call11
            | Call12 | Call13 | Call14 | Call15 | Call16 | Super0 | Super1 | Super2 | Super3 | Super4 | Super5
            | Super6 | Super7 | Super8 | Super9 | Super10 | Super11 | Super12 | Super13 | Super14 | Super15
            | Super16 => unreachable!("handled by is_call()/is_super_call() above"),
        }
    }
}
