//! `Fn` (compiled function prototype), `Closure`, and `Upvalue`.

use crate::object::{GcRef, ObjModule};
use crate::value::Value;

/// Per-instruction debug info: a name for stack traces and a line number
/// per byte offset in `code`.
pub struct FnDebug {
    pub name: String,
    pub lines: Vec<u32>,
}

/// A compiled function prototype. Shared (via `Closure`) across every call,
/// regardless of how many closures capture distinct upvalues over it.
pub struct ObjFn {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub module: GcRef, // ObjModule
    pub max_slots: u16,
    pub num_upvalues: u16,
    pub arity: u8,
    pub debug: FnDebug,
}

impl ObjFn {
    pub fn module(&self) -> &'static ObjModule {
        self.module.as_module()
    }

    pub fn line_for(&self, ip: usize) -> u32 {
        self.debug.lines.get(ip.saturating_sub(1)).copied().unwrap_or(0)
    }
}

/// Describes where a closure's Nth upvalue comes from at the moment the
/// `CLOSURE` instruction executes.
#[derive(Clone, Copy)]
pub struct UpvalueSpec {
    pub is_local: bool,
    pub index: u8,
}

/// A runtime closure: a function prototype plus the upvalues it captured.
pub struct ObjClosure {
    pub function: GcRef, // ObjFn
    pub upvalues: Vec<GcRef>, // ObjUpvalue
}

impl ObjClosure {
    pub fn function(&self) -> &'static ObjFn {
        self.function.as_fn()
    }
}

/// A shared upvalue cell. Open while the local it closes over is still live
/// on its owning fiber's stack (`stack_slot` points into that stack);
/// closed once that scope exits, at which point the value is copied out
/// into this variant instead.
pub enum ObjUpvalue {
    Open { stack_slot: usize, next: Option<GcRef> },
    Closed(Value),
}

impl ObjUpvalue {
    pub fn new_open(stack_slot: usize) -> Self {
        ObjUpvalue::Open { stack_slot, next: None }
    }

    pub fn stack_slot(&self) -> Option<usize> {
        match self {
            ObjUpvalue::Open { stack_slot, .. } => Some(*stack_slot),
            ObjUpvalue::Closed(_) => None,
        }
    }
}
