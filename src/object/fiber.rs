//! `Fiber` — a user-level coroutine.
//!
//! The fiber's value stack is indexed by `usize` offset rather than raw
//! pointer, so a `Vec<Value>` growing never invalidates anything held
//! against it — there's no relocation pass to get right or wrong when the
//! stack reallocates. Call frames (`stack_start`) and open upvalues
//! (`stack_slot`) are both indices for the same reason.

use crate::object::GcRef;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Root,
    Other,
    Try,
}

/// One active call on a fiber.
pub struct CallFrame {
    pub closure: GcRef, // ObjClosure
    pub ip: usize,
    /// Index into the owning fiber's `stack` where this frame's register
    /// window begins; slot 0 of the window is the receiver/closure.
    pub stack_start: usize,
}

pub struct ObjFiber {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Head of the open-upvalue list, sorted by descending `stack_slot`.
    pub open_upvalues: Option<GcRef>, // ObjUpvalue
    pub caller: Option<GcRef>,        // ObjFiber
    pub error: Value,
    pub state: FiberState,
    /// Set once the fiber's entry closure has actually been invoked (as
    /// opposed to merely constructed); `call`/`transfer`/`try` on an
    /// already-started, already-finished fiber is an error.
    pub started: bool,
}

impl ObjFiber {
    pub fn new(entry_closure: GcRef) -> Self {
        let mut stack = Vec::with_capacity(64);
        stack.push(Value::Obj(entry_closure));
        let frames = vec![CallFrame { closure: entry_closure, ip: 0, stack_start: 0 }];
        ObjFiber {
            stack,
            frames,
            open_upvalues: None,
            caller: None,
            error: Value::Null,
            state: FiberState::Other,
            started: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn has_error(&self) -> bool {
        !matches!(self.error, Value::Null)
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    pub fn ensure_stack(&mut self, additional: usize) {
        let needed = self.stack.len() + additional;
        if self.stack.capacity() < needed {
            self.stack.reserve(needed - self.stack.len());
        }
    }

    /// Finds (or creates) the open upvalue capturing `stack_slot`,
    /// inserting it into the descending-address-sorted list. The caller is
    /// responsible for actually allocating a fresh `ObjUpvalue` via the
    /// heap when `None` is returned alongside the correct insertion point;
    /// see `vm.rs::capture_upvalue` for the allocate-then-link sequence.
    pub fn find_open_upvalue(&self, stack_slot: usize) -> Option<GcRef> {
        let mut cur = self.open_upvalues;
        while let Some(uv) = cur {
            match uv.as_upvalue() {
                crate::object::function::ObjUpvalue::Open { stack_slot: slot, next } => {
                    if *slot == stack_slot {
                        return Some(uv);
                    }
                    if *slot < stack_slot {
                        return None; // sorted descending; we've passed it
                    }
                    cur = *next;
                }
                _ => unreachable!("open list only holds open upvalues"),
            }
        }
        None
    }
}
