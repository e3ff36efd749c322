//! The embedding ABI: the slot-based boundary a host application uses to
//! exchange values with scripts, plus handles, call handles, and variable
//! lookup.
//!
//! Built entirely on top of surface `vm.rs` and `gc.rs` already expose for
//! this purpose: `Vm::slots` (the `api_slots` window), `Heap::make_handle`/
//! `handle_get`/`release_handle` (already a GC root, see `gc.rs`'s
//! `collect`), and `Vm::invoke`/`run_closure_to_completion` for out-of-band
//! dispatch.

use crate::bytecode::Op;
use crate::error::InterpretResult;
use crate::object::function::FnDebug;
use crate::object::{GcRef, ObjClosure, ObjData, ObjFn, ObjForeign, ObjList, ObjMap, ObjString};
use crate::value::Value;
use crate::vm::Vm;

impl Vm {
    /// Borrows `self` as the slot-based embedding API.
    pub fn api(&mut self) -> Api<'_> {
        Api { vm: self }
    }
}

/// A host-owned, GC-safe reference to a value. Keeps its value alive across
/// collections (it lives in `Heap`'s handle list, which
/// `Vm::collect_garbage` marks every cycle) until released. Does not
/// outlive the `Vm` that created it — there is no way to express that
/// lifetime in the handle's own type without tying every `Handle` to a
/// borrow of the VM, which would defeat the point of a host-held handle, so
/// this is a contract the host must honor.
pub struct Handle(usize);

/// A compiled stub bound to one fixed method signature: `Api::call`
/// re-dispatches that signature against slot 0 with slots `1..=arity` as
/// arguments every time it's invoked.
pub struct CallHandle {
    closure: Handle,
    arity: u8,
}

/// The type currently held in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    Bool,
    Num,
    Foreign,
    List,
    Map,
    Null,
    String,
    Unknown,
}

/// Counts the `_` placeholders in a canonical method signature: this is the
/// call arity regardless of whether the signature is a plain call, a
/// setter, or a subscript — every parameter position is spelled `_` in
/// every signature shape the compiler emits.
fn signature_arity(signature: &str) -> u8 {
    signature.bytes().filter(|&b| b == b'_').count() as u8
}

/// Builds a closure wrapping `CALL_n <symbol> / RETURN / END` — a tiny stub
/// function compiled on the fly. Driving it through
/// `Vm::run_closure_to_completion` with the receiver and arguments already
/// in the initial stack window reproduces exactly the dispatch
/// `execute_call` performs for an ordinary in-script call.
fn build_call_stub(vm: &mut Vm, signature: &str) -> (GcRef, u8) {
    let arity = signature_arity(signature);
    let symbol = vm.method_names.intern(signature) as u16;
    let call_op = Op::from_byte(Op::CALL_FIRST + arity).expect("call handle arity must be <= 16");
    let code = vec![call_op as u8, (symbol >> 8) as u8, (symbol & 0xff) as u8, Op::Return as u8, Op::End as u8];
    let lines = vec![0u32; code.len()];
    let module = *vm.modules.get("core").expect("core module is bootstrapped before any call handle is made");
    let fn_obj = ObjFn {
        code,
        constants: Vec::new(),
        module,
        max_slots: arity as u16 + 1,
        num_upvalues: 0,
        arity,
        debug: FnDebug { name: format!("(call handle '{}')", signature), lines },
    };
    let fn_ref = vm.alloc(ObjData::Fn(fn_obj), None);
    let closure = vm.alloc(ObjData::Closure(ObjClosure { function: fn_ref, upvalues: Vec::new() }), None);
    (closure, arity)
}

/// The slot-based host boundary. Every method indexes into the current
/// fiber-independent argument/return window `Vm::slots` exposes;
/// `ensure_slots` grows that window the way the host is expected to before
/// marshalling arguments.
pub struct Api<'a> {
    vm: &'a mut Vm,
}

impl<'a> Api<'a> {
    // -- slot management ----------------------------------------------------

    /// Grows the slot window to at least `count` slots, filling new ones
    /// with `null`.
    pub fn ensure_slots(&mut self, count: usize) {
        let slots = self.vm.slots();
        if slots.len() < count {
            slots.resize(count, Value::Null);
        }
    }

    pub fn slot_count(&mut self) -> usize {
        self.vm.slots().len()
    }

    fn slot(&mut self, index: usize) -> Value {
        self.vm.slots().get(index).copied().unwrap_or(Value::Null)
    }

    fn set_slot(&mut self, index: usize, value: Value) {
        let slots = self.vm.slots();
        if index >= slots.len() {
            slots.resize(index + 1, Value::Null);
        }
        slots[index] = value;
    }

    pub fn slot_type(&mut self, index: usize) -> SlotType {
        match self.slot(index) {
            Value::Null => SlotType::Null,
            Value::Bool(_) => SlotType::Bool,
            Value::Num(_) => SlotType::Num,
            Value::Undefined => SlotType::Unknown,
            Value::Obj(o) => match o.kind() {
                crate::object::ObjKind::String => SlotType::String,
                crate::object::ObjKind::List => SlotType::List,
                crate::object::ObjKind::Map => SlotType::Map,
                crate::object::ObjKind::Foreign => SlotType::Foreign,
                _ => SlotType::Unknown,
            },
        }
    }

    // -- typed getters/setters -----------------------------------------------

    pub fn set_slot_null(&mut self, index: usize) {
        self.set_slot(index, Value::Null);
    }

    pub fn set_slot_bool(&mut self, index: usize, value: bool) {
        self.set_slot(index, Value::Bool(value));
    }

    pub fn set_slot_double(&mut self, index: usize, value: f64) {
        self.set_slot(index, Value::Num(value));
    }

    pub fn set_slot_string(&mut self, index: usize, value: &str) {
        let r = self.vm.new_string(value);
        self.set_slot(index, Value::Obj(r));
    }

    /// Sets a slot to a string holding arbitrary bytes, not necessarily
    /// valid UTF-8.
    pub fn set_slot_bytes(&mut self, index: usize, bytes: &[u8]) {
        let class = self.vm.core_class("String");
        let r = self.vm.alloc(ObjData::String(ObjString::new(bytes.to_vec())), class);
        self.set_slot(index, Value::Obj(r));
    }

    pub fn get_slot_bool(&mut self, index: usize) -> Option<bool> {
        self.slot(index).as_bool()
    }

    pub fn get_slot_double(&mut self, index: usize) -> Option<f64> {
        self.slot(index).as_num()
    }

    pub fn get_slot_string(&mut self, index: usize) -> Option<&'static str> {
        self.slot(index).as_string()
    }

    pub fn get_slot_bytes(&mut self, index: usize) -> Option<&'static [u8]> {
        match self.slot(index).as_obj() {
            Some(r) if r.kind() == crate::object::ObjKind::String => Some(&r.as_string().bytes),
            _ => None,
        }
    }

    // -- lists ----------------------------------------------------------------

    pub fn set_slot_new_list(&mut self, index: usize) {
        let class = self.vm.core_class("List");
        let r = self.vm.alloc(ObjData::List(ObjList::new()), class);
        self.set_slot(index, Value::Obj(r));
    }

    pub fn list_count(&mut self, list_slot: usize) -> usize {
        match self.slot(list_slot).as_obj() {
            Some(r) if r.kind() == crate::object::ObjKind::List => r.as_list().items.len(),
            _ => 0,
        }
    }

    /// Inserts the value in `element_slot` into the list at `list_slot` at
    /// `index` (clamped to the list's current length, so `index ==
    /// list_count` appends).
    pub fn list_insert(&mut self, list_slot: usize, index: usize, element_slot: usize) {
        let value = self.slot(element_slot);
        if let Some(r) = self.slot(list_slot).as_obj() {
            if r.kind() == crate::object::ObjKind::List {
                let clamped = index.min(r.as_list().items.len());
                r.as_list_mut().insert(clamped, value);
            }
        }
    }

    pub fn list_get(&mut self, list_slot: usize, index: usize, element_slot: usize) {
        let value = match self.slot(list_slot).as_obj() {
            Some(r) if r.kind() == crate::object::ObjKind::List => r.as_list().items.get(index).copied().unwrap_or(Value::Null),
            _ => Value::Null,
        };
        self.set_slot(element_slot, value);
    }

    // -- maps -----------------------------------------------------------------

    pub fn set_slot_new_map(&mut self, index: usize) {
        let class = self.vm.core_class("Map");
        let r = self.vm.alloc(ObjData::Map(ObjMap::new()), class);
        self.set_slot(index, Value::Obj(r));
    }

    pub fn map_count(&mut self, map_slot: usize) -> usize {
        match self.slot(map_slot).as_obj() {
            Some(r) if r.kind() == crate::object::ObjKind::Map => r.as_map().count(),
            _ => 0,
        }
    }

    pub fn map_contains_key(&mut self, map_slot: usize, key_slot: usize) -> bool {
        let key = self.slot(key_slot);
        match self.slot(map_slot).as_obj() {
            Some(r) if r.kind() == crate::object::ObjKind::Map => r.as_map().contains_key(&key),
            _ => false,
        }
    }

    pub fn map_set(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) {
        let key = self.slot(key_slot);
        let value = self.slot(value_slot);
        if let Some(r) = self.slot(map_slot).as_obj() {
            if r.kind() == crate::object::ObjKind::Map {
                r.as_map_mut().insert(key, value);
            }
        }
    }

    pub fn map_get(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) {
        let key = self.slot(key_slot);
        let value = match self.slot(map_slot).as_obj() {
            Some(r) if r.kind() == crate::object::ObjKind::Map => r.as_map().get(&key).unwrap_or(Value::Null),
            _ => Value::Null,
        };
        self.set_slot(value_slot, value);
    }

    pub fn map_remove(&mut self, map_slot: usize, key_slot: usize, removed_slot: usize) {
        let key = self.slot(key_slot);
        let value = match self.slot(map_slot).as_obj() {
            Some(r) if r.kind() == crate::object::ObjKind::Map => r.as_map_mut().remove(&key).unwrap_or(Value::Null),
            _ => Value::Null,
        };
        self.set_slot(removed_slot, value);
    }

    // -- foreign objects --------------------------------------------------------

    /// Allocates a foreign instance of the class in `class_slot` with
    /// `size` opaque bytes and leaves it in `slot`. A foreign class's
    /// `allocate` hook calls this exactly once; it's the `ForeignClassHooks`
    /// callback the host registers through `bind_foreign_class_fn`.
    pub fn set_slot_new_foreign(&mut self, slot: usize, class_slot: usize, size: usize) {
        let Some(class) = self.slot(class_slot).as_obj() else { return };
        let r = self.vm.alloc(ObjData::Foreign(ObjForeign::new(size)), Some(class));
        self.set_slot(slot, Value::Obj(r));
    }

    pub fn get_slot_foreign(&mut self, slot: usize) -> Option<&'static mut [u8]> {
        match self.slot(slot).as_obj() {
            Some(r) if r.kind() == crate::object::ObjKind::Foreign => Some(&mut r.as_foreign_mut().data),
            _ => None,
        }
    }

    // -- handles ----------------------------------------------------------------

    /// Pins the value currently in `slot` behind a [`Handle`] the host may
    /// keep across further VM calls.
    pub fn get_slot_handle(&mut self, slot: usize) -> Handle {
        let v = self.slot(slot);
        Handle(self.vm.heap.make_handle(v))
    }

    pub fn set_slot_handle(&mut self, slot: usize, handle: &Handle) {
        let v = self.vm.heap.handle_get(handle.0);
        self.set_slot(slot, v);
    }

    pub fn release_handle(&mut self, handle: Handle) {
        self.vm.heap.release_handle(handle.0);
    }

    /// Releases a [`CallHandle`]'s underlying handle — a call handle is a
    /// handle too; the host frees them the same way once it no longer needs
    /// to re-invoke that signature.
    pub fn release_call_handle(&mut self, handle: CallHandle) {
        self.vm.heap.release_handle(handle.closure.0);
    }

    // -- call handles -------------------------------------------------------------

    /// Compiles a call handle for `signature`. `signature` must be one of
    /// the five canonical method-signature forms (`name`, `name(_,...)`,
    /// `name=(_)`, `[_,...]`, `[_,...]=(_)`).
    pub fn make_call_handle(&mut self, signature: &str) -> CallHandle {
        let (closure, arity) = build_call_stub(self.vm, signature);
        CallHandle { closure: Handle(self.vm.heap.make_handle(Value::Obj(closure))), arity }
    }

    /// Drives `handle` to completion in the current fiber, with the
    /// receiver in slot 0 and arguments in slots `1..=arity`. The result
    /// (or the error, as a string) is left in slot 0.
    pub fn call(&mut self, handle: &CallHandle) -> InterpretResult {
        let closure = match self.vm.heap.handle_get(handle.closure.0).as_obj() {
            Some(c) => c,
            None => {
                self.vm.set_api_error("call handle does not hold a closure");
                return InterpretResult::RuntimeError;
            }
        };
        let window: Vec<Value> = (0..=handle.arity as usize).map(|i| self.slot(i)).collect();
        match self.vm.run_closure_to_completion(closure, window) {
            Ok(result) => {
                self.set_slot(0, result);
                InterpretResult::Success
            }
            Err(msg) => {
                let s = self.vm.new_string(&msg);
                self.vm.set_api_error(msg);
                self.set_slot(0, Value::Obj(s));
                InterpretResult::RuntimeError
            }
        }
    }

    /// The message from the most recent failing [`Api::call`], if any
    /// (cleared once read).
    pub fn take_error(&mut self) -> Option<String> {
        self.vm.take_api_error()
    }

    // -- variable lookup ----------------------------------------------------------

    pub fn has_module(&self, name: &str) -> bool {
        self.vm.modules.contains_key(name)
    }

    pub fn has_variable(&self, module: &str, name: &str) -> bool {
        self.vm.modules.get(module).is_some_and(|m| m.as_module().find_variable(name).is_some())
    }

    /// Resolves `name` in `module` and leaves it in `slot`. Returns whether
    /// the lookup succeeded.
    pub fn get_variable(&mut self, module: &str, name: &str, slot: usize) -> bool {
        let Some(&m) = self.vm.modules.get(module) else { return false };
        let Some(idx) = m.as_module().find_variable(name) else { return false };
        let value = m.as_module().variables[idx];
        self.set_slot(slot, value);
        true
    }

    // -- abort ----------------------------------------------------------------

    /// Copies the value in `slot` into the running fiber's error and hands
    /// control back to the interpreter. A no-op if no fiber is currently
    /// running.
    pub fn abort_fiber(&mut self, slot: usize) {
        let value = self.slot(slot);
        if let Some(fiber) = self.vm.fiber {
            fiber.as_fiber_mut().error = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    fn fresh_vm() -> Vm {
        let mut vm = Vm::new(Configuration::default());
        crate::corelib::init(&mut vm);
        vm
    }

    #[test]
    fn signature_arity_counts_placeholders() {
        assert_eq!(signature_arity("toString()"), 0);
        assert_eq!(signature_arity("call(_)"), 1);
        assert_eq!(signature_arity("call(_,_,_)"), 3);
        assert_eq!(signature_arity("[_]=(_)"), 2);
        assert_eq!(signature_arity("!"), 0);
        assert_eq!(signature_arity("+(_)"), 1);
    }

    #[test]
    fn list_slots_round_trip() {
        let mut vm = fresh_vm();
        let mut api = vm.api();
        api.set_slot_new_list(0);
        api.set_slot_double(1, 1.0);
        api.list_insert(0, 0, 1);
        api.set_slot_double(1, 2.0);
        api.list_insert(0, 1, 1);
        assert_eq!(api.list_count(0), 2);
        api.list_get(0, 0, 2);
        assert_eq!(api.get_slot_double(2), Some(1.0));
        api.list_get(0, 1, 2);
        assert_eq!(api.get_slot_double(2), Some(2.0));
    }

    #[test]
    fn map_slots_round_trip() {
        let mut vm = fresh_vm();
        let mut api = vm.api();
        api.set_slot_new_map(0);
        api.set_slot_string(1, "a");
        api.set_slot_double(2, 42.0);
        api.map_set(0, 1, 2);
        assert_eq!(api.map_count(0), 1);
        assert!(api.map_contains_key(0, 1));
        api.map_get(0, 1, 3);
        assert_eq!(api.get_slot_double(3), Some(42.0));
        api.map_remove(0, 1, 3);
        assert_eq!(api.map_count(0), 0);
    }

    #[test]
    fn handle_keeps_value_alive_across_slot_overwrite() {
        let mut vm = fresh_vm();
        let mut api = vm.api();
        api.set_slot_string(0, "pinned");
        let handle = api.get_slot_handle(0);
        api.set_slot_null(0);
        api.set_slot_handle(1, &handle);
        assert_eq!(api.get_slot_string(1), Some("pinned"));
        api.release_handle(handle);
    }

    #[test]
    fn get_variable_reports_missing_module_and_name() {
        let mut vm = fresh_vm();
        let mut api = vm.api();
        assert!(!api.has_module("nope"));
        assert!(!api.get_variable("nope", "x", 0));
        assert!(api.has_module("core"));
        assert!(!api.has_variable("core", "NoSuchClass"));
    }
}
