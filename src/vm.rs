//! The interpreter loop: call frames, fiber scheduling, method dispatch.
//!
//! A `run` method drives a `match` over the current opcode, with a
//! `call_value`-style helper for invoking callables. Calling conventions put
//! the receiver at the start of the argument window on the value stack
//! rather than in dedicated registers, and the VM is a fiber-switching
//! scheduler rather than a single always-running main thread: `call`,
//! `transfer`, and `try` hand control between fibers explicitly instead of
//! running one fiber to completion before starting the next.

use crate::bytecode::Op;
use crate::config::Configuration;
use crate::error::InterpretResult;
use crate::gc::Heap;
use crate::object::class::{Method, MethodKind};
use crate::object::fiber::{CallFrame, FiberState};
use crate::object::{ForeignClassHooks, GcRef, ObjClass, ObjData, ObjFiber, ObjForeign, ObjInstance, ObjModule, ObjString};
use crate::symbol::SymbolTable;
use crate::value::Value;
use std::collections::HashMap;

/// Well-known method symbols resolved once at VM construction, so hot paths
/// (arithmetic fallback, `toString`, GC-visible error propagation) don't
/// re-intern a string every time.
struct WellKnownSymbols {
    to_string: usize,
}

pub struct Vm {
    pub heap: Heap,
    pub method_names: SymbolTable,
    pub modules: HashMap<String, GcRef>,
    pub fiber: Option<GcRef>,
    pub config: Configuration,
    well_known: WellKnownSymbols,
    /// The class every object's metaclass ultimately derives from; used as
    /// the default superclass for new `class` declarations.
    pub object_class: Option<GcRef>,
    pub class_class: Option<GcRef>,
    pub compiling_modules: Vec<GcRef>,
    last_imported: Option<GcRef>,
    api_slots: Vec<Value>,
    api_error: Option<String>,
    /// Set by `switch_to_fiber`/`yield_fiber` when a primitive changes
    /// `self.fiber` out from under the call that's executing; consumed by
    /// `execute_call` to route around pushing a result onto a stack that
    /// may not even be the current fiber's anymore.
    fiber_switch_pending: bool,
}

pub enum FiberSignal {
    Continue,
    Done(Value),
    RuntimeError(Value),
}

impl Vm {
    pub fn new(config: Configuration) -> Self {
        let mut method_names = SymbolTable::new();
        let to_string = method_names.intern("toString()");
        let heap = Heap::new(config.initial_heap_size, config.min_heap_size, config.heap_growth_percent);
        Vm {
            heap,
            method_names,
            modules: HashMap::new(),
            fiber: None,
            config,
            well_known: WellKnownSymbols { to_string },
            object_class: None,
            class_class: None,
            compiling_modules: Vec::new(),
            last_imported: None,
            api_slots: Vec::new(),
            api_error: None,
            fiber_switch_pending: false,
        }
    }

    /// Allocates a heap object, automatically binding `class` when given.
    pub fn alloc(&mut self, data: ObjData, class: Option<GcRef>) -> GcRef {
        let r = self.heap.allocate(data, class);
        self.heap.pop_temp_root();
        r
    }

    pub fn new_string(&mut self, s: &str) -> GcRef {
        let class = self.core_class("String");
        self.alloc(ObjData::String(ObjString::new(s.as_bytes().to_vec())), class)
    }

    pub fn core_class(&self, name: &str) -> Option<GcRef> {
        self.modules.get("core").and_then(|m| {
            let module = m.as_module();
            module.find_variable(name).map(|slot| module.variables[slot]).and_then(|v| v.as_obj())
        })
    }

    // -- module interpretation -------------------------------------------

    pub fn interpret(&mut self, module_name: &str, source: &str) -> InterpretResult {
        let module = self.get_or_create_module(module_name);
        let closure = match self.compile_module(module, module_name, source) {
            Ok(c) => c,
            Err(diags) => {
                for d in diags {
                    (self.config.error_fn)(crate::error::ErrorKind::Compile, module_name, d.line, &d.message);
                }
                return InterpretResult::CompileError;
            }
        };
        let fiber = self.heap.allocate(ObjData::Fiber(ObjFiber::new(closure)), None);
        self.heap.pop_temp_root();
        fiber.as_fiber_mut().state = FiberState::Root;
        self.fiber = Some(fiber);
        self.run()
    }

    /// Looks up a module by name, creating it if needed. Every module other
    /// than `"core"` itself starts out with a copy of `"core"`'s variables
    /// already declared, so `Object`, `List`, `String`, and friends resolve
    /// as the real bootstrap classes rather than silently auto-declaring as
    /// `undefined` the first time a script references them.
    pub(crate) fn get_or_create_module(&mut self, name: &str) -> GcRef {
        if let Some(&m) = self.modules.get(name) {
            return m;
        }
        let module = self.heap.allocate(ObjData::Module(ObjModule::new(name)), None);
        self.heap.pop_temp_root();
        if name != "core" {
            if let Some(&core) = self.modules.get("core") {
                let core_mod = core.as_module();
                let names = core_mod.variable_names.names().to_vec();
                let values = core_mod.variables.clone();
                let module_mut = module.as_module_mut();
                for (n, v) in names.iter().zip(values.iter()) {
                    module_mut.declare_variable(n, *v);
                }
            }
        }
        self.modules.insert(name.to_string(), module);
        module
    }

    fn compile_module(
        &mut self,
        module: GcRef,
        module_name: &str,
        source: &str,
    ) -> Result<GcRef, Vec<crate::error::CompileDiagnostic>> {
        let fn_obj = crate::compiler::Compiler::compile(&mut self.heap, &mut self.method_names, module, source, module_name)?;
        let closure = self.heap.allocate(ObjData::Closure(crate::object::ObjClosure { function: fn_obj, upvalues: Vec::new() }), None);
        self.heap.pop_temp_root();
        Ok(closure)
    }

    // -- main loop --------------------------------------------------------

    fn run(&mut self) -> InterpretResult {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            let Some(fiber_ref) = self.fiber else { return InterpretResult::Success };
            match self.run_fiber(fiber_ref) {
                FiberSignal::Continue => continue,
                FiberSignal::Done(_) => {
                    if self.fiber.is_none() {
                        return InterpretResult::Success;
                    }
                }
                FiberSignal::RuntimeError(err) => {
                    self.print_runtime_error(fiber_ref, err);
                    return InterpretResult::RuntimeError;
                }
            }
        }
    }

    fn print_runtime_error(&mut self, fiber: GcRef, err: Value) {
        let message = self.to_display(err);
        (self.config.error_fn)(crate::error::ErrorKind::Runtime, "", -1, &message);
        for frame in fiber.as_fiber().frames.iter().rev() {
            let f = frame.closure.as_closure().function();
            let line = f.line_for(frame.ip);
            let module_name = &f.module().name;
            (self.config.error_fn)(crate::error::ErrorKind::StackTrace, module_name, line as i32, &f.debug.name);
        }
    }

    fn to_display(&self, v: Value) -> String {
        v.to_display_string()
    }

    /// Runs `fiber` until it yields control back to the scheduler: either
    /// it (and its caller chain up to the root) finish, it hits an
    /// unhandled runtime error, or it explicitly switches to a different
    /// fiber mid-instruction (handled by looping back into `run`).
    fn run_fiber(&mut self, fiber: GcRef) -> FiberSignal {
        loop {
            let f = fiber.as_fiber_mut();
            if f.frames.is_empty() {
                return FiberSignal::Done(f.stack.last().copied().unwrap_or(Value::Null));
            }
            let frame_idx = f.frames.len() - 1;
            let ip = f.frames[frame_idx].ip;
            let closure = f.frames[frame_idx].closure;
            let function = closure.as_closure().function();
            if ip >= function.code.len() {
                return self.return_from_frame(fiber, Value::Null);
            }
            let op = Op::from_byte(function.code[ip]);
            let Some(op) = op else {
                return FiberSignal::RuntimeError(self.runtime_error_value(&format!("invalid opcode at ip {}", ip)));
            };
            f.frames[frame_idx].ip += 1;
            match self.execute(fiber, frame_idx, op) {
                Ok(ControlFlow::Continue) => continue,
                Ok(ControlFlow::Return(v)) => {
                    let sig = self.return_from_frame(fiber, v);
                    if !matches!(sig, FiberSignal::Continue) {
                        return sig;
                    }
                }
                Ok(ControlFlow::SwitchFiber) => return FiberSignal::Continue,
                Err(msg) => {
                    let err = self.runtime_error_value(&msg);
                    match self.propagate_error(fiber, err) {
                        Some(signal) => return signal,
                        None => continue,
                    }
                }
            }
        }
    }

    fn runtime_error_value(&mut self, msg: &str) -> Value {
        Value::Obj(self.new_string(msg))
    }

    /// Unwinds `fiber`'s call stack looking for a `Try`-state ancestor to
    /// hand the error to; if none exists, returns the terminal signal for
    /// the scheduler.
    fn propagate_error(&mut self, fiber: GcRef, err: Value) -> Option<FiberSignal> {
        let f = fiber.as_fiber_mut();
        f.error = err;
        f.frames.clear();
        match f.state {
            FiberState::Try => {
                let caller = f.caller;
                f.state = FiberState::Other;
                if let Some(c) = caller {
                    c.as_fiber_mut().push(err);
                    self.fiber = Some(c);
                    None
                } else {
                    Some(FiberSignal::RuntimeError(err))
                }
            }
            FiberState::Root => Some(FiberSignal::RuntimeError(err)),
            FiberState::Other => {
                let caller = f.caller;
                match caller {
                    Some(c) => {
                        self.fiber = Some(c);
                        None
                    }
                    None => Some(FiberSignal::RuntimeError(err)),
                }
            }
        }
    }

    /// Pops the current frame, pushing `result` for the caller. Returns a
    /// `FiberSignal` only when this was the fiber's last frame (the fiber
    /// is finished and control returns to its caller, or the whole
    /// interpretation is done).
    fn return_from_frame(&mut self, fiber: GcRef, result: Value) -> FiberSignal {
        let f = fiber.as_fiber_mut();
        let finished_frame = f.frames.pop().expect("frame to return from");
        self.close_upvalues(fiber, finished_frame.stack_start);
        f.stack.truncate(finished_frame.stack_start);
        if f.frames.is_empty() {
            let caller = f.caller;
            match caller {
                Some(c) => {
                    c.as_fiber_mut().push(result);
                    self.fiber = Some(c);
                    FiberSignal::Continue
                }
                None => {
                    self.fiber = None;
                    FiberSignal::Done(result)
                }
            }
        } else {
            f.push(result);
            FiberSignal::Continue
        }
    }

    fn close_upvalues(&mut self, fiber: GcRef, from_slot: usize) {
        let f = fiber.as_fiber_mut();
        loop {
            let Some(uv) = f.open_upvalues else { break };
            let slot = uv.as_upvalue().stack_slot().expect("open list holds only open upvalues");
            if slot < from_slot {
                break;
            }
            let value = f.stack[slot];
            let next = match uv.as_upvalue() {
                crate::object::function::ObjUpvalue::Open { next, .. } => *next,
                _ => None,
            };
            *uv.as_upvalue_mut() = crate::object::function::ObjUpvalue::Closed(value);
            f.open_upvalues = next;
        }
    }

    // -- single-instruction execution -------------------------------------

    fn execute(&mut self, fiber: GcRef, frame_idx: usize, op: Op) -> Result<ControlFlow, String> {
        use Op::*;
        macro_rules! f {
            () => {
                fiber.as_fiber_mut()
            };
        }
        macro_rules! read_u8 {
            () => {{
                let ip = f!().frames[frame_idx].ip;
                f!().frames[frame_idx].ip += 1;
                f!().frames[frame_idx].closure.as_closure().function().code[ip]
            }};
        }
        macro_rules! read_u16 {
            () => {{
                let hi = read_u8!() as u16;
                let lo = read_u8!() as u16;
                (hi << 8) | lo
            }};
        }

        if op.is_call() || op.is_super_call() {
            return self.execute_call(fiber, frame_idx, op);
        }

        match op {
            Constant => {
                let idx = read_u16!();
                let v = f!().frames[frame_idx].closure.as_closure().function().constants[idx as usize];
                f!().push(v);
            }
            Null => f!().push(Value::Null),
            False => f!().push(Value::Bool(false)),
            True => f!().push(Value::Bool(true)),
            LoadLocal0 | LoadLocal1 | LoadLocal2 | LoadLocal3 | LoadLocal4 | LoadLocal5 | LoadLocal6 | LoadLocal7 | LoadLocal8 => {
                let slot = (op as u8) - (Op::LoadLocal0 as u8);
                let start = f!().frames[frame_idx].stack_start;
                let v = f!().stack[start + slot as usize];
                f!().push(v);
            }
            LoadLocal => {
                let slot = read_u8!() as usize;
                let start = f!().frames[frame_idx].stack_start;
                let v = f!().stack[start + slot];
                f!().push(v);
            }
            StoreLocal => {
                let slot = read_u8!() as usize;
                let start = f!().frames[frame_idx].stack_start;
                let v = *f!().stack.last().expect("stack non-empty");
                f!().stack[start + slot] = v;
            }
            LoadUpvalue => {
                let idx = read_u8!() as usize;
                let closure = f!().frames[frame_idx].closure;
                let uv = closure.as_closure().upvalues[idx];
                let v = self.read_upvalue(fiber, uv);
                f!().push(v);
            }
            StoreUpvalue => {
                let idx = read_u8!() as usize;
                let closure = f!().frames[frame_idx].closure;
                let uv = closure.as_closure().upvalues[idx];
                let v = *f!().stack.last().expect("stack non-empty");
                self.write_upvalue(fiber, uv, v);
            }
            LoadModuleVar => {
                let idx = read_u16!() as usize;
                let module = f!().frames[frame_idx].closure.as_closure().function().module;
                let v = module.as_module().variables[idx];
                f!().push(v);
            }
            StoreModuleVar => {
                let idx = read_u16!() as usize;
                let module = f!().frames[frame_idx].closure.as_closure().function().module;
                let v = *f!().stack.last().expect("stack non-empty");
                module.as_module_mut().variables[idx] = v;
            }
            LoadFieldThis => {
                let field = read_u8!() as usize;
                let start = f!().frames[frame_idx].stack_start;
                let this = f!().stack[start];
                let v = self.instance_field(this, field)?;
                f!().push(v);
            }
            StoreFieldThis => {
                let field = read_u8!() as usize;
                let start = f!().frames[frame_idx].stack_start;
                let this = f!().stack[start];
                let v = *f!().stack.last().expect("stack non-empty");
                self.set_instance_field(this, field, v)?;
            }
            LoadField => {
                let field = read_u8!() as usize;
                let instance = f!().pop();
                let v = self.instance_field(instance, field)?;
                f!().push(v);
            }
            StoreField => {
                let field = read_u8!() as usize;
                let v = f!().pop();
                let instance = f!().pop();
                self.set_instance_field(instance, field, v)?;
                f!().push(v);
            }
            Pop => {
                f!().pop();
            }
            Jump => {
                let off = read_u16!() as usize;
                f!().frames[frame_idx].ip += off;
            }
            Loop => {
                let off = read_u16!() as usize;
                f!().frames[frame_idx].ip -= off;
            }
            JumpIfFalse => {
                let off = read_u16!() as usize;
                let v = f!().pop();
                if !v.is_truthy() {
                    f!().frames[frame_idx].ip += off;
                }
            }
            And => {
                let off = read_u16!() as usize;
                let v = *f!().stack.last().expect("stack non-empty");
                if !v.is_truthy() {
                    f!().frames[frame_idx].ip += off;
                } else {
                    f!().pop();
                }
            }
            Or => {
                let off = read_u16!() as usize;
                let v = *f!().stack.last().expect("stack non-empty");
                if v.is_truthy() {
                    f!().frames[frame_idx].ip += off;
                } else {
                    f!().pop();
                }
            }
            CloseUpvalue => {
                let top = f!().stack.len() - 1;
                self.close_upvalues(fiber, top);
                f!().pop();
            }
            Return => {
                let v = f!().pop();
                return Ok(ControlFlow::Return(v));
            }
            Closure => {
                let fn_idx = read_u16!();
                let function = f!().frames[frame_idx].closure.as_closure().function().constants[fn_idx as usize];
                let Some(fn_ref) = function.as_obj() else { return Err("CLOSURE constant is not a function".into()) };
                let num_upvalues = fn_ref.as_fn().num_upvalues;
                let mut upvalues = Vec::with_capacity(num_upvalues as usize);
                for _ in 0..num_upvalues {
                    let is_local = read_u8!() != 0;
                    let index = read_u8!();
                    if is_local {
                        let start = f!().frames[frame_idx].stack_start;
                        upvalues.push(self.capture_upvalue(fiber, start + index as usize));
                    } else {
                        let enclosing = f!().frames[frame_idx].closure;
                        upvalues.push(enclosing.as_closure().upvalues[index as usize]);
                    }
                }
                let fn_class = self.core_class("Fn");
                let closure = self.alloc(ObjData::Closure(crate::object::ObjClosure { function: fn_ref, upvalues }), fn_class);
                f!().push(Value::Obj(closure));
            }
            Construct => {
                let start = f!().frames[frame_idx].stack_start;
                let class_val = f!().stack[start];
                let Some(class_ref) = class_val.as_obj() else { return Err("cannot construct from a non-class".into()) };
                let num_fields = class_ref.as_class().num_fields.max(0) as usize;
                let instance = self.alloc(ObjData::Instance(ObjInstance::new(num_fields)), Some(class_ref));
                f!().stack[start] = Value::Obj(instance);
            }
            ForeignConstruct => {
                let start = f!().frames[frame_idx].stack_start;
                let class_val = f!().stack[start];
                let Some(class_ref) = class_val.as_obj() else { return Err("cannot construct from a non-class".into()) };
                let instance = self.alloc(ObjData::Foreign(ObjForeign::new(0)), Some(class_ref));
                f!().stack[start] = Value::Obj(instance);
                let hooks = class_ref.as_class().foreign_hooks;
                if let Some(hooks) = hooks {
                    let args_start = start;
                    let len = f!().stack.len();
                    let mut window = f!().stack[args_start..len].to_vec();
                    (hooks.allocate)(self, &mut window);
                    let n = window.len().min(f!().stack.len() - args_start);
                    f!().stack[args_start..args_start + n].copy_from_slice(&window[..n]);
                }
            }
            Class => {
                let num_fields = read_u8!() as i32;
                self.define_class(fiber, frame_idx, num_fields, false)?;
            }
            ForeignClass => {
                self.define_class(fiber, frame_idx, -1, true)?;
            }
            EndClass => {
                let attributes = f!().pop();
                let class_val = *f!().stack.last().expect("class on stack");
                if let Some(class_ref) = class_val.as_obj() {
                    class_ref.as_class_mut().attributes = attributes;
                }
            }
            MethodInstance | MethodStatic => {
                let symbol = read_u16!() as usize;
                let method_value = f!().pop();
                let class_val = f!().pop();
                f!().push(class_val);
                let Some(class_ref) = class_val.as_obj() else { return Err("method target is not a class".into()) };
                let is_static = matches!(op, MethodStatic);
                let module_name = f!().frames[frame_idx].closure.as_closure().function().module().name.clone();
                let method = self.resolve_compiled_method(&module_name, class_ref, method_value, is_static)?;
                let target = if is_static { self.metaclass_of(class_ref) } else { class_ref };
                target.as_class_mut().methods.set(symbol, method);
            }
            ImportModule => {
                let idx = read_u16!();
                let importer = f!().frames[frame_idx].closure.as_closure().function().module().name.clone();
                let name_val = f!().frames[frame_idx].closure.as_closure().function().constants[idx as usize];
                let module_name = name_val.as_string().unwrap_or("").to_string();
                let module = self.import_module(&importer, &module_name)?;
                self.last_imported = Some(module);
                f!().push(Value::Obj(module));
            }
            ImportVariable => {
                let idx = read_u16!();
                let name_val = f!().frames[frame_idx].closure.as_closure().function().constants[idx as usize];
                let var_name = name_val.as_string().unwrap_or("").to_string();
                let Some(module) = self.last_imported else { return Err("no module currently being imported from".into()) };
                let slot = module.as_module().find_variable(&var_name).ok_or_else(|| {
                    format!("module '{}' has no variable named '{}'", module.as_module().name, var_name)
                })?;
                let v = module.as_module().variables[slot];
                f!().push(v);
            }
            EndModule => {
                f!().push(Value::Null);
            }
            End => return Err("executed sentinel End opcode".into()),
            Call0 | Call1 | Call2 | Call3 | Call4 | Call5 | Call6 | Call7 | Call8 | Call9 | Call10 | Call11 | Call12
            | Call13 | Call14 | Call15 | Call16 | Super0 | Super1 | Super2 | Super3 | Super4 | Super5 | Super6 | Super7
            | Super8 | Super9 | Super10 | Super11 | Super12 | Super13 | Super14 | Super15 | Super16 => {
                unreachable!("handled by is_call()/is_super_call() above")
            }
        }
        Ok(ControlFlow::Continue)
    }

    fn read_upvalue(&self, fiber: GcRef, uv: GcRef) -> Value {
        match uv.as_upvalue() {
            crate::object::function::ObjUpvalue::Open { stack_slot, .. } => fiber.as_fiber().stack[*stack_slot],
            crate::object::function::ObjUpvalue::Closed(v) => *v,
        }
    }

    fn write_upvalue(&self, fiber: GcRef, uv: GcRef, value: Value) {
        match uv.as_upvalue_mut() {
            crate::object::function::ObjUpvalue::Open { stack_slot, .. } => fiber.as_fiber_mut().stack[*stack_slot] = value,
            crate::object::function::ObjUpvalue::Closed(v) => *v = value,
        }
    }

    fn capture_upvalue(&mut self, fiber: GcRef, stack_slot: usize) -> GcRef {
        if let Some(existing) = fiber.as_fiber().find_open_upvalue(stack_slot) {
            return existing;
        }
        let new_uv = self.alloc(ObjData::Upvalue(crate::object::function::ObjUpvalue::new_open(stack_slot)), None);
        let f = fiber.as_fiber_mut();
        let mut cur = f.open_upvalues;
        let mut prev: Option<GcRef> = None;
        while let Some(c) = cur {
            let slot = c.as_upvalue().stack_slot().unwrap();
            if slot < stack_slot {
                break;
            }
            prev = Some(c);
            cur = match c.as_upvalue() {
                crate::object::function::ObjUpvalue::Open { next, .. } => *next,
                _ => None,
            };
        }
        if let crate::object::function::ObjUpvalue::Open { next, .. } = new_uv.as_upvalue_mut() {
            *next = cur;
        }
        match prev {
            Some(p) => {
                if let crate::object::function::ObjUpvalue::Open { next, .. } = p.as_upvalue_mut() {
                    *next = Some(new_uv);
                }
            }
            None => f.open_upvalues = Some(new_uv),
        }
        new_uv
    }

    fn instance_field(&self, v: Value, field: usize) -> Result<Value, String> {
        let Some(r) = v.as_obj() else { return Err("cannot access a field on a non-instance value".into()) };
        match &r.get().data {
            ObjData::Instance(i) => Ok(i.fields.get(field).copied().unwrap_or(Value::Null)),
            _ => Err("cannot access a field on a non-instance value".into()),
        }
    }

    fn set_instance_field(&self, v: Value, field: usize, value: Value) -> Result<(), String> {
        let Some(r) = v.as_obj() else { return Err("cannot access a field on a non-instance value".into()) };
        match &mut r.get_mut().data {
            ObjData::Instance(i) => {
                if field < i.fields.len() {
                    i.fields[field] = value;
                }
                Ok(())
            }
            _ => Err("cannot access a field on a non-instance value".into()),
        }
    }

    fn define_class(&mut self, fiber: GcRef, frame_idx: usize, num_fields: i32, is_foreign: bool) -> Result<(), String> {
        let f = fiber.as_fiber_mut();
        let superclass_val = f.pop();
        let name_val = f.pop();
        let Some(name_ref) = name_val.as_obj() else { return Err("class name is not a string".into()) };
        let superclass_ref = superclass_val.as_obj();
        let inherited_fields = superclass_ref.map(|s| s.as_class().num_fields).unwrap_or(0).max(0);
        let total_fields = if is_foreign { -1 } else { inherited_fields + num_fields };

        let foreign_hooks = if is_foreign {
            let module_name = fiber.as_fiber().frames[frame_idx].closure.as_closure().function().module().name.clone();
            let class_name = name_ref.as_string().as_str().to_string();
            (self.config.bind_foreign_class_fn)(&module_name, &class_name)
        } else {
            None
        };

        let class = self.alloc(
            ObjData::Class(ObjClass {
                superclass: superclass_ref,
                name: name_ref,
                num_fields: total_fields,
                methods: Default::default(),
                attributes: Value::Null,
                foreign_hooks,
                is_metaclass: false,
            }),
            self.class_class,
        );
        if let Some(s) = superclass_ref {
            class.as_class_mut().methods.inherit_from(&s.as_class().methods);
        }
        let metaclass = self.alloc(
            ObjData::Class(ObjClass {
                superclass: self.class_class,
                name: name_ref,
                num_fields: 0,
                methods: Default::default(),
                attributes: Value::Null,
                foreign_hooks: None,
                is_metaclass: true,
            }),
            self.class_class,
        );
        if let (Some(s), true) = (superclass_ref, true) {
            let super_meta = self.metaclass_of(s);
            metaclass.as_class_mut().methods.inherit_from(&super_meta.as_class().methods);
        }
        class.get_mut().class.set(Some(metaclass));
        fiber.as_fiber_mut().push(Value::Obj(class));
        Ok(())
    }

    /// Every class, by construction here, has its metaclass stashed as its
    /// own `Obj` header's `class` field: a class's class is its metaclass.
    fn metaclass_of(&self, class: GcRef) -> GcRef {
        class.get().class.get().unwrap_or(self.class_class.unwrap_or(class))
    }

    /// Interprets the value left on the stack by a `MethodInstance`/
    /// `MethodStatic` preamble: either a `Closure` (a real block method) or
    /// a `String` (a foreign-method placeholder the host binder resolves).
    fn resolve_compiled_method(&mut self, module_name: &str, class: GcRef, method_value: Value, is_static: bool) -> Result<Method, String> {
        if let Some(r) = method_value.as_obj() {
            if r.kind() == crate::object::ObjKind::Closure {
                return Ok(Method { kind: MethodKind::Block(r) });
            }
            if r.kind() == crate::object::ObjKind::String {
                let sig = r.as_string().as_str().to_string();
                let class_name = class.as_class().name.as_string().as_str().to_string();
                let bound = (self.config.bind_foreign_method_fn)(module_name, &class_name, is_static, &sig);
                return match bound {
                    Some(f) => Ok(Method { kind: MethodKind::Foreign(f) }),
                    None => Err(format!("could not find foreign method '{}' for class '{}'", sig, class_name)),
                };
            }
        }
        Err("invalid method definition value".into())
    }

    fn import_module(&mut self, importer: &str, name: &str) -> Result<GcRef, String> {
        if let Some(&m) = self.modules.get(name) {
            return Ok(m);
        }
        let resolved = (self.config.resolve_module_fn)(importer, name).unwrap_or_else(|| name.to_string());
        let source = (self.config.load_module_fn)(&resolved).ok_or_else(|| format!("could not load module '{}'", resolved))?;
        let module = self.get_or_create_module(&resolved);
        let closure = self.compile_module(module, &resolved, &source).map_err(|diags| {
            diags.into_iter().map(|d| d.message).collect::<Vec<_>>().join("; ")
        })?;
        let sub_fiber = self.alloc(ObjData::Fiber(ObjFiber::new(closure)), None);
        let saved = self.fiber;
        self.fiber = Some(sub_fiber);
        let outcome = self.run();
        self.fiber = saved;
        if outcome != InterpretResult::Success {
            return Err(format!("module '{}' failed to run", resolved));
        }
        Ok(module)
    }

    // -- calls --------------------------------------------------------------

    fn execute_call(&mut self, fiber: GcRef, frame_idx: usize, op: Op) -> Result<ControlFlow, String> {
        let argc = op.call_arg_count() as usize;
        let symbol = {
            let ip = fiber.as_fiber().frames[frame_idx].ip;
            let code = &fiber.as_fiber().frames[frame_idx].closure.as_closure().function().code;
            let hi = code[ip] as u16;
            let lo = code[ip + 1] as u16;
            fiber.as_fiber_mut().frames[frame_idx].ip += 2;
            ((hi << 8) | lo) as usize
        };

        let superclass = if op.is_super_call() {
            let v = fiber.as_fiber_mut().pop();
            v.as_obj()
        } else {
            None
        };

        let window_start = fiber.as_fiber().stack.len() - argc - 1;
        let receiver = fiber.as_fiber().stack[window_start];

        let class = match superclass {
            Some(c) => c,
            None => self.class_of(receiver),
        };
        let method = class.as_class().methods.get(symbol);

        match method.kind {
            MethodKind::None => {
                let name = self.method_names.name_of(symbol).unwrap_or("?").to_string();
                Err(format!("{} does not implement '{}'", receiver.type_name(), name))
            }
            MethodKind::Primitive(f) => {
                let len = fiber.as_fiber().stack.len();
                let mut window = fiber.as_fiber().stack[window_start..len].to_vec();
                let ok = f(self, &mut window);
                if self.take_fiber_switch() {
                    // The primitive (Fiber.call/transfer/try/yield) moved
                    // `self.fiber` on; the window we just read is not
                    // necessarily live anymore and there is no result to
                    // push here. Truncate this call's window back off the
                    // fiber it belongs to and let `run_fiber` return to the
                    // scheduler, which re-reads `self.fiber`.
                    fiber.as_fiber_mut().stack.truncate(window_start);
                    return Ok(ControlFlow::SwitchFiber);
                }
                let result = window[0];
                fiber.as_fiber_mut().stack.truncate(window_start);
                if ok {
                    fiber.as_fiber_mut().push(result);
                    Ok(ControlFlow::Continue)
                } else {
                    Err(self.to_display(result))
                }
            }
            MethodKind::Foreign(f) => {
                let len = fiber.as_fiber().stack.len();
                let mut window = fiber.as_fiber().stack[window_start..len].to_vec();
                let ok = f(self, &mut window);
                if self.take_fiber_switch() {
                    fiber.as_fiber_mut().stack.truncate(window_start);
                    return Ok(ControlFlow::SwitchFiber);
                }
                let result = window[0];
                fiber.as_fiber_mut().stack.truncate(window_start);
                if ok {
                    fiber.as_fiber_mut().push(result);
                    Ok(ControlFlow::Continue)
                } else {
                    Err(self.to_display(result))
                }
            }
            MethodKind::FunctionCall => self.call_closure_value(fiber, window_start, receiver),
            MethodKind::Block(closure) => {
                let expected = closure.as_closure().function().arity as usize;
                if expected != argc {
                    return Err(format!("expected {} argument(s), got {}", expected, argc));
                }
                fiber.as_fiber_mut().frames.push(CallFrame { closure, ip: 0, stack_start: window_start });
                Ok(ControlFlow::Continue)
            }
        }
    }

    fn call_closure_value(&mut self, fiber: GcRef, window_start: usize, receiver: Value) -> Result<ControlFlow, String> {
        let Some(r) = receiver.as_obj() else { return Err("can only call a Fn value".into()) };
        if r.kind() != crate::object::ObjKind::Closure {
            return Err("can only call a Fn value".into());
        }
        // The caller's argc need not match the closure's declared arity (a
        // `Fn` can be invoked through any `call()`..`call(_,...,_)` signature
        // up to 16 arguments); pad with `null` or drop extras so the callee's
        // locals land exactly where its own bytecode expects them.
        let arity = r.as_closure().function().arity as usize;
        let want_len = window_start + 1 + arity;
        let f = fiber.as_fiber_mut();
        if f.stack.len() < want_len {
            f.stack.resize(want_len, Value::Null);
        } else {
            f.stack.truncate(want_len);
        }
        f.frames.push(CallFrame { closure: r, ip: 0, stack_start: window_start });
        Ok(ControlFlow::Continue)
    }

    pub fn class_of(&self, v: Value) -> GcRef {
        match v {
            Value::Null => self.core_class("Null").unwrap_or_else(|| self.object_class.unwrap()),
            Value::Bool(_) => self.core_class("Bool").unwrap_or_else(|| self.object_class.unwrap()),
            Value::Num(_) => self.core_class("Num").unwrap_or_else(|| self.object_class.unwrap()),
            Value::Undefined => self.object_class.unwrap(),
            Value::Obj(r) => r.get().class.get().unwrap_or_else(|| self.object_class.unwrap()),
        }
    }

    // -- class construction (Object, Class, and Object's metaclass are
    // created by hand; every other core/script class follows the same
    // shape as `define_class` above, just without a fiber involved) --------

    /// Builds a class + its metaclass, inheriting method tables from
    /// `superclass` (and its metaclass) the same way the `CLASS` opcode does.
    /// Used by `corelib.rs` to construct the built-in classes in Rust rather
    /// than through compiled bytecode.
    pub fn new_native_class(&mut self, name: &str, superclass: Option<GcRef>) -> GcRef {
        let name_ref = self.new_string(name);
        let inherited_fields = superclass.map(|s| s.as_class().num_fields).unwrap_or(0).max(0);
        let class = self.alloc(
            ObjData::Class(ObjClass {
                superclass,
                name: name_ref,
                num_fields: inherited_fields,
                methods: Default::default(),
                attributes: Value::Null,
                foreign_hooks: None,
                is_metaclass: false,
            }),
            self.class_class,
        );
        if let Some(s) = superclass {
            class.as_class_mut().methods.inherit_from(&s.as_class().methods);
        }
        let metaclass = self.alloc(
            ObjData::Class(ObjClass {
                superclass: self.class_class,
                name: name_ref,
                num_fields: 0,
                methods: Default::default(),
                attributes: Value::Null,
                foreign_hooks: None,
                is_metaclass: true,
            }),
            self.class_class,
        );
        match superclass {
            Some(s) => {
                let super_meta = self.metaclass_of(s);
                metaclass.as_class_mut().methods.inherit_from(&super_meta.as_class().methods);
            }
            None => {
                if let Some(cc) = self.class_class {
                    metaclass.as_class_mut().methods.inherit_from(&cc.as_class().methods);
                }
            }
        }
        class.get_mut().class.set(Some(metaclass));
        class
    }

    pub fn metaclass_of_pub(&self, class: GcRef) -> GcRef {
        self.metaclass_of(class)
    }

    /// Binds a Rust-implemented primitive at `sig` on `class`'s instance
    /// method table.
    pub fn bind_primitive(&mut self, class: GcRef, sig: &str, f: crate::object::class::PrimitiveFn) {
        let symbol = self.method_names.intern(sig);
        class.as_class_mut().methods.set(symbol, Method { kind: MethodKind::Primitive(f) });
    }

    /// Binds a Rust-implemented primitive on `class`'s *metaclass* (a
    /// `static` method).
    pub fn bind_static_primitive(&mut self, class: GcRef, sig: &str, f: crate::object::class::PrimitiveFn) {
        let symbol = self.method_names.intern(sig);
        let meta = self.metaclass_of(class);
        meta.as_class_mut().methods.set(symbol, Method { kind: MethodKind::Primitive(f) });
    }

    /// Binds `sig` on `class` to the `FUNCTION_CALL` method kind: dispatch
    /// pushes a new frame for whatever closure is in the receiver slot,
    /// used for `Fn.call(...)`.
    pub fn bind_function_call(&mut self, class: GcRef, sig: &str) {
        let symbol = self.method_names.intern(sig);
        class.as_class_mut().methods.set(symbol, Method { kind: MethodKind::FunctionCall });
    }

    // -- fiber primitives, driven from corelib.rs --------------------------

    /// `Fiber.new(fn)`: allocate a suspended fiber wrapping `closure`.
    pub fn new_fiber(&mut self, closure: GcRef) -> GcRef {
        let class = self.core_class("Fiber");
        self.alloc(ObjData::Fiber(ObjFiber::new(closure)), class)
    }

    /// Implements `call`/`transfer`/`try`: switches the
    /// running fiber to `target`, optionally passing `arg` as the single
    /// value on its stack (entry closures take arity 0 or 1), and records
    /// the caller link unless this is a `transfer`.
    pub fn switch_to_fiber(
        &mut self,
        target: GcRef,
        arg: Option<Value>,
        set_caller: bool,
        mark_try: bool,
    ) -> Result<(), String> {
        {
            let tf = target.as_fiber();
            if tf.is_done() {
                return Err("cannot call a finished fiber".into());
            }
            if matches!(tf.state, FiberState::Root) && tf.started {
                return Err("cannot call a root fiber".into());
            }
        }
        let already_started = target.as_fiber().started;
        if already_started {
            // Resuming a fiber parked inside `Fiber.yield` always needs a
            // value pushed to stand in for that call's result, even when the
            // caller passed none (`call()` resumes with `null`) — the
            // instruction stream after the yield unconditionally expects one
            // value on the stack.
            target.as_fiber_mut().push(arg.unwrap_or(Value::Null));
        } else {
            target.as_fiber_mut().started = true;
            let entry_arity = target.as_fiber().frames[0].closure.as_closure().function().arity;
            if entry_arity == 1 {
                target.as_fiber_mut().push(arg.unwrap_or(Value::Null));
            }
        }
        if set_caller {
            target.as_fiber_mut().caller = self.fiber;
        }
        target.as_fiber_mut().state = if mark_try { FiberState::Try } else { FiberState::Other };
        self.fiber = Some(target);
        self.fiber_switch_pending = true;
        Ok(())
    }

    /// `Fiber.yield()`/`Fiber.yield(value)`: suspend the current fiber and
    /// resume its caller. Returns the caller to resume, or `None` if there
    /// is no caller (the whole interpretation ends).
    pub fn yield_fiber(&mut self, value: Value) -> Option<GcRef> {
        let current = self.fiber?;
        let caller = current.as_fiber().caller;
        current.as_fiber_mut().caller = None;
        current.as_fiber_mut().state = FiberState::Other;
        if let Some(c) = caller {
            c.as_fiber_mut().push(value);
            self.fiber = Some(c);
        } else {
            self.fiber = None;
        }
        self.fiber_switch_pending = true;
        caller
    }

    fn take_fiber_switch(&mut self) -> bool {
        std::mem::replace(&mut self.fiber_switch_pending, false)
    }

    // -- GC integration -----------------------------------------------------

    pub fn collect_garbage(&mut self) {
        let modules = self.modules.clone();
        let fiber = self.fiber;
        let object_class = self.object_class;
        let class_class = self.class_class;
        let api_slots = self.api_slots.clone();
        let last_imported = self.last_imported;
        self.heap.collect(|heap| {
            for (_, m) in modules.iter() {
                heap.mark_object(*m);
            }
            if let Some(f) = fiber {
                heap.mark_object(f);
            }
            if let Some(c) = object_class {
                heap.mark_object(c);
            }
            if let Some(c) = class_class {
                heap.mark_object(c);
            }
            if let Some(m) = last_imported {
                heap.mark_object(m);
            }
            for v in &api_slots {
                heap.mark_value(*v);
            }
        });
    }

    // -- out-of-band method invocation (call handles) ----------------------

    /// Invokes `sig` on `receiver` with `args` and runs it to completion,
    /// independent of whatever fiber (if any) is currently executing. This
    /// is what a host-held call handle (`api.rs`) dispatches through, and
    /// it mirrors `execute_call`'s dispatch exactly, just without a live
    /// instruction stream driving it.
    pub fn invoke(&mut self, sig: &str, receiver: Value, args: &[Value]) -> Result<Value, String> {
        let symbol = self.method_names.get(sig).ok_or_else(|| format!("undefined method '{}'", sig))?;
        let class = self.class_of(receiver);
        let method = class.as_class().methods.get(symbol);
        let mut window = Vec::with_capacity(1 + args.len());
        window.push(receiver);
        window.extend_from_slice(args);
        match method.kind {
            MethodKind::None => Err(format!("{} does not implement '{}'", receiver.type_name(), sig)),
            MethodKind::Primitive(f) => {
                let ok = f(self, &mut window);
                self.take_fiber_switch();
                if ok {
                    Ok(window[0])
                } else {
                    Err(self.to_display(window[0]))
                }
            }
            MethodKind::Foreign(f) => {
                let ok = f(self, &mut window);
                self.take_fiber_switch();
                if ok {
                    Ok(window[0])
                } else {
                    Err(self.to_display(window[0]))
                }
            }
            MethodKind::FunctionCall => {
                let Some(r) = receiver.as_obj() else { return Err("can only call a Fn value".into()) };
                if r.kind() != crate::object::ObjKind::Closure {
                    return Err("can only call a Fn value".into());
                }
                let arity = r.as_closure().function().arity as usize;
                window.resize(1 + arity, Value::Null);
                self.run_closure_to_completion(r, window)
            }
            MethodKind::Block(closure) => {
                let expected = closure.as_closure().function().arity as usize;
                if expected != args.len() {
                    return Err(format!("expected {} argument(s), got {}", expected, args.len()));
                }
                self.run_closure_to_completion(closure, window)
            }
        }
    }

    /// Drives a fresh, caller-less fiber running `closure` with `window`
    /// (receiver at index 0, arguments after) as its initial stack, to
    /// completion, unwinding any unhandled error into `Err`. `pub(crate)`
    /// rather than private: `api.rs`'s call handles drive stub closures
    /// through exactly this path.
    pub(crate) fn run_closure_to_completion(&mut self, closure: GcRef, window: Vec<Value>) -> Result<Value, String> {
        let driver = self.alloc(ObjData::Fiber(ObjFiber::new(closure)), None);
        {
            let f = driver.as_fiber_mut();
            f.stack = window;
            f.started = true;
        }
        let saved = self.fiber;
        self.fiber = Some(driver);
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            match self.run_fiber(driver) {
                FiberSignal::Continue => continue,
                FiberSignal::Done(v) => {
                    self.fiber = saved;
                    return Ok(v);
                }
                FiberSignal::RuntimeError(err) => {
                    self.fiber = saved;
                    return Err(self.to_display(err));
                }
            }
        }
    }

    // -- embedding-facing slot API (see also `api.rs`) ---------------------

    pub fn slots(&mut self) -> &mut Vec<Value> {
        &mut self.api_slots
    }

    pub fn take_api_error(&mut self) -> Option<String> {
        self.api_error.take()
    }

    pub fn set_api_error(&mut self, msg: impl Into<String>) {
        self.api_error = Some(msg.into());
    }
}

enum ControlFlow {
    Continue,
    Return(Value),
    SwitchFiber,
}
