//! Integration tests for the embedding ABI, exercised the way a host
//! application actually would: through `lumen::new_vm` and the `Api`
//! surface, never by reaching into VM internals.

use lumen::object::class::ForeignMethodFn;
use lumen::object::ForeignClassHooks;
use lumen::{new_vm, Configuration, InterpretResult};

fn run(config: Configuration, src: &str) -> InterpretResult {
    let mut vm = new_vm(config);
    vm.interpret("main", src)
}

#[test]
fn call_handle_invokes_instance_method() {
    let mut vm = new_vm(Configuration::default());
    let result = vm.interpret(
        "main",
        "class Greeter {\n  construct new() {}\n  greet(name) { \"hi \" + name }\n}\nvar g = Greeter.new()\n",
    );
    assert_eq!(result, InterpretResult::Success);

    let mut api = vm.api();
    assert!(api.get_variable("main", "g", 0));
    let receiver = api.get_slot_handle(0);
    let handle = api.make_call_handle("greet(_)");

    api.set_slot_handle(0, &receiver);
    api.set_slot_string(1, "world");
    let outcome = api.call(&handle);
    assert_eq!(outcome, InterpretResult::Success);
    assert_eq!(api.get_slot_string(0), Some("hi world"));

    api.release_handle(receiver);
    api.release_call_handle(handle);
}

#[test]
fn call_handle_surfaces_runtime_error() {
    let mut vm = new_vm(Configuration::default());
    let result = vm.interpret(
        "main",
        "class Boom {\n  construct new() {}\n  trigger() { Fiber.abort(\"kaboom\") }\n}\nvar b = Boom.new()\n",
    );
    assert_eq!(result, InterpretResult::Success);

    let mut api = vm.api();
    assert!(api.get_variable("main", "b", 0));
    let receiver = api.get_slot_handle(0);
    let handle = api.make_call_handle("trigger()");

    api.set_slot_handle(0, &receiver);
    let outcome = api.call(&handle);
    assert_eq!(outcome, InterpretResult::RuntimeError);
    assert_eq!(api.take_error().as_deref(), Some("kaboom"));

    api.release_handle(receiver);
    api.release_call_handle(handle);
}

#[test]
fn variable_lookup_distinguishes_missing_module_and_name() {
    let mut vm = new_vm(Configuration::default());
    assert_eq!(vm.interpret("main", "var found = 42\n"), InterpretResult::Success);

    let mut api = vm.api();
    assert!(api.has_module("main"));
    assert!(!api.has_module("nonexistent"));
    assert!(api.has_variable("main", "found"));
    assert!(!api.has_variable("main", "missing"));

    assert!(api.get_variable("main", "found", 0));
    assert_eq!(api.get_slot_double(0), Some(42.0));
    assert!(!api.get_variable("main", "missing", 1));
    assert!(!api.get_variable("nonexistent", "found", 1));
}

#[test]
fn list_and_map_slots_survive_a_round_trip_through_a_script() {
    let mut vm = new_vm(Configuration::default());
    assert_eq!(
        vm.interpret("main", "var items = [1, 2, 3]\nvar table = {\"k\": \"v\"}\n"),
        InterpretResult::Success
    );

    let mut api = vm.api();
    assert!(api.get_variable("main", "items", 0));
    assert_eq!(api.list_count(0), 3);
    api.list_get(0, 1, 1);
    assert_eq!(api.get_slot_double(1), Some(2.0));

    api.set_slot_double(1, 4.0);
    api.list_insert(0, 3, 1);
    assert_eq!(api.list_count(0), 4);

    assert!(api.get_variable("main", "table", 2));
    api.set_slot_string(3, "k");
    assert!(api.map_contains_key(2, 3));
    api.map_get(2, 3, 4);
    assert_eq!(api.get_slot_string(4), Some("v"));
}

// A minimal foreign class binding: a `Counter` whose state lives entirely
// in `ObjForeign::data`, mutated directly the way a `ForeignMethodFn`
// closure-free hook must — foreign methods get `&mut [Value]` with the
// receiver at index 0, not a borrowed `Api`.
const COUNTER_SOURCE: &str = "foreign class Counter {\n  construct new(start) {}\n  foreign increment()\n  foreign value\n}\nvar c = Counter.new(10)\n";

fn counter_allocate(vm: &mut lumen::Vm, args: &mut [lumen::Value]) -> bool {
    let start = args[1].as_num().unwrap_or(0.0) as i64;
    let receiver = args[0].as_obj().expect("receiver must be the foreign instance");
    let _ = vm;
    receiver.as_foreign_mut().data = start.to_le_bytes().to_vec();
    true
}

fn counter_increment(_vm: &mut lumen::Vm, args: &mut [lumen::Value]) -> bool {
    let receiver = args[0].as_obj().expect("receiver must be the foreign instance");
    let data = &mut receiver.as_foreign_mut().data;
    let current = i64::from_le_bytes(data[..8].try_into().unwrap());
    data.copy_from_slice(&(current + 1).to_le_bytes());
    args[0] = lumen::Value::Num((current + 1) as f64);
    true
}

fn counter_value(_vm: &mut lumen::Vm, args: &mut [lumen::Value]) -> bool {
    let receiver = args[0].as_obj().expect("receiver must be the foreign instance");
    let data = &receiver.as_foreign().data;
    let current = i64::from_le_bytes(data[..8].try_into().unwrap());
    args[0] = lumen::Value::Num(current as f64);
    true
}

fn bind_counter_class(_module: &str, class_name: &str) -> Option<ForeignClassHooks> {
    if class_name == "Counter" {
        Some(ForeignClassHooks { allocate: counter_allocate as ForeignMethodFn, finalize: None })
    } else {
        None
    }
}

fn bind_counter_method(_module: &str, class_name: &str, is_static: bool, signature: &str) -> Option<ForeignMethodFn> {
    if class_name != "Counter" || is_static {
        return None;
    }
    match signature {
        "increment()" => Some(counter_increment as ForeignMethodFn),
        "value" => Some(counter_value as ForeignMethodFn),
        _ => None,
    }
}

#[test]
fn foreign_class_allocate_and_methods_operate_on_opaque_bytes() {
    let mut config = Configuration::default();
    config.bind_foreign_class_fn = bind_counter_class;
    config.bind_foreign_method_fn = bind_counter_method;

    let result = run(config, COUNTER_SOURCE);
    assert_eq!(result, InterpretResult::Success);
}

#[test]
fn foreign_class_value_reflects_allocate_and_increment() {
    let mut config = Configuration::default();
    config.bind_foreign_class_fn = bind_counter_class;
    config.bind_foreign_method_fn = bind_counter_method;

    let mut vm = new_vm(config);
    assert_eq!(vm.interpret("main", COUNTER_SOURCE), InterpretResult::Success);
    assert_eq!(vm.interpret("main", "c.increment()\nc.increment()\n"), InterpretResult::Success);

    let mut api = vm.api();
    assert!(api.get_variable("main", "c", 0));
    let handle = api.make_call_handle("value");
    let receiver = api.get_slot_handle(0);
    api.set_slot_handle(0, &receiver);
    let outcome = api.call(&handle);
    assert_eq!(outcome, InterpretResult::Success);
    assert_eq!(api.get_slot_double(0), Some(12.0));

    api.release_handle(receiver);
    api.release_call_handle(handle);
}
