//! The built-in class library: `Object`, `Class`, `Bool`, `Null`, `Num`,
//! `String`, `List`, `Map`, `Range`, `Fiber`, `Fn`, `System`.
//!
//! Every primitive is a plain Rust function bound straight into a class's
//! method table at a given signature through
//! `Vm::bind_primitive`/`bind_static_primitive`/`bind_function_call`, which
//! install a [`crate::object::class::PrimitiveFn`] with no intermediate
//! wrapper value needed.
//!
//! `Object`, `Class`, and `Object`'s metaclass have a cyclic class graph —
//! `Object`'s class is `Object metaclass`, `Object metaclass`'s class is
//! `Class`, and `Class`'s class is itself — so they're wired by hand first:
//! all three are allocated with a null class pointer, then the three edges
//! connecting them are patched in one pass before anything else is built.
//! Every other class here is built through
//! [`crate::vm::Vm::new_native_class`], which reproduces the same
//! inherit-then-patch shape the `CLASS` opcode uses at script run time.

use crate::object::{GcRef, ObjClass, ObjData, ObjKind, ObjList, ObjMap, ObjRange, ObjString, MethodTable};
use crate::value::Value;
use crate::vm::Vm;

/// Writes `result` into the receiver slot and signals success.
fn ret(args: &mut [Value], result: Value) -> bool {
    args[0] = result;
    true
}

fn ret_num(args: &mut [Value], n: f64) -> bool {
    ret(args, Value::Num(n))
}

fn ret_bool(args: &mut [Value], b: bool) -> bool {
    ret(args, Value::Bool(b))
}

/// Writes a runtime error into the receiver slot and signals failure, per
/// the convention that a primitive returns `false` on error.
fn runtime_err(vm: &mut Vm, args: &mut [Value], msg: &str) -> bool {
    let s = vm.new_string(msg);
    args[0] = Value::Obj(s);
    false
}

fn declare_core(vm: &mut Vm, name: &str, class: GcRef) {
    let core = *vm.modules.get("core").expect("core module exists by the time classes are declared");
    core.as_module_mut().declare_variable(name, Value::Obj(class));
}

/// Bootstraps the core library into `vm`. Called once, right after
/// `Vm::new`, before any user source is compiled.
pub fn init(vm: &mut Vm) {
    vm.get_or_create_module("core");

    let (object_class, class_class, object_metaclass) = bootstrap_object_and_class(vm);
    bind_object(vm, object_class);
    bind_class(vm, class_class);
    // `object_metaclass` was allocated before `class_class`'s primitives
    // existed to copy down; reconcile it now.
    object_metaclass.as_class_mut().methods.inherit_from(&class_class.as_class().methods);
    declare_core(vm, "Object", object_class);
    declare_core(vm, "Class", class_class);

    let bool_class = vm.new_native_class("Bool", Some(object_class));
    bind_bool(vm, bool_class);
    declare_core(vm, "Bool", bool_class);

    let null_class = vm.new_native_class("Null", Some(object_class));
    bind_null(vm, null_class);
    declare_core(vm, "Null", null_class);

    let num_class = vm.new_native_class("Num", Some(object_class));
    bind_num(vm, num_class);
    declare_core(vm, "Num", num_class);

    let range_class = vm.new_native_class("Range", Some(object_class));
    bind_range(vm, range_class);
    declare_core(vm, "Range", range_class);

    let string_class = vm.new_native_class("String", Some(object_class));
    bind_string(vm, string_class);
    declare_core(vm, "String", string_class);
    // Every string allocated before this point (class names interned during
    // bootstrap) has no class pointer yet; patch them all in one pass.
    vm.heap.patch_string_class(string_class);

    let list_class = vm.new_native_class("List", Some(object_class));
    bind_list(vm, list_class);
    declare_core(vm, "List", list_class);

    let map_class = vm.new_native_class("Map", Some(object_class));
    bind_map(vm, map_class);
    declare_core(vm, "Map", map_class);

    let fn_class = vm.new_native_class("Fn", Some(object_class));
    bind_fn(vm, fn_class);
    declare_core(vm, "Fn", fn_class);

    let fiber_class = vm.new_native_class("Fiber", Some(object_class));
    bind_fiber(vm, fiber_class);
    declare_core(vm, "Fiber", fiber_class);

    let system_class = vm.new_native_class("System", Some(object_class));
    bind_system(vm, system_class);
    declare_core(vm, "System", system_class);
}

/// Hand-builds `Object`, `Class`, and `Object`'s metaclass, wiring the three
/// cyclic edges: `Object`'s class is `Object metaclass`, `Object
/// metaclass`'s class is `Class`, and `Class`'s class is itself.
fn bootstrap_object_and_class(vm: &mut Vm) -> (GcRef, GcRef, GcRef) {
    let object_name = vm.new_string("Object");
    let object_class = vm.alloc(
        ObjData::Class(ObjClass {
            superclass: None,
            name: object_name,
            num_fields: 0,
            methods: MethodTable::default(),
            attributes: Value::Null,
            foreign_hooks: None,
            is_metaclass: false,
        }),
        None,
    );

    let class_name = vm.new_string("Class");
    let class_class = vm.alloc(
        ObjData::Class(ObjClass {
            superclass: Some(object_class),
            name: class_name,
            num_fields: 0,
            methods: MethodTable::default(),
            attributes: Value::Null,
            foreign_hooks: None,
            is_metaclass: false,
        }),
        None,
    );

    let object_meta_name = vm.new_string("Object metaclass");
    let object_metaclass = vm.alloc(
        ObjData::Class(ObjClass {
            superclass: Some(class_class),
            name: object_meta_name,
            num_fields: 0,
            methods: MethodTable::default(),
            attributes: Value::Null,
            foreign_hooks: None,
            is_metaclass: true,
        }),
        None,
    );

    object_class.get().class.set(Some(object_metaclass));
    object_metaclass.get().class.set(Some(class_class));
    class_class.get().class.set(Some(class_class));

    vm.object_class = Some(object_class);
    vm.class_class = Some(class_class);

    (object_class, class_class, object_metaclass)
}

// -- Object ---------------------------------------------------------------

fn object_not(_vm: &mut Vm, args: &mut [Value]) -> bool {
    ret_bool(args, false)
}

fn object_eqeq(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let eq = args[0].equals(&args[1]);
    ret_bool(args, eq)
}

fn object_noteq(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let eq = args[0].equals(&args[1]);
    ret_bool(args, !eq)
}

fn object_is(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(class) = args[1].as_obj() else {
        return runtime_err(vm, args, "right operand of 'is' must be a class");
    };
    if class.kind() != ObjKind::Class {
        return runtime_err(vm, args, "right operand of 'is' must be a class");
    }
    let mut cur = Some(vm.class_of(args[0]));
    while let Some(c) = cur {
        if c == class {
            return ret_bool(args, true);
        }
        cur = c.as_class().superclass;
    }
    ret_bool(args, false)
}

fn object_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = vm.class_of(args[0]);
    let name = class.as_class().name.as_string().as_str().to_string();
    let s = vm.new_string(&format!("instance of {}", name));
    ret(args, Value::Obj(s))
}

fn object_class_of(vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = vm.class_of(args[0]);
    ret(args, Value::Obj(class))
}

fn bind_object(vm: &mut Vm, object_class: GcRef) {
    vm.bind_primitive(object_class, "!", object_not);
    vm.bind_primitive(object_class, "==(_)", object_eqeq);
    vm.bind_primitive(object_class, "!=(_)", object_noteq);
    vm.bind_primitive(object_class, "is(_)", object_is);
    vm.bind_primitive(object_class, "toString()", object_to_string);
    vm.bind_primitive(object_class, "class", object_class_of);
    vm.bind_primitive(object_class, "type()", object_class_of);
}

// -- Class ------------------------------------------------------------------

fn class_name(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = args[0].as_obj().expect("receiver is a class");
    ret(args, Value::Obj(class.as_class().name))
}

fn class_supertype(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = args[0].as_obj().expect("receiver is a class");
    match class.as_class().superclass {
        Some(s) => ret(args, Value::Obj(s)),
        None => ret(args, Value::Null),
    }
}

fn class_to_string(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = args[0].as_obj().expect("receiver is a class");
    ret(args, Value::Obj(class.as_class().name))
}

fn class_attributes(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = args[0].as_obj().expect("receiver is a class");
    ret(args, class.as_class().attributes)
}

fn bind_class(vm: &mut Vm, class_class: GcRef) {
    vm.bind_primitive(class_class, "name()", class_name);
    vm.bind_primitive(class_class, "supertype()", class_supertype);
    vm.bind_primitive(class_class, "toString()", class_to_string);
    vm.bind_primitive(class_class, "attributes()", class_attributes);
}

// -- Bool ---------------------------------------------------------------

fn bool_not(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let b = args[0].as_bool().unwrap_or(false);
    ret_bool(args, !b)
}

fn bool_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let text = args[0].to_display_string();
    let s = vm.new_string(&text);
    ret(args, Value::Obj(s))
}

fn bind_bool(vm: &mut Vm, bool_class: GcRef) {
    vm.bind_primitive(bool_class, "!", bool_not);
    vm.bind_primitive(bool_class, "toString()", bool_to_string);
}

// -- Null ---------------------------------------------------------------

fn null_not(_vm: &mut Vm, args: &mut [Value]) -> bool {
    ret_bool(args, true)
}

fn null_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let s = vm.new_string("null");
    ret(args, Value::Obj(s))
}

fn bind_null(vm: &mut Vm, null_class: GcRef) {
    vm.bind_primitive(null_class, "!", null_not);
    vm.bind_primitive(null_class, "toString()", null_to_string);
}

// -- Num ------------------------------------------------------------------

macro_rules! num_unary_math {
    ($name:ident, $f:expr) => {
        fn $name(_vm: &mut Vm, args: &mut [Value]) -> bool {
            let n = args[0].as_num().expect("receiver is a number");
            ret_num(args, $f(n))
        }
    };
}

num_unary_math!(num_abs, f64::abs);
num_unary_math!(num_ceil, f64::ceil);
num_unary_math!(num_floor, f64::floor);
num_unary_math!(num_round, f64::round);
num_unary_math!(num_truncate, f64::trunc);
num_unary_math!(num_sqrt, f64::sqrt);
num_unary_math!(num_sin, f64::sin);
num_unary_math!(num_cos, f64::cos);
num_unary_math!(num_tan, f64::tan);
num_unary_math!(num_asin, f64::asin);
num_unary_math!(num_acos, f64::acos);
num_unary_math!(num_atan, f64::atan);
num_unary_math!(num_log, f64::ln);
num_unary_math!(num_exp, f64::exp);

fn num_fraction(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let n = args[0].as_num().expect("receiver is a number");
    ret_num(args, n.fract())
}

fn num_sign(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let n = args[0].as_num().expect("receiver is a number");
    ret_num(args, if n > 0.0 { 1.0 } else if n < 0.0 { -1.0 } else { 0.0 })
}

fn num_is_infinity(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let n = args[0].as_num().expect("receiver is a number");
    ret_bool(args, n.is_infinite())
}

fn num_is_nan(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let n = args[0].as_num().expect("receiver is a number");
    ret_bool(args, n.is_nan())
}

fn num_is_integer(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let n = args[0].as_num().expect("receiver is a number");
    ret_bool(args, n.is_finite() && n == n.trunc())
}

macro_rules! num_binary {
    ($name:ident, $op:expr) => {
        fn $name(vm: &mut Vm, args: &mut [Value]) -> bool {
            let a = args[0].as_num().expect("receiver is a number");
            let Some(b) = args[1].as_num() else {
                return runtime_err(vm, args, "right operand must be a number");
            };
            ret_num(args, $op(a, b))
        }
    };
}

num_binary!(num_add, |a: f64, b: f64| a + b);
num_binary!(num_sub, |a: f64, b: f64| a - b);
num_binary!(num_mul, |a: f64, b: f64| a * b);
num_binary!(num_div, |a: f64, b: f64| a / b);
num_binary!(num_mod, |a: f64, b: f64| a % b);
num_binary!(num_min, f64::min);
num_binary!(num_max, f64::max);
num_binary!(num_pow, f64::powf);

macro_rules! num_cmp {
    ($name:ident, $op:tt) => {
        fn $name(vm: &mut Vm, args: &mut [Value]) -> bool {
            let a = args[0].as_num().expect("receiver is a number");
            let Some(b) = args[1].as_num() else {
                return runtime_err(vm, args, "right operand must be a number");
            };
            ret_bool(args, a $op b)
        }
    };
}

num_cmp!(num_lt, <);
num_cmp!(num_gt, >);
num_cmp!(num_le, <=);
num_cmp!(num_ge, >=);

/// Bitwise ops truncate to a 32-bit unsigned integer first, matching the
/// reference implementation's `(uint32_t)` cast before the operation.
fn num_band(vm: &mut Vm, args: &mut [Value]) -> bool {
    let a = args[0].as_num().expect("receiver is a number") as i64 as u32;
    let Some(bn) = args[1].as_num() else { return runtime_err(vm, args, "right operand must be a number") };
    ret_num(args, (a & (bn as i64 as u32)) as f64)
}

fn num_bor(vm: &mut Vm, args: &mut [Value]) -> bool {
    let a = args[0].as_num().expect("receiver is a number") as i64 as u32;
    let Some(bn) = args[1].as_num() else { return runtime_err(vm, args, "right operand must be a number") };
    ret_num(args, (a | (bn as i64 as u32)) as f64)
}

fn num_bxor(vm: &mut Vm, args: &mut [Value]) -> bool {
    let a = args[0].as_num().expect("receiver is a number") as i64 as u32;
    let Some(bn) = args[1].as_num() else { return runtime_err(vm, args, "right operand must be a number") };
    ret_num(args, (a ^ (bn as i64 as u32)) as f64)
}

fn num_shl(vm: &mut Vm, args: &mut [Value]) -> bool {
    let a = args[0].as_num().expect("receiver is a number") as i64 as u32;
    let Some(bn) = args[1].as_num() else { return runtime_err(vm, args, "right operand must be a number") };
    let b = (bn as i64 as u32) & 31;
    ret_num(args, (a << b) as f64)
}

fn num_shr(vm: &mut Vm, args: &mut [Value]) -> bool {
    let a = args[0].as_num().expect("receiver is a number") as i64 as u32;
    let Some(bn) = args[1].as_num() else { return runtime_err(vm, args, "right operand must be a number") };
    let b = (bn as i64 as u32) & 31;
    ret_num(args, (a >> b) as f64)
}

fn num_bnot(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let a = args[0].as_num().expect("receiver is a number") as i64 as u32;
    ret_num(args, (!a) as f64)
}

fn num_neg(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let n = args[0].as_num().expect("receiver is a number");
    ret_num(args, -n)
}

fn num_range_inclusive(vm: &mut Vm, args: &mut [Value]) -> bool {
    let a = args[0].as_num().expect("receiver is a number");
    let Some(b) = args[1].as_num() else { return runtime_err(vm, args, "range endpoint must be a number") };
    let class = vm.core_class("Range");
    let r = vm.alloc(ObjData::Range(ObjRange::new(a, b, true)), class);
    ret(args, Value::Obj(r))
}

fn num_range_exclusive(vm: &mut Vm, args: &mut [Value]) -> bool {
    let a = args[0].as_num().expect("receiver is a number");
    let Some(b) = args[1].as_num() else { return runtime_err(vm, args, "range endpoint must be a number") };
    let class = vm.core_class("Range");
    let r = vm.alloc(ObjData::Range(ObjRange::new(a, b, false)), class);
    ret(args, Value::Obj(r))
}

fn num_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let n = args[0].as_num().expect("receiver is a number");
    let s = vm.new_string(&Value::format_num(n));
    ret(args, Value::Obj(s))
}

fn num_static_pi(_vm: &mut Vm, args: &mut [Value]) -> bool {
    ret_num(args, std::f64::consts::PI)
}

fn num_static_tau(_vm: &mut Vm, args: &mut [Value]) -> bool {
    ret_num(args, std::f64::consts::TAU)
}

fn num_static_infinity(_vm: &mut Vm, args: &mut [Value]) -> bool {
    ret_num(args, f64::INFINITY)
}

fn num_static_nan(_vm: &mut Vm, args: &mut [Value]) -> bool {
    ret_num(args, f64::NAN)
}

fn num_static_largest(_vm: &mut Vm, args: &mut [Value]) -> bool {
    ret_num(args, f64::MAX)
}

fn num_static_smallest(_vm: &mut Vm, args: &mut [Value]) -> bool {
    ret_num(args, f64::MIN_POSITIVE)
}

fn num_static_from_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(s) = args[1].as_string() else { return runtime_err(vm, args, "argument must be a string") };
    match s.trim().parse::<f64>() {
        Ok(n) => ret_num(args, n),
        Err(_) => ret(args, Value::Null),
    }
}

fn bind_num(vm: &mut Vm, num_class: GcRef) {
    vm.bind_primitive(num_class, "+(_)", num_add);
    vm.bind_primitive(num_class, "-(_)", num_sub);
    vm.bind_primitive(num_class, "*(_)", num_mul);
    vm.bind_primitive(num_class, "/(_)", num_div);
    vm.bind_primitive(num_class, "%(_)", num_mod);
    vm.bind_primitive(num_class, "<(_)", num_lt);
    vm.bind_primitive(num_class, ">(_)", num_gt);
    vm.bind_primitive(num_class, "<=(_)", num_le);
    vm.bind_primitive(num_class, ">=(_)", num_ge);
    vm.bind_primitive(num_class, "&(_)", num_band);
    vm.bind_primitive(num_class, "|(_)", num_bor);
    vm.bind_primitive(num_class, "^(_)", num_bxor);
    vm.bind_primitive(num_class, "<<(_)", num_shl);
    vm.bind_primitive(num_class, ">>(_)", num_shr);
    vm.bind_primitive(num_class, "~", num_bnot);
    vm.bind_primitive(num_class, "-", num_neg);
    vm.bind_primitive(num_class, "..(_)", num_range_inclusive);
    vm.bind_primitive(num_class, "...(_)", num_range_exclusive);
    vm.bind_primitive(num_class, "abs()", num_abs);
    vm.bind_primitive(num_class, "ceil()", num_ceil);
    vm.bind_primitive(num_class, "floor()", num_floor);
    vm.bind_primitive(num_class, "round()", num_round);
    vm.bind_primitive(num_class, "truncate()", num_truncate);
    vm.bind_primitive(num_class, "fraction()", num_fraction);
    vm.bind_primitive(num_class, "sign()", num_sign);
    vm.bind_primitive(num_class, "sqrt()", num_sqrt);
    vm.bind_primitive(num_class, "sin()", num_sin);
    vm.bind_primitive(num_class, "cos()", num_cos);
    vm.bind_primitive(num_class, "tan()", num_tan);
    vm.bind_primitive(num_class, "asin()", num_asin);
    vm.bind_primitive(num_class, "acos()", num_acos);
    vm.bind_primitive(num_class, "atan()", num_atan);
    vm.bind_primitive(num_class, "log()", num_log);
    vm.bind_primitive(num_class, "exp()", num_exp);
    vm.bind_primitive(num_class, "isNan()", num_is_nan);
    vm.bind_primitive(num_class, "isInfinity()", num_is_infinity);
    vm.bind_primitive(num_class, "isInteger()", num_is_integer);
    vm.bind_primitive(num_class, "min(_)", num_min);
    vm.bind_primitive(num_class, "max(_)", num_max);
    vm.bind_primitive(num_class, "pow(_)", num_pow);
    vm.bind_primitive(num_class, "toString()", num_to_string);
    vm.bind_static_primitive(num_class, "pi()", num_static_pi);
    vm.bind_static_primitive(num_class, "tau()", num_static_tau);
    vm.bind_static_primitive(num_class, "infinity()", num_static_infinity);
    vm.bind_static_primitive(num_class, "nan()", num_static_nan);
    vm.bind_static_primitive(num_class, "largest()", num_static_largest);
    vm.bind_static_primitive(num_class, "smallest()", num_static_smallest);
    vm.bind_static_primitive(num_class, "fromString(_)", num_static_from_string);
}

// -- Range ------------------------------------------------------------------

fn range_from(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a range");
    ret_num(args, r.as_range().from)
}

fn range_to(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a range");
    ret_num(args, r.as_range().to)
}

fn range_min(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a range");
    ret_num(args, r.as_range().min())
}

fn range_max(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a range");
    ret_num(args, r.as_range().max())
}

fn range_is_inclusive(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a range");
    ret_bool(args, r.as_range().is_inclusive)
}

/// `from` is always yielded first (whether or not the range counts down);
/// an exclusive range whose endpoints are equal yields nothing, while a
/// one-element *inclusive* range yields exactly once.
fn range_iterate(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a range");
    let range = r.as_range();
    let step = if range.from <= range.to { 1.0 } else { -1.0 };
    let next = match args[1] {
        Value::Null => range.from,
        Value::Num(i) => i + step,
        _ => return runtime_err(vm, args, "iterator must be a number or null"),
    };
    let past_end = if step > 0.0 {
        if range.is_inclusive { next > range.to } else { next >= range.to }
    } else if range.is_inclusive {
        next < range.to
    } else {
        next <= range.to
    };
    if past_end {
        ret_bool(args, false)
    } else {
        ret_num(args, next)
    }
}

fn range_iterator_value(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let v = args[1];
    ret(args, v)
}

fn range_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a range");
    let range = r.as_range();
    let op = if range.is_inclusive { ".." } else { "..." };
    let text = format!("{}{}{}", Value::format_num(range.from), op, Value::format_num(range.to));
    let s = vm.new_string(&text);
    ret(args, Value::Obj(s))
}

fn bind_range(vm: &mut Vm, range_class: GcRef) {
    vm.bind_primitive(range_class, "from()", range_from);
    vm.bind_primitive(range_class, "to()", range_to);
    vm.bind_primitive(range_class, "min()", range_min);
    vm.bind_primitive(range_class, "max()", range_max);
    vm.bind_primitive(range_class, "isInclusive()", range_is_inclusive);
    vm.bind_primitive(range_class, "iterate(_)", range_iterate);
    vm.bind_primitive(range_class, "iteratorValue(_)", range_iterator_value);
    vm.bind_primitive(range_class, "toString()", range_to_string);
}

// -- String ---------------------------------------------------------------

fn string_plus(vm: &mut Vm, args: &mut [Value]) -> bool {
    let a = args[0].as_string().expect("receiver is a string");
    let Some(b) = args[1].as_string() else { return runtime_err(vm, args, "right operand must be a string") };
    let mut combined = String::with_capacity(a.len() + b.len());
    combined.push_str(a);
    combined.push_str(b);
    let s = vm.new_string(&combined);
    ret(args, Value::Obj(s))
}

fn string_byte_count(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a string");
    ret_num(args, r.as_string().len_bytes() as f64)
}

/// Resolves a possibly-negative script index against `len`, returning the
/// in-bounds `usize` index or `None`.
fn resolve_index(i: f64, len: usize) -> Option<usize> {
    let idx = i as i64;
    let idx = if idx < 0 { len as i64 + idx } else { idx };
    if idx < 0 || idx as usize >= len {
        None
    } else {
        Some(idx as usize)
    }
}

fn string_byte_at(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a string");
    let Some(i) = args[1].as_num() else { return runtime_err(vm, args, "index must be a number") };
    let bytes = &r.as_string().bytes;
    match resolve_index(i, bytes.len()) {
        Some(idx) => ret_num(args, bytes[idx] as f64),
        None => runtime_err(vm, args, "string index out of bounds"),
    }
}

fn string_subscript(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a string");
    let Some(i) = args[1].as_num() else { return runtime_err(vm, args, "index must be a number") };
    let bytes = &r.as_string().bytes;
    match resolve_index(i, bytes.len()) {
        Some(idx) => {
            let byte = bytes[idx];
            let text = std::str::from_utf8(&[byte]).unwrap_or("\u{FFFD}");
            let s = vm.new_string(text);
            ret(args, Value::Obj(s))
        }
        None => runtime_err(vm, args, "string index out of bounds"),
    }
}

fn string_code_point_at(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a string");
    let Some(i) = args[1].as_num() else { return runtime_err(vm, args, "index must be a number") };
    let s = r.as_string().as_str();
    let idx = i as usize;
    match s.get(idx..).and_then(|rest| rest.chars().next()) {
        Some(c) => ret_num(args, c as u32 as f64),
        None => ret_num(args, -1.0),
    }
}

fn string_contains(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a string");
    let Some(needle) = args[1].as_string() else { return runtime_err(vm, args, "argument must be a string") };
    ret_bool(args, r.as_string().as_str().contains(needle))
}

fn string_ends_with(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a string");
    let Some(suffix) = args[1].as_string() else { return runtime_err(vm, args, "argument must be a string") };
    ret_bool(args, r.as_string().as_str().ends_with(suffix))
}

fn string_starts_with(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a string");
    let Some(prefix) = args[1].as_string() else { return runtime_err(vm, args, "argument must be a string") };
    ret_bool(args, r.as_string().as_str().starts_with(prefix))
}

fn string_index_of(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a string");
    let Some(needle) = args[1].as_string() else { return runtime_err(vm, args, "argument must be a string") };
    match r.as_string().as_str().find(needle) {
        Some(byte_idx) => ret_num(args, byte_idx as f64),
        None => ret_num(args, -1.0),
    }
}

fn string_iterate(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a string");
    let s = r.as_string().as_str();
    let len = s.len();
    match args[1] {
        Value::Null => {
            if len == 0 {
                ret_bool(args, false)
            } else {
                ret_num(args, 0.0)
            }
        }
        Value::Num(i) => {
            let cur = i as usize;
            let Some(c) = s.get(cur..).and_then(|rest| rest.chars().next()) else {
                return runtime_err(vm, args, "invalid string iterator");
            };
            let next = cur + c.len_utf8();
            if next < len {
                ret_num(args, next as f64)
            } else {
                ret_bool(args, false)
            }
        }
        _ => runtime_err(vm, args, "iterator must be a number or null"),
    }
}

fn string_iterator_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a string");
    let Some(i) = args[1].as_num() else { return runtime_err(vm, args, "iterator must be a number") };
    let s = r.as_string().as_str();
    let idx = i as usize;
    match s.get(idx..).and_then(|rest| rest.chars().next()) {
        Some(c) => {
            let mut buf = [0u8; 4];
            let piece = c.encode_utf8(&mut buf);
            let sv = vm.new_string(piece);
            ret(args, Value::Obj(sv))
        }
        None => runtime_err(vm, args, "invalid string iterator"),
    }
}

fn string_iterate_byte(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a string");
    let len = r.as_string().len_bytes();
    match args[1] {
        Value::Null => {
            if len == 0 {
                ret_bool(args, false)
            } else {
                ret_num(args, 0.0)
            }
        }
        Value::Num(i) => {
            let next = i + 1.0;
            if (next as usize) < len {
                ret_num(args, next)
            } else {
                ret_bool(args, false)
            }
        }
        _ => runtime_err(vm, args, "iterator must be a number or null"),
    }
}

fn string_to_string(_vm: &mut Vm, _args: &mut [Value]) -> bool {
    true
}

fn string_dollar(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a string");
    let text = r.as_string().as_str().to_string();
    match (vm.config.dollar_operator_fn)(&text) {
        Some(result) => {
            let obj = vm.new_string(&result);
            ret(args, Value::Obj(obj))
        }
        None => ret(args, Value::Null),
    }
}

fn string_static_from_code_point(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(n) = args[1].as_num() else { return runtime_err(vm, args, "argument must be a number") };
    match char::from_u32(n as u32) {
        Some(c) => {
            let mut buf = [0u8; 4];
            let piece = c.encode_utf8(&mut buf);
            let s = vm.new_string(piece);
            ret(args, Value::Obj(s))
        }
        None => runtime_err(vm, args, "invalid code point"),
    }
}

fn string_static_from_byte(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(n) = args[1].as_num() else { return runtime_err(vm, args, "argument must be a number") };
    let b = n as i64;
    if !(0..=255).contains(&b) {
        return runtime_err(vm, args, "byte value must be between 0 and 255");
    }
    let class = vm.core_class("String");
    let obj = vm.alloc(ObjData::String(ObjString::new(vec![b as u8])), class);
    ret(args, Value::Obj(obj))
}

fn bind_string(vm: &mut Vm, string_class: GcRef) {
    vm.bind_primitive(string_class, "+(_)", string_plus);
    vm.bind_primitive(string_class, "[_]", string_subscript);
    vm.bind_primitive(string_class, "byteAt(_)", string_byte_at);
    vm.bind_primitive(string_class, "byteCount()", string_byte_count);
    vm.bind_primitive(string_class, "codePointAt(_)", string_code_point_at);
    vm.bind_primitive(string_class, "contains(_)", string_contains);
    vm.bind_primitive(string_class, "endsWith(_)", string_ends_with);
    vm.bind_primitive(string_class, "startsWith(_)", string_starts_with);
    vm.bind_primitive(string_class, "indexOf(_)", string_index_of);
    vm.bind_primitive(string_class, "iterate(_)", string_iterate);
    vm.bind_primitive(string_class, "iterateByte(_)", string_iterate_byte);
    vm.bind_primitive(string_class, "iteratorValue(_)", string_iterator_value);
    vm.bind_primitive(string_class, "toString()", string_to_string);
    vm.bind_primitive(string_class, "$", string_dollar);
    vm.bind_static_primitive(string_class, "fromCodePoint(_)", string_static_from_code_point);
    vm.bind_static_primitive(string_class, "fromByte(_)", string_static_from_byte);
}

// -- List ---------------------------------------------------------------

fn list_static_new(vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = vm.core_class("List");
    let l = vm.alloc(ObjData::List(ObjList::new()), class);
    ret(args, Value::Obj(l))
}

fn list_static_filled(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(n) = args[1].as_num() else { return runtime_err(vm, args, "count must be a number") };
    if n < 0.0 {
        return runtime_err(vm, args, "count cannot be negative");
    }
    let fill = args[2];
    let class = vm.core_class("List");
    let l = vm.alloc(ObjData::List(ObjList { items: vec![fill; n as usize] }), class);
    ret(args, Value::Obj(l))
}

/// Appends and returns the receiver, so a chain of list-literal elements
/// keeps dispatching against the same list: a list literal desugars to
/// `List.new()` followed by one `addCore_` call per element.
fn list_add_core(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    let v = args[1];
    r.as_list_mut().items.push(v);
    true
}

fn list_add(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    let v = args[1];
    r.as_list_mut().items.push(v);
    ret(args, v)
}

fn list_clear(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    r.as_list_mut().items.clear();
    ret(args, Value::Null)
}

fn list_count(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    ret_num(args, r.as_list().items.len() as f64)
}

fn list_insert(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    let Some(i) = args[1].as_num() else { return runtime_err(vm, args, "index must be a number") };
    let len = r.as_list().items.len();
    let idx = i as i64;
    let idx = if idx < 0 { len as i64 + idx + 1 } else { idx };
    if idx < 0 || idx as usize > len {
        return runtime_err(vm, args, "index out of bounds");
    }
    let value = args[2];
    r.as_list_mut().insert(idx as usize, value);
    ret(args, value)
}

fn list_remove_at(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    let Some(i) = args[1].as_num() else { return runtime_err(vm, args, "index must be a number") };
    let len = r.as_list().items.len();
    match resolve_index(i, len) {
        Some(idx) => {
            let v = r.as_list_mut().remove_at(idx);
            ret(args, v)
        }
        None => runtime_err(vm, args, "index out of bounds"),
    }
}

fn list_remove(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    let target = args[1];
    match r.as_list().items.iter().position(|v| v.equals(&target)) {
        Some(i) => {
            let v = r.as_list_mut().remove_at(i);
            ret(args, v)
        }
        None => ret(args, Value::Null),
    }
}

fn list_index_of(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    let target = args[1];
    match r.as_list().items.iter().position(|v| v.equals(&target)) {
        Some(i) => ret_num(args, i as f64),
        None => ret_num(args, -1.0),
    }
}

fn list_swap(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    let (Some(a), Some(b)) = (args[1].as_num(), args[2].as_num()) else {
        return runtime_err(vm, args, "indices must be numbers");
    };
    let len = r.as_list().items.len();
    if (a as usize) >= len || (b as usize) >= len {
        return runtime_err(vm, args, "index out of bounds");
    }
    r.as_list_mut().items.swap(a as usize, b as usize);
    ret(args, Value::Null)
}

fn list_subscript_get(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    let Some(i) = args[1].as_num() else { return runtime_err(vm, args, "index must be a number") };
    let len = r.as_list().items.len();
    match resolve_index(i, len) {
        Some(idx) => ret(args, r.as_list().items[idx]),
        None => runtime_err(vm, args, "list index out of bounds"),
    }
}

fn list_subscript_set(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    let Some(i) = args[1].as_num() else { return runtime_err(vm, args, "index must be a number") };
    let len = r.as_list().items.len();
    match resolve_index(i, len) {
        Some(idx) => {
            let value = args[2];
            r.as_list_mut().items[idx] = value;
            ret(args, value)
        }
        None => runtime_err(vm, args, "list index out of bounds"),
    }
}

fn list_iterate(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    let len = r.as_list().items.len();
    match args[1] {
        Value::Null => {
            if len == 0 {
                ret_bool(args, false)
            } else {
                ret_num(args, 0.0)
            }
        }
        Value::Num(i) => {
            let next = i + 1.0;
            if (next as usize) < len {
                ret_num(args, next)
            } else {
                ret_bool(args, false)
            }
        }
        _ => runtime_err(vm, args, "iterator must be a number or null"),
    }
}

fn list_iterator_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    let Some(i) = args[1].as_num() else { return runtime_err(vm, args, "iterator must be a number") };
    match r.as_list().items.get(i as usize) {
        Some(&v) => ret(args, v),
        None => runtime_err(vm, args, "invalid list iterator"),
    }
}

/// Gives `System.print` on a list something better to show than `Object`'s
/// default `instance of List` — renders each element with its own
/// `toString()` and joins them Lumen-literal-style.
fn list_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a list");
    let items = r.as_list().items.clone();
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match vm.invoke("toString()", item, &[]) {
            Ok(s) => parts.push(s.to_display_string()),
            Err(e) => return runtime_err(vm, args, &e),
        }
    }
    let s = vm.new_string(&format!("[{}]", parts.join(", ")));
    ret(args, Value::Obj(s))
}

fn bind_list(vm: &mut Vm, list_class: GcRef) {
    vm.bind_primitive(list_class, "[_]", list_subscript_get);
    vm.bind_primitive(list_class, "[_,_]=", list_subscript_set);
    vm.bind_primitive(list_class, "add(_)", list_add);
    vm.bind_primitive(list_class, "addCore_(_)", list_add_core);
    vm.bind_primitive(list_class, "clear()", list_clear);
    vm.bind_primitive(list_class, "count()", list_count);
    vm.bind_primitive(list_class, "insert(_,_)", list_insert);
    vm.bind_primitive(list_class, "iterate(_)", list_iterate);
    vm.bind_primitive(list_class, "iteratorValue(_)", list_iterator_value);
    vm.bind_primitive(list_class, "removeAt(_)", list_remove_at);
    vm.bind_primitive(list_class, "remove(_)", list_remove);
    vm.bind_primitive(list_class, "indexOf(_)", list_index_of);
    vm.bind_primitive(list_class, "swap(_,_)", list_swap);
    vm.bind_primitive(list_class, "toString()", list_to_string);
    vm.bind_static_primitive(list_class, "new()", list_static_new);
    vm.bind_static_primitive(list_class, "filled(_,_)", list_static_filled);
}

// -- Map ----------------------------------------------------------------

fn map_static_new(vm: &mut Vm, args: &mut [Value]) -> bool {
    let class = vm.core_class("Map");
    let m = vm.alloc(ObjData::Map(ObjMap::new()), class);
    ret(args, Value::Obj(m))
}

/// Like `List.addCore_`, leaves the receiver (not the inserted value) in
/// the result slot so a chain of `key: value` map-literal pairs keeps
/// dispatching against the same map.
fn map_add_core(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a map");
    let (k, v) = (args[1], args[2]);
    r.as_map_mut().insert(k, v);
    true
}

fn map_subscript_get(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a map");
    match r.as_map().get(&args[1]) {
        Some(v) => ret(args, v),
        None => ret(args, Value::Null),
    }
}

fn map_subscript_set(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a map");
    let value = args[2];
    r.as_map_mut().insert(args[1], value);
    ret(args, value)
}

fn map_clear(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a map");
    r.as_map_mut().clear();
    ret(args, Value::Null)
}

fn map_contains_key(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a map");
    let has = r.as_map().contains_key(&args[1]);
    ret_bool(args, has)
}

fn map_count(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a map");
    ret_num(args, r.as_map().count() as f64)
}

fn map_remove(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a map");
    match r.as_map_mut().remove(&args[1]) {
        Some(v) => ret(args, v),
        None => ret(args, Value::Null),
    }
}

fn map_iterate(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a map");
    if r.as_map().capacity() == 0 {
        return ret_bool(args, false);
    }
    let start = match args[1] {
        Value::Null => 0,
        Value::Num(i) => i as usize + 1,
        _ => return runtime_err(vm, args, "iterator must be a number or null"),
    };
    match r.as_map().next_slot(start) {
        Some(slot) => ret_num(args, slot as f64),
        None => ret_bool(args, false),
    }
}

fn map_key_iterator_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a map");
    let Some(i) = args[1].as_num() else { return runtime_err(vm, args, "iterator must be a number") };
    let (k, _) = r.as_map().entry_at(i as usize);
    ret(args, k)
}

fn map_value_iterator_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a map");
    let Some(i) = args[1].as_num() else { return runtime_err(vm, args, "iterator must be a number") };
    let (_, v) = r.as_map().entry_at(i as usize);
    ret(args, v)
}

fn bind_map(vm: &mut Vm, map_class: GcRef) {
    vm.bind_primitive(map_class, "[_]", map_subscript_get);
    vm.bind_primitive(map_class, "[_,_]=", map_subscript_set);
    vm.bind_primitive(map_class, "addCore_(_,_)", map_add_core);
    vm.bind_primitive(map_class, "clear()", map_clear);
    vm.bind_primitive(map_class, "containsKey(_)", map_contains_key);
    vm.bind_primitive(map_class, "count()", map_count);
    vm.bind_primitive(map_class, "remove(_)", map_remove);
    vm.bind_primitive(map_class, "iterate(_)", map_iterate);
    vm.bind_primitive(map_class, "keyIteratorValue_(_)", map_key_iterator_value);
    vm.bind_primitive(map_class, "valueIteratorValue_(_)", map_value_iterator_value);
    vm.bind_static_primitive(map_class, "new()", map_static_new);
}

// -- Fn -----------------------------------------------------------------

/// `Fn.new { ... }` is compiled as a static call whose sole argument is
/// already the closure the block literal built, tagged with `Fn`'s class by
/// the `CLOSURE` opcode — the static constructor is just identity.
fn fn_static_new(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let block = args[1];
    ret(args, block)
}

fn fn_arity(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a closure");
    ret_num(args, r.as_closure().function().arity as f64)
}

fn fn_to_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let s = vm.new_string("<fn>");
    ret(args, Value::Obj(s))
}

fn bind_fn(vm: &mut Vm, fn_class: GcRef) {
    vm.bind_static_primitive(fn_class, "new(_)", fn_static_new);
    vm.bind_primitive(fn_class, "arity()", fn_arity);
    vm.bind_primitive(fn_class, "toString()", fn_to_string);
    for n in 0..=16usize {
        let sig = if n == 0 { "call()".to_string() } else { format!("call({})", vec!["_"; n].join(",")) };
        vm.bind_function_call(fn_class, &sig);
    }
}

// -- Fiber --------------------------------------------------------------

fn fiber_static_new(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(closure_ref) = args[1].as_obj() else { return runtime_err(vm, args, "argument must be a function") };
    if closure_ref.kind() != ObjKind::Closure {
        return runtime_err(vm, args, "argument must be a function");
    }
    let fiber = vm.new_fiber(closure_ref);
    ret(args, Value::Obj(fiber))
}

fn fiber_static_current(vm: &mut Vm, args: &mut [Value]) -> bool {
    match vm.fiber {
        Some(f) => ret(args, Value::Obj(f)),
        None => ret(args, Value::Null),
    }
}

fn fiber_static_yield_none(vm: &mut Vm, args: &mut [Value]) -> bool {
    vm.yield_fiber(Value::Null);
    let _ = args;
    true
}

fn fiber_static_yield_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let v = args[1];
    vm.yield_fiber(v);
    true
}

fn fiber_static_abort(_vm: &mut Vm, args: &mut [Value]) -> bool {
    args[0] = args[1];
    false
}

fn fiber_call_none(vm: &mut Vm, args: &mut [Value]) -> bool {
    let target = args[0].as_obj().expect("receiver is a fiber");
    match vm.switch_to_fiber(target, None, true, false) {
        Ok(()) => true,
        Err(e) => runtime_err(vm, args, &e),
    }
}

fn fiber_call_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let target = args[0].as_obj().expect("receiver is a fiber");
    let arg = args[1];
    match vm.switch_to_fiber(target, Some(arg), true, false) {
        Ok(()) => true,
        Err(e) => runtime_err(vm, args, &e),
    }
}

fn fiber_transfer_none(vm: &mut Vm, args: &mut [Value]) -> bool {
    let target = args[0].as_obj().expect("receiver is a fiber");
    match vm.switch_to_fiber(target, None, false, false) {
        Ok(()) => true,
        Err(e) => runtime_err(vm, args, &e),
    }
}

fn fiber_transfer_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let target = args[0].as_obj().expect("receiver is a fiber");
    let arg = args[1];
    match vm.switch_to_fiber(target, Some(arg), false, false) {
        Ok(()) => true,
        Err(e) => runtime_err(vm, args, &e),
    }
}

fn fiber_try_none(vm: &mut Vm, args: &mut [Value]) -> bool {
    let target = args[0].as_obj().expect("receiver is a fiber");
    match vm.switch_to_fiber(target, None, true, true) {
        Ok(()) => true,
        Err(e) => runtime_err(vm, args, &e),
    }
}

fn fiber_try_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let target = args[0].as_obj().expect("receiver is a fiber");
    let arg = args[1];
    match vm.switch_to_fiber(target, Some(arg), true, true) {
        Ok(()) => true,
        Err(e) => runtime_err(vm, args, &e),
    }
}

fn fiber_is_done(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a fiber");
    ret_bool(args, r.as_fiber().is_done())
}

fn fiber_error(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let r = args[0].as_obj().expect("receiver is a fiber");
    ret(args, r.as_fiber().error)
}

fn bind_fiber(vm: &mut Vm, fiber_class: GcRef) {
    vm.bind_primitive(fiber_class, "call()", fiber_call_none);
    vm.bind_primitive(fiber_class, "call(_)", fiber_call_value);
    vm.bind_primitive(fiber_class, "transfer()", fiber_transfer_none);
    vm.bind_primitive(fiber_class, "transfer(_)", fiber_transfer_value);
    vm.bind_primitive(fiber_class, "try()", fiber_try_none);
    vm.bind_primitive(fiber_class, "try(_)", fiber_try_value);
    vm.bind_primitive(fiber_class, "isDone()", fiber_is_done);
    vm.bind_primitive(fiber_class, "error()", fiber_error);
    vm.bind_static_primitive(fiber_class, "new(_)", fiber_static_new);
    vm.bind_static_primitive(fiber_class, "current()", fiber_static_current);
    vm.bind_static_primitive(fiber_class, "yield()", fiber_static_yield_none);
    vm.bind_static_primitive(fiber_class, "yield(_)", fiber_static_yield_value);
    vm.bind_static_primitive(fiber_class, "abort(_)", fiber_static_abort);
}

// -- System ---------------------------------------------------------------

fn system_static_write_string(vm: &mut Vm, args: &mut [Value]) -> bool {
    let Some(s) = args[1].as_string() else { return runtime_err(vm, args, "argument must be a string") };
    (vm.config.write_fn)(s);
    let v = args[1];
    ret(args, v)
}

fn system_static_print_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let v = args[1];
    match vm.invoke("toString()", v, &[]) {
        Ok(s) => {
            (vm.config.write_fn)(&s.to_display_string());
            (vm.config.write_fn)("\n");
            ret(args, v)
        }
        Err(e) => runtime_err(vm, args, &e),
    }
}

fn system_static_print_none(vm: &mut Vm, args: &mut [Value]) -> bool {
    (vm.config.write_fn)("\n");
    let _ = args;
    ret(args, Value::Null)
}

fn system_static_write_value(vm: &mut Vm, args: &mut [Value]) -> bool {
    let v = args[1];
    match vm.invoke("toString()", v, &[]) {
        Ok(s) => {
            (vm.config.write_fn)(&s.to_display_string());
            ret(args, v)
        }
        Err(e) => runtime_err(vm, args, &e),
    }
}

fn system_static_clock(_vm: &mut Vm, args: &mut [Value]) -> bool {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0);
    ret_num(args, now)
}

fn system_static_gc(vm: &mut Vm, args: &mut [Value]) -> bool {
    vm.collect_garbage();
    ret(args, Value::Null)
}

fn system_static_is_debug_build(_vm: &mut Vm, args: &mut [Value]) -> bool {
    ret_bool(args, cfg!(debug_assertions))
}

fn bind_system(vm: &mut Vm, system_class: GcRef) {
    vm.bind_static_primitive(system_class, "writeString_(_)", system_static_write_string);
    vm.bind_static_primitive(system_class, "print(_)", system_static_print_value);
    vm.bind_static_primitive(system_class, "print()", system_static_print_none);
    vm.bind_static_primitive(system_class, "write(_)", system_static_write_value);
    vm.bind_static_primitive(system_class, "clock()", system_static_clock);
    vm.bind_static_primitive(system_class, "gc()", system_static_gc);
    vm.bind_static_primitive(system_class, "isDebugBuild()", system_static_is_debug_build);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    fn new_vm() -> Vm {
        let mut vm = Vm::new(Configuration::default());
        init(&mut vm);
        vm
    }

    #[test]
    fn object_is_walks_superclass_chain() {
        let vm = new_vm();
        let num_class = vm.core_class("Num").unwrap();
        let object_class = vm.core_class("Object").unwrap();
        let mut vm = vm;
        let mut window = [Value::Num(1.0), Value::Obj(object_class)];
        assert!(object_is(&mut vm, &mut window));
        assert_eq!(window[0].as_bool(), Some(true));
        let mut window = [Value::Num(1.0), Value::Obj(num_class)];
        assert!(object_is(&mut vm, &mut window));
        assert_eq!(window[0].as_bool(), Some(true));
    }

    #[test]
    fn num_arithmetic_primitives() {
        let mut vm = new_vm();
        let result = vm.invoke("+(_)", Value::Num(1.0), &[Value::Num(2.0)]).unwrap();
        assert_eq!(result.as_num(), Some(3.0));
        let result = vm.invoke("sqrt()", Value::Num(9.0), &[]).unwrap();
        assert_eq!(result.as_num(), Some(3.0));
    }

    #[test]
    fn list_literal_protocol_chains_addcore() {
        let mut vm = new_vm();
        let list_class = vm.core_class("List");
        let l = vm.alloc(ObjData::List(ObjList::new()), list_class);
        vm.invoke("addCore_(_)", Value::Obj(l), &[Value::Num(1.0)]).unwrap();
        vm.invoke("addCore_(_)", Value::Obj(l), &[Value::Num(2.0)]).unwrap();
        assert_eq!(l.as_list().items.len(), 2);
        let s = vm.invoke("toString()", Value::Obj(l), &[]).unwrap();
        assert_eq!(s.as_string(), Some("[1, 2]"));
    }

    #[test]
    fn map_roundtrip() {
        let mut vm = new_vm();
        let map_class = vm.core_class("Map");
        let m = vm.alloc(ObjData::Map(ObjMap::new()), map_class);
        vm.invoke("[_,_]=", Value::Obj(m), &[Value::Num(1.0), Value::Num(2.0)]).unwrap();
        let v = vm.invoke("[_]", Value::Obj(m), &[Value::Num(1.0)]).unwrap();
        assert_eq!(v.as_num(), Some(2.0));
        let count = vm.invoke("count()", Value::Obj(m), &[]).unwrap();
        assert_eq!(count.as_num(), Some(1.0));
    }

    #[test]
    fn range_iterate_boundaries() {
        let mut vm = new_vm();
        let range_class = vm.core_class("Range");
        let r = vm.alloc(ObjData::Range(ObjRange::new(1.0, 1.0, false)), range_class);
        let first = vm.invoke("iterate(_)", Value::Obj(r), &[Value::Null]).unwrap();
        assert_eq!(first.as_bool(), Some(false));

        let r2 = vm.alloc(ObjData::Range(ObjRange::new(1.0, 3.0, true)), range_class);
        let first = vm.invoke("iterate(_)", Value::Obj(r2), &[Value::Null]).unwrap();
        assert_eq!(first.as_num(), Some(1.0));
        let second = vm.invoke("iterate(_)", Value::Obj(r2), &[Value::Num(1.0)]).unwrap();
        assert_eq!(second.as_num(), Some(2.0));
        let third = vm.invoke("iterate(_)", Value::Obj(r2), &[Value::Num(2.0)]).unwrap();
        assert_eq!(third.as_num(), Some(3.0));
        let fourth = vm.invoke("iterate(_)", Value::Obj(r2), &[Value::Num(3.0)]).unwrap();
        assert_eq!(fourth.as_bool(), Some(false));
    }
}
