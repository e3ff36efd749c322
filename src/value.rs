//! The uniform [`Value`] cell.
//!
//! This build uses a tagged-struct representation rather than NaN-tagged
//! doubles, favoring readability over the extra few bytes a `Value` costs;
//! a tagged `enum` keeps the choice local to this module, since swapping in
//! a NaN-boxed `u64` later would only touch this module and `gc.rs`'s
//! allocation accounting, not any call site.

use crate::object::GcRef;

/// A script-visible value. `Copy` because every variant is either inline
/// data or a pointer into the GC heap — there is never a reason to clone
/// deeply.
#[derive(Clone, Copy)]
pub enum Value {
    /// Never visible to scripts; marks unused map slots and forward-declared
    /// module variables.
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Obj(GcRef),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        // Only `false` and `null` are falsy. Everything else — including
        // `0`, `""`, and empty collections — is truthy.
        !matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_num(&self) -> bool {
        matches!(self, Value::Num(_))
    }

    pub fn is_obj(&self) -> bool {
        matches!(self, Value::Obj(_))
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<GcRef> {
        match self {
            Value::Obj(o) => Some(*o),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&'static str> {
        match self {
            Value::Obj(o) if o.kind() == crate::object::ObjKind::String => Some(o.as_string().as_str()),
            _ => None,
        }
    }

    /// Short type name, used by `Object.type` and error messages.
    pub fn type_name(&self) -> &'static str {
        use crate::object::ObjKind::*;
        match self {
            Value::Undefined => "Undefined",
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Num(_) => "Num",
            Value::Obj(o) => match o.kind() {
                String => "String",
                List => "List",
                Map => "Map",
                Range => "Range",
                Module => "Module",
                Fn => "Fn",
                Closure => "Fn",
                Upvalue => "Upvalue",
                Fiber => "Fiber",
                Class => "Class",
                Instance => "Instance",
                Foreign => "Foreign",
            },
        }
    }

    /// Structural equality (script `==`). Strings compare by bytes,
    /// numbers by IEEE-754 equality (so `nan == nan` is false), everything
    /// else by identity.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => {
                if a == b {
                    return true;
                }
                if a.kind() == crate::object::ObjKind::String && b.kind() == crate::object::ObjKind::String {
                    return a.as_string().bytes == b.as_string().bytes;
                }
                if a.kind() == crate::object::ObjKind::Range && b.kind() == crate::object::ObjKind::Range {
                    let (ra, rb) = (a.as_range(), b.as_range());
                    return ra.from == rb.from && ra.to == rb.to && ra.is_inclusive == rb.is_inclusive;
                }
                false
            }
            _ => false,
        }
    }

    /// `Num.toString` formatting: round-trips except NaN/Infinity, which
    /// serialize as the literal words rather than Rust's `NaN`/`inf`.
    pub fn format_num(n: f64) -> String {
        if n.is_nan() {
            return "nan".to_string();
        }
        if n.is_infinite() {
            return if n > 0.0 { "infinity".to_string() } else { "-infinity".to_string() };
        }
        if n == n.trunc() && n.abs() < 1e15 {
            return format!("{}", n as i64);
        }
        // Closest portable stand-in for `%.14g`: 14 significant digits,
        // then trim trailing zeros (but keep at least one fractional digit).
        let s = format!("{:.*e}", 13, n);
        format_g(n, &s)
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => Value::format_num(*n),
            Value::Obj(o) => match o.kind() {
                crate::object::ObjKind::String => o.as_string().as_str().to_string(),
                _ => format!("<{} object>", self.type_name()),
            },
        }
    }
}

/// Trim a `%e`-formatted number down to `%.14g` style: plain decimal for
/// magnitudes in the usual range, scientific notation (trimmed) outside it.
fn format_g(n: f64, _sci: &str) -> String {
    let formatted = format!("{:.14}", n);
    let trimmed = formatted.trim_end_matches('0');
    let trimmed = trimmed.trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

/// A hashable/orderable projection of a [`Value`] used as a constant-pool
/// key, so each distinct literal is added to a function's constant table
/// at most once. Constants are only ever numbers or strings, so this
/// doesn't need to handle the full value space.
#[derive(Clone, PartialEq)]
pub enum ConstKey {
    Num(u64), // f64::to_bits
    Str(Vec<u8>),
}

impl Eq for ConstKey {}

impl std::hash::Hash for ConstKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            ConstKey::Num(bits) => {
                0u8.hash(state);
                bits.hash(state);
            }
            ConstKey::Str(bytes) => {
                1u8.hash(state);
                bytes.hash(state);
            }
        }
    }
}
