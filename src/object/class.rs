//! `Class`, `Instance`, `Foreign`, and the method table.

use crate::object::GcRef;
use crate::value::Value;
use std::collections::HashMap;

/// A primitive implemented directly in Rust. Takes the argument window
/// (`args[0]` is the receiver) and either writes the result into `args[0]`
/// and returns `true`, or signals an error/fiber-switch and returns `false`.
pub type PrimitiveFn = fn(&mut crate::vm::Vm, &mut [Value]) -> bool;

/// A method bound through the host's foreign-method binder.
pub type ForeignMethodFn = fn(&mut crate::vm::Vm, &mut [Value]) -> bool;

#[derive(Clone, Copy)]
pub enum MethodKind {
    None,
    Primitive(PrimitiveFn),
    FunctionCall,
    Foreign(ForeignMethodFn),
    Block(GcRef), // ObjClosure
}

#[derive(Clone, Copy)]
pub struct Method {
    pub kind: MethodKind,
}

impl Method {
    pub fn none() -> Self {
        Method { kind: MethodKind::None }
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, MethodKind::None)
    }
}

/// Dense, symbol-indexed method table: a flat vector indexed by a global
/// method symbol. One per class; subclassing copies the superclass's slots
/// down so lookup is always a single indexed read with no fallback walk at
/// call time.
#[derive(Default)]
pub struct MethodTable {
    methods: Vec<Method>,
}

impl MethodTable {
    pub fn new() -> Self {
        MethodTable { methods: Vec::new() }
    }

    pub fn get(&self, symbol: usize) -> Method {
        self.methods.get(symbol).copied().unwrap_or_else(Method::none)
    }

    pub fn set(&mut self, symbol: usize, method: Method) {
        if symbol >= self.methods.len() {
            self.methods.resize(symbol + 1, Method::none());
        }
        self.methods[symbol] = method;
    }

    /// Copies every bound slot from `other` into `self`: used when a
    /// subclass is created, so its inherited slots are copied down from
    /// the superclass at binding time rather than resolved lazily.
    pub fn inherit_from(&mut self, other: &MethodTable) {
        if other.methods.len() > self.methods.len() {
            self.methods.resize(other.methods.len(), Method::none());
        }
        for (i, m) in other.methods.iter().enumerate() {
            if !m.is_none() {
                self.methods[i] = *m;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Host hooks bound to a foreign class.
#[derive(Clone, Copy)]
pub struct ForeignClassHooks {
    pub allocate: ForeignMethodFn,
    pub finalize: Option<fn(&mut [u8])>,
}

pub struct ObjClass {
    pub superclass: Option<GcRef>, // ObjClass
    pub name: GcRef,               // ObjString
    /// Field count including inherited fields, or `-1` for a foreign class.
    /// Capped at `MAX_FIELDS`.
    pub num_fields: i32,
    pub methods: MethodTable,
    /// Compile-time metadata captured from attribute syntax, exposed as
    /// `Class.attributes`.
    pub attributes: Value,
    pub foreign_hooks: Option<ForeignClassHooks>,
    pub is_metaclass: bool,
}

impl ObjClass {
    pub const MAX_FIELDS: i32 = 255;

    pub fn is_foreign(&self) -> bool {
        self.num_fields < 0
    }
}

/// A plain instance of a non-foreign class: an inline field array sized by
/// the owning class's `num_fields`.
pub struct ObjInstance {
    pub fields: Vec<Value>,
}

impl ObjInstance {
    pub fn new(num_fields: usize) -> Self {
        ObjInstance { fields: vec![Value::Null; num_fields] }
    }
}

/// An instance of a foreign class: opaque, host-sized bytes plus whatever
/// per-instance bookkeeping the binder attached. The bytes are sized and
/// populated by the foreign class's `allocate` callback, called exactly
/// once per instance.
pub struct ObjForeign {
    pub data: Vec<u8>,
    pub user_map: HashMap<&'static str, usize>,
}

impl ObjForeign {
    pub fn new(size: usize) -> Self {
        ObjForeign { data: vec![0u8; size], user_map: HashMap::new() }
    }
}
