//! Heap object model.
//!
//! Every heap value is a single `Obj`: a fixed header (mark bit, class
//! pointer, intrusive `next` link for the GC's all-objects list) plus a
//! payload enum tagged by [`ObjKind`]. Keeping payload and tag in one Rust
//! enum (rather than a C-style `kind` byte plus an `unsafe` pointer cast)
//! means every downcast is an ordinary, checked `match`.

pub mod class;
pub mod collections;
pub mod fiber;
pub mod function;
pub mod module;
pub mod string;

use std::cell::Cell;
use std::ptr::NonNull;

pub use class::{ForeignClassHooks, Method, MethodKind, MethodTable, ObjClass, ObjForeign, ObjInstance};
pub use collections::{ObjList, ObjMap, ObjRange};
pub use fiber::{FiberState, ObjFiber};
pub use function::{ObjClosure, ObjFn, ObjUpvalue};
pub use module::ObjModule;
pub use string::ObjString;

/// Discriminant for a heap object. Mirrors `ObjData`'s variants so code that
/// only needs to know *what kind* of object a pointer is (e.g. error
/// messages, the slot API's type query) doesn't need to match the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjKind {
    String,
    List,
    Map,
    Range,
    Module,
    Fn,
    Closure,
    Upvalue,
    Fiber,
    Class,
    Instance,
    Foreign,
}

/// The tagged payload of a heap object.
pub enum ObjData {
    String(ObjString),
    List(ObjList),
    Map(ObjMap),
    Range(ObjRange),
    Module(ObjModule),
    Fn(ObjFn),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Fiber(ObjFiber),
    Class(ObjClass),
    Instance(ObjInstance),
    Foreign(ObjForeign),
}

impl ObjData {
    pub fn kind(&self) -> ObjKind {
        match self {
            ObjData::String(_) => ObjKind::String,
            ObjData::List(_) => ObjKind::List,
            ObjData::Map(_) => ObjKind::Map,
            ObjData::Range(_) => ObjKind::Range,
            ObjData::Module(_) => ObjKind::Module,
            ObjData::Fn(_) => ObjKind::Fn,
            ObjData::Closure(_) => ObjKind::Closure,
            ObjData::Upvalue(_) => ObjKind::Upvalue,
            ObjData::Fiber(_) => ObjKind::Fiber,
            ObjData::Class(_) => ObjKind::Class,
            ObjData::Instance(_) => ObjKind::Instance,
            ObjData::Foreign(_) => ObjKind::Foreign,
        }
    }
}

/// Object header: kind is implicit in `data`, plus a dark-mark bit, an
/// (optional, during bootstrap) class pointer, and the intrusive `next`
/// link threading every live object for sweeping.
pub struct Obj {
    pub dark: Cell<bool>,
    pub class: Cell<Option<GcRef>>,
    pub next: Cell<Option<NonNull<Obj>>>,
    pub data: ObjData,
}

impl Obj {
    pub fn kind(&self) -> ObjKind {
        self.data.kind()
    }
}

/// A GC-owned reference to a heap object. Plain `Copy`able pointer;
/// equality is identity. Dereferencing is safe for as long as the object is
/// reachable, which the GC guarantees between safepoints (allocations) as
/// long as the caller holds the value on a fiber stack, in a temporary
/// root, or behind a handle.
#[derive(Clone, Copy)]
pub struct GcRef(pub NonNull<Obj>);

impl GcRef {
    /// # Safety
    /// `ptr` must point at a live `Obj` for the lifetime of any use of the
    /// returned `GcRef`.
    pub unsafe fn from_raw(ptr: NonNull<Obj>) -> Self {
        GcRef(ptr)
    }

    pub fn as_ptr(self) -> *mut Obj {
        self.0.as_ptr()
    }

    pub fn kind(self) -> ObjKind {
        self.get().kind()
    }

    pub fn get(self) -> &'static Obj {
        // SAFETY: see struct docs; the GC never frees a reachable object,
        // and callers are only ever handed a `GcRef` to a reachable one.
        unsafe { self.0.as_ref() }
    }

    pub fn get_mut(mut self) -> &'static mut Obj {
        unsafe { self.0.as_mut() }
    }
}

impl PartialEq for GcRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for GcRef {}

impl std::hash::Hash for GcRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.as_ptr().hash(state);
    }
}

impl std::fmt::Debug for GcRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcRef({:?}, {:?})", self.0.as_ptr(), self.kind())
    }
}

macro_rules! downcast {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        impl GcRef {
            pub fn $get(self) -> &'static $ty {
                match &self.get().data {
                    ObjData::$variant(v) => v,
                    other => panic!("expected {}, found {:?}", stringify!($variant), other.kind()),
                }
            }
            pub fn $get_mut(self) -> &'static mut $ty {
                match &mut self.get_mut().data {
                    ObjData::$variant(v) => v,
                    other => panic!("expected {}, found {:?}", stringify!($variant), other.kind()),
                }
            }
        }
    };
}

downcast!(as_string, as_string_mut, String, ObjString);
downcast!(as_list, as_list_mut, List, ObjList);
downcast!(as_map, as_map_mut, Map, ObjMap);
downcast!(as_range, as_range_mut, Range, ObjRange);
downcast!(as_module, as_module_mut, Module, ObjModule);
downcast!(as_fn, as_fn_mut, Fn, ObjFn);
downcast!(as_closure, as_closure_mut, Closure, ObjClosure);
downcast!(as_upvalue, as_upvalue_mut, Upvalue, ObjUpvalue);
downcast!(as_fiber, as_fiber_mut, Fiber, ObjFiber);
downcast!(as_class, as_class_mut, Class, ObjClass);
downcast!(as_instance, as_instance_mut, Instance, ObjInstance);
downcast!(as_foreign, as_foreign_mut, Foreign, ObjForeign);
