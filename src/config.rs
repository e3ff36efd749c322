//! Host configuration.
//!
//! One struct of plain-`fn` callbacks, with `Default` filling in
//! reasonable no-op or stdio behavior for each: module resolution and
//! loading, foreign method/class binding, output, error reporting, and the
//! `$` string-method hook.

use crate::error::ErrorKind;
use crate::object::class::ForeignMethodFn;
use crate::object::ForeignClassHooks;

pub type ResolveModuleFn = fn(importer: &str, name: &str) -> Option<String>;
pub type LoadModuleFn = fn(name: &str) -> Option<String>;
pub type BindForeignMethodFn = fn(module: &str, class_name: &str, is_static: bool, signature: &str) -> Option<ForeignMethodFn>;
pub type BindForeignClassFn = fn(module: &str, class_name: &str) -> Option<ForeignClassHooks>;
pub type WriteFn = fn(&str);
pub type ErrorFn = fn(ErrorKind, &str, i32, &str);
/// Invoked by the `$"..."` string-method surface. Returns the formatted
/// string, or `None` (when no hook is installed, or the hook declines) to
/// fall back to `null`.
pub type DollarOperatorFn = fn(&str) -> Option<String>;

fn default_resolve_module(_importer: &str, name: &str) -> Option<String> {
    Some(name.to_string())
}

fn default_load_module(_name: &str) -> Option<String> {
    None
}

fn default_bind_foreign_method(_module: &str, _class: &str, _is_static: bool, _sig: &str) -> Option<ForeignMethodFn> {
    None
}

fn default_bind_foreign_class(_module: &str, _class: &str) -> Option<ForeignClassHooks> {
    None
}

fn default_write(s: &str) {
    print!("{}", s);
}

fn default_error(kind: ErrorKind, module: &str, line: i32, message: &str) {
    match kind {
        ErrorKind::Compile => eprintln!("{}:{}: {}", module, line, message),
        ErrorKind::Runtime => eprintln!("{}", message),
        ErrorKind::StackTrace => eprintln!("  at {} line {}", module, line),
    }
}

fn default_dollar_operator(_s: &str) -> Option<String> {
    None
}

/// Host-supplied behavior for one VM instance. The process allocator
/// itself is not pluggable here — this build leans on Rust's global
/// allocator and the GC's own `Heap::allocate` accounting (see `gc.rs`'s
/// module doc) rather than a host-swappable `realloc` shim, since a safe
/// Rust API for that hook would just be `GlobalAlloc`, which is already
/// configurable at the binary level.
pub struct Configuration {
    pub resolve_module_fn: ResolveModuleFn,
    pub load_module_fn: LoadModuleFn,
    pub bind_foreign_method_fn: BindForeignMethodFn,
    pub bind_foreign_class_fn: BindForeignClassFn,
    pub write_fn: WriteFn,
    pub error_fn: ErrorFn,
    pub dollar_operator_fn: DollarOperatorFn,
    pub initial_heap_size: usize,
    pub min_heap_size: usize,
    pub heap_growth_percent: u32,
    pub accepts_trailing_semicolons: bool,
    pub user_data: Option<std::rc::Rc<dyn std::any::Any>>,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            resolve_module_fn: default_resolve_module,
            load_module_fn: default_load_module,
            bind_foreign_method_fn: default_bind_foreign_method,
            bind_foreign_class_fn: default_bind_foreign_class,
            write_fn: default_write,
            error_fn: default_error,
            dollar_operator_fn: default_dollar_operator,
            initial_heap_size: 10 * 1024 * 1024,
            min_heap_size: 1024 * 1024,
            heap_growth_percent: 50,
            accepts_trailing_semicolons: false,
            user_data: None,
        }
    }
}
