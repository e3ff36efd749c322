//! Lumen: an embeddable, class-based, concurrent scripting language
//! interpreter.
//!
//! The crate is split by pipeline stage: a uniform [`value::Value`] and
//! heap [`object`] model, a precise mark-sweep [`gc`], growable buffers and
//! symbol tables ([`symbol`]), a [`lexer`], a single-pass [`compiler`], a
//! fixed [`bytecode`] instruction set, the interpreter loop and fiber
//! scheduler in [`vm`], the built-in class library in [`corelib`], and the
//! host-facing embedding ABI in [`api`].
//!
//! This crate does no I/O, threading, or dynamic linking on its own —
//! every external effect is mediated by a [`config::Configuration`]
//! callback the host supplies.

pub mod api;
pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod corelib;
pub mod error;
pub mod gc;
pub mod lexer;
pub mod object;
pub mod symbol;
pub mod value;
pub mod vm;

pub use api::{Api, CallHandle, Handle, SlotType};
pub use config::Configuration;
pub use error::InterpretResult;
pub use value::Value;
pub use vm::Vm;

/// Constructs a fully initialized VM: allocates the bootstrap classes and
/// runs the core script preamble, ready to `interpret`.
pub fn new_vm(config: Configuration) -> Vm {
    let mut vm = Vm::new(config);
    corelib::init(&mut vm);
    vm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> (InterpretResult, String) {
        use std::cell::RefCell;
        thread_local! {
            static OUTPUT: RefCell<String> = RefCell::new(String::new());
        }
        OUTPUT.with(|o| o.borrow_mut().clear());
        fn write(s: &str) {
            OUTPUT.with(|o| o.borrow_mut().push_str(s));
        }
        let mut config = Configuration::default();
        config.write_fn = write;
        let mut vm = new_vm(config);
        let result = vm.interpret("main", src);
        (result, OUTPUT.with(|o| o.borrow().clone()))
    }

    #[test]
    fn empty_module_succeeds() {
        let (result, _) = run("");
        assert_eq!(result, InterpretResult::Success);
    }

    #[test]
    fn arithmetic_precedence() {
        let (result, out) = run("System.print(1 + 2 * 3)\n");
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(out, "7\n");
    }

    #[test]
    fn list_building_and_iteration() {
        let (result, out) = run("var a = []\nfor (i in 1..3) a.add(i*i)\nSystem.print(a)\n");
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(out, "[1, 4, 9]\n");
    }

    #[test]
    fn fn_call() {
        let (result, out) = run("var f = Fn.new { |x| x + 1 }\nSystem.print(f.call(41))\n");
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(out, "42\n");
    }

    #[test]
    fn fiber_yield_resume() {
        let (result, out) = run(
            "var fib = Fiber.new { |x| Fiber.yield(x+1); x+10 }\nSystem.print(fib.call(1))\nSystem.print(fib.call())\n",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(out, "2\n11\n");
    }

    #[test]
    fn super_dispatch() {
        let (result, out) = run(
            "class A { foo { \"A\" } }\nclass B is A { foo { super.foo + \"B\" } }\nSystem.print(B.new().foo)\n",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(out, "AB\n");
    }

    #[test]
    fn map_remove_and_count() {
        let (result, out) = run(
            "var m = {\"a\":1,\"b\":2}\nm.remove(\"a\")\nSystem.print(m.count)\nSystem.print(m.containsKey(\"b\"))\n",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(out, "1\ntrue\n");
    }

    #[test]
    fn fiber_try_catches_abort() {
        let (result, out) = run("var e = Fiber.new { Fiber.abort(\"boom\") }\nSystem.print(e.try())\n");
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(out, "boom\n");
    }
}
