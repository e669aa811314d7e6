//! Shared helpers for assembling and running test programs.
#![allow(dead_code)]

use charly_core::{FunctionBuilder, ModuleBuilder, Opcode};
use charly_runtime::value;
use charly_runtime::{Runtime, RuntimeOptions};

/// Options used by the integration tests: a small heap so collections
/// actually happen, and two processors so fibers migrate.
pub fn test_options() -> RuntimeOptions {
    RuntimeOptions {
        maxprocs: Some(2),
        initial_heap_regions: 8,
        ..RuntimeOptions::default()
    }
}

/// Assemble a module and run it to completion, returning the exit code.
pub fn run_module(build: impl FnOnce(&mut ModuleBuilder)) -> i32 {
    run_module_with_options(test_options(), build)
}

pub fn run_module_with_options(
    options: RuntimeOptions,
    build: impl FnOnce(&mut ModuleBuilder),
) -> i32 {
    let mut module = ModuleBuilder::new("test.ch");
    build(&mut module);
    Runtime::run(options, Some(module.build()))
}

/// Push the null value.
pub fn push_null(function: &mut FunctionBuilder) {
    function.loadsmi(value::NULL.raw());
}

/// Push an integer: `loadsmi` when the encoding fits the 24-bit
/// immediate, the constant table otherwise (negative or large values).
pub fn push_int(function: &mut FunctionBuilder, value: i64) {
    let raw = charly_runtime::Value::int(value).raw();
    if raw <= 0x00ff_ffff {
        function.loadsmi(raw);
    } else {
        let index = function.constant(raw);
        function.emit_aa(Opcode::Load, index);
    }
}

/// Call the `exit` builtin with the value stored in a local slot. The
/// call never returns; the trailing `ret` keeps the frame well-formed.
pub fn exit_with_local(function: &mut FunctionBuilder, local: u8) {
    push_null(function);
    let name = function.string("exit");
    function.emit_aa(Opcode::Loadglobal, name);
    function.emit_a(Opcode::Loadlocal, local);
    function.emit_a(Opcode::Call, 1);
    function.emit_a(Opcode::Pop, 1);
    function.emit(Opcode::Ret);
}

/// Call a builtin global with arguments produced by `push_args`, leaving
/// the result on the stack.
pub fn call_builtin(
    function: &mut FunctionBuilder,
    name: &str,
    argc: u8,
    push_args: impl FnOnce(&mut FunctionBuilder),
) {
    push_null(function);
    let name = function.string(name);
    function.emit_aa(Opcode::Loadglobal, name);
    push_args(function);
    function.emit_a(Opcode::Call, argc);
}
