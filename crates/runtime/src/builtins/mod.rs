//! Builtin functions
//!
//! Builtins are C-level callables exposed to bytecode through
//! `BuiltinFunction` wrapper objects registered as const globals. They run
//! on the calling fiber's stack; a builtin that needs to block (sleep)
//! parks the fiber through the thread suspension protocol instead of
//! blocking the worker.
//!
//! Builtins that allocate must root their arguments in handle slots before
//! the first allocation — argument slices are not GC roots by themselves.

pub mod core;
pub mod future;
pub mod list;
pub mod timer;

use crate::object::BuiltinFunctionType;
use crate::runtime::create_builtin_function;
use crate::thread::Thread;

/// Register every builtin function as a const global.
pub fn initialize(thread: &mut Thread) {
    let builtins: &[(&str, BuiltinFunctionType, u8)] = &[
        ("print", core::print, 1),
        ("writevalue", core::writevalue, 1),
        ("exit", core::exit, 1),
        ("currenttimestamp", core::currenttimestamp, 0),
        ("capturestacktrace", core::capturestacktrace, 0),
        ("disassemble", core::disassemble, 1),
        ("futurecreate", future::create, 0),
        ("futureawait", future::await_, 1),
        ("futureresolve", future::resolve, 2),
        ("futurereject", future::reject, 2),
        ("timersleep", timer::sleep, 1),
        ("timerfibercreate", timer::fibercreate, 4),
        ("timercancel", timer::cancel, 1),
        ("listcreate", list::create, 2),
        ("listinsert", list::insert, 3),
        ("listerase", list::erase, 3),
        ("listpush", list::push, 2),
        ("listpop", list::pop, 1),
    ];

    let runtime = thread.runtime();
    for &(name, function, argc) in builtins {
        let builtin = create_builtin_function(thread, function, name, argc);
        let symbol = runtime.declare_symbol(thread, name);
        check!(
            runtime.declare_global_variable(symbol, true, builtin).is_error_ok(),
            "duplicate builtin function {name}"
        );
    }
}
